// Scriptable in-process encoder for driving the engine without ffmpeg

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;
use vidproc::engine::{
    CancellationToken, EncodeError, EncodeFailure, EncodeReport, EncodeRequest, Encoder,
};

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[derive(Default)]
struct Calls {
    sources: Vec<PathBuf>,
}

/// Encoder double. By default every call succeeds, reports progress in
/// quarter steps and writes an output half the size of the source.
#[derive(Default)]
pub struct StubEncoder {
    fail: HashSet<String>,
    fail_once: Mutex<HashSet<String>>,
    panic_on: HashSet<String>,
    unavailable: Option<String>,
    /// Hold every call until `release` (or cancel, unless `ignore_cancel`)
    hold: bool,
    ignore_cancel: bool,
    /// Write a stray file at the final path while holding
    debris: bool,
    released: AtomicBool,
    /// Calls that ran to the end and returned a report
    returned: AtomicUsize,
    calls: Mutex<Calls>,
    called: Condvar,
}

impl StubEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, name: &str) -> Self {
        self.fail.insert(name.to_string());
        self
    }

    /// Fail the first call for `name`, succeed afterwards
    pub fn failing_once(self, name: &str) -> Self {
        self.fail_once
            .lock()
            .unwrap()
            .insert(name.to_string());
        self
    }

    pub fn panicking(mut self, name: &str) -> Self {
        self.panic_on.insert(name.to_string());
        self
    }

    pub fn unavailable(mut self, reason: &str) -> Self {
        self.unavailable = Some(reason.to_string());
        self
    }

    pub fn holding(mut self) -> Self {
        self.hold = true;
        self
    }

    pub fn ignoring_cancel(mut self) -> Self {
        self.ignore_cancel = true;
        self
    }

    pub fn leaving_debris(mut self) -> Self {
        self.debris = true;
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Let held calls finish
    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().sources.len()
    }

    pub fn called_names(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .sources
            .iter()
            .map(|p| file_name(p))
            .collect()
    }

    /// Block until at least `n` calls have been made
    pub fn wait_for_calls(&self, n: usize, timeout: Duration) -> bool {
        let guard = self.calls.lock().unwrap();
        let (guard, _) = self
            .called
            .wait_timeout_while(guard, timeout, |c| c.sources.len() < n)
            .unwrap();
        guard.sources.len() >= n
    }

    pub fn returned_count(&self) -> usize {
        self.returned.load(Ordering::SeqCst)
    }

    fn record(&self, source: &Path) {
        self.calls.lock().unwrap().sources.push(source.to_path_buf());
        self.called.notify_all();
    }
}

impl Encoder for StubEncoder {
    fn preflight(&self) -> Result<(), String> {
        match &self.unavailable {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }

    fn transcode(
        &self,
        request: &EncodeRequest,
        cancel: &CancellationToken,
        progress: &mut dyn FnMut(f64),
    ) -> Result<EncodeReport, EncodeError> {
        self.record(&request.source_path);
        let name = file_name(&request.source_path);

        if self.panic_on.contains(&name) {
            panic!("stub panic for {}", name);
        }
        if self.fail.contains(&name) || self.fail_once.lock().unwrap().remove(&name) {
            return Err(EncodeError::failed(
                EncodeFailure::Process,
                format!("stub failure for {}", name),
            ));
        }

        progress(25.0);
        if self.hold {
            if self.debris {
                fs::write(&request.output_path, b"half-written").unwrap();
            }
            while !self.released.load(Ordering::SeqCst) {
                if cancel.is_cancelled() && !self.ignore_cancel {
                    return Err(EncodeError::Cancelled);
                }
                thread::sleep(Duration::from_millis(5));
            }
        }
        if cancel.is_cancelled() && !self.ignore_cancel {
            return Err(EncodeError::Cancelled);
        }
        progress(50.0);
        progress(75.0);

        let source_len = fs::metadata(&request.source_path)
            .map(|m| m.len())
            .unwrap_or(0);
        let output = vec![0u8; (source_len / 2) as usize];
        fs::write(&request.output_path, &output).map_err(|e| {
            EncodeError::failed(EncodeFailure::Finalize, e.to_string())
        })?;
        progress(100.0);
        self.returned.fetch_add(1, Ordering::SeqCst);

        Ok(EncodeReport {
            source: None,
            output: None,
            output_bytes: Some(output.len() as u64),
        })
    }
}
