// Single writer for BatchState: applies events and control signals, feeds the reporter

use chrono::Utc;
use std::fs;
use std::io;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::core::{
    BatchSnapshot, BatchState, ControlSignal, EngineError, EngineEvent, Job, JobStatus, Phase,
    Reporter,
};

/// Everything the aggregator thread consumes
#[derive(Debug)]
pub enum Envelope {
    Event(EngineEvent),
    Control {
        signal: ControlSignal,
        reply: Sender<Result<Phase, EngineError>>,
    },
}

/// Cloneable handle for publishing to the aggregator
#[derive(Debug, Clone)]
pub struct EventSink(Sender<Envelope>);

impl EventSink {
    pub fn new(tx: Sender<Envelope>) -> Self {
        Self(tx)
    }

    /// Returns false once the aggregator has gone away
    pub fn emit(&self, event: EngineEvent) -> bool {
        self.0.send(Envelope::Event(event)).is_ok()
    }

    /// Apply a control signal and wait for the resulting phase
    pub fn control(&self, signal: ControlSignal) -> Result<Phase, EngineError> {
        let (reply, rx) = mpsc::channel();
        self.0
            .send(Envelope::Control { signal, reply })
            .map_err(|_| EngineError::Disconnected)?;
        rx.recv().map_err(|_| EngineError::Disconnected)?
    }
}

/// Latest published snapshot plus the parties waiting on it.
/// Only the newest aggregator may publish; older ones are ignored.
#[derive(Debug)]
pub struct SnapshotBoard {
    generation: AtomicU64,
    latest: Mutex<Arc<BatchSnapshot>>,
    changed: Condvar,
    subscribers: Mutex<Vec<Sender<Arc<BatchSnapshot>>>>,
}

impl Default for SnapshotBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotBoard {
    pub fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
            latest: Mutex::new(Arc::new(BatchSnapshot::default())),
            changed: Condvar::new(),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn lock_latest(&self) -> MutexGuard<'_, Arc<BatchSnapshot>> {
        self.latest.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn latest(&self) -> Arc<BatchSnapshot> {
        self.lock_latest().clone()
    }

    pub fn subscribe(&self) -> Receiver<Arc<BatchSnapshot>> {
        let (tx, rx) = mpsc::channel();
        // New subscribers see the current state right away
        let _ = tx.send(self.latest());
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Claim the board for a new aggregator
    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn publish(&self, generation: u64, snapshot: BatchSnapshot) {
        let snapshot = Arc::new(snapshot);
        {
            let mut latest = self.lock_latest();
            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            *latest = snapshot.clone();
        }
        self.changed.notify_all();

        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|tx| tx.send(snapshot.clone()).is_ok());
    }

    /// Block until `done` holds for the latest snapshot, or the timeout passes.
    /// Returns the snapshot that satisfied it.
    pub fn wait_until<F>(&self, done: F, timeout: Option<Duration>) -> Option<Arc<BatchSnapshot>>
    where
        F: Fn(&BatchSnapshot) -> bool,
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut latest = self.lock_latest();
        loop {
            if done(&**latest) {
                return Some(latest.clone());
            }
            latest = match deadline {
                None => self.changed.wait(latest).unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return None;
                    }
                    self.changed
                        .wait_timeout(latest, remaining)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
    }
}

struct Aggregator {
    state: BatchState,
    reporter: Reporter,
    board: Arc<SnapshotBoard>,
    generation: u64,
}

/// Start the aggregator thread. It runs until every `EventSink` clone is dropped.
pub fn spawn(
    reporter: Reporter,
    board: Arc<SnapshotBoard>,
) -> io::Result<(EventSink, JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel();
    let aggregator = Aggregator {
        state: BatchState::new(),
        reporter,
        generation: board.next_generation(),
        board,
    };
    let handle = thread::Builder::new()
        .name("vidproc-aggregator".into())
        .spawn(move || aggregator.run(rx))?;
    Ok((EventSink::new(tx), handle))
}

impl Aggregator {
    fn run(mut self, rx: Receiver<Envelope>) {
        self.publish();
        while let Ok(first) = rx.recv() {
            self.handle(first);
            // Coalesce bursts of progress events into one snapshot
            for envelope in rx.try_iter() {
                self.handle(envelope);
            }
            self.publish();
        }
        tracing::debug!("aggregator stopped");
    }

    fn handle(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Event(event) => {
                if let EngineEvent::JobFinished(job) = &event {
                    self.discard_late_output(job);
                }
                let finished = self.state.apply(event);
                self.report(&finished);
                self.settle();
            }
            Envelope::Control { signal, reply } => {
                let result = match self.state.control(signal, Utc::now()) {
                    Ok((_, finished)) => {
                        self.report(&finished);
                        self.settle();
                        Ok(self.state.phase())
                    }
                    Err(e) => Err(e),
                };
                // Callers observe the new phase through the board as soon as they hear back
                self.publish();
                let _ = reply.send(result);
            }
        }
    }

    /// A worker that outlived the cancel grace period may still finish its
    /// encode. The record already reads cancelled, so the file it produced
    /// must not stay at the final path.
    fn discard_late_output(&self, finished: &Job) {
        let force_cancelled = self
            .state
            .job(finished.id)
            .is_some_and(|job| job.status() == JobStatus::Cancelled);
        if !force_cancelled
            || finished.status() != JobStatus::Completed
            || finished.output_preexisting
        {
            return;
        }
        match fs::remove_file(&finished.output_path) {
            Ok(()) => tracing::info!(
                output = %finished.output_path.display(),
                "removed output of a job finished after cancel"
            ),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                output = %finished.output_path.display(),
                error = %e,
                "failed to remove output of a job finished after cancel"
            ),
        }
    }

    fn report(&mut self, finished: &[Job]) {
        for job in finished {
            if let Err(e) = self.reporter.record(job) {
                tracing::warn!(source = %job.source_path.display(), error = %e, "failed to write log record");
            }
        }
    }

    fn settle(&mut self) {
        let now = Utc::now();
        if !self.state.settle(now) {
            return;
        }
        let summary = self.state.summary(now);
        tracing::info!(
            total = summary.total_jobs,
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            cancelled = summary.cancelled,
            saved_bytes = summary.saved_bytes,
            elapsed_secs = summary.elapsed_secs,
            "batch completed"
        );
        if let Err(e) = self.reporter.finish(&summary) {
            tracing::warn!(error = %e, "failed to finalize batch log");
        }
    }

    fn publish(&self) {
        self.board
            .publish(self.generation, self.state.snapshot(Utc::now()));
    }
}
