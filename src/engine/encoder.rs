// Encoder contract and the ffmpeg implementation

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use thiserror::Error;

use super::core::{
    EncodeSettings, MediaInfo, ProgressParser, build_ffmpeg_cmd, check_ffmpeg, format_ffmpeg_cmd,
    partial_output_path,
};
use super::probe::{ProbeError, probe_media};

/// Cooperative cancellation flag shared by the controller, workers and encoders
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One transcode: read `source_path`, produce `output_path`
#[derive(Debug, Clone)]
pub struct EncodeRequest {
    pub source_path: PathBuf,
    pub output_path: PathBuf,
    pub settings: Arc<EncodeSettings>,
}

/// What a successful transcode reports back
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodeReport {
    pub source: Option<MediaInfo>,
    pub output: Option<MediaInfo>,
    pub output_bytes: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeFailure {
    /// The source could not be probed
    Probe,
    /// The source is truncated or not a media file
    CorruptInput,
    /// The encoder process failed
    Process,
    /// Moving the finished output into place failed
    Finalize,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodeError {
    #[error("{message}")]
    Failed {
        kind: EncodeFailure,
        message: String,
    },

    #[error("cancelled")]
    Cancelled,
}

impl EncodeError {
    pub fn failed(kind: EncodeFailure, message: impl Into<String>) -> Self {
        EncodeError::Failed {
            kind,
            message: message.into(),
        }
    }
}

/// The transcode collaborator. Implementations must be callable from many
/// worker threads at once.
pub trait Encoder: Send + Sync {
    /// Refuse to start a batch when the encoder cannot work at all
    fn preflight(&self) -> Result<(), String> {
        Ok(())
    }

    /// Transcode one file. Percent values (0-100, non-decreasing) go to `progress`.
    /// On failure or cancel no file may be left at `request.output_path`.
    fn transcode(
        &self,
        request: &EncodeRequest,
        cancel: &CancellationToken,
        progress: &mut dyn FnMut(f64),
    ) -> Result<EncodeReport, EncodeError>;
}

/// Probe error text that means the input itself is broken
fn is_corrupt_input(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("moov atom not found") || lower.contains("invalid data found when processing input")
}

fn remove_partial(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove partial output");
        }
    }
}

/// Ask the child to stop, then kill it if it lingers
fn terminate(child: &mut Child) {
    for _ in 0..30 {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(_) => break,
        }
        if child.kill().is_ok() {
            let _ = child.wait();
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    let _ = child.wait();
}

/// ffmpeg/ffprobe backed encoder
#[derive(Debug, Clone, Default)]
pub struct FfmpegEncoder;

impl FfmpegEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl Encoder for FfmpegEncoder {
    fn preflight(&self) -> Result<(), String> {
        let (ffmpeg, ffprobe) = check_ffmpeg().map_err(|e| format!("{:#}", e))?;
        tracing::info!(%ffmpeg, %ffprobe, "encoder preflight ok");
        Ok(())
    }

    fn transcode(
        &self,
        request: &EncodeRequest,
        cancel: &CancellationToken,
        progress: &mut dyn FnMut(f64),
    ) -> Result<EncodeReport, EncodeError> {
        let source = match probe_media(&request.source_path) {
            Ok(info) => info,
            Err(ProbeError::Failed(message)) if is_corrupt_input(&message) => {
                return Err(EncodeError::failed(
                    EncodeFailure::CorruptInput,
                    format!("File is corrupted or incomplete: {}", message),
                ));
            }
            Err(e) => return Err(EncodeError::failed(EncodeFailure::Probe, e.to_string())),
        };

        if cancel.is_cancelled() {
            return Err(EncodeError::Cancelled);
        }

        let partial = partial_output_path(&request.output_path);
        let mut cmd = build_ffmpeg_cmd(&request.source_path, &partial, &request.settings);
        tracing::debug!(cmd = %format_ffmpeg_cmd(&cmd), "running ffmpeg");

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            EncodeError::failed(EncodeFailure::Process, format!("Failed to spawn ffmpeg: {}", e))
        })?;

        let stderr_thread = child.stderr.take().map(|stderr| {
            thread::spawn(move || {
                BufReader::new(stderr)
                    .lines()
                    .map_while(Result::ok)
                    .map(|l| l.trim().to_string())
                    .filter(|l| !l.is_empty())
                    .collect::<Vec<_>>()
            })
        });

        let mut parser = ProgressParser::new();
        let mut last_pct = -1.0;
        let mut cancelled = false;
        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                if cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
                parser.parse_line(line.trim());
                if let Some(pct) = parser.progress_pct(source.duration_s) {
                    if pct > last_pct {
                        last_pct = pct;
                        progress(pct);
                    }
                }
            }
        }

        // The pipe may also close because ffmpeg exited; re-check before deciding
        cancelled |= cancel.is_cancelled();
        if cancelled {
            terminate(&mut child);
        }

        let status = child.wait();
        let stderr_lines = stderr_thread
            .and_then(|t| t.join().ok())
            .unwrap_or_default();

        if cancelled {
            remove_partial(&partial);
            return Err(EncodeError::Cancelled);
        }

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                remove_partial(&partial);
                return Err(EncodeError::failed(
                    EncodeFailure::Process,
                    format!("Failed to wait for ffmpeg: {}", e),
                ));
            }
        };

        if !status.success() {
            remove_partial(&partial);
            let message = if stderr_lines.is_empty() {
                format!("ffmpeg failed ({})", status)
            } else {
                stderr_lines.join("; ")
            };
            return Err(EncodeError::failed(EncodeFailure::Process, message));
        }

        if let Err(e) = fs::rename(&partial, &request.output_path) {
            remove_partial(&partial);
            return Err(EncodeError::failed(
                EncodeFailure::Finalize,
                format!("Failed to finalize output: {}", e),
            ));
        }
        if last_pct < 100.0 {
            progress(100.0);
        }

        let output_bytes = fs::metadata(&request.output_path).ok().map(|m| m.len());
        let output = match probe_media(&request.output_path) {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::warn!(path = %request.output_path.display(), error = %e, "could not probe output");
                None
            }
        };

        Ok(EncodeReport {
            source: Some(source),
            output,
            output_bytes,
        })
    }
}
