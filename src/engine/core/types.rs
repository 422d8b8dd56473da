use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::config::{Config, EncodeConfig, HardwareConfig};

pub type JobId = Uuid;

/// Everything an encoder needs besides the two paths
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncodeSettings {
    pub encode: EncodeConfig,
    pub hardware: HardwareConfig,
    /// Let the encoder replace an existing file
    pub overwrite: bool,
}

impl EncodeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            encode: config.encode.clone(),
            hardware: config.hardware.clone(),
            overwrite: config.batch.collision_policy == crate::engine::CollisionPolicy::Overwrite,
        }
    }
}

/// Flat job status, used for counting and display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Skipped,
        JobStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Classification of a per-job failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No free suffixed output name within the attempt bound
    Collision,
    /// The encoder reported failure
    Encode,
    /// Preparing the output location failed
    Io,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: FailureKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    OutputExists,
    DryRun,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::OutputExists => f.write_str("output exists"),
            SkipReason::DryRun => f.write_str("dry run"),
        }
    }
}

/// Stream-level facts about one media file, as reported by a prober
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub duration_s: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub video_bitrate_kbps: Option<u32>,
    pub audio_bitrate_kbps: Option<u32>,
    pub fps: Option<f64>,
}

impl MediaInfo {
    /// "WIDTHxHEIGHT", or None when either side is unknown
    pub fn resolution(&self) -> Option<String> {
        match (self.width, self.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some(format!("{}x{}", w, h)),
            _ => None,
        }
    }
}

/// Measurements attached to a completed job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetrics {
    pub original_bytes: Option<u64>,
    pub output_bytes: Option<u64>,
    pub original: Option<MediaInfo>,
    pub output: Option<MediaInfo>,
    pub processing_secs: f64,
}

impl JobMetrics {
    /// Bytes saved, never negative
    pub fn saved_bytes(&self) -> u64 {
        match (self.original_bytes, self.output_bytes) {
            (Some(original), Some(output)) => original.saturating_sub(output),
            _ => 0,
        }
    }

    /// Saved bytes as a percentage of the original size
    pub fn compression_ratio_pct(&self) -> f64 {
        match self.original_bytes {
            Some(original) if original > 0 => self.saved_bytes() as f64 / original as f64 * 100.0,
            _ => 0.0,
        }
    }
}

/// Job state with its associated data. Terminal variants never change again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running { percent: f64 },
    Completed { metrics: Box<JobMetrics> },
    Failed { error: JobError },
    Skipped { reason: SkipReason },
    Cancelled,
}

impl JobState {
    pub fn status(&self) -> JobStatus {
        match self {
            JobState::Queued => JobStatus::Queued,
            JobState::Running { .. } => JobStatus::Running,
            JobState::Completed { .. } => JobStatus::Completed,
            JobState::Failed { .. } => JobStatus::Failed,
            JobState::Skipped { .. } => JobStatus::Skipped,
            JobState::Cancelled => JobStatus::Cancelled,
        }
    }
}

/// Terminal result recorded for a job
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(JobMetrics),
    Failed(JobError),
    Skipped(SkipReason),
    Cancelled,
}

/// Rejected job state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("job cannot move from {from} to {to}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// One file's transcode task and its tracked state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub source_path: PathBuf,
    pub relative_path: PathBuf,
    pub output_path: PathBuf,
    pub state: JobState,

    /// Source size at scan time
    pub source_bytes: Option<u64>,

    /// 1 for the first run, incremented per retry
    pub attempt: u32,
    pub retry_of: Option<JobId>,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// A file was already at `output_path` when the worker picked the job up
    #[serde(default)]
    pub output_preexisting: bool,
}

impl Job {
    /// Create a new queued job. `output_path` is filled in by collision resolution.
    pub fn new(source_path: PathBuf, relative_path: PathBuf, source_bytes: Option<u64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_path,
            relative_path,
            output_path: PathBuf::new(),
            state: JobState::Queued,
            source_bytes,
            attempt: 1,
            retry_of: None,
            started_at: None,
            finished_at: None,
            output_preexisting: false,
        }
    }

    /// Fresh queued record for the same source; the previous record is left untouched
    pub fn retry_of(previous: &Job) -> Self {
        Self {
            attempt: previous.attempt + 1,
            retry_of: Some(previous.id),
            ..Job::new(
                previous.source_path.clone(),
                previous.relative_path.clone(),
                previous.source_bytes,
            )
        }
    }

    pub fn status(&self) -> JobStatus {
        self.state.status()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Current percent; None before the job runs
    pub fn progress_percent(&self) -> Option<f64> {
        match &self.state {
            JobState::Queued => None,
            JobState::Running { percent } => Some(*percent),
            JobState::Completed { .. } => Some(100.0),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&JobError> {
        match &self.state {
            JobState::Failed { error } => Some(error),
            _ => None,
        }
    }

    pub fn metrics(&self) -> Option<&JobMetrics> {
        match &self.state {
            JobState::Completed { metrics } => Some(metrics),
            _ => None,
        }
    }

    /// queued -> running
    pub fn start(&mut self, at: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status() != JobStatus::Queued {
            return Err(TransitionError {
                from: self.status(),
                to: JobStatus::Running,
            });
        }
        self.state = JobState::Running { percent: 0.0 };
        self.started_at.get_or_insert(at);
        Ok(())
    }

    /// Raise the running percent. Lower values are ignored; returns the value now held.
    pub fn advance(&mut self, percent: f64) -> Option<f64> {
        match &mut self.state {
            JobState::Running { percent: current } => {
                let clamped = if percent.is_finite() {
                    percent.clamp(0.0, 100.0)
                } else {
                    *current
                };
                if clamped > *current {
                    *current = clamped;
                }
                Some(*current)
            }
            _ => None,
        }
    }

    /// queued/running -> terminal
    pub fn finish(&mut self, outcome: JobOutcome, at: DateTime<Utc>) -> Result<(), TransitionError> {
        let to = match &outcome {
            JobOutcome::Completed(_) => JobStatus::Completed,
            JobOutcome::Failed(_) => JobStatus::Failed,
            JobOutcome::Skipped(_) => JobStatus::Skipped,
            JobOutcome::Cancelled => JobStatus::Cancelled,
        };
        let from = self.status();
        // Completion requires the job to have actually run
        let allowed = match from {
            JobStatus::Running => true,
            JobStatus::Queued => to != JobStatus::Completed,
            _ => false,
        };
        if !allowed {
            return Err(TransitionError { from, to });
        }

        self.state = match outcome {
            JobOutcome::Completed(metrics) => JobState::Completed {
                metrics: Box::new(metrics),
            },
            JobOutcome::Failed(error) => JobState::Failed { error },
            JobOutcome::Skipped(reason) => JobState::Skipped { reason },
            JobOutcome::Cancelled => JobState::Cancelled,
        };
        self.finished_at.get_or_insert(at);
        Ok(())
    }

    /// Seconds between start and finish, when both are known
    pub fn processing_secs(&self) -> Option<f64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as f64 / 1000.0),
            _ => None,
        }
    }
}

/// Parser for ffmpeg progress output (key=value format)
#[derive(Debug, Default, Clone)]
pub struct ProgressParser {
    pub out_time_us: u64,
    pub fps: Option<f64>,
    pub speed: Option<f64>,
    pub bitrate_kbps: Option<f64>,
    pub total_size: Option<u64>,
    pub is_complete: bool,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a single line of ffmpeg progress output
    pub fn parse_line(&mut self, line: &str) {
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim();
            match key.trim() {
                // ffmpeg reports microseconds under both names
                "out_time_us" | "out_time_ms" => {
                    if let Ok(us) = value.parse::<u64>() {
                        self.out_time_us = us;
                    }
                }
                "fps" => {
                    if let Ok(f) = value.parse::<f64>() {
                        self.fps = Some(f);
                    }
                }
                "speed" => {
                    if let Ok(s) = value.trim_end_matches('x').parse::<f64>() {
                        self.speed = Some(s);
                    }
                }
                "bitrate" => {
                    if let Ok(b) = value.trim_end_matches("kbits/s").parse::<f64>() {
                        self.bitrate_kbps = Some(b);
                    }
                }
                "total_size" => {
                    if let Ok(size) = value.parse::<u64>() {
                        self.total_size = Some(size);
                    }
                }
                "progress" => {
                    if value == "end" {
                        self.is_complete = true;
                    }
                }
                _ => {}
            }
        }
    }

    pub fn out_time_s(&self) -> f64 {
        self.out_time_us as f64 / 1_000_000.0
    }

    /// Whole-number percent of `duration_s`, floored and capped at 100.
    /// None when the duration is unknown.
    pub fn progress_pct(&self, duration_s: Option<f64>) -> Option<f64> {
        if self.is_complete {
            return Some(100.0);
        }
        match duration_s {
            Some(dur) if dur > 0.0 => Some((self.out_time_s() / dur * 100.0).floor().clamp(0.0, 100.0)),
            _ => None,
        }
    }
}
