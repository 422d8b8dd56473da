use chrono::{DateTime, Utc};

use super::scan::ScanWarning;
use super::types::{Job, JobId};

/// Facts published by the feeder and workers. Only the aggregator applies them.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A job entered the batch. Already-terminal jobs (skipped, collision
    /// failures, dry-run entries) are recorded as finished right away.
    JobDiscovered(Box<Job>),

    JobStarted { job_id: JobId, at: DateTime<Utc> },

    JobProgress { job_id: JobId, percent: f64 },

    /// Terminal record for a job, as owned by the worker
    JobFinished(Box<Job>),

    ScanWarning(ScanWarning),

    /// The feeder has pushed every scanned job
    ScanFinished,
}
