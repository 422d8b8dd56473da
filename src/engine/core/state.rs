// Batch aggregate: per-job records, rollups and the batch phase machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::error::EngineError;
use super::events::EngineEvent;
use super::scan::ScanWarning;
use super::types::{Job, JobId, JobOutcome, JobStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Scanning,
    Running,
    Paused,
    Cancelling,
    Completed,
}

impl Phase {
    /// A batch is underway and has not settled yet
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Phase::Scanning | Phase::Running | Phase::Paused | Phase::Cancelling
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Scanning => "scanning",
            Phase::Running => "running",
            Phase::Paused => "paused",
            Phase::Cancelling => "cancelling",
            Phase::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// Requests from the controller. Each one is validated against the current phase.
#[derive(Debug, Clone)]
pub enum ControlSignal {
    Start,
    Pause,
    Resume,
    Cancel,
    /// Fresh records replacing failed ones (matched through `retry_of`)
    Retry(Vec<Job>),
    /// Cancel grace period ran out; stop waiting for workers
    ForceComplete,
}

impl ControlSignal {
    pub fn action(&self) -> &'static str {
        match self {
            ControlSignal::Start => "start",
            ControlSignal::Pause => "pause",
            ControlSignal::Resume => "resume",
            ControlSignal::Cancel => "cancel",
            ControlSignal::Retry(_) => "retry",
            ControlSignal::ForceComplete => "force-complete",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    pub fn get(&self, status: JobStatus) -> usize {
        match status {
            JobStatus::Queued => self.queued,
            JobStatus::Running => self.running,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Skipped => self.skipped,
            JobStatus::Cancelled => self.cancelled,
        }
    }

    fn slot(&mut self, status: JobStatus) -> &mut usize {
        match status {
            JobStatus::Queued => &mut self.queued,
            JobStatus::Running => &mut self.running,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Skipped => &mut self.skipped,
            JobStatus::Cancelled => &mut self.cancelled,
        }
    }

    fn add(&mut self, status: JobStatus) {
        *self.slot(status) += 1;
    }

    fn remove(&mut self, status: JobStatus) {
        let slot = self.slot(status);
        *slot = slot.saturating_sub(1);
    }

    fn shift(&mut self, from: JobStatus, to: JobStatus) {
        self.remove(from);
        self.add(to);
    }

    pub fn total(&self) -> usize {
        JobStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }

    /// Jobs still waiting for or holding a worker
    pub fn outstanding(&self) -> usize {
        self.queued + self.running
    }
}

/// Read-only view of the batch handed to presentation layers
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSnapshot {
    pub phase: Phase,
    pub counts: StatusCounts,
    pub total_bytes: u64,
    pub processed_bytes: u64,
    pub percent: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed_secs: f64,
    pub eta_secs: Option<f64>,
    pub jobs: Vec<Job>,
    /// Failed records replaced by a retry
    pub superseded: Vec<Job>,
    pub warnings: Vec<ScanWarning>,
}

impl BatchSnapshot {
    pub fn total_jobs(&self) -> usize {
        self.jobs.len()
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn jobs_with_status(&self, status: JobStatus) -> impl Iterator<Item = &Job> {
        self.jobs.iter().filter(move |j| j.status() == status)
    }
}

/// Totals written when a batch settles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub phase: Phase,
    pub total_jobs: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub retried: usize,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub saved_bytes: u64,
    pub compression_ratio_pct: f64,
    pub elapsed_secs: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// The batch aggregate. Mutated only through `apply`, `control` and `settle`.
#[derive(Debug, Default)]
pub struct BatchState {
    phase: Phase,
    feeding: bool,
    jobs: Vec<Job>,
    index: HashMap<JobId, usize>,
    superseded: Vec<Job>,
    counts: StatusCounts,
    total_bytes: u64,
    processed_bytes: u64,
    warnings: Vec<ScanWarning>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl BatchState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn counts(&self) -> StatusCounts {
        self.counts
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.index.get(&id).map(|&i| &self.jobs[i])
    }

    fn job_mut(&mut self, id: JobId) -> Option<&mut Job> {
        match self.index.get(&id) {
            Some(&i) => self.jobs.get_mut(i),
            None => None,
        }
    }

    fn insert(&mut self, job: Job) {
        self.counts.add(job.status());
        let bytes = job.source_bytes.unwrap_or(0);
        self.total_bytes += bytes;
        if job.is_terminal() {
            self.processed_bytes += bytes;
        }
        self.index.insert(job.id, self.jobs.len());
        self.jobs.push(job);
    }

    /// Apply one event. Returns the records that became terminal because of it.
    pub fn apply(&mut self, event: EngineEvent) -> Vec<Job> {
        match event {
            EngineEvent::JobDiscovered(job) => {
                if self.phase == Phase::Completed || self.index.contains_key(&job.id) {
                    tracing::warn!(job_id = %job.id, phase = %self.phase, "ignoring late or duplicate job");
                    return Vec::new();
                }
                let terminal = job.is_terminal().then(|| (*job).clone());
                self.insert(*job);
                terminal.into_iter().collect()
            }
            EngineEvent::JobStarted { job_id, at } => {
                let started = self
                    .job_mut(job_id)
                    .is_some_and(|job| job.start(at).is_ok());
                if started {
                    self.counts.shift(JobStatus::Queued, JobStatus::Running);
                }
                Vec::new()
            }
            EngineEvent::JobProgress { job_id, percent } => {
                if let Some(job) = self.job_mut(job_id) {
                    job.advance(percent);
                }
                Vec::new()
            }
            EngineEvent::JobFinished(finished) => {
                if !finished.is_terminal() {
                    tracing::warn!(job_id = %finished.id, "finish event without terminal state");
                    return Vec::new();
                }
                let Some(&slot) = self.index.get(&finished.id) else {
                    tracing::warn!(job_id = %finished.id, "finish event for unknown job");
                    return Vec::new();
                };
                let from = self.jobs[slot].status();
                if from.is_terminal() {
                    // Already settled, e.g. forced to cancelled after the grace period
                    tracing::debug!(job_id = %finished.id, %from, "ignoring late finish");
                    return Vec::new();
                }
                self.counts.shift(from, finished.status());
                self.processed_bytes += finished.source_bytes.unwrap_or(0);
                self.jobs[slot] = (*finished).clone();
                vec![*finished]
            }
            EngineEvent::ScanWarning(warning) => {
                self.warnings.push(warning);
                Vec::new()
            }
            EngineEvent::ScanFinished => {
                self.feeding = false;
                if self.phase == Phase::Scanning {
                    self.phase = Phase::Running;
                }
                Vec::new()
            }
        }
    }

    /// Validate and apply a control request.
    /// Returns the new phase and any records that became terminal.
    pub fn control(
        &mut self,
        signal: ControlSignal,
        now: DateTime<Utc>,
    ) -> Result<(Phase, Vec<Job>), EngineError> {
        let action = signal.action();
        let mut finished = Vec::new();

        match (signal, self.phase) {
            (ControlSignal::Start, Phase::Idle) => {
                self.phase = Phase::Scanning;
                self.feeding = true;
                self.started_at = Some(now);
            }
            (ControlSignal::Pause, Phase::Scanning | Phase::Running) => {
                self.phase = Phase::Paused;
            }
            (ControlSignal::Resume, Phase::Paused) => {
                self.phase = if self.feeding {
                    Phase::Scanning
                } else {
                    Phase::Running
                };
            }
            (ControlSignal::Cancel, Phase::Scanning | Phase::Running | Phase::Paused) => {
                self.phase = Phase::Cancelling;
            }
            (ControlSignal::Cancel, Phase::Cancelling) => {}
            (ControlSignal::Retry(jobs), Phase::Completed) => {
                self.phase = Phase::Running;
                self.finished_at = None;
                for job in jobs {
                    if let Some(old_id) = job.retry_of {
                        self.supersede(old_id);
                    }
                    if job.is_terminal() {
                        finished.push(job.clone());
                    }
                    self.insert(job);
                }
            }
            (ControlSignal::ForceComplete, Phase::Cancelling) => {
                self.feeding = false;
                for job in self.jobs.iter_mut().filter(|j| !j.is_terminal()) {
                    let from = job.status();
                    if job.finish(JobOutcome::Cancelled, now).is_ok() {
                        self.counts.shift(from, JobStatus::Cancelled);
                        self.processed_bytes += job.source_bytes.unwrap_or(0);
                        finished.push(job.clone());
                    }
                }
            }
            (ControlSignal::ForceComplete, Phase::Completed) => {}
            (_, phase) => return Err(EngineError::InvalidTransition { action, phase }),
        }

        tracing::debug!(action, phase = %self.phase, "control applied");
        Ok((self.phase, finished))
    }

    /// Move a record from the live list into `superseded`
    fn supersede(&mut self, old_id: JobId) {
        let Some(slot) = self.index.remove(&old_id) else {
            return;
        };
        let old = self.jobs.remove(slot);
        for idx in self.index.values_mut() {
            if *idx > slot {
                *idx -= 1;
            }
        }
        self.counts.remove(old.status());
        let bytes = old.source_bytes.unwrap_or(0);
        self.total_bytes = self.total_bytes.saturating_sub(bytes);
        if old.is_terminal() {
            self.processed_bytes = self.processed_bytes.saturating_sub(bytes);
        }
        self.superseded.push(old);
    }

    /// Nothing left to feed, queue or run
    pub fn is_settled(&self) -> bool {
        matches!(
            self.phase,
            Phase::Running | Phase::Paused | Phase::Cancelling
        ) && !self.feeding
            && self.counts.outstanding() == 0
    }

    /// Move to `Completed` when settled. Returns true on that transition.
    pub fn settle(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_settled() {
            return false;
        }
        self.phase = Phase::Completed;
        self.finished_at = Some(now);
        true
    }

    /// Count-weighted mean: queued 0, running its percent, terminal 100
    pub fn percent(&self) -> f64 {
        if self.jobs.is_empty() {
            return if self.phase == Phase::Completed { 100.0 } else { 0.0 };
        }
        let sum: f64 = self
            .jobs
            .iter()
            .map(|job| match job.status() {
                JobStatus::Queued => 0.0,
                JobStatus::Running => job.progress_percent().unwrap_or(0.0),
                _ => 100.0,
            })
            .sum();
        (sum / self.jobs.len() as f64).clamp(0.0, 100.0)
    }

    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> f64 {
        match self.started_at {
            Some(start) => {
                let end = self.finished_at.unwrap_or(now);
                (end - start).num_milliseconds().max(0) as f64 / 1000.0
            }
            None => 0.0,
        }
    }

    /// Linear estimate from elapsed time and batch percent
    pub fn eta_secs(&self, now: DateTime<Utc>) -> Option<f64> {
        if self.phase == Phase::Completed {
            return Some(0.0);
        }
        let pct = self.percent();
        if pct <= 0.0 || pct >= 100.0 {
            return None;
        }
        let elapsed = self.elapsed_secs(now);
        Some(elapsed * (100.0 - pct) / pct)
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> BatchSnapshot {
        BatchSnapshot {
            phase: self.phase,
            counts: self.counts,
            total_bytes: self.total_bytes,
            processed_bytes: self.processed_bytes,
            percent: self.percent(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            elapsed_secs: self.elapsed_secs(now),
            eta_secs: self.eta_secs(now),
            jobs: self.jobs.clone(),
            superseded: self.superseded.clone(),
            warnings: self.warnings.clone(),
        }
    }

    pub fn summary(&self, now: DateTime<Utc>) -> BatchSummary {
        let (input_bytes, output_bytes, saved_bytes) = self
            .jobs
            .iter()
            .filter_map(|j| j.metrics())
            .fold((0u64, 0u64, 0u64), |(i, o, s), m| {
                (
                    i + m.original_bytes.unwrap_or(0),
                    o + m.output_bytes.unwrap_or(0),
                    s + m.saved_bytes(),
                )
            });
        let compression_ratio_pct = if input_bytes > 0 {
            saved_bytes as f64 / input_bytes as f64 * 100.0
        } else {
            0.0
        };

        BatchSummary {
            phase: self.phase,
            total_jobs: self.jobs.len(),
            completed: self.counts.completed,
            failed: self.counts.failed,
            skipped: self.counts.skipped,
            cancelled: self.counts.cancelled,
            retried: self.superseded.len(),
            input_bytes,
            output_bytes,
            saved_bytes,
            compression_ratio_pct,
            elapsed_secs: self.elapsed_secs(now),
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}
