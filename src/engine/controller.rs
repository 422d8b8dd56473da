// Batch controller: owns one run at a time and drives it through its phases

use chrono::{Local, Utc};
use std::fs;
use std::path;
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::aggregator::{self, EventSink, SnapshotBoard};
use super::core::{
    BatchSnapshot, CollisionResolver, ControlSignal, Decision, EncodeSettings, EngineError,
    EngineEvent, FailureKind, Job, JobError, JobOutcome, JobQueue, JobStatus, Phase, ReportPaths,
    Reporter, ScanItem, Scanner, SkipReason,
};
use super::encoder::{CancellationToken, Encoder};
use super::worker::{WorkerContext, WorkerPool};
use crate::config::Config;

/// Resolve the output path of a fresh job. Jobs that must not reach a
/// worker come back terminal.
fn prepare(job: &mut Job, resolver: &CollisionResolver, dry_run: bool) {
    let outcome = match resolver.resolve(&job.relative_path) {
        Ok(Decision::Skip(path)) => {
            job.output_path = path;
            Some(JobOutcome::Skipped(SkipReason::OutputExists))
        }
        Ok(decision) => {
            job.output_path = decision.output_path().to_path_buf();
            dry_run.then_some(JobOutcome::Skipped(SkipReason::DryRun))
        }
        Err(e) => {
            job.output_path = resolver.target_for(&job.relative_path);
            Some(JobOutcome::Failed(JobError::new(
                FailureKind::Collision,
                e.to_string(),
            )))
        }
    };

    if let Some(outcome) = outcome {
        if let Err(e) = job.finish(outcome, Utc::now()) {
            tracing::warn!(job_id = %job.id, error = %e, "could not settle job at discovery");
        }
    }
}

/// Announce a prepared job and hand it to the queue when it still has to run
fn enqueue(job: Job, queue: &JobQueue, events: &EventSink) {
    let runnable = !job.is_terminal();
    events.emit(EngineEvent::JobDiscovered(Box::new(job.clone())));
    if runnable {
        push_or_cancel(job, queue, events);
    }
}

/// Queue a runnable job. A queue that refuses it is draining, so the job
/// settles as cancelled instead of staying queued forever.
fn push_or_cancel(job: Job, queue: &JobQueue, events: &EventSink) {
    let Err(mut rejected) = queue.push(job) else {
        return;
    };
    tracing::debug!(job_id = %rejected.id, "queue closed to new work, cancelling job");
    match rejected.finish(JobOutcome::Cancelled, Utc::now()) {
        Ok(()) => {
            events.emit(EngineEvent::JobFinished(Box::new(rejected)));
        }
        Err(e) => tracing::warn!(job_id = %rejected.id, error = %e, "could not cancel rejected job"),
    }
}

struct Feeder {
    scanner: Scanner,
    resolver: Arc<CollisionResolver>,
    queue: Arc<JobQueue>,
    events: EventSink,
    cancel: CancellationToken,
    dry_run: bool,
}

impl Feeder {
    fn run(self) {
        let mut found = 0usize;
        for item in self.scanner.iter() {
            if self.cancel.is_cancelled() {
                tracing::info!(found, "scan stopped by cancel");
                break;
            }
            match item {
                ScanItem::Warning(warning) => {
                    self.events.emit(EngineEvent::ScanWarning(warning));
                }
                ScanItem::Found(entry) => {
                    found += 1;
                    let mut job = Job::new(entry.source_path, entry.relative_path, entry.size_bytes);
                    prepare(&mut job, &self.resolver, self.dry_run);
                    enqueue(job, &self.queue, &self.events);
                }
            }
        }
        self.queue.close();
        self.events.emit(EngineEvent::ScanFinished);
        tracing::info!(found, root = %self.scanner.root().display(), "scan finished");
    }
}

/// One started batch and the threads serving it
struct Run {
    events: EventSink,
    queue: Arc<JobQueue>,
    cancel: CancellationToken,
    resolver: Arc<CollisionResolver>,
    settings: Arc<EncodeSettings>,
    workers: usize,
    dry_run: bool,
    grace: Option<Duration>,
    pools: Vec<WorkerPool>,
    feeder: Option<JoinHandle<()>>,
}

impl Run {
    fn spawn_workers(&mut self, encoder: &Arc<dyn Encoder>) -> Result<(), EngineError> {
        if self.dry_run {
            return Ok(());
        }
        let ctx = WorkerContext {
            queue: self.queue.clone(),
            encoder: encoder.clone(),
            settings: self.settings.clone(),
            cancel: self.cancel.clone(),
            events: self.events.clone(),
        };
        self.pools.push(WorkerPool::spawn(self.workers, ctx)?);
        Ok(())
    }

    /// Join the threads that already exited
    fn reap(&mut self) {
        if self.feeder.as_ref().is_some_and(|f| f.is_finished()) {
            if let Some(Err(_)) = self.feeder.take().map(JoinHandle::join) {
                tracing::error!("feeder thread panicked");
            }
        }
        self.pools.retain_mut(|pool| pool.reap() > 0);
    }
}

impl Drop for Run {
    fn drop(&mut self) {
        // Stop anything still working for a run nobody can observe anymore
        self.cancel.cancel();
        self.queue.drain();
        self.queue.close();
    }
}

/// Entry point for presentation layers. All batch mutation goes through here.
pub struct Controller {
    config: Config,
    encoder: Arc<dyn Encoder>,
    board: Arc<SnapshotBoard>,
    run: Option<Run>,
}

impl Controller {
    pub fn new(config: Config, encoder: Arc<dyn Encoder>) -> Self {
        Self {
            config,
            encoder,
            board: Arc::new(SnapshotBoard::new()),
            run: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Replace the configuration. Rejected while a batch is active.
    pub fn set_config(&mut self, config: Config) -> Result<(), EngineError> {
        if self.phase().is_active() {
            return Err(EngineError::ConfigLocked);
        }
        self.config = config;
        Ok(())
    }

    pub fn phase(&self) -> Phase {
        self.board.latest().phase
    }

    pub fn snapshot(&self) -> Arc<BatchSnapshot> {
        self.board.latest()
    }

    /// Receive a snapshot after every aggregator update, starting with the current one
    pub fn subscribe(&self) -> Receiver<Arc<BatchSnapshot>> {
        self.board.subscribe()
    }

    /// Validate, then start scanning and encoding in the background
    pub fn start(&mut self) -> Result<(), EngineError> {
        let phase = self.phase();
        if !matches!(phase, Phase::Idle | Phase::Completed) {
            return Err(EngineError::InvalidTransition {
                action: "start",
                phase,
            });
        }

        self.config.normalize();
        self.config.validate()?;
        let batch = &self.config.batch;
        let input_error = |e: std::io::Error| EngineError::InputRoot {
            path: batch.input_dir.clone(),
            message: e.to_string(),
        };
        fs::read_dir(&batch.input_dir).map_err(input_error)?;
        // Records carry absolute paths whatever the working directory
        let input_root = fs::canonicalize(&batch.input_dir).map_err(input_error)?;
        let output_root = path::absolute(&batch.output_dir)?;

        // Dry runs never touch the encoder or the filesystem
        let reporter = if batch.dry_run {
            Reporter::disabled()
        } else {
            self.encoder
                .preflight()
                .map_err(EngineError::EncoderUnavailable)?;
            let paths = ReportPaths::from_config(&self.config.log, &output_root, Local::now());
            Reporter::create(paths)?
        };

        // A previous run is stopped and its threads left to exit on their own
        self.run = None;

        // The aggregator thread exits once every sink clone is dropped
        let (events, _aggregator) = aggregator::spawn(reporter, self.board.clone())?;
        events.control(ControlSignal::Start)?;

        let cancel = CancellationToken::new();
        let queue = Arc::new(JobQueue::new());
        let resolver = Arc::new(CollisionResolver::new(
            output_root.clone(),
            batch.collision_policy,
        ));
        let mut run = Run {
            events: events.clone(),
            queue: queue.clone(),
            cancel: cancel.clone(),
            resolver: resolver.clone(),
            settings: Arc::new(EncodeSettings::from_config(&self.config)),
            workers: self.config.effective_workers(),
            dry_run: batch.dry_run,
            grace: batch.cancel_grace_secs.map(Duration::from_secs),
            pools: Vec::new(),
            feeder: None,
        };
        run.spawn_workers(&self.encoder)?;

        let feeder = Feeder {
            scanner: Scanner::new(input_root.clone(), &batch.extensions)
                .follow_links(batch.follow_links),
            resolver,
            queue,
            events,
            cancel,
            dry_run: batch.dry_run,
        };
        run.feeder = Some(
            thread::Builder::new()
                .name("vidproc-feeder".into())
                .spawn(move || feeder.run())?,
        );

        tracing::info!(
            input = %input_root.display(),
            output = %output_root.display(),
            workers = run.workers,
            dry_run = run.dry_run,
            "batch started"
        );
        self.run = Some(run);
        Ok(())
    }

    fn active_run(&self) -> Result<&Run, EngineError> {
        self.run.as_ref().ok_or(EngineError::NotStarted)
    }

    /// Stop handing out queued jobs. Running jobs finish normally.
    pub fn pause(&self) -> Result<(), EngineError> {
        let run = self.active_run()?;
        // Close the gate before the phase changes so no job starts in between
        run.queue.pause();
        if let Err(e) = run.events.control(ControlSignal::Pause) {
            let already_paused = matches!(
                e,
                EngineError::InvalidTransition {
                    phase: Phase::Paused,
                    ..
                }
            );
            if !already_paused {
                run.queue.resume();
            }
            return Err(e);
        }
        Ok(())
    }

    /// The gate opens only once the phase reads running again
    pub fn resume(&self) -> Result<(), EngineError> {
        let run = self.active_run()?;
        run.events.control(ControlSignal::Resume)?;
        run.queue.resume();
        Ok(())
    }

    /// Cancel the batch: queued jobs are cancelled at once, running ones cooperatively
    pub fn cancel(&self) -> Result<(), EngineError> {
        let run = self.active_run()?;
        let phase = run.events.control(ControlSignal::Cancel)?;
        run.cancel.cancel();

        let now = Utc::now();
        let drained = run.queue.drain();
        tracing::info!(unstarted = drained.len(), "cancelling batch");
        for mut job in drained {
            if job.finish(JobOutcome::Cancelled, now).is_ok() {
                run.events.emit(EngineEvent::JobFinished(Box::new(job)));
            }
        }

        if let (Some(grace), Phase::Cancelling) = (run.grace, phase) {
            let events = run.events.clone();
            thread::Builder::new()
                .name("vidproc-cancel-grace".into())
                .spawn(move || {
                    thread::sleep(grace);
                    match events.control(ControlSignal::ForceComplete) {
                        Ok(phase) => tracing::debug!(%phase, "cancel grace period elapsed"),
                        Err(e) => tracing::debug!(error = %e, "cancel grace period not applied"),
                    }
                })?;
        }
        Ok(())
    }

    /// Re-run every failed job of a completed batch. Returns how many were retried.
    pub fn retry_failed(&mut self) -> Result<usize, EngineError> {
        let snapshot = self.snapshot();
        if snapshot.phase != Phase::Completed {
            return Err(EngineError::InvalidTransition {
                action: "retry",
                phase: snapshot.phase,
            });
        }
        let failed: Vec<&Job> = snapshot.jobs_with_status(JobStatus::Failed).collect();
        if failed.is_empty() {
            return Ok(0);
        }

        let encoder = self.encoder.clone();
        let run = self.run.as_mut().ok_or(EngineError::NotStarted)?;

        // Workers of the previous pass may still be stuck after a forced
        // completion, so the retry gets its own queue and token.
        run.queue = Arc::new(JobQueue::new());
        run.cancel = CancellationToken::new();

        let jobs: Vec<Job> = failed
            .iter()
            .map(|old| {
                run.resolver.release(&old.output_path);
                let mut job = Job::retry_of(old);
                prepare(&mut job, &run.resolver, run.dry_run);
                job
            })
            .collect();
        let count = jobs.len();

        run.events.control(ControlSignal::Retry(jobs.clone()))?;
        for job in jobs.into_iter().filter(|j| !j.is_terminal()) {
            push_or_cancel(job, &run.queue, &run.events);
        }
        run.queue.close();
        run.spawn_workers(&encoder)?;

        tracing::info!(count, "retrying failed jobs");
        Ok(count)
    }

    /// Block until the batch completes and return the final snapshot
    pub fn wait(&mut self) -> Result<Arc<BatchSnapshot>, EngineError> {
        self.active_run()?;
        let snapshot = self
            .board
            .wait_until(|s| s.phase == Phase::Completed, None)
            .ok_or(EngineError::Disconnected)?;
        if let Some(run) = self.run.as_mut() {
            run.reap();
        }
        Ok(snapshot)
    }

    /// Like `wait`, giving up after `timeout`. Returns whether the batch completed.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, EngineError> {
        self.active_run()?;
        Ok(self
            .board
            .wait_until(|s| s.phase == Phase::Completed, Some(timeout))
            .is_some())
    }
}
