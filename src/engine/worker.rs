// Worker pool for parallel video encoding

use chrono::Utc;
use std::any::Any;
use std::fs;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use super::aggregator::EventSink;
use super::core::{
    EncodeSettings, EngineEvent, FailureKind, Job, JobError, JobMetrics, JobOutcome, JobQueue,
    ensure_parent_dir,
};
use super::encoder::{CancellationToken, EncodeError, EncodeRequest, Encoder};

/// Everything a worker thread shares with its siblings
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: Arc<JobQueue>,
    pub encoder: Arc<dyn Encoder>,
    pub settings: Arc<EncodeSettings>,
    pub cancel: CancellationToken,
    pub events: EventSink,
}

/// Fixed set of worker threads pulling from one queue
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers. Each exits when the queue closes or drains.
    pub fn spawn(count: usize, ctx: WorkerContext) -> io::Result<Self> {
        let mut handles = Vec::with_capacity(count);
        for worker_id in 0..count.max(1) {
            let ctx = ctx.clone();
            let handle = thread::Builder::new()
                .name(format!("vidproc-worker-{}", worker_id))
                .spawn(move || worker_loop(worker_id, ctx))?;
            handles.push(handle);
        }
        tracing::debug!(workers = handles.len(), "worker pool started");
        Ok(Self { handles })
    }

    /// Join the workers that already exited. Returns how many are still alive.
    pub fn reap(&mut self) -> usize {
        let (done, alive): (Vec<_>, Vec<_>) =
            self.handles.drain(..).partition(|h| h.is_finished());
        for handle in done {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked outside a job");
            }
        }
        self.handles = alive;
        self.handles.len()
    }

    /// Wait for every worker to exit
    #[cfg(test)]
    pub(crate) fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked outside a job");
            }
        }
    }
}

fn worker_loop(worker_id: usize, ctx: WorkerContext) {
    while let Some(job) = ctx.queue.pop() {
        let job_id = job.id;
        let finished = run_job(&ctx, job);
        tracing::debug!(worker_id, %job_id, status = %finished.status(), "job finished");
        if !ctx.events.emit(EngineEvent::JobFinished(Box::new(finished))) {
            break;
        }
    }
    tracing::trace!(worker_id, "worker idle, exiting");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn finish(mut job: Job, outcome: JobOutcome) -> Job {
    if let Err(e) = job.finish(outcome, Utc::now()) {
        tracing::warn!(job_id = %job.id, error = %e, "dropping invalid job transition");
    }
    job
}

/// Run one queued job to a terminal record. Never panics out of the encoder.
pub fn run_job(ctx: &WorkerContext, mut job: Job) -> Job {
    if ctx.cancel.is_cancelled() {
        return finish(job, JobOutcome::Cancelled);
    }

    let started_at = Utc::now();
    if let Err(e) = job.start(started_at) {
        tracing::warn!(job_id = %job.id, error = %e, "job was not queued");
        return job;
    }
    ctx.events.emit(EngineEvent::JobStarted {
        job_id: job.id,
        at: started_at,
    });
    tracing::info!(
        source = %job.source_path.display(),
        output = %job.output_path.display(),
        "encoding"
    );

    if let Err(e) = ensure_parent_dir(&job.output_path) {
        let message = format!("Failed to create output directory: {}", e);
        return finish(job, JobOutcome::Failed(JobError::new(FailureKind::Io, message)));
    }

    job.output_preexisting = job.output_path.exists();
    let request = EncodeRequest {
        source_path: job.source_path.clone(),
        output_path: job.output_path.clone(),
        settings: ctx.settings.clone(),
    };

    let timer = Instant::now();
    let result = {
        let job_id = job.id;
        let events = &ctx.events;
        let tracked = &mut job;
        let mut on_progress = |pct: f64| {
            let before = tracked.progress_percent();
            if let Some(percent) = tracked.advance(pct).filter(|p| Some(*p) != before) {
                events.emit(EngineEvent::JobProgress { job_id, percent });
            }
        };
        panic::catch_unwind(AssertUnwindSafe(|| {
            ctx.encoder
                .transcode(&request, &ctx.cancel, &mut on_progress)
        }))
    };
    let processing_secs = timer.elapsed().as_secs_f64();

    let outcome = match result {
        Ok(Ok(report)) => {
            let output_bytes = report
                .output_bytes
                .or_else(|| fs::metadata(&job.output_path).ok().map(|m| m.len()));
            JobOutcome::Completed(JobMetrics {
                original_bytes: job.source_bytes,
                output_bytes,
                original: report.source,
                output: report.output,
                processing_secs,
            })
        }
        Ok(Err(EncodeError::Cancelled)) => JobOutcome::Cancelled,
        Ok(Err(EncodeError::Failed { message, .. })) => {
            tracing::warn!(source = %job.source_path.display(), error = %message, "encode failed");
            JobOutcome::Failed(JobError::new(FailureKind::Encode, message))
        }
        Err(payload) => {
            let message = format!("encoder panicked: {}", panic_message(payload.as_ref()));
            tracing::error!(source = %job.source_path.display(), %message);
            JobOutcome::Failed(JobError::new(FailureKind::Encode, message))
        }
    };

    // Nothing unfinished may be left where a finished output would live
    if !matches!(outcome, JobOutcome::Completed(_))
        && !job.output_preexisting
        && job.output_path.exists()
    {
        if let Err(e) = fs::remove_file(&job.output_path) {
            tracing::warn!(path = %job.output_path.display(), error = %e, "failed to remove incomplete output");
        }
    }

    finish(job, outcome)
}
