// FIFO job queue shared by the feeder and the worker pool

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
#[cfg(test)]
use std::time::Duration;

use super::types::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Open,
    Paused,
    Draining,
}

#[derive(Debug)]
struct Inner {
    jobs: VecDeque<Job>,
    gate: Gate,
    closed: bool,
}

/// Blocking FIFO. Workers park in `pop` until a job arrives, the queue is
/// closed, or it starts draining.
#[derive(Debug)]
pub struct JobQueue {
    inner: Mutex<Inner>,
    ready: Condvar,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                jobs: VecDeque::new(),
                gate: Gate::Open,
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a job. While draining the job is handed back untouched.
    pub fn push(&self, job: Job) -> Result<(), Job> {
        let mut inner = self.lock();
        if inner.gate == Gate::Draining {
            return Err(job);
        }
        inner.jobs.push_back(job);
        drop(inner);
        self.ready.notify_one();
        Ok(())
    }

    /// Take the next job, blocking while empty or paused.
    /// Returns `None` once closed and empty, or when draining.
    pub fn pop(&self) -> Option<Job> {
        let mut inner = self.lock();
        loop {
            match inner.gate {
                Gate::Draining => return None,
                Gate::Open => {
                    if let Some(job) = inner.jobs.pop_front() {
                        return Some(job);
                    }
                    if inner.closed {
                        return None;
                    }
                }
                Gate::Paused => {}
            }
            inner = self.ready.wait(inner).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Stop releasing jobs to idle workers
    pub fn pause(&self) {
        let mut inner = self.lock();
        if inner.gate == Gate::Open {
            inner.gate = Gate::Paused;
        }
    }

    pub fn resume(&self) {
        let mut inner = self.lock();
        if inner.gate == Gate::Paused {
            inner.gate = Gate::Open;
        }
        drop(inner);
        self.ready.notify_all();
    }

    /// Refuse further pushes, wake every waiter and hand back the unstarted jobs
    pub fn drain(&self) -> Vec<Job> {
        let mut inner = self.lock();
        inner.gate = Gate::Draining;
        let jobs: Vec<Job> = inner.jobs.drain(..).collect();
        drop(inner);
        self.ready.notify_all();
        jobs
    }

    /// No more pushes are coming; workers exit once the queue is empty
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }
}

// Introspection used by the unit tests
#[cfg(test)]
impl JobQueue {
    /// Like `pop`, but gives up after `timeout` with `None`
    pub(crate) fn pop_timeout(&self, timeout: Duration) -> Option<Job> {
        let mut inner = self.lock();
        loop {
            match inner.gate {
                Gate::Draining => return None,
                Gate::Open => {
                    if let Some(job) = inner.jobs.pop_front() {
                        return Some(job);
                    }
                    if inner.closed {
                        return None;
                    }
                }
                Gate::Paused => {}
            }
            let (guard, result) = self
                .ready
                .wait_timeout(inner, timeout)
                .unwrap_or_else(|e| e.into_inner());
            inner = guard;
            if result.timed_out() {
                return None;
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.lock().gate == Gate::Paused
    }
}
