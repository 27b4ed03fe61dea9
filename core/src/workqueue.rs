//! Shared queue of jobs waiting to be mined.
//!
//! Work sources push, miners take. `target` is the fill level the framework
//! tries to keep; sources use `count()` against it for back-pressure.

use std::collections::VecDeque;
use std::time::Instant;

use log::debug;
use parking_lot::Mutex;

use crate::job::Job;

pub struct WorkQueue {
    inner: Mutex<Inner>,
    target: usize,
}

struct Inner {
    jobs: VecDeque<Job>,
    /// Bumped on every cancellation event, not per cancelled job.
    cancellations: u64,
}

impl WorkQueue {
    pub fn new(target: usize) -> Self {
        Self {
            inner: Mutex::new(Inner { jobs: VecDeque::new(), cancellations: 0 }),
            target,
        }
    }

    /// Desired fill level.
    pub fn target(&self) -> usize {
        self.target
    }

    pub fn count(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    pub fn push(&self, jobs: Vec<Job>) {
        if jobs.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        inner.jobs.extend(jobs);
    }

    /// Hand out the oldest non-expired job.
    pub fn take(&self) -> Option<Job> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        while let Some(job) = inner.jobs.pop_front() {
            if job.is_expired(now) {
                continue;
            }
            return Some(job);
        }
        None
    }

    /// Flush everything queued. Returns how many jobs were dropped.
    pub fn cancel_all(&self) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.jobs.len();
        inner.jobs.clear();
        inner.cancellations += 1;
        if dropped > 0 {
            debug!("work queue flushed, {} queued jobs dropped", dropped);
        }
        dropped
    }

    /// How many cancellation events have hit this queue.
    pub fn cancellations(&self) -> u64 {
        self.inner.lock().cancellations
    }
}
