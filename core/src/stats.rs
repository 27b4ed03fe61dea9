//! Per-source statistics.

use parking_lot::Mutex;
use serde::Serialize;

/// Counters owned by one work source. All fields live under a single lock;
/// workers touch them from many threads.
#[derive(Default)]
pub struct SourceStats {
    inner: Mutex<Counters>,
}

#[derive(Default, Clone)]
struct Counters {
    jobs_received: u64,
    shares_accepted: u64,
    shares_rejected: u64,
    submit_retries: u64,
    transport_errors: u64,
    /// `None` until the first response tells us either way.
    supports_rollntime: Option<bool>,
}

/// Point-in-time copy for display and the stats file.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub jobs_received: u64,
    pub shares_accepted: u64,
    pub shares_rejected: u64,
    pub submit_retries: u64,
    pub transport_errors: u64,
    pub supports_rollntime: Option<bool>,
}

impl SourceStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_jobs_received(&self, count: u64) {
        self.inner.lock().jobs_received += count;
    }

    pub fn share_accepted(&self) {
        self.inner.lock().shares_accepted += 1;
    }

    pub fn share_rejected(&self) {
        self.inner.lock().shares_rejected += 1;
    }

    pub fn submit_retry(&self) {
        self.inner.lock().submit_retries += 1;
    }

    pub fn transport_error(&self) {
        self.inner.lock().transport_errors += 1;
    }

    pub fn set_supports_rollntime(&self, value: Option<bool>) {
        self.inner.lock().supports_rollntime = value;
    }

    pub fn supports_rollntime(&self) -> Option<bool> {
        self.inner.lock().supports_rollntime
    }

    pub fn jobs_received(&self) -> u64 {
        self.inner.lock().jobs_received
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let c = self.inner.lock().clone();
        StatsSnapshot {
            jobs_received: c.jobs_received,
            shares_accepted: c.shares_accepted,
            shares_rejected: c.shares_rejected,
            submit_retries: c.submit_retries,
            transport_errors: c.transport_errors,
            supports_rollntime: c.supports_rollntime,
        }
    }
}
