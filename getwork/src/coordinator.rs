//! Shared coordination state.
//!
//! Two distinct monitors: the demand monitor wakes idle fetchers one token at
//! a time, the state monitor serializes the epoch vocabulary and the long
//! poll handshake. Long poll setup must never contend with fetcher wake-ups.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

/// Fetcher demand bookkeeping, guarded by the demand monitor.
#[derive(Default)]
pub(crate) struct DemandCounters {
    /// Fetch transactions currently claimed (running plus pending pickup).
    pub fetchers_running: usize,
    /// Demand tokens waiting for a worker.
    pub fetchers_pending: usize,
    /// Estimated jobs attached to claimed transactions.
    pub fetcher_jobs_running: i64,
    /// Estimated jobs attached to waiting tokens.
    pub fetcher_jobs_pending: i64,
    pub shutdown: bool,
    /// Bumped on every start so workers abandoned by a bounded-wait join
    /// cannot rejoin a later generation's pool.
    pub generation: u64,
}

/// Long poll and cancellation state, guarded by the state monitor.
#[derive(Default)]
pub(crate) struct SourceState {
    /// Bumped whenever outstanding jobs become invalid. A batch built from a
    /// response captured under an older epoch is discarded.
    pub job_epoch: u64,
    /// Highest long poll response already applied.
    pub lp_epoch: u64,
    /// Generation counter for long poll listeners; a listener born under a
    /// lower value retires at its next check.
    pub run_cycle: u64,
    pub long_poll_url: Option<String>,
    pub signals_new_block: bool,
    pub last_identifier: Option<i64>,
}

pub(crate) struct Coordinator {
    pub demand: Mutex<DemandCounters>,
    pub demand_cond: Condvar,
    pub state: Mutex<SourceState>,
    /// Jobs expected per fetch, refreshed from the last observed roll count.
    estimated_jobs: AtomicUsize,
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            demand: Mutex::new(DemandCounters::default()),
            demand_cond: Condvar::new(),
            state: Mutex::new(SourceState::default()),
            estimated_jobs: AtomicUsize::new(1),
        }
    }

    pub fn job_epoch(&self) -> u64 {
        self.state.lock().job_epoch
    }

    pub fn bump_job_epoch(&self) -> u64 {
        let mut state = self.state.lock();
        state.job_epoch += 1;
        state.job_epoch
    }

    pub fn run_cycle(&self) -> u64 {
        self.state.lock().run_cycle
    }

    pub fn bump_run_cycle(&self) -> u64 {
        let mut state = self.state.lock();
        state.run_cycle += 1;
        state.run_cycle
    }

    /// The epoch a long poll response will claim, captured before the request
    /// goes on the wire.
    pub fn next_lp_epoch(&self) -> u64 {
        self.state.lock().lp_epoch + 1
    }

    pub fn estimated_jobs(&self) -> usize {
        self.estimated_jobs.load(Ordering::Relaxed).max(1)
    }

    pub fn set_estimated_jobs(&self, count: usize) {
        self.estimated_jobs.store(count.max(1), Ordering::Relaxed);
    }

    pub fn generation(&self) -> u64 {
        self.demand.lock().generation
    }

    /// Fresh state for a (re)start. `run_cycle` deliberately survives so
    /// listeners from a previous run stay poisoned.
    pub fn reset_for_start(&self) {
        {
            let mut state = self.state.lock();
            state.job_epoch = 0;
            state.lp_epoch = 0;
            state.long_poll_url = None;
            state.signals_new_block = false;
            state.last_identifier = None;
        }
        let mut demand = self.demand.lock();
        demand.shutdown = false;
        demand.generation += 1;
        demand.fetchers_running = 0;
        demand.fetchers_pending = 0;
        demand.fetcher_jobs_running = 0;
        demand.fetcher_jobs_pending = 0;
        self.estimated_jobs.store(1, Ordering::Relaxed);
    }

    pub fn begin_shutdown(&self) {
        let mut demand = self.demand.lock();
        demand.shutdown = true;
        self.demand_cond.notify_all();
    }

    /// True once `generation` no longer names the live worker pool.
    pub fn retired(&self, generation: u64) -> bool {
        let demand = self.demand.lock();
        demand.shutdown || demand.generation != generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epochs_are_monotonic() {
        let coordinator = Coordinator::new();
        assert_eq!(coordinator.job_epoch(), 0);
        assert_eq!(coordinator.bump_job_epoch(), 1);
        assert_eq!(coordinator.bump_job_epoch(), 2);
        assert_eq!(coordinator.next_lp_epoch(), 1);
    }

    #[test]
    fn reset_preserves_run_cycle_and_bumps_generation() {
        let coordinator = Coordinator::new();
        coordinator.bump_run_cycle();
        coordinator.bump_job_epoch();
        coordinator.begin_shutdown();

        let old_generation = coordinator.generation();
        coordinator.reset_for_start();

        assert_eq!(coordinator.run_cycle(), 1);
        assert_eq!(coordinator.job_epoch(), 0);
        assert_eq!(coordinator.generation(), old_generation + 1);
        assert!(!coordinator.demand.lock().shutdown);
        assert!(coordinator.retired(old_generation));
        assert!(!coordinator.retired(old_generation + 1));
    }

    #[test]
    fn estimated_jobs_never_reports_zero() {
        let coordinator = Coordinator::new();
        coordinator.set_estimated_jobs(0);
        assert_eq!(coordinator.estimated_jobs(), 1);
        coordinator.set_estimated_jobs(60);
        assert_eq!(coordinator.estimated_jobs(), 60);
    }
}
