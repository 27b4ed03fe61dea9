//! Chain-facing hooks.
//!
//! Work sources show every fresh template to the blockchain before rolling it
//! into jobs, so the chain side can track the current template and target.

use parking_lot::Mutex;

use crate::job::Job;

#[derive(Default)]
pub struct Blockchain {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    reference_jobs: u64,
    current_identifier: Option<i64>,
    current_target: Option<[u8; 32]>,
}

impl Blockchain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a reference job. Side effect only; callers ignore the result.
    pub fn check_job(&self, job: &Job) {
        let mut inner = self.inner.lock();
        inner.reference_jobs += 1;
        inner.current_identifier = job.identifier();
        inner.current_target = Some(*job.target());
    }

    /// How many reference jobs have been checked.
    pub fn reference_jobs(&self) -> u64 {
        self.inner.lock().reference_jobs
    }

    pub fn current_identifier(&self) -> Option<i64> {
        self.inner.lock().current_identifier
    }

    pub fn current_target(&self) -> Option<[u8; 32]> {
        self.inner.lock().current_target
    }
}
