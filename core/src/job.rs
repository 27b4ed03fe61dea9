//! Candidate block header jobs.
//!
//! A `Job` is one 80-byte header candidate plus the 32-byte share target it
//! must beat. The SHA-256 midstate over the first 64 header bytes is computed
//! once and shared by value across a roll-ntime batch, so miners only iterate
//! the final 16 bytes.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use sha2::compress256;
use sha2::digest::generic_array::GenericArray;

/// Serialized block header length for classic getwork.
pub const HEADER_LEN: usize = 80;

/// The midstate covers exactly the first SHA-256 block of the header.
pub const MIDSTATE_INPUT_LEN: usize = 64;

/// SHA-256 initial hash value (FIPS 180-4, section 5.3.3).
const SHA256_IV: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a,
    0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19,
];

/// Upstream verdict for a submitted nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// Rejected, with the server's reason when it gave one.
    Rejected(Option<String>),
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            SubmitOutcome::Accepted => None,
            SubmitOutcome::Rejected(reason) => reason.as_deref(),
        }
    }
}

/// Receives the final verdict for a nonce found on a job.
///
/// Installed on jobs by the work source; the miner side never calls this
/// directly, it flows back through the upload path.
pub trait NonceHandler: Send + Sync {
    fn nonce_handled(&self, job: &Job, nonce: u32, difficulty: f64, outcome: SubmitOutcome);
}

#[derive(Clone)]
pub struct Job {
    data: [u8; HEADER_LEN],
    target: [u8; 32],
    midstate: [u8; 32],
    /// Absolute point after which miners must drop the job. `None` for
    /// reference jobs that only exist to be shown to the blockchain hook.
    expiry: Option<Instant>,
    identifier: Option<i64>,
    handler: Option<Arc<dyn NonceHandler>>,
}

impl Job {
    /// A full job with a freshly computed midstate.
    pub fn new(
        data: [u8; HEADER_LEN],
        target: [u8; 32],
        expiry: Option<Instant>,
        identifier: Option<i64>,
    ) -> Self {
        let midstate = Self::calculate_midstate(&data);
        Self { data, target, midstate, expiry, identifier, handler: None }
    }

    /// A job in a roll-ntime batch: rolling only touches header bytes past
    /// the first SHA-256 block, so one midstate serves the whole batch.
    pub fn with_midstate(
        data: [u8; HEADER_LEN],
        target: [u8; 32],
        midstate: [u8; 32],
        expiry: Option<Instant>,
        identifier: Option<i64>,
    ) -> Self {
        Self { data, target, midstate, expiry, identifier, handler: None }
    }

    /// The unrolled reference job submitted to [`crate::Blockchain::check_job`].
    pub fn reference(data: [u8; HEADER_LEN], target: [u8; 32], identifier: Option<i64>) -> Self {
        Self::new(data, target, None, identifier)
    }

    /// SHA-256 state after compressing the first 64 bytes of `header`.
    ///
    /// Panics if `header` is shorter than one SHA-256 block; getwork headers
    /// are validated to 80 bytes before jobs are built.
    pub fn calculate_midstate(header: &[u8]) -> [u8; 32] {
        let mut state = SHA256_IV;
        let block = GenericArray::clone_from_slice(&header[..MIDSTATE_INPUT_LEN]);
        compress256(&mut state, &[block]);
        let mut out = [0u8; 32];
        for (i, word) in state.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
        }
        out
    }

    pub fn data(&self) -> &[u8; HEADER_LEN] {
        &self.data
    }

    pub fn target(&self) -> &[u8; 32] {
        &self.target
    }

    pub fn midstate(&self) -> &[u8; 32] {
        &self.midstate
    }

    pub fn expiry(&self) -> Option<Instant> {
        self.expiry
    }

    pub fn identifier(&self) -> Option<i64> {
        self.identifier
    }

    /// Big-endian time field at header bytes 68..72.
    pub fn ntime(&self) -> u32 {
        u32::from_be_bytes([self.data[68], self.data[69], self.data[70], self.data[71]])
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        match self.expiry {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }

    pub fn set_handler(&mut self, handler: Arc<dyn NonceHandler>) {
        self.handler = Some(handler);
    }

    /// Forward the upstream verdict to the installed handler, if any.
    pub fn nonce_handled(&self, nonce: u32, difficulty: f64, outcome: SubmitOutcome) {
        if let Some(handler) = &self.handler {
            handler.nonce_handled(self, nonce, difficulty, outcome);
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("ntime", &self.ntime())
            .field("identifier", &self.identifier)
            .field("expiry", &self.expiry)
            .field("data", &hex::encode(self.data))
            .finish()
    }
}
