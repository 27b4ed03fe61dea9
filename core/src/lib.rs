//! Ironmine framework core.
//!
//! The pieces every work source plugs into: the [`Job`] entity handed to
//! miners, the shared [`WorkQueue`], the [`Blockchain`] validation hook and
//! per-source [`SourceStats`].

pub mod blockchain;
pub mod job;
pub mod stats;
pub mod workqueue;

pub use blockchain::Blockchain;
pub use job::{Job, NonceHandler, SubmitOutcome};
pub use stats::{SourceStats, StatsSnapshot};
pub use workqueue::WorkQueue;
