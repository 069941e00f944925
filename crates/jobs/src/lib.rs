//! The chunk-server job engine: an auto-scaling worker pool that marshals
//! every chunk-level operation off the event-loop thread, bounds
//! concurrency through a weighted work queue, and reports completions back
//! to the reactor through a wake pipe.

pub mod backend;
pub mod ops;
pub mod pool;
mod worker;

// Exercised by the integration suite only.
#[cfg(test)]
use tempfile as _;

pub use backend::{ChunkBackend, LoadLevel, LoadSink};
pub use ops::{
    ChunkOpArgs, JobOp, JobStatus, OutSlot, ReplicateArgs, ReplicateSource, ServArgs, out_slot,
};
pub use pool::{Callback, JobPool, JobPoolHook};
