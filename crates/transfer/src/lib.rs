//! Transfer plumbing shared by the upload and download pipelines: the
//! dependency-aware task scheduler, weighted progress, block I/O and
//! connectivity-driven suspension.

mod chunked;
mod progress;
pub mod scheduler;
mod suspender;
mod validation;

pub use chunked::{BlockCache, Chunk, ChunkReader, checksum_bytes, verify_checksum};
pub use progress::{Progress, ProgressCallback, ProgressSnapshot};
pub use scheduler::{
    Task, TaskContext, TaskFuture, TaskHandle, TaskId, TaskOutcome, TaskPanic, TaskScheduler,
    TaskState,
};
pub use suspender::{Connectivity, NetworkAwareSuspender, Suspendable};
pub use validation::validate_cache_key;

/// Default block size: 4 MiB.
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch on block {index}")]
    ChecksumMismatch { index: u32 },

    #[error("invalid path: {0}")]
    InvalidPath(String),
}
