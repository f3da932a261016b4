//! Chunk planning, chunk reading and progress accounting for block uploads.

mod chunked;
mod plan;
mod progress;
mod types;

pub use chunked::{ChunkSource, FileChunkSource, Fingerprinter, Md5Fingerprint, md5_hex};
pub use plan::ChunkPlan;
pub use progress::{ProgressInfo, ProgressTracker};
pub use types::{LoadedChunk, ReceiptBook};

/// Default chunk size: 4 MiB.
///
/// Also the block size accepted by a single `mkblk` request.
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Default memory budget for loaded-but-unsent chunks: 100 MiB.
pub const DEFAULT_MAX_MEMORY: u64 = 100 * 1024 * 1024;

/// Files smaller than this are sent with a single direct upload: 4 MiB.
pub const DEFAULT_DIRECT_THRESHOLD: u64 = 4 * 1024 * 1024;

/// Most chunks a single upload may be split into.
pub const MAX_CHUNK_COUNT: u64 = 1 << 20;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("short read at offset {offset}: expected {expected} bytes")]
    ShortRead { offset: u64, expected: u64 },

    #[error("invalid chunk size: {0}")]
    InvalidChunkSize(u64),

    #[error("task join error: {0}")]
    Join(String),
}
