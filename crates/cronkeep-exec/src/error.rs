//! Error types for the cronkeep-exec crate.

use thiserror::Error;

/// All errors that can originate from spawning or supervising a process.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The child process could not be spawned.
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// Underlying I/O failure while collecting output.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The child exceeded its wall-clock budget and was killed.
    #[error("process timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The supervising task panicked or was cancelled.
    #[error("supervisor task failed: {0}")]
    Join(String),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, ExecError>;
