//! Error types for the kernel pool.

use std::time::Duration;

/// Errors that can occur when spawning or talking to kernels.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// The interpreter process could not be started.
    #[error("failed to spawn kernel: {reason}")]
    SpawnFailed { reason: String },

    /// The pool is at its configured maximum and nothing idle can be evicted.
    #[error("kernel pool at capacity ({limit} kernels) with no evictable kernel")]
    ResourceExhausted { limit: usize },

    /// The kernel process exited while we were reading from it.
    #[error("kernel process exited unexpectedly")]
    Exited,

    /// The kernel missed a heartbeat deadline.
    #[error("kernel unresponsive after {0:?}")]
    Unresponsive(Duration),

    /// The kernel sent something that is not part of the wire protocol.
    #[error("invalid message from kernel: {reason}")]
    Protocol { reason: String },

    /// I/O error on the kernel's stdio pipes.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire message could not be encoded.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Result type for kernel operations.
pub type Result<T> = std::result::Result<T, KernelError>;
