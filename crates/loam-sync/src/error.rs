//! Error types for replication.

use loam_compaction::CompactionError;
use loam_core::StorageError;
use loam_log::LogError;
use thiserror::Error;

/// Failure talking to the reconciliation peer. Always recoverable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer returned status {0}")]
    Status(u16),

    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("malformed peer response: {0}")]
    Decode(String),
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Local log fault. Fatal for the cycle, never retried.
    #[error("log error: {0}")]
    Log(#[from] LogError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("compaction error: {0}")]
    Compaction(#[from] CompactionError),

    #[error("replication is disabled")]
    Disabled,

    #[error("no tokio runtime available")]
    NoRuntime,
}

impl SyncError {
    /// Whether this failure should drive the retry/backoff loop.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
