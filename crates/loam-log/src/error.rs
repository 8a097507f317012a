//! Error types for the event log layer.

use loam_core::{ItemId, PositionError, StorageError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LogError {
    /// Local storage failed. Fatal: nothing was committed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("item not found: {0}")]
    UnknownItem(ItemId),

    #[error("cannot place item: {0}")]
    Position(#[from] PositionError),
}

impl From<serde_json::Error> for LogError {
    fn from(e: serde_json::Error) -> Self {
        LogError::Storage(StorageError::Serialization(e))
    }
}

/// Result type for log operations.
pub type Result<T> = std::result::Result<T, LogError>;
