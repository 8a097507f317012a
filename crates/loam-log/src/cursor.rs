//! Persisted replication cursor.

use crate::error::Result;
use loam_core::{keys, Seq, Storage};
use std::sync::Arc;

/// The highest peer `seq` this replica has absorbed. Only moves forward.
pub struct SyncCursor {
    storage: Arc<dyn Storage>,
    value: Seq,
}

impl SyncCursor {
    /// Load the cursor, starting at zero if none was stored or it is unreadable.
    pub fn open(storage: Arc<dyn Storage>) -> Result<Self> {
        let value = match storage.read(keys::SYNC_CURSOR)? {
            Some(bytes) => serde_json::from_slice::<Seq>(&bytes).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "sync cursor unreadable, restarting from zero");
                0
            }),
            None => 0,
        };
        Ok(Self { storage, value })
    }

    pub fn get(&self) -> Seq {
        self.value
    }

    /// Move the cursor to `seq` if that is ahead of it. Returns whether it moved.
    pub fn advance(&mut self, seq: Seq) -> Result<bool> {
        if seq <= self.value {
            return Ok(false);
        }
        self.storage
            .write(keys::SYNC_CURSOR, &serde_json::to_vec(&seq)?)?;
        self.value = seq;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loam_core::MemoryStorage;

    #[test]
    fn test_cursor_is_monotonic_and_persisted() {
        let storage = Arc::new(MemoryStorage::new());
        let mut cursor = SyncCursor::open(storage.clone()).unwrap();
        assert_eq!(cursor.get(), 0);

        assert!(cursor.advance(10).unwrap());
        assert!(!cursor.advance(4).unwrap());
        assert!(!cursor.advance(10).unwrap());
        assert_eq!(cursor.get(), 10);

        assert_eq!(SyncCursor::open(storage).unwrap().get(), 10);
    }

    #[test]
    fn test_failed_write_leaves_cursor_unmoved() {
        let storage = Arc::new(MemoryStorage::new());
        let mut cursor = SyncCursor::open(storage.clone()).unwrap();
        storage.set_fail_writes(true);

        assert!(cursor.advance(3).is_err());
        assert_eq!(cursor.get(), 0);
    }
}
