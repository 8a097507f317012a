//! Identity provider: one stable id per replica.

use crate::ids::ReplicaId;
use crate::storage::{keys, Storage, StorageError};
use parking_lot::Mutex;
use std::sync::Arc;

/// Issues and persists the replica id that tags every locally authored event.
pub struct IdentityProvider {
    storage: Arc<dyn Storage>,
    cached: Mutex<Option<ReplicaId>>,
}

impl IdentityProvider {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            cached: Mutex::new(None),
        }
    }

    /// Return the persisted replica id, generating and storing one on first use.
    ///
    /// The same value is returned for the lifetime of the underlying storage.
    pub fn get_or_create_id(&self) -> Result<ReplicaId, StorageError> {
        let mut cached = self.cached.lock();
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }

        if let Some(bytes) = self.storage.read(keys::REPLICA_ID)? {
            match serde_json::from_slice::<ReplicaId>(&bytes) {
                Ok(id) if !id.as_str().is_empty() => {
                    *cached = Some(id.clone());
                    return Ok(id);
                }
                _ => tracing::warn!("stored replica id is unreadable, issuing a new one"),
            }
        }

        let id = ReplicaId::generate();
        self.storage
            .write(keys::REPLICA_ID, &serde_json::to_vec(&id)?)?;
        tracing::info!(replica = %id, "issued replica id");
        *cached = Some(id.clone());
        Ok(id)
    }
}
