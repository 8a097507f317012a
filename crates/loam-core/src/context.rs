//! Per-replica context: who is authoring events and what time it is.
//!
//! The context replaces any process-wide "current client" state. It is built
//! once per replica and handed to whatever needs to author events.

use crate::clock::{Clock, Timestamp};
use crate::event::{Event, EventPayload};
use crate::identity::IdentityProvider;
use crate::ids::{EventId, ItemId, ReplicaId};
use crate::item::{FieldChange, ItemSeed};
use crate::storage::{Storage, StorageError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Authoring context for one replica.
pub struct ReplicaContext {
    replica_id: ReplicaId,
    clock: Arc<dyn Clock>,
    last_stamp: AtomicU64,
}

impl ReplicaContext {
    pub fn new(replica_id: ReplicaId, clock: Arc<dyn Clock>) -> Self {
        Self {
            replica_id,
            clock,
            last_stamp: AtomicU64::new(0),
        }
    }

    /// Build a context whose replica id comes from the identity provider.
    pub fn open(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Result<Self, StorageError> {
        let replica_id = IdentityProvider::new(storage).get_or_create_id()?;
        Ok(Self::new(replica_id, clock))
    }

    pub fn replica_id(&self) -> &ReplicaId {
        &self.replica_id
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Next event stamp. Never goes backwards on this replica, even if the
    /// wall clock does.
    pub fn stamp(&self) -> Timestamp {
        let now = self.clock.now_millis();
        let prev = self.last_stamp.fetch_max(now, Ordering::SeqCst);
        prev.max(now)
    }

    fn event(&self, item_id: ItemId, payload: EventPayload) -> Event {
        Event::new(
            EventId::generate(),
            item_id,
            payload,
            self.stamp(),
            self.replica_id.clone(),
        )
    }

    pub fn created(&self, item_id: ItemId, seed: ItemSeed) -> Event {
        self.event(item_id, EventPayload::Created { value: seed })
    }

    pub fn field_changed(&self, item_id: ItemId, change: FieldChange) -> Event {
        self.event(item_id, EventPayload::FieldChanged { change })
    }

    pub fn deleted(&self, item_id: ItemId) -> Event {
        self.event(item_id, EventPayload::Deleted)
    }
}

impl std::fmt::Debug for ReplicaContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaContext")
            .field("replica_id", &self.replica_id)
            .field("last_stamp", &self.last_stamp.load(Ordering::SeqCst))
            .finish()
    }
}
