//! Mutation events, the unit of replication.

use crate::clock::Timestamp;
use crate::ids::{EventId, ItemId, ReplicaId};
use crate::item::{Field, FieldChange, ItemSeed};
use serde::{Deserialize, Serialize};

/// Peer-assigned position in the reconciliation order.
pub type Seq = u64;

/// What an event does to its target item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    /// Establish the item (or, for a repeated id, merge the carried state).
    Created { value: ItemSeed },
    /// Set one field.
    FieldChanged { change: FieldChange },
    /// Remove the item for good.
    Deleted,
}

/// An immutable mutation record.
///
/// Nothing about an event changes after creation except `seq`, which is set
/// once when the reconciliation peer acknowledges it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: EventId,
    pub item_id: ItemId,
    pub payload: EventPayload,
    pub timestamp: Timestamp,
    pub author_id: ReplicaId,
    #[serde(default)]
    pub seq: Option<Seq>,
}

impl Event {
    pub fn new(
        id: EventId,
        item_id: ItemId,
        payload: EventPayload,
        timestamp: Timestamp,
        author_id: ReplicaId,
    ) -> Self {
        Self {
            id,
            item_id,
            payload,
            timestamp,
            author_id,
            seq: None,
        }
    }

    /// Mark as acknowledged at `seq` (builder form, used by peers and snapshots).
    pub fn with_seq(mut self, seq: Seq) -> Self {
        self.seq = Some(seq);
        self
    }

    pub fn is_acknowledged(&self) -> bool {
        self.seq.is_some()
    }

    /// Field touched by a `FieldChanged` event.
    pub fn field(&self) -> Option<Field> {
        match &self.payload {
            EventPayload::FieldChanged { change } => Some(change.field()),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.payload {
            EventPayload::Created { .. } => "Created",
            EventPayload::FieldChanged { .. } => "FieldChanged",
            EventPayload::Deleted => "Deleted",
        }
    }
}
