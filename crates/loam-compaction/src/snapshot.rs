//! Synthetic snapshot events.
//!
//! A snapshot is an ordinary `Created` event whose payload carries the full
//! state of one item together with every per-field stamp, so replaying it
//! reproduces the item exactly and later events still merge under LWW.

use loam_core::{Event, EventId, EventPayload, Item, ReplicaId, Seq};

/// Id prefix for snapshot events.
pub const SNAPSHOT_PREFIX: &str = "snapshot:";

/// Deterministic snapshot id for an item.
pub fn snapshot_id(item: &Item) -> EventId {
    EventId::new(format!("{}{}", SNAPSHOT_PREFIX, item.id))
}

/// Build the already-acknowledged snapshot event for `item`.
pub fn snapshot_event(item: &Item, seq: Seq, author: &ReplicaId) -> Event {
    Event::new(
        snapshot_id(item),
        item.id.clone(),
        EventPayload::Created {
            value: item.to_seed(),
        },
        item.last_modified(),
        author.clone(),
    )
    .with_seq(seq)
}

pub fn is_snapshot(event: &Event) -> bool {
    event.id.as_str().starts_with(SNAPSHOT_PREFIX)
}
