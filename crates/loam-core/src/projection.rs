//! Projection engine: event sequence -> current items.
//!
//! Events are applied keyed by item id, so the result does not depend on
//! arrival order as long as the timestamps order each field's writes. The
//! output is sorted by `(position, id)`, which gives a total order even when
//! two items share a position.

use crate::clock::Timestamp;
use crate::event::{Event, EventPayload};
use crate::ids::ItemId;
use crate::item::{FieldChange, Item};
use std::collections::{HashMap, HashSet};

/// Project a sequence of events into the sorted list of live items.
pub fn project(events: &[Event]) -> Vec<Item> {
    let mut projection = Projection::new();
    projection.apply_all(events);
    projection.into_items()
}

/// Sort items into display order.
pub fn sort_items(items: &mut [Item]) {
    items.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
}

/// Incremental projection state.
///
/// Deleted ids are remembered for the lifetime of one projection run so a
/// late `Created` cannot bring an item back. Nothing about deletions is
/// emitted in the output.
///
/// Field changes that arrive before their item's `Created` are held back and
/// replayed under LWW once it shows up; if it never does they are dropped.
#[derive(Clone, Debug, Default)]
pub struct Projection {
    items: HashMap<ItemId, Item>,
    deleted: HashSet<ItemId>,
    pending: HashMap<ItemId, Vec<(FieldChange, Timestamp)>>,
}

impl Projection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event. Returns `true` if any item changed.
    pub fn apply(&mut self, event: &Event) -> bool {
        if self.deleted.contains(&event.item_id) {
            return false;
        }

        match &event.payload {
            EventPayload::Created { value } => match self.items.get_mut(&event.item_id) {
                Some(item) => item.apply_seed(value, event.timestamp),
                None => {
                    let mut item = Item::from_seed(event.item_id.clone(), value, event.timestamp);
                    for (change, at) in self.pending.remove(&event.item_id).unwrap_or_default() {
                        item.apply_change(&change, at);
                    }
                    self.items.insert(event.item_id.clone(), item);
                    true
                }
            },
            EventPayload::FieldChanged { change } => match self.items.get_mut(&event.item_id) {
                Some(item) => item.apply_change(change, event.timestamp),
                None => {
                    self.pending
                        .entry(event.item_id.clone())
                        .or_default()
                        .push((change.clone(), event.timestamp));
                    false
                }
            },
            EventPayload::Deleted => {
                self.deleted.insert(event.item_id.clone());
                self.pending.remove(&event.item_id);
                self.items.remove(&event.item_id).is_some()
            }
        }
    }

    pub fn apply_all<'a>(&mut self, events: impl IntoIterator<Item = &'a Event>) {
        for event in events {
            self.apply(event);
        }
    }

    pub fn get(&self, id: &ItemId) -> Option<&Item> {
        self.items.get(id)
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.items.contains_key(id)
    }

    pub fn is_deleted(&self, id: &ItemId) -> bool {
        self.deleted.contains(id)
    }

    /// Whether changes for `id` are waiting on a `Created` that has not been seen.
    pub fn is_orphaned(&self, id: &ItemId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Sorted copy of the live items.
    pub fn items(&self) -> Vec<Item> {
        let mut items: Vec<Item> = self.items.values().cloned().collect();
        sort_items(&mut items);
        items
    }

    pub fn into_items(self) -> Vec<Item> {
        let mut items: Vec<Item> = self.items.into_values().collect();
        sort_items(&mut items);
        items
    }
}
