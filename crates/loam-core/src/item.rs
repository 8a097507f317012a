//! The derived item model.
//!
//! Items are never stored as truth: they are rebuilt from events by the
//! projection engine. Each mergeable field sits next to the stamp of the
//! event that last set it, and [`Item::apply_change`] / [`Item::apply_seed`]
//! are the only places either half of such a pair is written.

use crate::clock::Timestamp;
use crate::ids::ItemId;
use crate::lww;
use crate::position::DEFAULT_POSITION;
use serde::{Deserialize, Serialize};

/// Whether an item is a plain entry or a section heading.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    #[default]
    Plain,
    Section,
}

/// Names of the mergeable fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Field {
    Text,
    Completed,
    Important,
    Archived,
    Position,
    Kind,
    Level,
    Indented,
    ParentId,
}

impl Field {
    pub const ALL: [Field; 9] = [
        Field::Text,
        Field::Completed,
        Field::Important,
        Field::Archived,
        Field::Position,
        Field::Kind,
        Field::Level,
        Field::Indented,
        Field::ParentId,
    ];
}

/// A single-field mutation, carrying only the value legal for that field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "camelCase")]
pub enum FieldChange {
    Text(String),
    Completed(bool),
    Important(bool),
    Archived(bool),
    Position(String),
    Kind(ItemKind),
    Level(Option<u8>),
    Indented(bool),
    ParentId(Option<ItemId>),
}

impl FieldChange {
    pub fn field(&self) -> Field {
        match self {
            FieldChange::Text(_) => Field::Text,
            FieldChange::Completed(_) => Field::Completed,
            FieldChange::Important(_) => Field::Important,
            FieldChange::Archived(_) => Field::Archived,
            FieldChange::Position(_) => Field::Position,
            FieldChange::Kind(_) => Field::Kind,
            FieldChange::Level(_) => Field::Level,
            FieldChange::Indented(_) => Field::Indented,
            FieldChange::ParentId(_) => Field::ParentId,
        }
    }
}

/// Historical per-field stamps carried by a snapshot `Created` payload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FieldStamps {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub important: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indented: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Timestamp>,
}

impl FieldStamps {
    pub fn get(&self, field: Field) -> Option<Timestamp> {
        match field {
            Field::Text => self.text,
            Field::Completed => self.completed,
            Field::Important => self.important,
            Field::Archived => self.archived,
            Field::Position => self.position,
            Field::Kind => self.kind,
            Field::Level => self.level,
            Field::Indented => self.indented,
            Field::ParentId => self.parent_id,
        }
    }

    pub fn is_empty(&self) -> bool {
        Field::ALL.iter().all(|f| self.get(*f).is_none())
    }
}

/// Payload of a `Created` event.
///
/// Absent fields take their defaults. Snapshot events written by the
/// compactor fill every field and carry the historical stamps in `stamps`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ItemSeed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub important: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ItemKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indented: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<ItemId>,
    #[serde(skip_serializing_if = "FieldStamps::is_empty")]
    pub stamps: FieldStamps,
}

impl ItemSeed {
    /// A seed with just text and position, the common case for a new item.
    pub fn new(text: impl Into<String>, position: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            position: Some(position.into()),
            ..Default::default()
        }
    }

    pub fn with_kind(mut self, kind: ItemKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_level(mut self, level: u8) -> Self {
        self.level = Some(level);
        self
    }

    pub fn with_parent(mut self, parent: ItemId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    /// Stamp for `field`: the historical one if carried, else the event's.
    fn stamp(&self, field: Field, event_at: Timestamp) -> Timestamp {
        self.stamps.get(field).unwrap_or(event_at)
    }
}

/// Current state of one item, as derived by projection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: ItemId,
    pub text: String,
    pub created_at: Timestamp,
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
    pub important: bool,
    pub archived: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<Timestamp>,
    pub position: String,
    pub kind: ItemKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u8>,
    pub indented: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<ItemId>,

    pub text_updated_at: Timestamp,
    pub completed_updated_at: Timestamp,
    pub important_updated_at: Timestamp,
    pub archived_updated_at: Timestamp,
    pub position_updated_at: Timestamp,
    pub kind_updated_at: Timestamp,
    pub level_updated_at: Timestamp,
    pub indented_updated_at: Timestamp,
    #[serde(default)]
    pub parent_id_updated_at: Timestamp,
}

impl Item {
    /// Build an item from the first `Created` event seen for its id.
    pub fn from_seed(id: ItemId, seed: &ItemSeed, at: Timestamp) -> Self {
        let completed = seed.completed.unwrap_or(false);
        let archived = seed.archived.unwrap_or(false);
        let completed_updated_at = seed.stamp(Field::Completed, at);
        let archived_updated_at = seed.stamp(Field::Archived, at);

        Item {
            id,
            text: seed.text.clone().unwrap_or_default(),
            created_at: seed.created_at.unwrap_or(at),
            completed,
            completed_at: completed.then(|| seed.completed_at.unwrap_or(completed_updated_at)),
            important: seed.important.unwrap_or(false),
            archived,
            archived_at: archived.then(|| seed.archived_at.unwrap_or(archived_updated_at)),
            position: seed
                .position
                .clone()
                .unwrap_or_else(|| DEFAULT_POSITION.to_string()),
            kind: seed.kind.unwrap_or_default(),
            level: seed.level,
            indented: seed.indented.unwrap_or(false),
            parent_id: seed.parent_id.clone(),

            text_updated_at: seed.stamp(Field::Text, at),
            completed_updated_at,
            important_updated_at: seed.stamp(Field::Important, at),
            archived_updated_at,
            position_updated_at: seed.stamp(Field::Position, at),
            kind_updated_at: seed.stamp(Field::Kind, at),
            level_updated_at: seed.stamp(Field::Level, at),
            indented_updated_at: seed.stamp(Field::Indented, at),
            parent_id_updated_at: seed.stamp(Field::ParentId, at),
        }
    }

    /// Merge a repeated `Created` payload field by field under LWW.
    ///
    /// Only fields present in the seed participate. `created_at` keeps the
    /// value established by the first `Created`.
    pub fn apply_seed(&mut self, seed: &ItemSeed, at: Timestamp) -> bool {
        let mut changed = false;

        if let Some(text) = &seed.text {
            changed |= self.apply_change(&FieldChange::Text(text.clone()), seed.stamp(Field::Text, at));
        }
        if let Some(completed) = seed.completed {
            let stamp = seed.stamp(Field::Completed, at);
            if self.apply_change(&FieldChange::Completed(completed), stamp) {
                // Historical completion time wins over the stamp when supplied.
                if completed {
                    self.completed_at = Some(seed.completed_at.unwrap_or(stamp));
                }
                changed = true;
            }
        }
        if let Some(important) = seed.important {
            changed |= self.apply_change(&FieldChange::Important(important), seed.stamp(Field::Important, at));
        }
        if let Some(archived) = seed.archived {
            let stamp = seed.stamp(Field::Archived, at);
            if self.apply_change(&FieldChange::Archived(archived), stamp) {
                if archived {
                    self.archived_at = Some(seed.archived_at.unwrap_or(stamp));
                }
                changed = true;
            }
        }
        if let Some(position) = &seed.position {
            changed |= self.apply_change(&FieldChange::Position(position.clone()), seed.stamp(Field::Position, at));
        }
        if let Some(kind) = seed.kind {
            changed |= self.apply_change(&FieldChange::Kind(kind), seed.stamp(Field::Kind, at));
        }
        if seed.level.is_some() {
            changed |= self.apply_change(&FieldChange::Level(seed.level), seed.stamp(Field::Level, at));
        }
        if let Some(indented) = seed.indented {
            changed |= self.apply_change(&FieldChange::Indented(indented), seed.stamp(Field::Indented, at));
        }
        if seed.parent_id.is_some() {
            changed |= self.apply_change(
                &FieldChange::ParentId(seed.parent_id.clone()),
                seed.stamp(Field::ParentId, at),
            );
        }

        changed
    }

    /// Apply a single-field change stamped `at`. Returns `true` if it won.
    pub fn apply_change(&mut self, change: &FieldChange, at: Timestamp) -> bool {
        match change {
            FieldChange::Text(text) => {
                lww::assign(&mut self.text, &mut self.text_updated_at, text.clone(), at)
            }
            FieldChange::Completed(completed) => {
                let applied = lww::assign(
                    &mut self.completed,
                    &mut self.completed_updated_at,
                    *completed,
                    at,
                );
                if applied {
                    self.completed_at = completed.then_some(at);
                }
                applied
            }
            FieldChange::Important(important) => lww::assign(
                &mut self.important,
                &mut self.important_updated_at,
                *important,
                at,
            ),
            FieldChange::Archived(archived) => {
                let applied = lww::assign(
                    &mut self.archived,
                    &mut self.archived_updated_at,
                    *archived,
                    at,
                );
                if applied {
                    self.archived_at = archived.then_some(at);
                }
                applied
            }
            FieldChange::Position(position) => lww::assign(
                &mut self.position,
                &mut self.position_updated_at,
                position.clone(),
                at,
            ),
            FieldChange::Kind(kind) => {
                lww::assign(&mut self.kind, &mut self.kind_updated_at, *kind, at)
            }
            FieldChange::Level(level) => {
                lww::assign(&mut self.level, &mut self.level_updated_at, *level, at)
            }
            FieldChange::Indented(indented) => lww::assign(
                &mut self.indented,
                &mut self.indented_updated_at,
                *indented,
                at,
            ),
            FieldChange::ParentId(parent) => lww::assign(
                &mut self.parent_id,
                &mut self.parent_id_updated_at,
                parent.clone(),
                at,
            ),
        }
    }

    /// Stamp currently recorded for `field`.
    pub fn stamp(&self, field: Field) -> Timestamp {
        match field {
            Field::Text => self.text_updated_at,
            Field::Completed => self.completed_updated_at,
            Field::Important => self.important_updated_at,
            Field::Archived => self.archived_updated_at,
            Field::Position => self.position_updated_at,
            Field::Kind => self.kind_updated_at,
            Field::Level => self.level_updated_at,
            Field::Indented => self.indented_updated_at,
            Field::ParentId => self.parent_id_updated_at,
        }
    }

    /// The full state of this item as a `Created` payload, historical stamps included.
    pub fn to_seed(&self) -> ItemSeed {
        ItemSeed {
            text: Some(self.text.clone()),
            created_at: Some(self.created_at),
            completed: Some(self.completed),
            completed_at: self.completed_at,
            important: Some(self.important),
            archived: Some(self.archived),
            archived_at: self.archived_at,
            position: Some(self.position.clone()),
            kind: Some(self.kind),
            level: self.level,
            indented: Some(self.indented),
            parent_id: self.parent_id.clone(),
            stamps: FieldStamps {
                text: Some(self.text_updated_at),
                completed: Some(self.completed_updated_at),
                important: Some(self.important_updated_at),
                archived: Some(self.archived_updated_at),
                position: Some(self.position_updated_at),
                kind: Some(self.kind_updated_at),
                level: Some(self.level_updated_at),
                indented: Some(self.indented_updated_at),
                parent_id: Some(self.parent_id_updated_at),
            },
        }
    }

    /// Latest stamp across all fields.
    pub fn last_modified(&self) -> Timestamp {
        Field::ALL
            .iter()
            .map(|f| self.stamp(*f))
            .max()
            .unwrap_or(self.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_seed() {
        let item = Item::from_seed(ItemId::new("x"), &ItemSeed::default(), 1000);

        assert_eq!(item.text, "");
        assert_eq!(item.position, "n");
        assert_eq!(item.kind, ItemKind::Plain);
        assert!(!item.completed && !item.important && !item.archived && !item.indented);
        assert_eq!(item.completed_at, None);
        assert_eq!(item.created_at, 1000);
        for field in Field::ALL {
            assert_eq!(item.stamp(field), 1000);
        }
    }

    #[test]
    fn test_seed_stamps_override_event_timestamp() {
        let mut seed = ItemSeed::new("hello", "c");
        seed.stamps.text = Some(500);
        seed.completed = Some(true);
        seed.completed_at = Some(700);
        seed.stamps.completed = Some(700);

        let item = Item::from_seed(ItemId::new("x"), &seed, 9000);
        assert_eq!(item.text_updated_at, 500);
        assert_eq!(item.position_updated_at, 9000);
        assert_eq!(item.completed_at, Some(700));
        assert_eq!(item.completed_updated_at, 700);
    }

    #[test]
    fn test_completed_at_follows_completed() {
        let mut item = Item::from_seed(ItemId::new("x"), &ItemSeed::default(), 1000);

        assert!(item.apply_change(&FieldChange::Completed(true), 1100));
        assert_eq!(item.completed_at, Some(1100));

        assert!(item.apply_change(&FieldChange::Completed(false), 1200));
        assert_eq!(item.completed_at, None);

        // Stale completion is skipped together with its timestamp.
        assert!(!item.apply_change(&FieldChange::Completed(true), 1150));
        assert!(!item.completed);
        assert_eq!(item.completed_at, None);
        assert_eq!(item.completed_updated_at, 1200);
    }

    #[test]
    fn test_to_seed_roundtrips_through_from_seed() {
        let mut item = Item::from_seed(ItemId::new("x"), &ItemSeed::new("a", "d"), 1000);
        item.apply_change(&FieldChange::Text("b".into()), 1001);
        item.apply_change(&FieldChange::Archived(true), 1002);
        item.apply_change(&FieldChange::Level(Some(2)), 1003);
        item.apply_change(&FieldChange::ParentId(Some(ItemId::new("s"))), 1004);

        let rebuilt = Item::from_seed(item.id.clone(), &item.to_seed(), 5000);
        assert_eq!(rebuilt, item);
    }

    #[test]
    fn test_apply_seed_is_lww_checked() {
        let mut item = Item::from_seed(ItemId::new("x"), &ItemSeed::new("first", "n"), 1000);
        item.apply_change(&FieldChange::Text("edited".into()), 3000);

        let replaced = item.apply_seed(&ItemSeed::new("second", "p"), 2000);
        assert!(replaced);
        assert_eq!(item.text, "edited");
        assert_eq!(item.position, "p");
        assert_eq!(item.created_at, 1000);
    }

    #[test]
    fn test_field_change_wire_shape() {
        let json = serde_json::to_value(FieldChange::Text("hi".into())).unwrap();
        assert_eq!(json, serde_json::json!({"field": "text", "value": "hi"}));

        let back: FieldChange =
            serde_json::from_value(serde_json::json!({"field": "parentId", "value": null})).unwrap();
        assert_eq!(back, FieldChange::ParentId(None));
    }
}
