//! Item-level mutations for one replica.
//!
//! [`Replica`] is the consumer-facing write path: each operation turns into
//! one or more events stamped by the replica context and appended through the
//! materializer.

use crate::error::{LogError, Result};
use crate::legacy::{import_legacy_state, LegacyImport};
use crate::materializer::Materializer;
use loam_core::{
    key_between, Clock, FieldChange, Item, ItemId, ItemKind, ItemSeed, ReplicaContext, ReplicaId,
    Storage,
};
use std::sync::Arc;

/// Where to put a new or moved item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Placement {
    Head,
    Tail,
    After(ItemId),
    Before(ItemId),
}

pub struct Replica {
    ctx: ReplicaContext,
    materializer: Materializer,
}

impl Replica {
    /// Open the replica stored in `storage`, importing legacy state on first use.
    pub fn open(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Result<Self> {
        let ctx = ReplicaContext::open(storage.clone(), clock)?;
        let mut materializer = Materializer::open(storage.clone())?;
        if let LegacyImport::Imported { items } =
            import_legacy_state(storage.as_ref(), &ctx, &mut materializer)?
        {
            tracing::info!(replica = %ctx.replica_id(), items, "replica seeded from legacy state");
        }
        Ok(Self { ctx, materializer })
    }

    pub fn new(ctx: ReplicaContext, materializer: Materializer) -> Self {
        Self { ctx, materializer }
    }

    pub fn replica_id(&self) -> &ReplicaId {
        self.ctx.replica_id()
    }

    pub fn context(&self) -> &ReplicaContext {
        &self.ctx
    }

    pub fn materializer(&self) -> &Materializer {
        &self.materializer
    }

    pub fn materializer_mut(&mut self) -> &mut Materializer {
        &mut self.materializer
    }

    pub fn items(&mut self) -> Arc<Vec<Item>> {
        self.materializer.current_state()
    }

    pub fn item(&mut self, id: &ItemId) -> Option<Item> {
        self.materializer.item(id)
    }

    pub fn create_item(&mut self, text: impl Into<String>, placement: Placement) -> Result<ItemId> {
        let position = self.position_for(None, &placement)?;
        self.create(ItemSeed::new(text, position))
    }

    /// Create a section header at `level`.
    pub fn create_section(
        &mut self,
        text: impl Into<String>,
        level: u8,
        placement: Placement,
    ) -> Result<ItemId> {
        let position = self.position_for(None, &placement)?;
        self.create(
            ItemSeed::new(text, position)
                .with_kind(ItemKind::Section)
                .with_level(level),
        )
    }

    fn create(&mut self, seed: ItemSeed) -> Result<ItemId> {
        let id = ItemId::generate();
        let event = self.ctx.created(id.clone(), seed);
        self.materializer.append(vec![event])?;
        Ok(id)
    }

    /// Set one field on an existing item.
    pub fn update_field(&mut self, id: &ItemId, change: FieldChange) -> Result<()> {
        if self.materializer.item(id).is_none() {
            return Err(LogError::UnknownItem(id.clone()));
        }
        let event = self.ctx.field_changed(id.clone(), change);
        self.materializer.append(vec![event])?;
        Ok(())
    }

    pub fn set_text(&mut self, id: &ItemId, text: impl Into<String>) -> Result<()> {
        self.update_field(id, FieldChange::Text(text.into()))
    }

    pub fn set_completed(&mut self, id: &ItemId, completed: bool) -> Result<()> {
        self.update_field(id, FieldChange::Completed(completed))
    }

    pub fn set_important(&mut self, id: &ItemId, important: bool) -> Result<()> {
        self.update_field(id, FieldChange::Important(important))
    }

    pub fn set_archived(&mut self, id: &ItemId, archived: bool) -> Result<()> {
        self.update_field(id, FieldChange::Archived(archived))
    }

    pub fn set_indented(&mut self, id: &ItemId, indented: bool) -> Result<()> {
        self.update_field(id, FieldChange::Indented(indented))
    }

    pub fn set_parent(&mut self, id: &ItemId, parent: Option<ItemId>) -> Result<()> {
        self.update_field(id, FieldChange::ParentId(parent))
    }

    /// Flip `completed`, returning the new value.
    pub fn toggle_completed(&mut self, id: &ItemId) -> Result<bool> {
        let item = self.require(id)?;
        self.set_completed(id, !item.completed)?;
        Ok(!item.completed)
    }

    /// Flip `archived`, returning the new value.
    pub fn toggle_archived(&mut self, id: &ItemId) -> Result<bool> {
        let item = self.require(id)?;
        self.set_archived(id, !item.archived)?;
        Ok(!item.archived)
    }

    /// Give `id` a position at `placement`, relative to the other items.
    pub fn move_item(&mut self, id: &ItemId, placement: Placement) -> Result<()> {
        self.require(id)?;
        let position = self.position_for(Some(id), &placement)?;
        self.update_field(id, FieldChange::Position(position))
    }

    pub fn delete_item(&mut self, id: &ItemId) -> Result<()> {
        self.require(id)?;
        let event = self.ctx.deleted(id.clone());
        self.materializer.append(vec![event])?;
        Ok(())
    }

    fn require(&mut self, id: &ItemId) -> Result<Item> {
        self.materializer
            .item(id)
            .ok_or_else(|| LogError::UnknownItem(id.clone()))
    }

    /// Compute an ordering key for `placement`, ignoring `moving` itself.
    ///
    /// Neighbours that share the anchor's position are skipped so the bounds
    /// are always strictly ordered.
    fn position_for(&mut self, moving: Option<&ItemId>, placement: &Placement) -> Result<String> {
        let items = self.materializer.current_state();
        let positions: Vec<&str> = items
            .iter()
            .filter(|i| Some(&i.id) != moving)
            .map(|i| i.position.as_str())
            .collect();

        let (before, after) = match placement {
            Placement::Head => (None, positions.first().copied()),
            Placement::Tail => (positions.last().copied(), None),
            Placement::After(anchor) => {
                let at = anchor_position(&items, anchor)?;
                (Some(at), positions.iter().copied().find(|p| *p > at))
            }
            Placement::Before(anchor) => {
                let at = anchor_position(&items, anchor)?;
                (positions.iter().rev().copied().find(|p| *p < at), Some(at))
            }
        };

        Ok(key_between(before, after)?)
    }
}

fn anchor_position<'a>(items: &'a [Item], anchor: &ItemId) -> Result<&'a str> {
    items
        .iter()
        .find(|i| &i.id == anchor)
        .map(|i| i.position.as_str())
        .ok_or_else(|| LogError::UnknownItem(anchor.clone()))
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("replica_id", self.ctx.replica_id())
            .field("events", &self.materializer.log().len())
            .finish()
    }
}
