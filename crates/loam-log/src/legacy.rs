//! One-time import of pre-log item state.
//!
//! Installs that predate the event log only have an item list stored under
//! [`keys::ITEMS`]. On the first open with an empty log, that list is turned
//! into `Created` events so the items replicate like any other. A marker under
//! [`keys::LEGACY_IMPORTED`] keeps the import from ever running twice.

use crate::error::Result;
use crate::materializer::{ChangeOrigin, Materializer};
use loam_core::{
    initial_positions, keys, Event, ItemId, ItemKind, ItemSeed, ReplicaContext, Storage, Timestamp,
};
use serde::Deserialize;

/// An item as written by the pre-log storage format.
///
/// Every field is optional; records without an id are skipped.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LegacyItem {
    pub id: Option<String>,
    pub text: Option<String>,
    pub created_at: Option<Timestamp>,
    pub completed: bool,
    pub completed_at: Option<Timestamp>,
    pub important: bool,
    pub archived: bool,
    pub archived_at: Option<Timestamp>,
    pub position: Option<String>,
    #[serde(alias = "type")]
    pub kind: Option<ItemKind>,
    pub level: Option<u8>,
    pub indented: bool,
    pub parent_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LegacyImport {
    /// The marker was already set.
    AlreadyImported,
    /// Nothing to import: the log has events or there is no legacy state.
    NotNeeded,
    Imported { items: usize },
}

/// Import legacy items into `materializer` if this replica has never done so.
pub fn import_legacy_state(
    storage: &dyn Storage,
    ctx: &ReplicaContext,
    materializer: &mut Materializer,
) -> Result<LegacyImport> {
    if storage.read(keys::LEGACY_IMPORTED)?.is_some() {
        return Ok(LegacyImport::AlreadyImported);
    }

    let legacy = if materializer.log().is_empty() {
        read_legacy_items(storage)
    } else {
        Vec::new()
    };

    let outcome = if legacy.is_empty() {
        LegacyImport::NotNeeded
    } else {
        let events = legacy_events(ctx, &legacy);
        let items = events.len();
        materializer.append_from(ChangeOrigin::Import, events)?;
        tracing::info!(items, "imported legacy items");
        LegacyImport::Imported { items }
    };

    // Written last: a failed append leaves the import to be retried on next open.
    storage.write(keys::LEGACY_IMPORTED, b"true")?;
    Ok(outcome)
}

fn read_legacy_items(storage: &dyn Storage) -> Vec<LegacyItem> {
    let bytes = match storage.read(keys::ITEMS) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Vec::new(),
        Err(e) => {
            tracing::warn!(error = %e, "legacy items unreadable, skipping import");
            return Vec::new();
        }
    };
    match serde_json::from_slice::<Vec<LegacyItem>>(&bytes) {
        Ok(items) => items.into_iter().filter(|i| i.id.is_some()).collect(),
        Err(e) => {
            tracing::warn!(error = %e, "legacy items malformed, skipping import");
            Vec::new()
        }
    }
}

/// One `Created` per legacy item, carrying its full state.
///
/// Items without a stored position get evenly spread keys in list order.
fn legacy_events(ctx: &ReplicaContext, legacy: &[LegacyItem]) -> Vec<Event> {
    let mut spread = initial_positions(legacy.len()).into_iter();

    legacy
        .iter()
        .filter_map(|item| {
            let fallback = spread.next();
            let id = item.id.clone()?;
            let seed = ItemSeed {
                text: Some(item.text.clone().unwrap_or_default()),
                created_at: item.created_at,
                completed: Some(item.completed),
                completed_at: item.completed.then_some(item.completed_at).flatten(),
                important: Some(item.important),
                archived: Some(item.archived),
                archived_at: item.archived.then_some(item.archived_at).flatten(),
                position: item.position.clone().or(fallback),
                kind: Some(item.kind.unwrap_or_default()),
                level: item.level,
                indented: Some(item.indented),
                parent_id: item.parent_id.clone().map(ItemId::new),
                ..Default::default()
            };
            Some(ctx.created(ItemId::new(id), seed))
        })
        .collect()
}
