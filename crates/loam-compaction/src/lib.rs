//! # loam-compaction
//!
//! Bounds the size of a Loam event log.
//!
//! Acknowledged history is folded into one snapshot `Created` event per live
//! item, carrying the item's full state and per-field stamps. Unacknowledged
//! events survive untouched, and the compacted log is checked to project to
//! the same items before it replaces the old one.
//!
//! ## Example
//!
//! ```rust
//! use loam_compaction::Compactor;
//! use loam_core::{ItemId, ItemSeed, ManualClock, MemoryStorage, ReplicaContext, ReplicaId};
//! use loam_log::Materializer;
//! use std::sync::Arc;
//!
//! let ctx = ReplicaContext::new(ReplicaId::new("r1"), Arc::new(ManualClock::new(1000)));
//! let mut materializer = Materializer::open(Arc::new(MemoryStorage::new())).unwrap();
//! materializer
//!     .append(vec![ctx.created(ItemId::new("x"), ItemSeed::new("Hello", "n")).with_seq(1)])
//!     .unwrap();
//!
//! let mut compactor = Compactor::new(ReplicaId::new("r1"));
//! let report = compactor.compact(&mut materializer).unwrap();
//! assert_eq!(report.snapshots, 1);
//! ```

mod compactor;
mod snapshot;

pub use compactor::{
    compact_events, verify, CompactedLog, CompactionConfig, CompactionError, CompactionReport,
    CompactionStats, Compactor,
};
pub use snapshot::{is_snapshot, snapshot_event, snapshot_id, SNAPSHOT_PREFIX};
