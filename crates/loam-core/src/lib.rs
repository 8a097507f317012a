//! # loam-core
//!
//! Core data model for Loam, a local-first replicated event log.
//!
//! Each replica keeps an append-only log of mutation [`Event`]s and derives
//! its visible [`Item`] list by replaying that log through the projection
//! engine. Divergent replicas converge by exchanging events and merging every
//! item field under Last-Writer-Wins.
//!
//! This crate provides:
//! - [`clock`]: injectable time sources
//! - [`ids`]: replica, event and item identifiers
//! - [`storage`]: named-blob local storage (memory and file backed)
//! - [`identity`]: the per-replica id provider
//! - [`context`]: the authoring context that stamps new events
//! - [`event`] / [`item`]: the event and item model
//! - [`lww`]: the field-level merge rule
//! - [`position`]: fractional ordering keys
//! - [`projection`]: the event -> item projection engine
//!
//! ## Example
//!
//! ```rust
//! use loam_core::{project, ItemId, ItemSeed, ManualClock, ReplicaContext, ReplicaId};
//! use std::sync::Arc;
//!
//! let ctx = ReplicaContext::new(ReplicaId::new("r1"), Arc::new(ManualClock::new(1000)));
//! let events = vec![ctx.created(ItemId::new("x"), ItemSeed::new("Hello", "n"))];
//! let items = project(&events);
//! assert_eq!(items[0].text, "Hello");
//! ```

pub mod clock;
pub mod context;
pub mod event;
pub mod identity;
pub mod ids;
pub mod item;
pub mod lww;
pub mod position;
pub mod projection;
pub mod storage;

pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use context::ReplicaContext;
pub use event::{Event, EventPayload, Seq};
pub use identity::IdentityProvider;
pub use ids::{EventId, ItemId, ReplicaId};
pub use item::{Field, FieldChange, FieldStamps, Item, ItemKind, ItemSeed};
pub use position::{initial_positions, key_between, PositionError, DEFAULT_POSITION};
pub use projection::{project, sort_items, Projection};
pub use storage::{keys, FileStorage, MemoryStorage, Storage, StorageError};
