//! # loam-log
//!
//! Durable event log and derived state for a Loam replica.
//!
//! - [`store`]: the append-only, id-deduplicated [`EventLog`]
//! - [`cursor`]: the persisted replication cursor
//! - [`materializer`]: cached projection plus state-changed observers
//! - [`replica`]: item operations that author events
//! - [`legacy`]: one-time import of pre-log item state
//!
//! ## Example
//!
//! ```rust
//! use loam_core::{ManualClock, MemoryStorage};
//! use loam_log::{Placement, Replica};
//! use std::sync::Arc;
//!
//! let mut replica = Replica::open(Arc::new(MemoryStorage::new()), Arc::new(ManualClock::new(1000))).unwrap();
//! let id = replica.create_item("Buy milk", Placement::Tail).unwrap();
//! replica.set_completed(&id, true).unwrap();
//! assert!(replica.items()[0].completed);
//! ```

pub mod cursor;
pub mod error;
pub mod legacy;
pub mod materializer;
pub mod replica;
pub mod store;

pub use cursor::SyncCursor;
pub use error::{LogError, Result};
pub use legacy::{import_legacy_state, LegacyImport, LegacyItem};
pub use materializer::{ChangeOrigin, Materializer, MergeOutcome, StateChange, SubscriptionId};
pub use replica::{Placement, Replica};
pub use store::{ContentDigest, EventLog};
