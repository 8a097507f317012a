//! # loam-sync
//!
//! Replication for Loam replicas.
//!
//! A replica pushes the events it authored to a reconciliation peer, which
//! gives every event a global `seq`, and pulls everything newer than its
//! cursor back in pages. Merging is idempotent by event id, so retries and
//! duplicate delivery are harmless.
//!
//! - [`SyncTransport`]: the peer's `submit` / `fetch` contract
//! - [`MemoryPeer`]: an in-memory peer with fault injection
//! - [`SyncEngine`]: single-flight sync cycles with backoff and resync
//! - [`Client`]: a replica wired to an engine

pub mod backoff;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod memory;
pub mod transport;

pub use backoff::Backoff;
pub use client::{Client, ClientConfig};
pub use config::{SyncConfig, SyncConfigBuilder};
pub use engine::{SyncEngine, SyncEvent, SyncPhase, SyncReport, SyncStatus};
pub use error::{Result, SyncError, TransportError};
pub use memory::MemoryPeer;
pub use transport::SyncTransport;
