//! The reconciliation peer, as seen by the replication engine.

use crate::error::TransportError;
use async_trait::async_trait;
use loam_core::{Event, Seq};

/// Request/response channel to the peer that orders events.
///
/// Authentication and framing belong to the implementation; the engine only
/// sees success or a [`TransportError`].
#[async_trait]
pub trait SyncTransport: Send + Sync + 'static {
    /// Hand over a batch of events and get them back with their `seq`.
    ///
    /// Must be idempotent by event id: resubmitting an event returns the seq
    /// it was first given.
    async fn submit(&self, events: Vec<Event>) -> Result<Vec<Event>, TransportError>;

    /// Events with `seq > since`, ascending by seq, at most `limit` of them.
    async fn fetch(&self, since: Seq, limit: usize) -> Result<Vec<Event>, TransportError>;
}
