//! In-memory reconciliation peer for tests and simulation.
//!
//! Behaves like the real peer: assigns a global `seq` in arrival order,
//! deduplicates by event id, and serves pages ascending by seq. Responses go
//! through JSON so the event encoding is exercised on every call. Faults can
//! be injected per call.

use crate::error::TransportError;
use crate::transport::SyncTransport;
use async_trait::async_trait;
use loam_core::{Event, EventId, Seq};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Default)]
struct PeerLog {
    events: Vec<Event>,
    index: HashMap<EventId, usize>,
}

#[derive(Default)]
struct Faults {
    /// Submits to reject outright.
    submits: Vec<TransportError>,
    /// Submits to commit whose response is then lost.
    lost_responses: usize,
    fetches: Vec<TransportError>,
}

/// Reconciliation peer held in memory.
#[derive(Default)]
pub struct MemoryPeer {
    log: Mutex<PeerLog>,
    faults: Mutex<Faults>,
    latency: Mutex<Option<Duration>>,
    submit_calls: AtomicU64,
    fetch_calls: AtomicU64,
}

impl MemoryPeer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` submits with `status`, without committing them.
    pub fn fail_next_submits(&self, n: usize, status: u16) {
        let mut faults = self.faults.lock();
        faults.submits.extend(std::iter::repeat(TransportError::Status(status)).take(n));
    }

    /// Commit the next `n` submits but report them as unreachable.
    pub fn lose_next_submit_responses(&self, n: usize) {
        self.faults.lock().lost_responses += n;
    }

    pub fn fail_next_fetches(&self, n: usize, status: u16) {
        let mut faults = self.faults.lock();
        faults.fetches.extend(std::iter::repeat(TransportError::Status(status)).take(n));
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Store events as if other replicas had submitted them.
    pub fn seed(&self, events: impl IntoIterator<Item = Event>) -> Vec<Event> {
        let mut log = self.log.lock();
        events.into_iter().map(|e| Self::commit(&mut log, e)).collect()
    }

    /// Number of distinct events held.
    pub fn len(&self) -> usize {
        self.log.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn events(&self) -> Vec<Event> {
        self.log.lock().events.clone()
    }

    /// Highest seq assigned so far, 0 when empty.
    pub fn head(&self) -> Seq {
        self.log.lock().events.len() as Seq
    }

    pub fn submit_calls(&self) -> u64 {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> u64 {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    fn commit(log: &mut PeerLog, mut event: Event) -> Event {
        if let Some(&pos) = log.index.get(&event.id) {
            return log.events[pos].clone();
        }
        let seq = log.events.len() as Seq + 1;
        event.seq = Some(seq);
        log.index.insert(event.id.clone(), log.events.len());
        log.events.push(event.clone());
        event
    }

    async fn delay(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

/// Round-trip through the wire encoding.
fn over_the_wire(events: &[Event]) -> Result<Vec<Event>, TransportError> {
    let bytes = serde_json::to_vec(events).map_err(|e| TransportError::Decode(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| TransportError::Decode(e.to_string()))
}

#[async_trait]
impl SyncTransport for MemoryPeer {
    async fn submit(&self, events: Vec<Event>) -> Result<Vec<Event>, TransportError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;

        let lose_response = {
            let mut faults = self.faults.lock();
            if !faults.submits.is_empty() {
                return Err(faults.submits.remove(0));
            }
            let lose = faults.lost_responses > 0;
            if lose {
                faults.lost_responses -= 1;
            }
            lose
        };

        let acked: Vec<Event> = {
            let mut log = self.log.lock();
            events.into_iter().map(|e| Self::commit(&mut log, e)).collect()
        };
        tracing::trace!(events = acked.len(), "peer accepted batch");

        if lose_response {
            return Err(TransportError::Unreachable("response lost".into()));
        }
        over_the_wire(&acked)
    }

    async fn fetch(&self, since: Seq, limit: usize) -> Result<Vec<Event>, TransportError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;

        {
            let mut faults = self.faults.lock();
            if !faults.fetches.is_empty() {
                return Err(faults.fetches.remove(0));
            }
        }

        let page: Vec<Event> = {
            let log = self.log.lock();
            // seq n lives at index n - 1.
            let start = (since as usize).min(log.events.len());
            log.events[start..].iter().take(limit).cloned().collect()
        };
        over_the_wire(&page)
    }
}
