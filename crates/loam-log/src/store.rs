//! Append-only event log store.
//!
//! The log is held in memory and persisted as a single JSON blob after every
//! mutation. A mutation is only visible once its blob write succeeded: if the
//! write fails the in-memory log is rolled back and the error is returned.

use crate::error::Result;
use loam_core::{keys, Event, EventId, Seq, Storage, StorageError};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

/// SHA-256 of the serialized log, used as the materializer's cache key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    pub fn of(bytes: &[u8]) -> Self {
        ContentDigest(Sha256::digest(bytes).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 8 hex characters, for logs.
    pub fn short(&self) -> String {
        self.0[..4].iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Keep the first copy of each id, in order. A stored blob may predate
/// deduplication or have been written by another handle.
fn dedupe(events: Vec<Event>) -> (Vec<Event>, HashMap<EventId, usize>) {
    let mut kept = Vec::with_capacity(events.len());
    let mut index = HashMap::with_capacity(events.len());
    for event in events {
        if !index.contains_key(&event.id) {
            index.insert(event.id.clone(), kept.len());
            kept.push(event);
        }
    }
    (kept, index)
}

/// Ordered, id-deduplicated sequence of events.
pub struct EventLog {
    storage: Arc<dyn Storage>,
    events: Vec<Event>,
    index: HashMap<EventId, usize>,
    digest: ContentDigest,
}

impl EventLog {
    /// Open the log stored under [`keys::EVENTS`].
    ///
    /// A blob that cannot be decoded is set aside under `events.corrupt` and
    /// the log starts empty. Storage read errors are returned as-is.
    pub fn open(storage: Arc<dyn Storage>) -> Result<Self> {
        let events = match storage.read(keys::EVENTS)? {
            None => Vec::new(),
            Some(bytes) => match serde_json::from_slice::<Vec<Event>>(&bytes) {
                Ok(events) => events,
                Err(e) => {
                    tracing::warn!(error = %e, bytes = bytes.len(), "event log is corrupt, starting empty");
                    if let Err(e) = storage.write(&format!("{}.corrupt", keys::EVENTS), &bytes) {
                        tracing::warn!(error = %e, "could not preserve corrupt event log");
                    }
                    Vec::new()
                }
            },
        };

        let (events, index) = dedupe(events);
        let digest = ContentDigest::of(&serde_json::to_vec(&events)?);
        let log = EventLog {
            storage,
            events,
            index,
            digest,
        };

        tracing::debug!(events = log.events.len(), digest = %log.digest.short(), "opened event log");
        Ok(log)
    }

    /// Serialize and write `events`, returning the digest of what was written.
    fn persist(&self, events: &[Event]) -> std::result::Result<ContentDigest, StorageError> {
        let bytes = serde_json::to_vec(events)?;
        self.storage.write(keys::EVENTS, &bytes)?;
        Ok(ContentDigest::of(&bytes))
    }

    fn rebuild_index(&mut self) {
        self.index = self
            .events
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect();
    }

    /// Append events whose ids are not already present, preserving order.
    ///
    /// Returns the number actually appended; replaying a batch is a no-op.
    pub fn append(&mut self, events: impl IntoIterator<Item = Event>) -> Result<usize> {
        let start = self.events.len();
        for event in events {
            if self.index.contains_key(&event.id) {
                continue;
            }
            self.index.insert(event.id.clone(), self.events.len());
            self.events.push(event);
        }

        let appended = self.events.len() - start;
        if appended == 0 {
            return Ok(0);
        }

        match self.persist(&self.events) {
            Ok(digest) => {
                self.digest = digest;
                tracing::debug!(appended, total = self.events.len(), "appended events");
                Ok(appended)
            }
            Err(e) => {
                for event in self.events.drain(start..) {
                    self.index.remove(&event.id);
                }
                tracing::error!(error = %e, "event log write failed, append rolled back");
                Err(e.into())
            }
        }
    }

    /// Defensive copy of every event, in log order.
    pub fn load(&self) -> Vec<Event> {
        self.events.clone()
    }

    /// Read-only view of the log.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Events the peer has not acknowledged yet (`seq == None`), in log order.
    pub fn unacknowledged(&self) -> Vec<Event> {
        self.events
            .iter()
            .filter(|e| e.seq.is_none())
            .cloned()
            .collect()
    }

    pub fn unacknowledged_count(&self) -> usize {
        self.events.iter().filter(|e| e.seq.is_none()).count()
    }

    /// Set `seq` on the matching events.
    ///
    /// A seq is written once: events that already carry one are left alone.
    /// Unknown ids are ignored. Returns the number of events updated.
    pub fn acknowledge(&mut self, acks: &HashMap<EventId, Seq>) -> Result<usize> {
        let mut updated = Vec::new();
        for (id, seq) in acks {
            let Some(&pos) = self.index.get(id) else {
                continue;
            };
            let event = &mut self.events[pos];
            match event.seq {
                None => {
                    event.seq = Some(*seq);
                    updated.push(pos);
                }
                Some(existing) if existing != *seq => {
                    tracing::warn!(event = %id, existing, incoming = seq, "ignoring conflicting ack");
                }
                Some(_) => {}
            }
        }

        if updated.is_empty() {
            return Ok(0);
        }

        match self.persist(&self.events) {
            Ok(digest) => {
                self.digest = digest;
                Ok(updated.len())
            }
            Err(e) => {
                for pos in updated {
                    self.events[pos].seq = None;
                }
                Err(e.into())
            }
        }
    }

    /// Replace the whole log. Used by compaction.
    pub fn replace(&mut self, events: Vec<Event>) -> Result<()> {
        let digest = self.persist(&events)?;
        self.events = events;
        self.rebuild_index();
        self.digest = digest;
        Ok(())
    }

    /// Re-read the log from storage, picking up writes made behind our back.
    ///
    /// Unlike [`EventLog::open`], a corrupt blob here is an error: the
    /// in-memory log is kept and nothing is discarded mid-session.
    pub fn reload(&mut self) -> Result<bool> {
        let bytes = self.storage.read(keys::EVENTS)?.unwrap_or_else(|| b"[]".to_vec());
        let digest = ContentDigest::of(&bytes);
        if digest == self.digest {
            return Ok(false);
        }

        let events: Vec<Event> =
            serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
                key: keys::EVENTS.to_string(),
                reason: e.to_string(),
            })?;
        let (events, index) = dedupe(events);
        self.events = events;
        self.index = index;
        self.digest = digest;
        tracing::debug!(events = self.events.len(), "reloaded event log from storage");
        Ok(true)
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &EventId) -> Option<&Event> {
        self.index.get(id).map(|&pos| &self.events[pos])
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Highest acknowledged seq present in the log.
    pub fn max_seq(&self) -> Option<Seq> {
        self.events.iter().filter_map(|e| e.seq).max()
    }

    pub fn digest(&self) -> ContentDigest {
        self.digest
    }
}
