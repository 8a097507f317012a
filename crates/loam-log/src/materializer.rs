//! Cached projection of the event log, with change notification.
//!
//! The materializer owns the [`EventLog`]. Every write goes through it so the
//! cached item list can be invalidated and registered observers told about
//! the change. Observers run synchronously, after the write has been
//! persisted, in registration order.

use crate::error::Result;
use crate::store::{ContentDigest, EventLog};
use loam_core::{keys, project, Event, EventId, Item, ItemId, Seq, Storage};
use std::collections::HashMap;
use std::sync::Arc;

/// Where a state change came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Authored on this replica.
    Local,
    /// Pulled from the reconciliation peer.
    Remote,
    /// The log was rewritten by compaction.
    Compaction,
    /// The log was re-read after an external write.
    Reload,
    /// Events synthesized from pre-log state.
    Import,
}

impl ChangeOrigin {
    /// Whether the change carries events this replica must push.
    pub fn is_authored_here(self) -> bool {
        matches!(self, ChangeOrigin::Local | ChangeOrigin::Import)
    }
}

/// Notification passed to observers.
#[derive(Clone, Debug)]
pub struct StateChange {
    pub origin: ChangeOrigin,
    /// Events newly added to the log.
    pub appended: usize,
    pub log_len: usize,
    /// Events still waiting for the peer's ack.
    pub unacknowledged: usize,
}

/// Handle returned by [`Materializer::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Observer = Box<dyn Fn(&StateChange) + Send + Sync>;

/// Outcome of merging a page of remote events.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Unseen events appended to the log.
    pub appended: usize,
    /// Already-known local events that picked up their seq from the page.
    pub acknowledged: usize,
    /// Highest seq present in the page.
    pub max_seq: Option<Seq>,
}

pub struct Materializer {
    storage: Arc<dyn Storage>,
    log: EventLog,
    cache: Option<(ContentDigest, Arc<Vec<Item>>)>,
    observers: Vec<(SubscriptionId, Observer)>,
    next_subscription: u64,
}

impl Materializer {
    pub fn open(storage: Arc<dyn Storage>) -> Result<Self> {
        let log = EventLog::open(storage.clone())?;
        Ok(Self {
            storage,
            log,
            cache: None,
            observers: Vec::new(),
            next_subscription: 0,
        })
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// Register a state-changed handler.
    pub fn subscribe<F>(&mut self, observer: F) -> SubscriptionId
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.observers.push((id, Box::new(observer)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(sid, _)| *sid != id);
        self.observers.len() != before
    }

    /// Current items, recomputed only when the log content changed.
    pub fn current_state(&mut self) -> Arc<Vec<Item>> {
        let digest = self.log.digest();
        if let Some((cached, items)) = &self.cache {
            if *cached == digest {
                return items.clone();
            }
        }

        let items = Arc::new(project(self.log.events()));
        tracing::trace!(items = items.len(), digest = %digest.short(), "projection recomputed");
        self.cache = Some((digest, items.clone()));
        items
    }

    /// Look up one live item.
    pub fn item(&mut self, id: &ItemId) -> Option<Item> {
        self.current_state().iter().find(|i| &i.id == id).cloned()
    }

    /// Append locally authored events.
    pub fn append(&mut self, events: Vec<Event>) -> Result<usize> {
        self.append_from(ChangeOrigin::Local, events)
    }

    pub fn append_from(&mut self, origin: ChangeOrigin, events: Vec<Event>) -> Result<usize> {
        let appended = self.log.append(events)?;
        if appended > 0 {
            self.after_write(origin, appended);
        }
        Ok(appended)
    }

    /// Merge a page of events from the peer.
    ///
    /// Events whose id is already in the log are not appended again; if the
    /// local copy is still unacknowledged it takes the page's seq (the push
    /// that carried it may have lost its response).
    pub fn merge_remote(&mut self, events: Vec<Event>) -> Result<MergeOutcome> {
        let max_seq = events.iter().filter_map(|e| e.seq).max();

        let mut late_acks = HashMap::new();
        let mut fresh = Vec::new();
        for event in events {
            if self.log.contains(&event.id) {
                if let Some(seq) = event.seq {
                    late_acks.insert(event.id, seq);
                }
            } else {
                fresh.push(event);
            }
        }

        let acknowledged = if late_acks.is_empty() {
            0
        } else {
            self.log.acknowledge(&late_acks)?
        };
        let appended = self.log.append(fresh)?;
        if appended > 0 {
            self.after_write(ChangeOrigin::Remote, appended);
        }

        Ok(MergeOutcome {
            appended,
            acknowledged,
            max_seq,
        })
    }

    /// Record the peer's seq for pushed events.
    pub fn acknowledge(&mut self, acks: &HashMap<EventId, Seq>) -> Result<usize> {
        // The projection does not depend on seq; the cache key still changes
        // with the log content, which is all the cache needs.
        self.log.acknowledge(acks)
    }

    /// Swap in a rewritten log (compaction).
    pub fn replace_log(&mut self, events: Vec<Event>) -> Result<()> {
        self.log.replace(events)?;
        self.after_write(ChangeOrigin::Compaction, 0);
        Ok(())
    }

    /// Pick up log writes made by another handle on the same storage.
    pub fn reload(&mut self) -> Result<bool> {
        let changed = self.log.reload()?;
        if changed {
            self.after_write(ChangeOrigin::Reload, 0);
        }
        Ok(changed)
    }

    fn after_write(&mut self, origin: ChangeOrigin, appended: usize) {
        let items = self.current_state();
        match serde_json::to_vec(items.as_ref()) {
            Ok(bytes) => {
                if let Err(e) = self.storage.write(keys::ITEMS, &bytes) {
                    // Derived data: the log is already durable.
                    tracing::warn!(error = %e, "could not persist materialized items");
                }
            }
            Err(e) => tracing::warn!(error = %e, "could not serialize materialized items"),
        }

        let change = StateChange {
            origin,
            appended,
            log_len: self.log.len(),
            unacknowledged: self.log.unacknowledged_count(),
        };
        for (_, observer) in &self.observers {
            observer(&change);
        }
    }
}
