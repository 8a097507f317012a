//! Log compaction.
//!
//! Compaction folds the acknowledged prefix of the log into one snapshot
//! event per live item. Events the peer has not acknowledged are never
//! touched: they are carried over verbatim, after the snapshots, so they are
//! still pushed on the next sync.

use crate::snapshot::{is_snapshot, snapshot_event};
use loam_core::{project, Event, EventPayload, ItemId, Projection, ReplicaId, Seq};
use std::collections::HashSet;
use loam_log::{LogError, Materializer};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompactionError {
    /// The compacted log does not project to the same items. Nothing was written.
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("log error: {0}")]
    Log(#[from] LogError),
}

/// Configuration for the compactor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Whether the replication engine compacts after a successful sync.
    pub auto_compact: bool,

    /// Minimum log length before automatic compaction kicks in.
    pub min_events_for_compaction: usize,

    /// Re-project and compare before committing the compacted log.
    pub verify_after_compaction: bool,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        CompactionConfig {
            auto_compact: true,
            min_events_for_compaction: 500,
            verify_after_compaction: true,
        }
    }
}

impl CompactionConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Running totals across compactions.
#[derive(Clone, Debug, Default)]
pub struct CompactionStats {
    pub runs: u64,
    pub events_removed: u64,
    pub snapshots_written: u64,
    pub verification_failures: u64,
    /// Log length after the last successful run.
    pub last_log_len: Option<usize>,
}

/// What one compaction did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub events_before: usize,
    pub events_after: usize,
    /// Acknowledged events folded into snapshots.
    pub folded: usize,
    pub snapshots: usize,
    /// Unacknowledged events carried over.
    pub unacknowledged: usize,
}

impl CompactionReport {
    pub fn is_noop(&self) -> bool {
        self.folded == 0
    }
}

/// Result of [`compact_events`].
#[derive(Clone, Debug)]
pub struct CompactedLog {
    pub events: Vec<Event>,
    pub folded: usize,
    pub snapshots: usize,
}

/// Rewrite `events`, folding every acknowledged event with `seq <= horizon`.
///
/// Snapshots are taken from the projection of the whole log and stamped with
/// the highest folded seq. Two kinds of folded event are kept as-is because a
/// snapshot cannot stand in for them: field changes whose item has no
/// `Created` anywhere in the log, and deletions of items that unfolded events
/// still refer to. Everything not folded follows in its original order.
pub fn compact_events(events: &[Event], horizon: Seq, author: &ReplicaId) -> CompactedLog {
    // Old snapshots are always folded; the peer never sends them back.
    let foldable = |e: &Event| is_snapshot(e) || matches!(e.seq, Some(seq) if seq <= horizon);

    let Some(snapshot_seq) = events
        .iter()
        .filter(|e| foldable(*e))
        .filter_map(|e| e.seq)
        .max()
    else {
        return CompactedLog {
            events: events.to_vec(),
            folded: 0,
            snapshots: 0,
        };
    };

    let mut projection = Projection::new();
    projection.apply_all(events);
    let items = projection.items();

    let referenced: HashSet<&ItemId> = events
        .iter()
        .filter(|e| !foldable(*e))
        .map(|e| &e.item_id)
        .collect();

    let mut compacted: Vec<Event> = items
        .iter()
        .map(|item| snapshot_event(item, snapshot_seq, author))
        .collect();
    let snapshots = compacted.len();

    let mut folded = 0;
    let mut kept = Vec::new();
    for event in events {
        if !foldable(event) {
            kept.push(event.clone());
            continue;
        }
        let preserve = match event.payload {
            EventPayload::FieldChanged { .. } => projection.is_orphaned(&event.item_id),
            EventPayload::Deleted => referenced.contains(&event.item_id),
            EventPayload::Created { .. } => false,
        };
        if preserve {
            compacted.push(event.clone());
        } else {
            folded += 1;
        }
    }
    compacted.extend(kept);

    CompactedLog {
        events: compacted,
        folded,
        snapshots,
    }
}

/// Check that `after` projects to exactly the items `before` does.
pub fn verify(before: &[Event], after: &[Event]) -> Result<(), CompactionError> {
    let expected = project(before);
    let actual = project(after);
    if expected == actual {
        return Ok(());
    }

    let detail = match expected
        .iter()
        .zip(actual.iter())
        .find(|(e, a)| e != a)
    {
        Some((e, _)) => format!("item {} differs", e.id),
        None => format!("{} items before, {} after", expected.len(), actual.len()),
    };
    Err(CompactionError::VerificationFailed(detail))
}

/// Compacts a replica's log through its materializer.
pub struct Compactor {
    replica_id: ReplicaId,
    config: CompactionConfig,
    stats: CompactionStats,
}

impl Compactor {
    pub fn new(replica_id: ReplicaId) -> Self {
        Self::with_config(replica_id, CompactionConfig::default())
    }

    pub fn with_config(replica_id: ReplicaId, config: CompactionConfig) -> Self {
        Compactor {
            replica_id,
            config,
            stats: CompactionStats::default(),
        }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    pub fn stats(&self) -> &CompactionStats {
        &self.stats
    }

    /// Whether automatic compaction should run on a log of this size.
    pub fn should_compact(&self, materializer: &Materializer) -> bool {
        self.config.auto_compact
            && materializer.log().len() >= self.config.min_events_for_compaction
            && materializer.log().max_seq().is_some()
    }

    /// Fold every acknowledged event.
    pub fn compact(&mut self, materializer: &mut Materializer) -> Result<CompactionReport, CompactionError> {
        let horizon = materializer.log().max_seq().unwrap_or(0);
        self.compact_through(materializer, horizon)
    }

    /// Fold acknowledged events with `seq <= horizon`.
    ///
    /// The replication engine passes its pull cursor here, so nothing the peer
    /// may still send back is folded away.
    pub fn compact_through(
        &mut self,
        materializer: &mut Materializer,
        horizon: Seq,
    ) -> Result<CompactionReport, CompactionError> {
        let before = materializer.log().events();
        let mut report = CompactionReport {
            events_before: before.len(),
            events_after: before.len(),
            unacknowledged: materializer.log().unacknowledged_count(),
            ..Default::default()
        };
        if before.is_empty() {
            return Ok(report);
        }

        let compacted = compact_events(before, horizon, &self.replica_id);
        if compacted.folded == 0 {
            tracing::debug!(horizon, "nothing to compact");
            return Ok(report);
        }

        if self.config.verify_after_compaction {
            if let Err(e) = verify(before, &compacted.events) {
                self.stats.verification_failures += 1;
                tracing::warn!(error = %e, horizon, "compaction aborted");
                return Err(e);
            }
        }

        report.events_after = compacted.events.len();
        report.folded = compacted.folded;
        report.snapshots = compacted.snapshots;
        materializer.replace_log(compacted.events)?;

        self.stats.runs += 1;
        self.stats.events_removed += report.events_before.saturating_sub(report.events_after) as u64;
        self.stats.snapshots_written += report.snapshots as u64;
        self.stats.last_log_len = Some(report.events_after);

        tracing::info!(
            before = report.events_before,
            after = report.events_after,
            snapshots = report.snapshots,
            "compacted event log"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loam_core::{EventId, FieldChange, ItemSeed, MemoryStorage};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn author() -> ReplicaId {
        ReplicaId::new("r1")
    }

    fn created(id: &str, item: &str, ts: u64) -> Event {
        Event::new(
            EventId::new(id),
            ItemId::new(item),
            EventPayload::Created {
                value: ItemSeed::new(item, "n"),
            },
            ts,
            author(),
        )
    }

    fn text(id: &str, item: &str, value: &str, ts: u64) -> Event {
        Event::new(
            EventId::new(id),
            ItemId::new(item),
            EventPayload::FieldChanged {
                change: FieldChange::Text(value.into()),
            },
            ts,
            author(),
        )
    }

    fn deleted(id: &str, item: &str, ts: u64) -> Event {
        Event::new(EventId::new(id), ItemId::new(item), EventPayload::Deleted, ts, author())
    }

    fn materializer(events: Vec<Event>) -> Materializer {
        let mut m = Materializer::open(Arc::new(MemoryStorage::new())).unwrap();
        m.append(events).unwrap();
        m
    }

    #[test]
    fn test_empty_log_is_noop() {
        let mut m = materializer(vec![]);
        let report = Compactor::new(author()).compact(&mut m).unwrap();
        assert!(report.is_noop());
        assert_eq!(report.events_before, 0);
    }

    #[test]
    fn test_unacknowledged_only_is_noop() {
        let mut m = materializer(vec![created("c1", "a", 1000), text("t1", "a", "x", 1001)]);
        let report = Compactor::new(author()).compact(&mut m).unwrap();
        assert!(report.is_noop());
        assert_eq!(m.log().len(), 2);
    }

    #[test]
    fn test_folds_acknowledged_history() {
        let mut m = materializer(vec![
            created("c1", "a", 1000).with_seq(1),
            text("t1", "a", "one", 1001).with_seq(2),
            text("t2", "a", "two", 1002).with_seq(3),
            created("c2", "b", 1003).with_seq(4),
            deleted("d2", "b", 1004).with_seq(5),
            text("t3", "a", "pending", 1005),
        ]);
        let before = m.current_state();

        let mut compactor = Compactor::new(author());
        let report = compactor.compact(&mut m).unwrap();
        assert_eq!(report.folded, 5);
        assert_eq!(report.snapshots, 1);
        assert_eq!(report.events_after, 2);

        let events = m.log().events();
        assert!(is_snapshot(&events[0]));
        assert_eq!(events[0].seq, Some(5));
        assert_eq!(events[1].id.as_str(), "t3");
        assert_eq!(events[1].seq, None);

        assert_eq!(*before, *m.current_state());
        assert_eq!(compactor.stats().runs, 1);
        assert_eq!(compactor.stats().events_removed, 4);
    }

    #[test]
    fn test_horizon_keeps_later_acknowledged_events() {
        let mut m = materializer(vec![
            created("c1", "a", 1000).with_seq(1),
            text("t1", "a", "one", 1001).with_seq(2),
            text("t2", "a", "two", 1002).with_seq(7),
        ]);

        let report = Compactor::new(author()).compact_through(&mut m, 2).unwrap();
        assert_eq!(report.folded, 2);

        let ids: Vec<&str> = m.log().events().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["snapshot:a", "t2"]);
        assert_eq!(m.log().events()[0].seq, Some(2));
        assert_eq!(m.current_state()[0].text, "two");
    }

    #[test]
    fn test_orphan_changes_are_kept() {
        let mut m = materializer(vec![
            created("c1", "a", 1000).with_seq(1),
            text("t1", "ghost", "early", 1001).with_seq(2),
        ]);
        Compactor::new(author()).compact(&mut m).unwrap();
        assert!(m.log().contains(&EventId::new("t1")));

        // The item shows up later and still picks up its change.
        m.append(vec![created("c9", "ghost", 900)]).unwrap();
        let ghost = m.item(&ItemId::new("ghost")).unwrap();
        assert_eq!(ghost.text, "early");
    }

    #[test]
    fn test_deletion_is_kept_while_referenced() {
        let mut m = materializer(vec![
            created("c1", "a", 1000).with_seq(1),
            deleted("d1", "a", 1001).with_seq(2),
            created("c2", "a", 1002),
        ]);
        assert!(m.current_state().is_empty());

        Compactor::new(author()).compact(&mut m).unwrap();
        let ids: Vec<&str> = m.log().events().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["d1", "c2"]);
        assert!(m.current_state().is_empty());
    }

    #[test]
    fn test_recompaction_replaces_snapshots() {
        let mut m = materializer(vec![
            created("c1", "a", 1000).with_seq(1),
            text("t1", "a", "one", 1001).with_seq(2),
        ]);
        let mut compactor = Compactor::new(author());
        compactor.compact(&mut m).unwrap();

        m.append(vec![text("t2", "a", "two", 1002)]).unwrap();
        let mut acks = HashMap::new();
        acks.insert(EventId::new("t2"), 3);
        m.acknowledge(&acks).unwrap();

        compactor.compact(&mut m).unwrap();
        assert_eq!(m.log().len(), 1);
        assert_eq!(m.log().events()[0].seq, Some(3));
        assert_eq!(m.current_state()[0].text, "two");
    }

    #[test]
    fn test_tie_broken_by_unacknowledged_fails_verification() {
        // Equal stamps: the acked value is processed last and wins. After
        // compaction the unacked value would be replayed last instead.
        let mut m = materializer(vec![
            created("c1", "a", 1000).with_seq(1),
            text("local", "a", "mine", 2000),
            text("remote", "a", "theirs", 2000).with_seq(2),
        ]);
        let mut compactor = Compactor::new(author());
        let result = compactor.compact(&mut m);

        assert!(matches!(result, Err(CompactionError::VerificationFailed(_))));
        assert_eq!(m.log().len(), 3);
        assert_eq!(compactor.stats().verification_failures, 1);
    }

    #[test]
    fn test_should_compact_threshold() {
        let config = CompactionConfig {
            min_events_for_compaction: 2,
            ..Default::default()
        };
        let compactor = Compactor::with_config(author(), config);

        assert!(!compactor.should_compact(&materializer(vec![created("c1", "a", 1).with_seq(1)])));
        assert!(!compactor.should_compact(&materializer(vec![
            created("c1", "a", 1),
            created("c2", "b", 2)
        ])));
        assert!(compactor.should_compact(&materializer(vec![
            created("c1", "a", 1).with_seq(1),
            created("c2", "b", 2)
        ])));
    }

    #[test]
    fn test_config_from_json() {
        let config = CompactionConfig::from_json(r#"{"min_events_for_compaction": 50}"#).unwrap();
        assert_eq!(config.min_events_for_compaction, 50);
        assert!(config.auto_compact);
    }
}
