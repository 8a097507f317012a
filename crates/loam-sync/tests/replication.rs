//! Replication behaviour against the in-memory peer.

use loam_compaction::CompactionConfig;
use loam_core::{
    Event, EventId, EventPayload, FieldChange, ItemId, ItemSeed, ManualClock, MemoryStorage,
    ReplicaId,
};
use loam_log::Placement;
use loam_sync::{
    Client, ClientConfig, MemoryPeer, SyncConfigBuilder, SyncError, SyncPhase, SyncStatus,
    TransportError,
};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Helpers
// ============================================================================

fn manual() -> SyncConfigBuilder {
    SyncConfigBuilder::new().auto_sync(false)
}

fn open(peer: &Arc<MemoryPeer>, sync: SyncConfigBuilder) -> (Client<MemoryPeer>, Arc<ManualClock>) {
    open_with(peer, sync, CompactionConfig::default())
}

fn open_with(
    peer: &Arc<MemoryPeer>,
    sync: SyncConfigBuilder,
    compaction: CompactionConfig,
) -> (Client<MemoryPeer>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1000));
    let client = Client::open(
        Arc::new(MemoryStorage::new()),
        clock.clone(),
        peer.clone(),
        ClientConfig {
            sync: sync.build(),
            compaction,
        },
    )
    .unwrap();
    (client, clock)
}

async fn wait_for(client: &Client<MemoryPeer>, done: impl Fn(&SyncStatus) -> bool) {
    let mut rx = client.watch_status();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| done(s)))
        .await
        .expect("timed out waiting for sync status")
        .expect("status channel closed");
}

fn remote_created(n: usize) -> Event {
    Event::new(
        EventId::new(format!("remote-{}", n)),
        ItemId::new(format!("item-{:04}", n)),
        EventPayload::Created {
            value: ItemSeed::new(format!("remote {}", n), "n"),
        },
        500 + n as u64,
        ReplicaId::new("elsewhere"),
    )
}

// ============================================================================
// Push
// ============================================================================

#[tokio::test]
async fn test_failed_push_retried_without_duplicates() {
    let peer = Arc::new(MemoryPeer::new());
    let (a, _) = open(&peer, manual().base_delay(60_000));
    for n in 0..5 {
        a.create_item(format!("item {}", n), Placement::Tail).unwrap();
    }

    peer.fail_next_submits(1, 500);
    let err = a.sync_now().await.unwrap_err();
    assert!(matches!(err, SyncError::Transport(TransportError::Status(500))));
    assert_eq!(peer.len(), 0);

    let status = a.status();
    assert_eq!(status.phase, SyncPhase::Backoff);
    assert_eq!(status.retry_count, 1);
    assert_eq!(status.unacknowledged, 5);

    let report = a.sync_now().await.unwrap();
    assert_eq!(report.pushed, 5);
    assert_eq!(report.acknowledged, 5);
    assert_eq!(peer.len(), 5);
    assert_eq!(peer.submit_calls(), 2);

    let status = a.status();
    assert_eq!(status.phase, SyncPhase::Idle);
    assert_eq!(status.retry_count, 0);
    assert_eq!(status.unacknowledged, 0);
    assert!(status.last_error.is_none());
}

#[tokio::test]
async fn test_lost_ack_is_resubmitted_safely() {
    let peer = Arc::new(MemoryPeer::new());
    let (a, _) = open(&peer, manual().base_delay(60_000));
    for n in 0..3 {
        a.create_item(format!("item {}", n), Placement::Tail).unwrap();
    }

    peer.lose_next_submit_responses(1);
    assert!(a.sync_now().await.is_err());
    assert_eq!(peer.len(), 3);
    assert_eq!(a.status().unacknowledged, 3);

    a.sync_now().await.unwrap();
    assert_eq!(peer.len(), 3);
    assert_eq!(a.status().unacknowledged, 0);
    assert_eq!(a.items().len(), 3);
}

// ============================================================================
// Pull
// ============================================================================

#[tokio::test]
async fn test_paged_pull_advances_cursor() {
    let peer = Arc::new(MemoryPeer::new());
    peer.seed((0..310).map(remote_created));
    let (a, _) = open(&peer, manual().page_size(100));

    let report = a.sync_now().await.unwrap();
    assert_eq!(report.pages, 4);
    assert_eq!(report.pulled, 310);
    assert_eq!(report.cursor, 310);
    assert!(!report.page_cap_hit);
    assert_eq!(peer.fetch_calls(), 4);
    assert_eq!(a.engine().cursor(), 310);
    assert_eq!(a.items().len(), 310);
}

#[tokio::test]
async fn test_pull_stops_at_page_cap() {
    let peer = Arc::new(MemoryPeer::new());
    peer.seed((0..310).map(remote_created));
    let (a, _) = open(&peer, manual().page_size(100).max_pages(2));

    let report = a.sync_now().await.unwrap();
    assert!(report.page_cap_hit);
    assert_eq!(peer.fetch_calls(), 2);
    assert_eq!(report.cursor, 200);

    // The next cycle carries on from the cursor.
    let report = a.sync_now().await.unwrap();
    assert_eq!(report.cursor, 310);
    assert_eq!(a.items().len(), 310);
}

#[tokio::test]
async fn test_failed_pull_leaves_cursor() {
    let peer = Arc::new(MemoryPeer::new());
    peer.seed((0..150).map(remote_created));
    let (a, _) = open(&peer, manual().page_size(100).base_delay(60_000));

    peer.fail_next_fetches(1, 502);
    assert!(a.sync_now().await.is_err());
    assert_eq!(a.engine().cursor(), 0);
    assert!(a.items().is_empty());

    a.sync_now().await.unwrap();
    assert_eq!(a.engine().cursor(), 150);
}

#[tokio::test]
async fn test_duplicate_delivery_is_ignored() {
    let peer = Arc::new(MemoryPeer::new());
    peer.seed((0..3).map(remote_created));
    let (a, _) = open(&peer, manual());

    a.sync_now().await.unwrap();
    let merged = a
        .with_replica(|r| r.materializer_mut().merge_remote(peer.events()))
        .unwrap();
    assert_eq!(merged.appended, 0);
    assert_eq!(a.with_replica(|r| r.materializer().log().len()), 3);
}

// ============================================================================
// Single flight and resync
// ============================================================================

#[tokio::test]
async fn test_requests_during_sync_coalesce() {
    let peer = Arc::new(MemoryPeer::new());
    peer.set_latency(Some(Duration::from_millis(100)));
    let (a, _) = open(&peer, SyncConfigBuilder::new());

    a.create_item("first", Placement::Tail).unwrap();
    // Let the background cycle get into its push.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(a.status().phase, SyncPhase::Syncing);

    a.create_item("second", Placement::Tail).unwrap();
    a.create_item("third", Placement::Tail).unwrap();
    assert!(a.status().pending_resync);
    let report = a.sync_now().await.unwrap();
    assert!(report.coalesced);

    wait_for(&a, |s| {
        s.phase == SyncPhase::Idle && !s.pending_resync && s.unacknowledged == 0
    })
    .await;
    assert_eq!(peer.len(), 3);
    assert_eq!(peer.submit_calls(), 2);
}

// ============================================================================
// Backoff
// ============================================================================

#[tokio::test]
async fn test_background_retry_until_success() {
    let peer = Arc::new(MemoryPeer::new());
    let (a, _) = open(&peer, SyncConfigBuilder::new().base_delay(10).max_delay(40));
    let mut events = a.subscribe();

    peer.fail_next_submits(2, 503);
    a.create_item("eventually", Placement::Tail).unwrap();

    wait_for(&a, |s| s.phase == SyncPhase::Idle && s.unacknowledged == 0).await;
    assert_eq!(peer.len(), 1);
    assert_eq!(peer.submit_calls(), 3);
    assert_eq!(a.status().retry_count, 0);

    let mut delays = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let loam_sync::SyncEvent::RetryScheduled { delay_ms, .. } = event {
            delays.push(delay_ms);
        }
    }
    assert_eq!(delays, vec![10, 20]);
}

#[tokio::test]
async fn test_exhausted_retries_report_failing_then_recover() {
    let peer = Arc::new(MemoryPeer::new());
    let (a, _) = open(
        &peer,
        SyncConfigBuilder::new().base_delay(5).max_delay(20).max_retries(1),
    );

    peer.fail_next_submits(3, 500);
    a.create_item("stubborn", Placement::Tail).unwrap();

    wait_for(&a, |s| s.failing).await;
    assert!(a.status().last_error.is_some());

    wait_for(&a, |s| s.phase == SyncPhase::Idle && s.unacknowledged == 0).await;
    let status = a.status();
    assert!(!status.failing);
    assert!(status.last_error.is_none());
    assert_eq!(peer.len(), 1);
}

#[tokio::test]
async fn test_disabling_clears_retry() {
    let peer = Arc::new(MemoryPeer::new());
    let (a, _) = open(&peer, manual().base_delay(50));
    a.create_item("parked", Placement::Tail).unwrap();

    peer.fail_next_submits(1, 500);
    assert!(a.sync_now().await.is_err());
    assert_eq!(a.status().phase, SyncPhase::Backoff);

    a.set_enabled(false);
    let status = a.status();
    assert_eq!(status.phase, SyncPhase::Idle);
    assert_eq!(status.retry_count, 0);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(peer.submit_calls(), 1);

    a.set_enabled(true);
    a.sync_now().await.unwrap();
    assert_eq!(peer.len(), 1);
}

// ============================================================================
// Local faults
// ============================================================================

#[tokio::test]
async fn test_change_during_locally_failed_cycle_is_resynced() {
    let peer = Arc::new(MemoryPeer::new());
    peer.set_latency(Some(Duration::from_millis(100)));
    let storage = Arc::new(MemoryStorage::new());
    let a = Client::open(
        storage.clone(),
        Arc::new(ManualClock::new(1000)),
        peer.clone(),
        ClientConfig::default(),
    )
    .unwrap();

    a.create_item("first", Placement::Tail).unwrap();
    a.create_item("second", Placement::Tail).unwrap();
    assert!(a.status().pending_resync);

    // The first cycle cannot record its acks.
    storage.set_fail_writes(true);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(a.status().last_error.is_some());
    storage.set_fail_writes(false);

    wait_for(&a, |s| s.phase == SyncPhase::Idle && s.unacknowledged == 0 && !s.pending_resync).await;
    assert_eq!(peer.len(), 2);
    assert_eq!(peer.submit_calls(), 2);
}

// ============================================================================
// Connectivity
// ============================================================================

#[tokio::test]
async fn test_coming_online_triggers_sync() {
    let peer = Arc::new(MemoryPeer::new());
    let (a, _) = open(&peer, SyncConfigBuilder::new().online_debounce(10));

    a.set_online(false);
    a.create_item("offline edit", Placement::Tail).unwrap();
    assert!(a.status().pending_resync);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(peer.submit_calls(), 0);

    a.set_online(true);
    wait_for(&a, |s| s.phase == SyncPhase::Idle && s.unacknowledged == 0 && !s.pending_resync).await;
    assert_eq!(peer.len(), 1);
}

#[tokio::test]
async fn test_repeated_online_notice_keeps_pending_sync() {
    let peer = Arc::new(MemoryPeer::new());
    let (a, _) = open(&peer, SyncConfigBuilder::new().online_debounce(10));

    a.set_online(false);
    a.create_item("offline edit", Placement::Tail).unwrap();
    a.set_online(true);
    a.set_online(true);

    wait_for(&a, |s| s.phase == SyncPhase::Idle && s.unacknowledged == 0 && !s.pending_resync).await;
    tokio::time::timeout(Duration::from_secs(1), a.settled())
        .await
        .expect("settled should return once the edit is pushed");
    assert_eq!(peer.len(), 1);
    assert_eq!(peer.submit_calls(), 1);
}

#[tokio::test]
async fn test_coming_online_pulls_without_local_changes() {
    let peer = Arc::new(MemoryPeer::new());
    let (a, _) = open(&peer, SyncConfigBuilder::new().online_debounce(5));
    a.set_online(false);

    peer.seed((0..4).map(remote_created));
    a.set_online(true);
    wait_for(&a, |s| s.cursor == 4).await;
    assert_eq!(a.items().len(), 4);
}

// ============================================================================
// Convergence
// ============================================================================

#[tokio::test]
async fn test_replicas_converge_under_concurrent_edits() {
    let peer = Arc::new(MemoryPeer::new());
    let (a, clock_a) = open(&peer, manual());
    let (b, clock_b) = open(&peer, manual());
    let (c, clock_c) = open(&peer, manual());

    let x = a.create_item("shared", Placement::Tail).unwrap();
    let y = a.create_item("other", Placement::Tail).unwrap();
    a.sync_now().await.unwrap();
    b.sync_now().await.unwrap();
    c.sync_now().await.unwrap();

    clock_a.set(2000);
    a.set_text(&x, "from a").unwrap();
    clock_b.set(3000);
    b.set_text(&x, "from b").unwrap();
    clock_c.set(2500);
    c.toggle_completed(&x).unwrap();
    c.move_item(&y, Placement::Head).unwrap();
    clock_a.set(2600);
    a.delete_item(&y).unwrap();

    for _ in 0..2 {
        for client in [&a, &b, &c] {
            client.sync_now().await.unwrap();
        }
    }

    let items = a.items();
    assert_eq!(items, b.items());
    assert_eq!(items, c.items());
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].text, "from b");
    assert!(items[0].completed);
}

#[tokio::test]
async fn test_late_field_change_for_deleted_item_is_ignored() {
    let peer = Arc::new(MemoryPeer::new());
    let (a, clock_a) = open(&peer, manual());
    let (b, clock_b) = open(&peer, manual());

    let x = a.create_item("doomed", Placement::Tail).unwrap();
    a.sync_now().await.unwrap();
    b.sync_now().await.unwrap();

    clock_a.set(5000);
    a.delete_item(&x).unwrap();
    clock_b.set(6000);
    b.update_field(&x, FieldChange::Important(true)).unwrap();

    for client in [&a, &b, &a, &b] {
        client.sync_now().await.unwrap();
    }
    assert!(a.items().is_empty());
    assert!(b.items().is_empty());
}

// ============================================================================
// Compaction after sync
// ============================================================================

#[tokio::test]
async fn test_sync_compacts_acknowledged_history() {
    let peer = Arc::new(MemoryPeer::new());
    let compaction = CompactionConfig {
        min_events_for_compaction: 10,
        ..Default::default()
    };
    let (a, clock) = open_with(&peer, manual(), compaction);

    let mut ids = Vec::new();
    for n in 0..4 {
        ids.push(a.create_item(format!("item {}", n), Placement::Tail).unwrap());
    }
    for round in 0..3 {
        clock.advance(10);
        for id in &ids {
            a.set_text(id, format!("round {}", round)).unwrap();
        }
    }
    let before = a.items();

    let report = a.sync_now().await.unwrap();
    let compaction = report.compaction.expect("compaction should have run");
    assert_eq!(compaction.events_before, 16);
    assert_eq!(compaction.events_after, 4);
    assert_eq!(before, a.items());
    assert_eq!(a.engine().compaction_stats().runs, 1);

    // A fresh replica still converges from the peer's full history.
    let (b, _) = open(&peer, manual());
    b.sync_now().await.unwrap();
    assert_eq!(a.items(), b.items());

    // Edits after compaction still replicate.
    clock.advance(10);
    a.set_text(&ids[0], "after compaction").unwrap();
    a.sync_now().await.unwrap();
    b.sync_now().await.unwrap();
    assert_eq!(b.item(&ids[0]).unwrap().text, "after compaction");
}
