//! High-level client: a replica wired to a replication engine.

use crate::config::SyncConfig;
use crate::engine::{SyncEngine, SyncEvent, SyncReport, SyncStatus};
use crate::error::Result;
use crate::transport::SyncTransport;
use loam_compaction::CompactionConfig;
use loam_core::{Clock, FieldChange, Item, ItemId, ReplicaId, Storage};
use loam_log::{Placement, Replica, SubscriptionId, SyncCursor};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Configuration for a [`Client`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub sync: SyncConfig,
    pub compaction: CompactionConfig,
}

impl ClientConfig {
    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// A local-first replica that keeps itself in sync with a peer.
///
/// # Example
///
/// ```rust
/// use loam_core::{ManualClock, MemoryStorage};
/// use loam_log::Placement;
/// use loam_sync::{Client, ClientConfig, MemoryPeer};
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let peer = Arc::new(MemoryPeer::new());
/// let client = Client::open(
///     Arc::new(MemoryStorage::new()),
///     Arc::new(ManualClock::new(1000)),
///     peer.clone(),
///     ClientConfig::default(),
/// )
/// .unwrap();
///
/// // Local edits are pushed in the background.
/// client.create_item("Hello", Placement::Tail).unwrap();
/// client.settled().await;
/// assert_eq!(peer.len(), 1);
/// # });
/// ```
pub struct Client<T: SyncTransport> {
    replica: Arc<Mutex<Replica>>,
    engine: SyncEngine<T>,
    subscription: SubscriptionId,
}

impl<T: SyncTransport> Client<T> {
    /// Open the replica in `storage` and attach a replication engine.
    ///
    /// Events left unacknowledged by a previous session are scheduled for
    /// push straight away when auto-sync is on.
    pub fn open(
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        transport: Arc<T>,
        config: ClientConfig,
    ) -> Result<Self> {
        let replica = Replica::open(storage.clone(), clock)?;
        let cursor = SyncCursor::open(storage)?;
        let replica = Arc::new(Mutex::new(replica));

        let engine = SyncEngine::new(
            replica.clone(),
            cursor,
            transport,
            config.sync,
            config.compaction,
        )?;
        let subscription = replica
            .lock()
            .materializer_mut()
            .subscribe(engine.local_change_observer());

        let leftover = replica.lock().materializer().log().unacknowledged_count();
        if leftover > 0 && engine.config().auto_sync {
            tracing::debug!(events = leftover, "unacknowledged events from last session");
            engine.request_sync();
        }

        Ok(Self {
            replica,
            engine,
            subscription,
        })
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica.lock().replica_id().clone()
    }

    pub fn engine(&self) -> &SyncEngine<T> {
        &self.engine
    }

    /// Run `f` against the replica. Do not await inside.
    pub fn with_replica<R>(&self, f: impl FnOnce(&mut Replica) -> R) -> R {
        f(&mut self.replica.lock())
    }

    pub fn items(&self) -> Arc<Vec<Item>> {
        self.replica.lock().items()
    }

    pub fn item(&self, id: &ItemId) -> Option<Item> {
        self.replica.lock().item(id)
    }

    pub fn create_item(&self, text: impl Into<String>, placement: Placement) -> Result<ItemId> {
        Ok(self.replica.lock().create_item(text, placement)?)
    }

    pub fn create_section(
        &self,
        text: impl Into<String>,
        level: u8,
        placement: Placement,
    ) -> Result<ItemId> {
        Ok(self.replica.lock().create_section(text, level, placement)?)
    }

    pub fn update_field(&self, id: &ItemId, change: FieldChange) -> Result<()> {
        Ok(self.replica.lock().update_field(id, change)?)
    }

    pub fn set_text(&self, id: &ItemId, text: impl Into<String>) -> Result<()> {
        Ok(self.replica.lock().set_text(id, text)?)
    }

    pub fn toggle_completed(&self, id: &ItemId) -> Result<bool> {
        Ok(self.replica.lock().toggle_completed(id)?)
    }

    pub fn toggle_archived(&self, id: &ItemId) -> Result<bool> {
        Ok(self.replica.lock().toggle_archived(id)?)
    }

    pub fn move_item(&self, id: &ItemId, placement: Placement) -> Result<()> {
        Ok(self.replica.lock().move_item(id, placement)?)
    }

    pub fn delete_item(&self, id: &ItemId) -> Result<()> {
        Ok(self.replica.lock().delete_item(id)?)
    }

    pub async fn sync_now(&self) -> Result<SyncReport> {
        self.engine.sync_now().await
    }

    pub fn request_sync(&self) {
        self.engine.request_sync();
    }

    pub fn set_online(&self, online: bool) {
        self.engine.set_online(online);
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.engine.set_enabled(enabled);
    }

    pub fn status(&self) -> SyncStatus {
        self.engine.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.engine.watch_status()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.engine.subscribe()
    }

    /// Wait for background syncing to come to rest.
    pub async fn settled(&self) {
        self.engine.settled().await
    }
}

impl<T: SyncTransport> Drop for Client<T> {
    fn drop(&mut self) {
        self.replica
            .lock()
            .materializer_mut()
            .unsubscribe(self.subscription);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SyncPhase;
    use crate::memory::MemoryPeer;
    use crate::config::SyncConfigBuilder;
    use loam_core::{ManualClock, MemoryStorage};

    fn manual_config() -> ClientConfig {
        ClientConfig {
            sync: SyncConfigBuilder::new().auto_sync(false).build(),
            ..Default::default()
        }
    }

    fn client(peer: &Arc<MemoryPeer>, config: ClientConfig) -> Client<MemoryPeer> {
        Client::open(
            Arc::new(MemoryStorage::new()),
            Arc::new(ManualClock::new(1000)),
            peer.clone(),
            config,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_manual_sync_round_trip() {
        let peer = Arc::new(MemoryPeer::new());
        let a = client(&peer, manual_config());
        let b = client(&peer, manual_config());

        let id = a.create_item("from a", Placement::Tail).unwrap();
        let report = a.sync_now().await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(report.acknowledged, 1);
        assert_eq!(a.status().unacknowledged, 0);

        let report = b.sync_now().await.unwrap();
        assert_eq!(report.pulled, 1);
        assert_eq!(b.item(&id).unwrap().text, "from a");
        assert_eq!(b.status().cursor, 1);
    }

    #[tokio::test]
    async fn test_auto_sync_after_local_change() {
        let peer = Arc::new(MemoryPeer::new());
        let a = client(&peer, ClientConfig::default());

        a.create_item("pushed in background", Placement::Tail).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), a.settled())
            .await
            .unwrap();

        assert_eq!(peer.len(), 1);
        assert_eq!(a.status().phase, SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_disabled_client_does_not_sync() {
        let peer = Arc::new(MemoryPeer::new());
        let a = client(&peer, manual_config());
        a.set_enabled(false);

        a.create_item("local only", Placement::Tail).unwrap();
        assert!(matches!(a.sync_now().await, Err(crate::SyncError::Disabled)));
        assert_eq!(peer.submit_calls(), 0);
    }

    #[test]
    fn test_client_config_from_json() {
        let config = ClientConfig::from_json(
            r#"{"sync": {"page_size": 20}, "compaction": {"auto_compact": false}}"#,
        )
        .unwrap();
        assert_eq!(config.sync.page_size, 20);
        assert!(!config.compaction.auto_compact);
        assert_eq!(config.compaction.min_events_for_compaction, 500);
    }

    #[test]
    fn test_open_requires_runtime() {
        let peer = Arc::new(MemoryPeer::new());
        let result = Client::open(
            Arc::new(MemoryStorage::new()),
            Arc::new(ManualClock::new(1000)),
            peer,
            ClientConfig::default(),
        );
        assert!(matches!(result, Err(crate::SyncError::NoRuntime)));
    }
}
