//! The replication engine.
//!
//! One engine serves one replica and one peer. A sync cycle pushes every
//! unacknowledged event in a single batch, applies the peer's acks, then
//! pulls pages of newer events until a short page or the page cap.
//!
//! ```text
//!            request / online / retry timer
//!   Idle ──────────────────────────────────▶ Syncing
//!    ▲                                          │
//!    │ success (resync if pending)              │ transport failure
//!    └──────────────────────────────────────────┤
//!    ▲                                          ▼
//!    └──────────────── retry timer ───────── Backoff
//! ```
//!
//! At most one cycle is in flight. A request that arrives while a cycle runs
//! only sets the pending-resync flag; the cycle's completion starts another
//! one. Local state is only ever touched under the replica lock and never
//! across an await.

use crate::backoff::Backoff;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::transport::SyncTransport;
use futures::Stream;
use loam_compaction::{CompactionConfig, CompactionReport, Compactor};
use loam_core::{EventId, Seq};
use loam_log::{Replica, StateChange, SyncCursor};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SyncPhase {
    Idle,
    Syncing,
    Backoff,
}

/// Observable replication state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub enabled: bool,
    pub online: bool,
    pub retry_count: u32,
    pub pending_resync: bool,
    /// Highest peer seq absorbed.
    pub cursor: Seq,
    /// Local events not yet acknowledged by the peer.
    pub unacknowledged: usize,
    pub last_error: Option<String>,
    /// Set once the retry budget is spent; cleared by the next success.
    pub failing: bool,
}

/// Notifications about replication progress.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncEvent {
    SyncStarted,
    Pushed { events: usize, acknowledged: usize },
    Pulled { pages: usize, events: usize, cursor: Seq },
    Compacted { before: usize, after: usize },
    SyncCompleted(SyncReport),
    SyncFailed { error: String, retry: u32 },
    RetryScheduled { retry: u32, delay_ms: u64 },
}

/// What one cycle did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pushed: usize,
    pub acknowledged: usize,
    pub pages: usize,
    /// New events appended from the peer.
    pub pulled: usize,
    /// Pushed-but-unacked events acknowledged by the pull instead.
    pub late_acks: usize,
    pub cursor: Seq,
    /// Pull stopped at the page cap with more pages possibly left.
    pub page_cap_hit: bool,
    pub compaction: Option<CompactionReport>,
    /// Another cycle was in flight; this request was folded into it.
    pub coalesced: bool,
}

struct Control {
    phase: SyncPhase,
    enabled: bool,
    online: bool,
    pending_resync: bool,
    retry_count: u32,
    last_error: Option<String>,
    retry_timer: Option<JoinHandle<()>>,
    debounce_timer: Option<JoinHandle<()>>,
}

impl Control {
    fn cancel_retry(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
    }

    fn cancel_debounce(&mut self) {
        if let Some(timer) = self.debounce_timer.take() {
            timer.abort();
        }
    }
}

struct Inner<T: SyncTransport> {
    replica: Arc<Mutex<Replica>>,
    cursor: Mutex<SyncCursor>,
    transport: Arc<T>,
    config: SyncConfig,
    backoff: Backoff,
    compactor: Mutex<Compactor>,
    control: Mutex<Control>,
    status: watch::Sender<SyncStatus>,
    events: broadcast::Sender<SyncEvent>,
    runtime: Handle,
}

/// Replication engine handle. Cheap to clone.
pub struct SyncEngine<T: SyncTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: SyncTransport> Clone for SyncEngine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: SyncTransport> SyncEngine<T> {
    /// Create an engine. Must be called from within a tokio runtime.
    pub fn new(
        replica: Arc<Mutex<Replica>>,
        cursor: SyncCursor,
        transport: Arc<T>,
        config: SyncConfig,
        compaction: CompactionConfig,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;

        let (replica_id, unacknowledged) = {
            let replica = replica.lock();
            (
                replica.replica_id().clone(),
                replica.materializer().log().unacknowledged_count(),
            )
        };
        let status = SyncStatus {
            phase: SyncPhase::Idle,
            enabled: config.enabled,
            online: true,
            retry_count: 0,
            pending_resync: false,
            cursor: cursor.get(),
            unacknowledged,
            last_error: None,
            failing: false,
        };
        let (status_tx, _) = watch::channel(status);
        let (events_tx, _) = broadcast::channel(256);

        Ok(Self {
            inner: Arc::new(Inner {
                replica,
                cursor: Mutex::new(cursor),
                transport,
                backoff: Backoff::from_config(&config),
                compactor: Mutex::new(Compactor::with_config(replica_id, compaction)),
                control: Mutex::new(Control {
                    phase: SyncPhase::Idle,
                    enabled: config.enabled,
                    online: true,
                    pending_resync: false,
                    retry_count: 0,
                    last_error: None,
                    retry_timer: None,
                    debounce_timer: None,
                }),
                config,
                status: status_tx,
                events: events_tx,
                runtime,
            }),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Sync events as a stream. Events missed by a slow reader are skipped.
    pub fn event_stream(&self) -> impl Stream<Item = SyncEvent> {
        futures::stream::unfold(self.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "sync event reader lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }

    pub fn cursor(&self) -> Seq {
        self.inner.cursor.lock().get()
    }

    pub fn compaction_stats(&self) -> loam_compaction::CompactionStats {
        self.inner.compactor.lock().stats().clone()
    }

    /// Ask for a sync in the background.
    ///
    /// Starts a cycle when idle, marks a resync when one is running, and
    /// leaves a scheduled retry alone. Offline, the request is remembered
    /// until connectivity returns.
    pub fn request_sync(&self) {
        self.inner.request();
    }

    /// Run a cycle now and wait for it.
    ///
    /// A pending retry timer is cancelled in favour of this attempt. If a cycle
    /// is already running, the request is coalesced into it and a report with
    /// `coalesced` set is returned immediately.
    pub async fn sync_now(&self) -> Result<SyncReport> {
        {
            let mut control = self.inner.control.lock();
            if !control.enabled {
                return Err(SyncError::Disabled);
            }
            if control.phase == SyncPhase::Syncing {
                control.pending_resync = true;
                self.inner.publish(&control);
                return Ok(SyncReport {
                    coalesced: true,
                    ..Default::default()
                });
            }
            control.cancel_retry();
            control.phase = SyncPhase::Syncing;
            self.inner.publish(&control);
        }
        Inner::cycle(&self.inner).await
    }

    /// Connectivity hook. Coming online triggers a cycle after the debounce.
    ///
    /// Repeated notifications for the state already held change nothing, so
    /// a debounce already counting down is left to fire.
    pub fn set_online(&self, online: bool) {
        let mut control = self.inner.control.lock();
        if control.online == online {
            return;
        }
        control.online = online;
        control.cancel_debounce();

        if online && control.enabled {
            let weak = Arc::downgrade(&self.inner);
            let debounce = std::time::Duration::from_millis(self.inner.config.online_debounce_ms);
            control.debounce_timer = Some(self.inner.runtime.spawn(async move {
                tokio::time::sleep(debounce).await;
                if let Some(inner) = weak.upgrade() {
                    tracing::debug!("back online, syncing");
                    inner.trigger_now();
                }
            }));
        }
        self.inner.publish(&control);
    }

    /// Turn replication on or off. Turning it off drops timers and counters;
    /// a cycle already in flight finishes but schedules nothing.
    pub fn set_enabled(&self, enabled: bool) {
        {
            let mut control = self.inner.control.lock();
            control.enabled = enabled;
            if !enabled {
                control.cancel_retry();
                control.cancel_debounce();
                control.retry_count = 0;
                control.pending_resync = false;
                control.last_error = None;
                if control.phase == SyncPhase::Backoff {
                    control.phase = SyncPhase::Idle;
                }
            }
            self.inner.publish(&control);
        }
        if enabled && self.inner.config.auto_sync {
            self.inner.request();
        }
    }

    /// Wait until no cycle is running or runnable.
    ///
    /// Backoff counts as settled, as does a resync held back while offline.
    pub async fn settled(&self) {
        let mut rx = self.watch_status();
        loop {
            {
                let status = rx.borrow_and_update();
                let queued = status.pending_resync && status.online;
                if status.phase != SyncPhase::Syncing && !queued {
                    return;
                }
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Materializer observer that requests a sync after local mutations.
    ///
    /// Holds the engine weakly, so registering it does not keep the engine
    /// alive through the replica it syncs.
    pub fn local_change_observer(&self) -> impl Fn(&StateChange) + Send + Sync + 'static {
        let weak = Arc::downgrade(&self.inner);
        move |change: &StateChange| {
            if !change.origin.is_authored_here() {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                // Called under the replica lock: take counts from the change.
                inner.status.send_modify(|status| status.unacknowledged = change.unacknowledged);
                if inner.config.auto_sync {
                    inner.request();
                }
            }
        }
    }
}

impl<T: SyncTransport> Inner<T> {
    fn request(self: &Arc<Self>) {
        let mut control = self.control.lock();
        if !control.enabled {
            return;
        }
        match control.phase {
            SyncPhase::Syncing => control.pending_resync = true,
            SyncPhase::Backoff => {}
            SyncPhase::Idle if !control.online => control.pending_resync = true,
            SyncPhase::Idle => self.spawn_cycle(&mut control),
        }
        self.publish(&control);
    }

    /// Start a cycle unless one is running, cutting any backoff short.
    fn trigger_now(self: &Arc<Self>) {
        let mut control = self.control.lock();
        control.debounce_timer = None;
        if !control.enabled {
            return;
        }
        match control.phase {
            SyncPhase::Syncing => control.pending_resync = true,
            SyncPhase::Idle | SyncPhase::Backoff => {
                control.cancel_retry();
                self.spawn_cycle(&mut control);
            }
        }
        self.publish(&control);
    }

    /// Fired by the retry timer.
    fn retry(self: &Arc<Self>) {
        let mut control = self.control.lock();
        control.retry_timer = None;
        if control.enabled && control.phase == SyncPhase::Backoff {
            self.spawn_cycle(&mut control);
            self.publish(&control);
        }
    }

    fn spawn_cycle(self: &Arc<Self>, control: &mut Control) {
        control.phase = SyncPhase::Syncing;
        control.pending_resync = false;
        let inner = self.clone();
        self.runtime.spawn(async move {
            let _ = Inner::cycle(&inner).await;
        });
    }

    /// Run one cycle and settle the state machine. Caller has set `Syncing`.
    async fn cycle(self: &Arc<Self>) -> Result<SyncReport> {
        let _ = self.events.send(SyncEvent::SyncStarted);
        let result = self.run().await;
        self.finish(&result);
        result
    }

    async fn run(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        self.push(&mut report).await?;
        self.pull(&mut report).await?;
        report.compaction = self.maybe_compact();
        self.publish_counts();
        Ok(report)
    }

    async fn push(&self, report: &mut SyncReport) -> Result<()> {
        let batch = self.replica.lock().materializer().log().unacknowledged();
        if batch.is_empty() {
            return Ok(());
        }

        let sent: HashSet<EventId> = batch.iter().map(|e| e.id.clone()).collect();
        report.pushed = batch.len();
        let response = self.transport.submit(batch).await?;

        let acks: HashMap<EventId, Seq> = response
            .into_iter()
            .filter(|e| sent.contains(&e.id))
            .filter_map(|e| e.seq.map(|seq| (e.id, seq)))
            .collect();
        if acks.len() < sent.len() {
            tracing::warn!(sent = sent.len(), acked = acks.len(), "peer acknowledged part of the batch");
        }

        report.acknowledged = self.replica.lock().materializer_mut().acknowledge(&acks)?;
        tracing::debug!(events = report.pushed, acknowledged = report.acknowledged, "pushed");
        let _ = self.events.send(SyncEvent::Pushed {
            events: report.pushed,
            acknowledged: report.acknowledged,
        });
        self.publish_counts();
        Ok(())
    }

    async fn pull(&self, report: &mut SyncReport) -> Result<()> {
        let page_size = self.config.page_size.max(1);
        loop {
            if report.pages >= self.config.max_pages {
                report.page_cap_hit = true;
                tracing::warn!(pages = report.pages, "pull stopped at page cap");
                break;
            }

            let since = self.cursor.lock().get();
            let page = self.transport.fetch(since, page_size).await?;
            report.pages += 1;
            let full = page.len() >= page_size;
            if page.is_empty() {
                break;
            }

            let outcome = self.replica.lock().materializer_mut().merge_remote(page)?;
            report.pulled += outcome.appended;
            report.late_acks += outcome.acknowledged;
            if let Some(max) = outcome.max_seq {
                self.cursor.lock().advance(max)?;
            }
            tracing::trace!(cursor = self.cursor.lock().get(), appended = outcome.appended, "pulled page");

            if !full {
                break;
            }
        }

        report.cursor = self.cursor.lock().get();
        if report.pulled > 0 || report.late_acks > 0 {
            tracing::debug!(events = report.pulled, cursor = report.cursor, "pulled");
        }
        let _ = self.events.send(SyncEvent::Pulled {
            pages: report.pages,
            events: report.pulled,
            cursor: report.cursor,
        });
        Ok(())
    }

    /// Compact through the cursor when the log has grown enough.
    ///
    /// A failed compaction only costs space, so it is logged and skipped.
    fn maybe_compact(&self) -> Option<CompactionReport> {
        let horizon = self.cursor.lock().get();
        let mut replica = self.replica.lock();
        let mut compactor = self.compactor.lock();
        if !compactor.should_compact(replica.materializer()) {
            return None;
        }

        match compactor.compact_through(replica.materializer_mut(), horizon) {
            Ok(report) if !report.is_noop() => {
                let _ = self.events.send(SyncEvent::Compacted {
                    before: report.events_before,
                    after: report.events_after,
                });
                Some(report)
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "automatic compaction skipped");
                None
            }
        }
    }

    fn finish(self: &Arc<Self>, result: &Result<SyncReport>) {
        let mut control = self.control.lock();
        match result {
            Ok(report) => {
                control.retry_count = 0;
                control.last_error = None;
                control.cancel_retry();
                control.phase = SyncPhase::Idle;
                tracing::debug!(pushed = report.pushed, pulled = report.pulled, "sync completed");
                let _ = self.events.send(SyncEvent::SyncCompleted(report.clone()));

                if control.pending_resync && control.enabled && control.online {
                    self.spawn_cycle(&mut control);
                }
            }
            Err(e) => {
                control.last_error = Some(e.to_string());

                if e.is_retryable() && control.enabled {
                    // The retry pushes everything unacknowledged anyway.
                    control.pending_resync = false;
                    control.retry_count = control.retry_count.saturating_add(1);
                    let retry = control.retry_count;
                    let delay = self.backoff.delay(retry);
                    control.phase = SyncPhase::Backoff;
                    let _ = self.events.send(SyncEvent::SyncFailed {
                        error: e.to_string(),
                        retry,
                    });

                    if self.backoff.is_exhausted(retry) {
                        tracing::error!(error = %e, retry, "sync failing, retrying at max interval");
                    } else {
                        tracing::warn!(error = %e, retry, delay_ms = delay.as_millis() as u64, "sync failed, backing off");
                    }

                    control.cancel_retry();
                    let weak = Arc::downgrade(self);
                    control.retry_timer = Some(self.runtime.spawn(async move {
                        tokio::time::sleep(delay).await;
                        if let Some(inner) = weak.upgrade() {
                            inner.retry();
                        }
                    }));
                    let _ = self.events.send(SyncEvent::RetryScheduled {
                        retry,
                        delay_ms: delay.as_millis() as u64,
                    });
                } else {
                    control.phase = SyncPhase::Idle;
                    if control.enabled {
                        tracing::error!(error = %e, "sync failed on a local fault");
                    }
                    let _ = self.events.send(SyncEvent::SyncFailed {
                        error: e.to_string(),
                        retry: control.retry_count,
                    });

                    // A change that arrived mid-cycle still needs its own push.
                    if control.pending_resync && control.enabled && control.online {
                        tracing::debug!("change arrived during failed cycle, resyncing");
                        self.spawn_cycle(&mut control);
                    }
                }
            }
        }
        self.publish(&control);
        drop(control);
        self.publish_counts();
    }

    /// Push control-derived fields to the status channel.
    fn publish(&self, control: &Control) {
        let failing = self.backoff.is_exhausted(control.retry_count);
        self.status.send_modify(|status| {
            status.phase = control.phase;
            status.enabled = control.enabled;
            status.online = control.online;
            status.retry_count = control.retry_count;
            status.pending_resync = control.pending_resync;
            status.last_error = control.last_error.clone();
            status.failing = failing;
        });
    }

    /// Push log-derived fields. Never called with the control lock held.
    fn publish_counts(&self) {
        let unacknowledged = self.replica.lock().materializer().log().unacknowledged_count();
        let cursor = self.cursor.lock().get();
        self.status.send_modify(|status| {
            status.unacknowledged = unacknowledged;
            status.cursor = cursor;
        });
    }
}

impl<T: SyncTransport> Drop for Inner<T> {
    fn drop(&mut self) {
        let control = self.control.get_mut();
        control.cancel_retry();
        control.cancel_debounce();
    }
}
