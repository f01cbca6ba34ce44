/// The relay manager: one handle over projector, selection, sync and propagation.
///
/// `start()` spawns the listeners into a single cancellable scope; `stop()`
/// tears the whole scope down. Both are idempotent. Selection and sync
/// operations work whether or not the listeners run, but the projected
/// views (and therefore sync) only resolve while started.
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::candidate::RelayCandidate;
use crate::config::RelayManagerConfig;
use crate::metrics::{MetricsSnapshot, RelayMetrics};
use crate::ports::{AnnounceRepository, ContactStore, NetworkTransport, SettingsStore};
use crate::projector::{
    run_available_relays, run_projector, AvailableRelaysState, RelayInfo, RelayState,
};
use crate::propagator::run_propagator;
use crate::selection::{
    run_announce_listener, SelectionEngine, SelectionMode, SelectionOutcome,
};
use crate::sync::{SyncOrchestrator, SyncResult, SyncStatus};
use crate::types::NodeId;

/// The external collaborators a manager is wired to.
#[derive(Clone)]
pub struct Collaborators {
    pub announces: Arc<dyn AnnounceRepository>,
    pub contacts: Arc<dyn ContactStore>,
    pub settings: Arc<dyn SettingsStore>,
    pub transport: Arc<dyn NetworkTransport>,
}

/// Listeners of one started session.
struct Scope {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Scope {
    fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            task.abort();
        }
    }
}

struct Inner {
    collaborators: Collaborators,
    engine: Arc<SelectionEngine>,
    sync: SyncOrchestrator,
    relay_state: watch::Sender<RelayState>,
    current_relay: watch::Sender<Option<RelayInfo>>,
    available: watch::Sender<AvailableRelaysState>,
    sync_status: watch::Sender<SyncStatus>,
    results: broadcast::Sender<SyncResult>,
    metrics: Arc<RelayMetrics>,
    scope: Mutex<Option<Scope>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(scope) = self
            .scope
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            scope.shutdown();
        }
    }
}

/// Cheap to clone; all clones share the same state and listeners.
#[derive(Clone)]
pub struct RelayManager {
    inner: Arc<Inner>,
}

impl RelayManager {
    pub fn new(collaborators: Collaborators, config: RelayManagerConfig) -> Self {
        let metrics = Arc::new(RelayMetrics::default());
        let (relay_state, relay_state_rx) = watch::channel(RelayState::Loading);
        let (current_relay, _) = watch::channel(None);
        let (available, _) = watch::channel(AvailableRelaysState::Loading);
        let (sync_status, _) = watch::channel(SyncStatus::Idle);
        let (results, _) = broadcast::channel(config.event_buffer);

        let engine = Arc::new(SelectionEngine::new(
            collaborators.contacts.clone(),
            collaborators.settings.clone(),
            collaborators.announces.clone(),
            metrics.clone(),
        ));
        let sync = SyncOrchestrator::new(
            collaborators.transport.clone(),
            collaborators.settings.clone(),
            relay_state_rx,
            sync_status.clone(),
            results.clone(),
            metrics.clone(),
            config.sync_timeout,
            config.complete_display,
        );

        Self {
            inner: Arc::new(Inner {
                collaborators,
                engine,
                sync,
                relay_state,
                current_relay,
                available,
                sync_status,
                results,
                metrics,
                scope: Mutex::new(None),
            }),
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    /// Spawn all listeners. Needs a Tokio runtime; without one this logs and returns.
    pub fn start(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                "relay manager start() called outside a tokio runtime, ignoring"
            );
            return;
        };
        let mut scope = self.inner.scope.lock().unwrap_or_else(|e| e.into_inner());
        if scope.is_some() {
            tracing::debug!("relay manager already started");
            return;
        }

        let inner = &self.inner;
        let c = &inner.collaborators;
        let cancel = CancellationToken::new();

        inner.relay_state.send_replace(RelayState::Loading);
        inner.available.send_replace(AvailableRelaysState::Loading);
        inner.sync.begin_session(cancel.clone());

        // Subscribe before spawning so announces arriving during startup are kept.
        let announce_rx = c.announces.announces();

        let mut tasks = Vec::with_capacity(6);
        tasks.push(runtime.spawn(run_projector(
            c.contacts.clone(),
            c.announces.clone(),
            inner.relay_state.clone(),
            inner.current_relay.clone(),
            cancel.clone(),
        )));
        tasks.push(runtime.spawn(run_available_relays(
            c.announces.clone(),
            inner.available.clone(),
            cancel.clone(),
        )));
        tasks.push(runtime.spawn(run_propagator(
            c.transport.clone(),
            inner.relay_state.subscribe(),
            inner.metrics.clone(),
            cancel.clone(),
        )));
        tasks.push(runtime.spawn(run_announce_listener(
            inner.engine.clone(),
            announce_rx,
            cancel.clone(),
        )));
        tasks.push(runtime.spawn(run_periodic_sync(
            Arc::downgrade(inner),
            c.settings.watch_sync_interval(),
            cancel.clone(),
        )));

        let engine = inner.engine.clone();
        let scan_cancel = cancel.clone();
        tasks.push(runtime.spawn(async move {
            tokio::select! {
                _ = scan_cancel.cancelled() => {}
                outcome = engine.scan_candidates() => {
                    tracing::debug!(?outcome, "startup candidate scan finished");
                }
            }
        }));

        *scope = Some(Scope { cancel, tasks });
        tracing::info!("relay manager started");
    }

    /// Cancel every listener and drop local sync bookkeeping.
    ///
    /// A transport request already dispatched is not cancelled.
    pub fn stop(&self) {
        let scope = self
            .inner
            .scope
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(scope) = scope else {
            return;
        };
        scope.shutdown();
        self.inner.sync.reset_local();
        tracing::info!("relay manager stopped");
    }

    pub fn is_started(&self) -> bool {
        self.inner
            .scope
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    // ── Observed state ────────────────────────────────────────────────

    pub fn current_relay(&self) -> watch::Receiver<Option<RelayInfo>> {
        self.inner.current_relay.subscribe()
    }

    pub fn relay_state(&self) -> watch::Receiver<RelayState> {
        self.inner.relay_state.subscribe()
    }

    pub fn available_relays(&self) -> watch::Receiver<AvailableRelaysState> {
        self.inner.available.subscribe()
    }

    pub fn sync_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.sync_status.subscribe()
    }

    pub fn sync_results(&self) -> broadcast::Receiver<SyncResult> {
        self.inner.results.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.sync.is_syncing()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Persisted selection mode, `None` if the settings store cannot be read.
    pub async fn selection_mode(&self) -> Option<SelectionMode> {
        match self.inner.engine.mode().await {
            Ok(mode) => Some(mode),
            Err(e) => {
                tracing::warn!("failed to read selection mode: {e}");
                None
            }
        }
    }

    // ── Selection ─────────────────────────────────────────────────────

    /// Switch to auto mode and adopt the closest known propagation node.
    ///
    /// With no propagation node known, the current relay is left in place
    /// and `NoCandidate` is returned.
    pub async fn enable_auto_select(&self) -> SelectionOutcome {
        self.inner.engine.enable_auto_select().await
    }

    /// Pin `node_id` as relay, using announce data when the node is known.
    pub async fn set_manual_relay(
        &self,
        node_id: NodeId,
        display_name: Option<&str>,
    ) -> SelectionOutcome {
        self.inner
            .engine
            .set_manual_relay(node_id, display_name)
            .await
    }

    /// Pin a relay known only by its identifier.
    pub async fn set_manual_relay_by_hash(
        &self,
        node_id: NodeId,
        nickname: Option<&str>,
    ) -> SelectionOutcome {
        self.inner
            .engine
            .set_manual_relay_by_hash(node_id, nickname)
            .await
    }

    pub async fn clear_relay(&self) -> SelectionOutcome {
        self.inner.engine.clear_relay().await
    }

    /// The user deleted the relay contact.
    pub async fn on_relay_deleted(
        &self,
        auto_select_new: bool,
        exclude: Option<NodeId>,
    ) -> SelectionOutcome {
        self.inner
            .engine
            .on_relay_deleted(auto_select_new, exclude)
            .await
    }

    /// Apply a propagation-node announce directly, bypassing the listener.
    pub async fn on_propagation_node_announce(
        &self,
        candidate: &RelayCandidate,
    ) -> SelectionOutcome {
        self.inner
            .engine
            .on_propagation_node_announce(candidate)
            .await
    }

    /// Run the auto rule against the best currently announced node.
    pub async fn select_best_candidate(&self) -> SelectionOutcome {
        self.inner.engine.scan_candidates().await
    }

    // ── Sync ──────────────────────────────────────────────────────────

    /// User-initiated sync. Runs even when the network is not reported ready.
    ///
    /// `None` when coalesced into a sync already in flight.
    pub async fn trigger_sync(&self) -> Option<SyncResult> {
        self.inner.sync.trigger_sync().await
    }

    /// Background sync entry point.
    ///
    /// Skipped (`None`) while the network is not ready. With no relay and
    /// auto-select on, tries to select one instead and returns `None` if that
    /// worked; the sync itself happens on a later call.
    pub async fn sync_with_propagation_node(&self) -> Option<SyncResult> {
        self.inner.sync_with_propagation_node().await
    }
}

impl Inner {
    async fn sync_with_propagation_node(&self) -> Option<SyncResult> {
        let status = self
            .collaborators
            .transport
            .network_status()
            .borrow()
            .clone();
        if !status.is_ready() {
            self.metrics.syncs_skipped_not_ready.inc();
            tracing::debug!(?status, "network not ready, skipping sync");
            return None;
        }

        if let Ok(None) = self.sync.resolved_relay().await {
            let auto = match self.collaborators.settings.auto_select_enabled().await {
                Ok(auto) => auto,
                Err(e) => {
                    tracing::warn!("failed to read auto-select setting: {e}");
                    false
                }
            };
            if auto {
                match self.engine.scan_candidates().await {
                    SelectionOutcome::Adopted { node_id } => {
                        tracing::info!(
                            relay = %node_id,
                            "relay selected before sync, syncing on next call",
                        );
                        return None;
                    }
                    outcome => tracing::debug!(?outcome, "no relay selected before sync"),
                }
            }
        }

        self.sync.trigger_sync().await
    }
}

/// Call `sync_with_propagation_node` every `sync_interval`. Zero disables.
///
/// The first tick of each timer is skipped. An interval change restarts it.
async fn run_periodic_sync(
    inner: Weak<Inner>,
    mut interval_rx: watch::Receiver<Duration>,
    cancel: CancellationToken,
) {
    let mut settings_open = true;

    loop {
        let period = *interval_rx.borrow_and_update();

        if period.is_zero() {
            if !settings_open {
                return;
            }
            tracing::debug!("periodic sync disabled");
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = interval_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            continue;
        }

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        tracing::debug!(?period, "periodic sync scheduled");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = interval_rx.changed(), if settings_open => {
                    if changed.is_err() {
                        settings_open = false;
                        continue;
                    }
                    break;
                }
                _ = ticker.tick() => {
                    let Some(inner) = inner.upgrade() else {
                        return;
                    };
                    if let Some(result) = inner.sync_with_propagation_node().await {
                        tracing::debug!(?result, "periodic sync finished");
                    }
                }
            }
        }
    }
}
