/// Sync orchestration with the current propagation node.
///
/// One sync at a time: a second request while one is in flight is
/// coalesced into it (no transport call, no result). The wait for the
/// transport's terminal phase is bounded by `sync_timeout`.
///
/// Per attempt: Idle -> Starting -> InProgress -> outcome -> Idle, with a
/// short-lived Complete status after a sync that received messages.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::metrics::RelayMetrics;
use crate::ports::{NetworkTransport, SettingsStore, SyncPhase, SyncState};
use crate::projector::{RelayInfo, RelayState};
use crate::types::now_ms;

// ── Outcomes ──────────────────────────────────────────────────────────

/// Outcome of a sync attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SyncResult {
    Success { messages_received: u32 },
    Error { message: String },
    /// No relay configured; the network was not contacted.
    NoRelay,
    /// Request dispatched but no terminal phase arrived in time.
    /// Messages may still be delivered later.
    Pending,
}

/// What a UI shows for the sync button.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncStatus {
    Idle,
    Starting,
    InProgress { phase: SyncPhase, progress: f32 },
    Complete { messages_received: u32 },
}

// ── In-flight guard ───────────────────────────────────────────────────

/// The single mutual-exclusion slot. Holds the id of the running attempt.
#[derive(Default)]
struct InFlight {
    slot: Mutex<Option<u64>>,
    next_id: AtomicU64,
}

impl InFlight {
    fn try_acquire(self: &Arc<Self>) -> Option<SyncGuard> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        *slot = Some(id);
        Some(SyncGuard {
            in_flight: Arc::clone(self),
            id,
        })
    }

    fn is_busy(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn reset(&self) {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Releases the slot on drop, including on panic or cancellation.
struct SyncGuard {
    in_flight: Arc<InFlight>,
    id: u64,
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        let mut slot = self
            .in_flight
            .slot
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        // A stop() may have reset the slot and a newer attempt taken it.
        if *slot == Some(self.id) {
            *slot = None;
        }
    }
}

// ── Orchestrator ──────────────────────────────────────────────────────

pub(crate) struct SyncOrchestrator {
    transport: Arc<dyn NetworkTransport>,
    settings: Arc<dyn SettingsStore>,
    relay_state: watch::Receiver<RelayState>,
    status_tx: watch::Sender<SyncStatus>,
    results_tx: broadcast::Sender<SyncResult>,
    in_flight: Arc<InFlight>,
    session: Mutex<CancellationToken>,
    metrics: Arc<RelayMetrics>,
    sync_timeout: Duration,
    complete_display: Duration,
}

impl SyncOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        transport: Arc<dyn NetworkTransport>,
        settings: Arc<dyn SettingsStore>,
        relay_state: watch::Receiver<RelayState>,
        status_tx: watch::Sender<SyncStatus>,
        results_tx: broadcast::Sender<SyncResult>,
        metrics: Arc<RelayMetrics>,
        sync_timeout: Duration,
        complete_display: Duration,
    ) -> Self {
        // No session until the first start().
        let session = CancellationToken::new();
        session.cancel();
        Self {
            transport,
            settings,
            relay_state,
            status_tx,
            results_tx,
            in_flight: Arc::new(InFlight::default()),
            session: Mutex::new(session),
            metrics,
            sync_timeout,
            complete_display,
        }
    }

    /// Bind waits to a new manager session (called by `start()`).
    pub(crate) fn begin_session(&self, token: CancellationToken) {
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = token;
    }

    /// Drop local bookkeeping of an in-flight sync (called by `stop()`).
    ///
    /// The transport call itself is not cancelled.
    pub(crate) fn reset_local(&self) {
        self.in_flight.reset();
        self.status_tx.send_replace(SyncStatus::Idle);
    }

    pub(crate) fn is_syncing(&self) -> bool {
        self.in_flight.is_busy()
    }

    fn session(&self) -> CancellationToken {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Wait until the projector resolved the relay, then return it.
    ///
    /// `Err` when the manager is not running or the state never resolves
    /// within the sync timeout.
    pub(crate) async fn resolved_relay(&self) -> Result<Option<RelayInfo>, String> {
        let cancel = self.session();
        if cancel.is_cancelled() {
            return Err(crate::RelayError::Stopped.to_string());
        }
        let mut state_rx = self.relay_state.clone();
        let resolved = tokio::select! {
            _ = cancel.cancelled() => Err(crate::RelayError::Stopped.to_string()),
            waited = tokio::time::timeout(
                self.sync_timeout,
                state_rx.wait_for(RelayState::is_loaded),
            ) => match waited {
                Ok(Ok(state)) => Ok(state.relay().cloned()),
                Ok(Err(_)) => Err("relay state unavailable".to_string()),
                Err(_) => Err("relay state not resolved in time".to_string()),
            },
        };
        resolved
    }

    /// User-initiated sync. Does not look at network readiness.
    ///
    /// Returns `None` when coalesced into a sync already in flight.
    pub(crate) async fn trigger_sync(&self) -> Option<SyncResult> {
        let cancel = self.session();
        if cancel.is_cancelled() {
            return Some(self.finish(SyncResult::Error {
                message: crate::RelayError::Stopped.to_string(),
            }));
        }

        let relay = match self.resolved_relay().await {
            Ok(Some(relay)) => relay,
            Ok(None) => {
                tracing::debug!("sync requested without a relay");
                return Some(self.finish(SyncResult::NoRelay));
            }
            Err(message) => return Some(self.finish(SyncResult::Error { message })),
        };

        let Some(_guard) = self.in_flight.try_acquire() else {
            self.metrics.syncs_coalesced.inc();
            tracing::debug!("sync already in progress, coalescing");
            return None;
        };

        let attempt = uuid::Uuid::new_v4();
        let span = tracing::info_span!("relay_sync", %attempt, relay = %relay.node_id);
        let result = self.run_attempt(&cancel).instrument(span).await;
        Some(result)
    }

    async fn run_attempt(&self, cancel: &CancellationToken) -> SyncResult {
        self.metrics.syncs_started.inc();
        self.status_tx.send_replace(SyncStatus::Starting);

        // Subscribe before dispatch so a fast completion is not missed.
        let mut progress = self.transport.sync_progress();

        let result = tokio::select! {
            _ = cancel.cancelled() => SyncResult::Error {
                message: "sync cancelled: relay manager stopped".to_string(),
            },
            outcome = tokio::time::timeout(self.sync_timeout, self.transfer(&mut progress)) => {
                match outcome {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!(
                            timeout = ?self.sync_timeout,
                            "no sync completion before timeout",
                        );
                        SyncResult::Pending
                    }
                }
            }
        };

        if let SyncResult::Success { messages_received } = result {
            if let Err(e) = self.settings.set_last_sync_timestamp(now_ms()).await {
                tracing::warn!("failed to persist last sync time: {e}");
            }
            self.metrics.syncs_succeeded.inc();
            self.metrics.messages_received.inc_by(u64::from(messages_received));
            tracing::info!(messages_received, "sync complete");
        } else {
            match &result {
                SyncResult::Pending => self.metrics.syncs_pending.inc(),
                _ => self.metrics.syncs_failed.inc(),
            }
            tracing::info!(?result, "sync ended without completion");
        }

        self.settle_status(&result, cancel);
        self.finish(result)
    }

    /// Dispatch the request and follow progress to a terminal phase.
    async fn transfer(&self, progress: &mut broadcast::Receiver<SyncState>) -> SyncResult {
        let initial = match self.transport.request_stored_messages().await {
            Ok(state) => state,
            Err(e) => {
                return SyncResult::Error {
                    message: e.to_string(),
                }
            }
        };
        // No attempt id on the stream. A completion seen before this request
        // was reported sent belongs to an earlier, timed-out attempt.
        let mut request_seen = initial.phase.is_request_underway();
        if let Some(result) = self.observe(initial) {
            return result;
        }

        loop {
            match progress.recv().await {
                Ok(state) => {
                    request_seen |= state.phase.is_request_underway();
                    if state.phase.is_complete() && !request_seen {
                        tracing::debug!(
                            messages = state.messages_received,
                            "ignoring completion that predates this request"
                        );
                        continue;
                    }
                    if let Some(result) = self.observe(state) {
                        return result;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "sync progress lagged");
                    request_seen = true;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return SyncResult::Error {
                        message: "sync progress stream closed".to_string(),
                    };
                }
            }
        }
    }

    /// Terminal result for a state, or `None` while still running.
    fn observe(&self, state: SyncState) -> Option<SyncResult> {
        if state.phase.is_complete() {
            return Some(SyncResult::Success {
                messages_received: state.messages_received,
            });
        }
        if state.phase.is_failure() {
            return Some(SyncResult::Error {
                message: format!("propagation transfer failed: {}", state.phase.describe()),
            });
        }
        self.status_tx.send_replace(SyncStatus::InProgress {
            phase: state.phase,
            progress: state.progress,
        });
        None
    }

    fn settle_status(&self, result: &SyncResult, cancel: &CancellationToken) {
        match *result {
            SyncResult::Success { messages_received } if messages_received > 0 => {
                self.status_tx
                    .send_replace(SyncStatus::Complete { messages_received });
                let status_tx = self.status_tx.clone();
                let cancel = cancel.clone();
                let display = self.complete_display;
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(display) => {}
                    }
                    // Leave a newer attempt's status alone.
                    status_tx.send_if_modified(|status| {
                        if matches!(status, SyncStatus::Complete { .. }) {
                            *status = SyncStatus::Idle;
                            true
                        } else {
                            false
                        }
                    });
                });
            }
            _ => {
                self.status_tx.send_replace(SyncStatus::Idle);
            }
        }
    }

    fn finish(&self, result: SyncResult) -> SyncResult {
        // No subscribers is fine.
        let _ = self.results_tx.send(result.clone());
        result
    }
}
