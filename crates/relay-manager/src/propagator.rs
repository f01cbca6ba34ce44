//! Pushes the projected relay down to the network transport.
//!
//! The only writer of transport-level relay configuration. Everything else
//! changes the contact store and lets this listener follow.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::metrics::RelayMetrics;
use crate::ports::NetworkTransport;
use crate::projector::RelayState;
use crate::types::NodeId;

/// Follow resolved relay identity changes and configure the transport.
///
/// `Loading` is skipped, and metadata-only updates (name, hops) of the
/// same relay do not reach the transport. A failed call is logged; the
/// next identity change retries.
pub(crate) async fn run_propagator(
    transport: Arc<dyn NetworkTransport>,
    mut state_rx: watch::Receiver<RelayState>,
    metrics: Arc<RelayMetrics>,
    cancel: CancellationToken,
) {
    let mut applied: Option<Option<NodeId>> = None;

    loop {
        let target = match &*state_rx.borrow_and_update() {
            RelayState::Loading => None,
            RelayState::Loaded(info) => Some(info.as_ref().map(|i| i.node_id)),
        };

        if let Some(target) = target.filter(|t| applied != Some(*t)) {
            match transport.set_outbound_relay(target).await {
                Ok(()) => {
                    metrics.outbound_relay_pushes.inc();
                    match target {
                        Some(node_id) => {
                            tracing::info!(
                                relay = %node_id,
                                "outbound propagation node set",
                            );
                        }
                        None => tracing::info!("outbound propagation node cleared"),
                    }
                    applied = Some(target);
                }
                Err(e) => {
                    tracing::warn!(
                        relay = ?target,
                        "failed to configure outbound propagation node: {e}",
                    );
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}
