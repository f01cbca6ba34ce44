/// Relay selection engine.
///
/// Decides which propagation node becomes "my relay", in response to
/// announces and user actions. Writes only to the contact store (relay
/// flag) and the settings store (mode); the transport is configured
/// downstream by the propagator.
///
/// Every mutation runs under one async mutex. Tokio's mutex is fair, so
/// concurrent announces and user actions are applied one at a time, in
/// arrival order, and an adoption chain is never interleaved with another.
use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use crate::candidate::{compare_hops, select_best, RelayCandidate};
use crate::metrics::RelayMetrics;
use crate::ports::{AnnounceRepository, ContactStore, SettingsStore};
use crate::types::NodeId;

// ── Modes and outcomes ────────────────────────────────────────────────

/// Which rule governs selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    /// Relay follows the closest announced propagation node.
    Auto,
    /// Auto-select is off. Announces never switch the relay; the pinned
    /// node is `None` after the user deleted the relay without a replacement.
    Manual(Option<NodeId>),
}

/// What a selection operation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionOutcome {
    /// A node was (re)flagged as relay, replacing whatever was there.
    Adopted { node_id: NodeId },
    /// The current relay re-announced and was re-flagged in place.
    Refreshed { node_id: NodeId },
    /// Nothing changed: incumbent kept or announce ignored in manual mode.
    Kept,
    /// No eligible candidate; the relay was left as it was.
    NoCandidate,
    /// The relay flag was cleared (or stays cleared).
    Cleared,
    /// A collaborator failed; prior relay state is intact.
    Aborted { reason: String },
}

/// Auto-mode verdict for a candidate against the incumbent relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchDecision {
    /// No relay set yet.
    AdoptFirst,
    /// Candidate is the incumbent; re-adopt to refresh its metadata.
    Refresh,
    /// Candidate is strictly closer, or known against an unknown incumbent.
    SwitchCloser,
    KeepIncumbent,
}

/// Apply the "closer wins, incumbent sticky" rule.
///
/// `current` is the incumbent's id and hop count (`None` = unknown).
pub fn evaluate_candidate(
    current: Option<(NodeId, Option<u32>)>,
    candidate: &RelayCandidate,
) -> SwitchDecision {
    let Some((current_id, current_hops)) = current else {
        return SwitchDecision::AdoptFirst;
    };
    if current_id == candidate.node_id {
        return SwitchDecision::Refresh;
    }
    // unknown candidate hops never compare as closer
    if compare_hops(candidate.hops, current_hops).is_lt() {
        SwitchDecision::SwitchCloser
    } else {
        SwitchDecision::KeepIncumbent
    }
}

/// Where contact data for a not-yet-known relay comes from.
enum ContactSource<'a> {
    Announce(&'a RelayCandidate),
    Identifier { nickname: Option<&'a str> },
}

// ── Engine ────────────────────────────────────────────────────────────

pub(crate) struct SelectionEngine {
    contacts: Arc<dyn ContactStore>,
    settings: Arc<dyn SettingsStore>,
    announces: Arc<dyn AnnounceRepository>,
    metrics: Arc<RelayMetrics>,
    serial: Mutex<()>,
}

impl SelectionEngine {
    pub(crate) fn new(
        contacts: Arc<dyn ContactStore>,
        settings: Arc<dyn SettingsStore>,
        announces: Arc<dyn AnnounceRepository>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            contacts,
            settings,
            announces,
            metrics,
            serial: Mutex::new(()),
        }
    }

    /// Current mode as persisted. `manual_node_id` only counts when auto is off.
    pub(crate) async fn mode(&self) -> Result<SelectionMode, crate::RelayError> {
        if self.settings.auto_select_enabled().await? {
            return Ok(SelectionMode::Auto);
        }
        Ok(SelectionMode::Manual(self.settings.manual_node_id().await?))
    }

    pub(crate) async fn enable_auto_select(&self) -> SelectionOutcome {
        let _serial = self.serial.lock().await;

        if let Err(e) = self.settings.set_auto_select_enabled(true).await {
            return self.abort("enable auto-select", e);
        }
        // Ignored while auto is on, so a failed clear leaves the mode intact.
        if let Err(e) = self.settings.set_manual_node_id(None).await {
            tracing::warn!("failed to clear manual relay setting: {e}");
        }
        tracing::info!("relay auto-select enabled");

        let candidates = self.announces.propagation_nodes().borrow().clone();
        match select_best(&candidates, &HashSet::new()) {
            Some(best) => {
                self.adopt(best.node_id, ContactSource::Announce(best))
                    .await
            }
            None => {
                // Keep whatever relay we had until an announce shows up.
                tracing::debug!("auto-select enabled with no propagation nodes known");
                SelectionOutcome::NoCandidate
            }
        }
    }

    pub(crate) async fn set_manual_relay(
        &self,
        node_id: NodeId,
        display_name: Option<&str>,
    ) -> SelectionOutcome {
        let _serial = self.serial.lock().await;

        if let Err(e) = self.pin(node_id).await {
            return self.abort("pin manual relay", e);
        }
        let announce = match self.announces.get(&node_id).await {
            Ok(found) => found,
            Err(e) => {
                tracing::debug!(relay = %node_id, "announce lookup failed: {e}");
                None
            }
        };
        match announce.as_ref() {
            Some(candidate) if !candidate.public_key.is_empty() => {
                self.adopt(node_id, ContactSource::Announce(candidate))
                    .await
            }
            _ => {
                let nickname = display_name.filter(|n| !n.trim().is_empty());
                self.adopt(node_id, ContactSource::Identifier { nickname })
                    .await
            }
        }
    }

    pub(crate) async fn set_manual_relay_by_hash(
        &self,
        node_id: NodeId,
        nickname: Option<&str>,
    ) -> SelectionOutcome {
        let _serial = self.serial.lock().await;

        if let Err(e) = self.pin(node_id).await {
            return self.abort("pin manual relay", e);
        }
        let nickname = nickname.filter(|n| !n.trim().is_empty());
        self.adopt(node_id, ContactSource::Identifier { nickname })
            .await
    }

    /// Drop the relay. The auto-select flag is left as it is.
    pub(crate) async fn clear_relay(&self) -> SelectionOutcome {
        let _serial = self.serial.lock().await;

        if let Err(e) = self.settings.set_manual_node_id(None).await {
            tracing::warn!("failed to clear manual relay setting: {e}");
        }
        match self.contacts.clear_relay().await {
            Ok(()) => {
                tracing::info!("relay cleared");
                SelectionOutcome::Cleared
            }
            Err(e) => self.abort("clear relay flag", e),
        }
    }

    /// React to the user deleting the relay contact.
    pub(crate) async fn on_relay_deleted(
        &self,
        auto_select_new: bool,
        exclude: Option<NodeId>,
    ) -> SelectionOutcome {
        let _serial = self.serial.lock().await;

        if let Err(e) = self.settings.set_manual_node_id(None).await {
            tracing::warn!("failed to clear manual relay setting: {e}");
        }
        if let Err(e) = self.settings.set_auto_select_enabled(auto_select_new).await {
            return self.abort("update auto-select after relay deletion", e);
        }
        if !auto_select_new {
            tracing::info!("relay deleted, auto-select disabled");
            return SelectionOutcome::Cleared;
        }

        let exclude: HashSet<NodeId> = exclude.into_iter().collect();
        let candidates = self.announces.propagation_nodes().borrow().clone();
        match select_best(&candidates, &exclude) {
            Some(best) => {
                tracing::info!(relay = %best.node_id, "relay deleted, selecting alternative");
                self.adopt(best.node_id, ContactSource::Announce(best))
                    .await
            }
            None => {
                tracing::info!("relay deleted, no alternative propagation node known");
                SelectionOutcome::NoCandidate
            }
        }
    }

    /// Announce-driven update. Acts only in auto mode.
    pub(crate) async fn on_propagation_node_announce(
        &self,
        candidate: &RelayCandidate,
    ) -> SelectionOutcome {
        let _serial = self.serial.lock().await;
        self.apply_auto_rule(candidate).await
    }

    /// Run the auto rule against the best currently announced node.
    pub(crate) async fn scan_candidates(&self) -> SelectionOutcome {
        let _serial = self.serial.lock().await;

        let candidates = self.announces.propagation_nodes().borrow().clone();
        match select_best(&candidates, &HashSet::new()) {
            Some(best) => {
                let best = best.clone();
                self.apply_auto_rule(&best).await
            }
            None => SelectionOutcome::NoCandidate,
        }
    }

    // ── Internals (caller holds `serial`) ─────────────────────────────

    async fn apply_auto_rule(&self, candidate: &RelayCandidate) -> SelectionOutcome {
        match self.settings.auto_select_enabled().await {
            Ok(true) => {}
            Ok(false) => {
                tracing::trace!(
                    node = %candidate.node_id,
                    "manual relay pinned, ignoring announce",
                );
                return SelectionOutcome::Kept;
            }
            Err(e) => return self.abort("read auto-select setting", e),
        }

        let current = match self.current_relay_id() {
            Some(id) => Some((id, self.current_hops(&id).await)),
            None => None,
        };

        match evaluate_candidate(current, candidate) {
            SwitchDecision::KeepIncumbent => {
                tracing::trace!(node = %candidate.node_id, "keeping incumbent relay");
                SelectionOutcome::Kept
            }
            SwitchDecision::Refresh => {
                let source = ContactSource::Announce(candidate);
                match self.adopt(candidate.node_id, source).await {
                    SelectionOutcome::Adopted { node_id } => {
                        SelectionOutcome::Refreshed { node_id }
                    }
                    other => other,
                }
            }
            decision => {
                tracing::debug!(
                    node = %candidate.node_id,
                    hops = ?candidate.hops,
                    ?decision,
                    "auto-selecting relay",
                );
                self.adopt(candidate.node_id, ContactSource::Announce(candidate))
                    .await
            }
        }
    }

    /// Persist the pin. The manual id goes first: it only counts once auto
    /// is off, so a failure at either step leaves the previous mode in force.
    async fn pin(&self, node_id: NodeId) -> Result<(), crate::RelayError> {
        let previous = self.settings.manual_node_id().await?;
        self.settings.set_manual_node_id(Some(node_id)).await?;
        if let Err(e) = self.settings.set_auto_select_enabled(false).await {
            if let Err(restore) = self.settings.set_manual_node_id(previous).await {
                tracing::warn!("failed to restore manual relay setting: {restore}");
            }
            return Err(e);
        }
        tracing::info!(relay = %node_id, "relay pinned manually");
        Ok(())
    }

    fn current_relay_id(&self) -> Option<NodeId> {
        self.contacts
            .my_relay()
            .borrow()
            .as_ref()
            .map(|c| c.node_id)
    }

    async fn current_hops(&self, node_id: &NodeId) -> Option<u32> {
        match self.announces.get(node_id).await {
            Ok(found) => found.and_then(|c| c.hops),
            Err(e) => {
                tracing::debug!(relay = %node_id, "hop lookup failed, treating as unknown: {e}");
                None
            }
        }
    }

    /// Make sure a contact exists, then flag it as the only relay.
    async fn adopt(&self, node_id: NodeId, source: ContactSource<'_>) -> SelectionOutcome {
        let known = match self.contacts.has_contact(&node_id).await {
            Ok(known) => known,
            Err(e) => return self.abort_adoption(node_id, e),
        };

        if !known {
            let added = match source {
                ContactSource::Announce(candidate) if !candidate.public_key.is_empty() => self
                    .contacts
                    .add_from_announce(&node_id, &candidate.public_key)
                    .await,
                ContactSource::Announce(candidate) => {
                    let name =
                        Some(candidate.display_name.as_str()).filter(|n| !n.is_empty());
                    self.contacts.add_pending(&node_id, name).await.map(|_| ())
                }
                ContactSource::Identifier { nickname } => {
                    self.contacts.add_pending(&node_id, nickname).await.map(|outcome| {
                        tracing::debug!(relay = %node_id, ?outcome, "relay added as contact");
                    })
                }
            };
            if let Err(e) = added {
                return self.abort_adoption(node_id, e);
            }
        }

        if let Err(e) = self.contacts.set_as_relay(&node_id, true).await {
            return self.abort_adoption(node_id, e);
        }
        self.metrics.adoptions.inc();
        tracing::info!(relay = %node_id, "relay adopted");
        SelectionOutcome::Adopted { node_id }
    }

    fn abort_adoption(&self, node_id: NodeId, error: crate::RelayError) -> SelectionOutcome {
        self.metrics.adoption_failures.inc();
        tracing::warn!(relay = %node_id, "relay adoption aborted: {error}");
        SelectionOutcome::Aborted {
            reason: error.to_string(),
        }
    }

    fn abort(&self, step: &str, error: crate::RelayError) -> SelectionOutcome {
        tracing::warn!("{step} failed: {error}");
        SelectionOutcome::Aborted {
            reason: format!("{step}: {error}"),
        }
    }
}

/// Feed propagation-node announces into the engine, one at a time.
pub(crate) async fn run_announce_listener(
    engine: Arc<SelectionEngine>,
    mut announces: broadcast::Receiver<RelayCandidate>,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = announces.recv() => received,
        };
        match received {
            Ok(candidate) => {
                engine.on_propagation_node_announce(&candidate).await;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "announce listener lagged, rescanning candidates");
                engine.scan_candidates().await;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NODE_ID_LEN;

    fn node_id(seed: u8) -> NodeId {
        NodeId::from_bytes([seed; NODE_ID_LEN])
    }

    fn candidate(seed: u8, hops: Option<u32>) -> RelayCandidate {
        RelayCandidate {
            node_id: node_id(seed),
            display_name: String::new(),
            hops,
            public_key: vec![seed; 32],
            last_seen: 0,
        }
    }

    #[test]
    fn first_candidate_adopted_when_unset() {
        assert_eq!(
            evaluate_candidate(None, &candidate(1, Some(3))),
            SwitchDecision::AdoptFirst
        );
        assert_eq!(
            evaluate_candidate(None, &candidate(1, None)),
            SwitchDecision::AdoptFirst
        );
    }

    #[test]
    fn closer_node_switches() {
        let current = Some((node_id(1), Some(5)));
        assert_eq!(
            evaluate_candidate(current, &candidate(2, Some(4))),
            SwitchDecision::SwitchCloser
        );
    }

    #[test]
    fn equal_hops_keep_incumbent() {
        let current = Some((node_id(1), Some(5)));
        assert_eq!(
            evaluate_candidate(current, &candidate(2, Some(5))),
            SwitchDecision::KeepIncumbent
        );
    }

    #[test]
    fn farther_node_keeps_incumbent() {
        let current = Some((node_id(1), Some(2)));
        assert_eq!(
            evaluate_candidate(current, &candidate(2, Some(6))),
            SwitchDecision::KeepIncumbent
        );
    }

    #[test]
    fn known_beats_unknown_incumbent() {
        let current = Some((node_id(1), None));
        assert_eq!(
            evaluate_candidate(current, &candidate(2, Some(9))),
            SwitchDecision::SwitchCloser
        );
        assert_eq!(
            evaluate_candidate(current, &candidate(2, None)),
            SwitchDecision::KeepIncumbent
        );
    }

    #[test]
    fn same_node_is_refresh() {
        let current = Some((node_id(1), Some(3)));
        assert_eq!(
            evaluate_candidate(current, &candidate(1, Some(3))),
            SwitchDecision::Refresh
        );
        assert_eq!(
            evaluate_candidate(current, &candidate(1, Some(7))),
            SwitchDecision::Refresh
        );
    }
}
