/// Relay state projection.
///
/// Turns the contact store's "my relay" record into a display-ready
/// [`RelayInfo`], enriched from the live announce table. Pure projection:
/// the only writes go to the manager's own watch channels.
///
/// Field priority:
/// - name: live announce name, then contact nickname, then truncated id
/// - hops: live announce, else unknown
/// - last seen: live announce, else the contact's last interaction
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::candidate::{rank, RelayCandidate};
use crate::ports::{AnnounceRepository, ContactRecord, ContactStore};

// ── Projected views ───────────────────────────────────────────────────

/// The relay currently in use, resolved for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayInfo {
    pub node_id: crate::types::NodeId,
    pub display_name: String,
    /// `None` when no live announce gives a distance.
    pub hops: Option<u32>,
    pub last_seen: Option<u64>,
}

impl RelayInfo {
    pub fn hop_count_or_unknown(&self) -> i64 {
        self.hops.map_or(-1, i64::from)
    }
}

/// Distinguishes "not resolved yet" from "resolved to no relay".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayState {
    Loading,
    Loaded(Option<RelayInfo>),
}

impl RelayState {
    pub fn is_loaded(&self) -> bool {
        matches!(self, RelayState::Loaded(_))
    }

    pub fn relay(&self) -> Option<&RelayInfo> {
        match self {
            RelayState::Loaded(info) => info.as_ref(),
            RelayState::Loading => None,
        }
    }
}

/// Propagation nodes a user could pick from, closest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvailableRelaysState {
    Loading,
    /// An empty list means no relay is currently available.
    Loaded(Vec<RelayCandidate>),
}

/// Merge a contact record with its live announce, if any.
pub fn resolve_relay_info(contact: &ContactRecord, announce: Option<&RelayCandidate>) -> RelayInfo {
    let announced_name = announce
        .map(|a| a.display_name.trim())
        .filter(|name| !name.is_empty());
    let nickname = contact
        .custom_nickname
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty());

    let display_name = announced_name
        .or(nickname)
        .map(str::to_string)
        .unwrap_or_else(|| contact.node_id.short());

    RelayInfo {
        node_id: contact.node_id,
        display_name,
        hops: announce.and_then(|a| a.hops),
        last_seen: announce.map(|a| a.last_seen).or(contact.last_interaction),
    }
}

/// Look up the contact's announce and resolve. Lookup failures fall back.
pub(crate) async fn project(
    contact: &ContactRecord,
    announces: &dyn AnnounceRepository,
) -> RelayInfo {
    let announce = match announces.get(&contact.node_id).await {
        Ok(found) => found,
        Err(e) => {
            tracing::debug!(
                relay = %contact.node_id,
                "announce lookup failed, using contact data: {e}",
            );
            None
        }
    };
    resolve_relay_info(contact, announce.as_ref())
}

fn publish<T: PartialEq>(tx: &watch::Sender<T>, next: T) {
    tx.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
}

// ── Listeners ─────────────────────────────────────────────────────────

/// Follow the relay flag and the announce table, publish the projection.
///
/// A value is only published once enrichment finished, so observers never
/// see a transient `None` between the flag change and the lookup.
pub(crate) async fn run_projector(
    contacts: Arc<dyn ContactStore>,
    announces: Arc<dyn AnnounceRepository>,
    state_tx: watch::Sender<RelayState>,
    current_tx: watch::Sender<Option<RelayInfo>>,
    cancel: CancellationToken,
) {
    let mut relay_rx = contacts.my_relay();
    let mut nodes_rx = announces.propagation_nodes();
    let mut nodes_open = true;

    loop {
        let contact = relay_rx.borrow_and_update().clone();
        nodes_rx.borrow_and_update();

        let info = match contact {
            Some(contact) => Some(project(&contact, announces.as_ref()).await),
            None => None,
        };
        publish(&current_tx, info.clone());
        publish(&state_tx, RelayState::Loaded(info));

        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = relay_rx.changed() => {
                if changed.is_err() {
                    tracing::warn!("contact store closed its relay stream, projector stopping");
                    break;
                }
            }
            changed = nodes_rx.changed(), if nodes_open => {
                if changed.is_err() {
                    nodes_open = false;
                }
            }
        }
    }
}

/// Publish the ranked propagation-node list.
pub(crate) async fn run_available_relays(
    announces: Arc<dyn AnnounceRepository>,
    tx: watch::Sender<AvailableRelaysState>,
    cancel: CancellationToken,
) {
    let mut nodes_rx = announces.propagation_nodes();
    loop {
        let ranked = rank(&nodes_rx.borrow_and_update());
        publish(&tx, AvailableRelaysState::Loaded(ranked));

        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = nodes_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::ContactStatus;
    use crate::types::{NodeId, NODE_ID_LEN};

    fn node_id(seed: u8) -> NodeId {
        NodeId::from_bytes([seed; NODE_ID_LEN])
    }

    fn contact(seed: u8, nickname: Option<&str>, last_interaction: Option<u64>) -> ContactRecord {
        ContactRecord {
            node_id: node_id(seed),
            public_key: None,
            custom_nickname: nickname.map(str::to_string),
            last_interaction,
            status: ContactStatus::Confirmed,
            is_my_relay: true,
        }
    }

    fn announce(seed: u8, name: &str, hops: Option<u32>, last_seen: u64) -> RelayCandidate {
        RelayCandidate {
            node_id: node_id(seed),
            display_name: name.to_string(),
            hops,
            public_key: vec![seed; 32],
            last_seen,
        }
    }

    #[test]
    fn announce_data_wins() {
        let c = contact(1, Some("my nick"), Some(10));
        let a = announce(1, "Relay One", Some(2), 500);
        let info = resolve_relay_info(&c, Some(&a));
        assert_eq!(info.display_name, "Relay One");
        assert_eq!(info.hops, Some(2));
        assert_eq!(info.last_seen, Some(500));
    }

    #[test]
    fn nickname_when_announce_name_empty() {
        let c = contact(1, Some("my nick"), Some(10));
        let a = announce(1, "  ", Some(3), 500);
        let info = resolve_relay_info(&c, Some(&a));
        assert_eq!(info.display_name, "my nick");
        assert_eq!(info.hops, Some(3));
    }

    #[test]
    fn contact_only_fallback() {
        let c = contact(1, Some("my nick"), Some(10));
        let info = resolve_relay_info(&c, None);
        assert_eq!(info.display_name, "my nick");
        assert_eq!(info.hops, None);
        assert_eq!(info.hop_count_or_unknown(), -1);
        assert_eq!(info.last_seen, Some(10));
    }

    #[test]
    fn truncated_id_as_last_resort() {
        let c = contact(0xab, None, None);
        let info = resolve_relay_info(&c, None);
        assert_eq!(info.display_name, node_id(0xab).short());
        assert_eq!(info.last_seen, None);
    }

    #[test]
    fn relay_state_accessors() {
        assert!(!RelayState::Loading.is_loaded());
        assert!(RelayState::Loaded(None).is_loaded());
        assert!(RelayState::Loaded(None).relay().is_none());
    }
}
