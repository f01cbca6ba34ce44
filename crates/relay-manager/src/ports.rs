/// Collaborator abstractions consumed by the relay manager.
///
/// In production: implemented by the app's announce table, contact
/// database, preference store and the native network binding.
/// In tests: implemented by the in-memory doubles in [`crate::memory`].
///
/// Reactive single values are `watch` receivers; event streams are
/// `broadcast` receivers. Every async call is a suspension point and may fail.
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::candidate::RelayCandidate;
use crate::error::RelayError;
use crate::types::NodeId;

// ── Announce repository ───────────────────────────────────────────────

#[async_trait::async_trait]
pub trait AnnounceRepository: Send + Sync {
    /// Live list of nodes announcing the propagation-node role. May be empty.
    fn propagation_nodes(&self) -> watch::Receiver<Vec<RelayCandidate>>;

    /// Individual propagation-node announces, in arrival order.
    fn announces(&self) -> broadcast::Receiver<RelayCandidate>;

    /// Point lookup by node id.
    async fn get(&self, node_id: &NodeId) -> Result<Option<RelayCandidate>, RelayError>;
}

// ── Contact store ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContactStatus {
    /// Identity known from network data.
    Confirmed,
    /// Created from a bare identifier, identity not yet resolved.
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRecord {
    pub node_id: NodeId,
    pub public_key: Option<Vec<u8>>,
    pub custom_nickname: Option<String>,
    /// Unix ms of the last interaction with this contact.
    pub last_interaction: Option<u64>,
    pub status: ContactStatus,
    pub is_my_relay: bool,
}

/// Outcome of adding a contact from a bare identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOutcome {
    /// Stored as pending until an announce resolves the identity.
    AddedAsPending,
    /// The identity was already known, stored as confirmed.
    ResolvedImmediately,
    AlreadyExists,
}

/// Owner of the "my relay" flag. At most one contact carries it.
#[async_trait::async_trait]
pub trait ContactStore: Send + Sync {
    /// The contact currently flagged as relay, if any.
    fn my_relay(&self) -> watch::Receiver<Option<ContactRecord>>;

    /// Flag `node_id` as relay. With `clear_other`, every other flag is cleared.
    async fn set_as_relay(&self, node_id: &NodeId, clear_other: bool) -> Result<(), RelayError>;

    async fn clear_relay(&self) -> Result<(), RelayError>;

    async fn has_contact(&self, node_id: &NodeId) -> Result<bool, RelayError>;

    async fn add_from_announce(
        &self,
        node_id: &NodeId,
        public_key: &[u8],
    ) -> Result<(), RelayError>;

    async fn add_pending(
        &self,
        node_id: &NodeId,
        nickname: Option<&str>,
    ) -> Result<PendingOutcome, RelayError>;
}

// ── Settings store ────────────────────────────────────────────────────

/// Default periodic sync interval.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(3600);

/// Persisted relay-selection preferences.
///
/// Each value has a one-shot getter, a reactive receiver and a setter.
#[async_trait::async_trait]
pub trait SettingsStore: Send + Sync {
    async fn auto_select_enabled(&self) -> Result<bool, RelayError>;
    fn watch_auto_select_enabled(&self) -> watch::Receiver<bool>;
    async fn set_auto_select_enabled(&self, enabled: bool) -> Result<(), RelayError>;

    async fn manual_node_id(&self) -> Result<Option<NodeId>, RelayError>;
    fn watch_manual_node_id(&self) -> watch::Receiver<Option<NodeId>>;
    async fn set_manual_node_id(&self, node_id: Option<NodeId>) -> Result<(), RelayError>;

    async fn last_sync_timestamp(&self) -> Result<Option<u64>, RelayError>;
    fn watch_last_sync_timestamp(&self) -> watch::Receiver<Option<u64>>;
    async fn set_last_sync_timestamp(&self, timestamp_ms: u64) -> Result<(), RelayError>;

    /// Periodic sync interval. Zero disables periodic sync.
    async fn sync_interval(&self) -> Result<Duration, RelayError>;
    fn watch_sync_interval(&self) -> watch::Receiver<Duration>;
    async fn set_sync_interval(&self, interval: Duration) -> Result<(), RelayError>;
}

// ── Network transport ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkStatus {
    Initializing,
    Ready,
    Shutdown,
    Error(String),
}

impl NetworkStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, NetworkStatus::Ready)
    }
}

/// Phase of a propagation transfer, using the LXMF transfer-state codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncPhase {
    Idle,
    PathRequested,
    LinkEstablishing,
    LinkEstablished,
    RequestSent,
    Receiving,
    ResponseReceived,
    Complete,
    NoPath,
    LinkFailed,
    TransferFailed,
    NoIdentityReceived,
    NoAccess,
    Failed,
}

impl SyncPhase {
    pub fn code(self) -> u8 {
        match self {
            SyncPhase::Idle => 0x00,
            SyncPhase::PathRequested => 0x01,
            SyncPhase::LinkEstablishing => 0x02,
            SyncPhase::LinkEstablished => 0x03,
            SyncPhase::RequestSent => 0x04,
            SyncPhase::Receiving => 0x05,
            SyncPhase::ResponseReceived => 0x06,
            SyncPhase::Complete => 0x07,
            SyncPhase::NoPath => 0xf0,
            SyncPhase::LinkFailed => 0xf1,
            SyncPhase::TransferFailed => 0xf2,
            SyncPhase::NoIdentityReceived => 0xf3,
            SyncPhase::NoAccess => 0xf4,
            SyncPhase::Failed => 0xfe,
        }
    }

    /// Decode a raw transfer-state code. Unknown codes map to `None`.
    pub fn from_code(code: u8) -> Option<Self> {
        let phase = match code {
            0x00 => SyncPhase::Idle,
            0x01 => SyncPhase::PathRequested,
            0x02 => SyncPhase::LinkEstablishing,
            0x03 => SyncPhase::LinkEstablished,
            0x04 => SyncPhase::RequestSent,
            0x05 => SyncPhase::Receiving,
            0x06 => SyncPhase::ResponseReceived,
            0x07 => SyncPhase::Complete,
            0xf0 => SyncPhase::NoPath,
            0xf1 => SyncPhase::LinkFailed,
            0xf2 => SyncPhase::TransferFailed,
            0xf3 => SyncPhase::NoIdentityReceived,
            0xf4 => SyncPhase::NoAccess,
            0xfe => SyncPhase::Failed,
            _ => return None,
        };
        Some(phase)
    }

    pub fn is_complete(self) -> bool {
        self == SyncPhase::Complete
    }

    pub fn is_failure(self) -> bool {
        self.code() >= 0xf0
    }

    /// The request reached the relay and a response is on its way.
    pub fn is_request_underway(self) -> bool {
        matches!(
            self,
            SyncPhase::RequestSent | SyncPhase::Receiving | SyncPhase::ResponseReceived
        )
    }

    pub fn describe(self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::PathRequested => "path requested",
            SyncPhase::LinkEstablishing => "establishing link",
            SyncPhase::LinkEstablished => "link established",
            SyncPhase::RequestSent => "request sent",
            SyncPhase::Receiving => "receiving",
            SyncPhase::ResponseReceived => "response received",
            SyncPhase::Complete => "complete",
            SyncPhase::NoPath => "no path to relay",
            SyncPhase::LinkFailed => "link failed",
            SyncPhase::TransferFailed => "transfer failed",
            SyncPhase::NoIdentityReceived => "relay did not identify",
            SyncPhase::NoAccess => "access denied by relay",
            SyncPhase::Failed => "failed",
        }
    }
}

/// Snapshot of a propagation transfer as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub phase: SyncPhase,
    /// 0.0 to 1.0.
    pub progress: f32,
    pub messages_received: u32,
}

impl SyncState {
    pub fn new(phase: SyncPhase, progress: f32, messages_received: u32) -> Self {
        Self {
            phase,
            progress,
            messages_received,
        }
    }

    pub fn complete(messages_received: u32) -> Self {
        Self::new(SyncPhase::Complete, 1.0, messages_received)
    }
}

#[async_trait::async_trait]
pub trait NetworkTransport: Send + Sync {
    fn network_status(&self) -> watch::Receiver<NetworkStatus>;

    /// Configure (or clear, with `None`) the outbound propagation node.
    async fn set_outbound_relay(&self, node_id: Option<NodeId>) -> Result<(), RelayError>;

    /// Ask the outbound propagation node for stored messages.
    ///
    /// Returns the transfer state right after dispatch; the terminal
    /// state arrives on [`NetworkTransport::sync_progress`].
    async fn request_stored_messages(&self) -> Result<SyncState, RelayError>;

    fn sync_progress(&self) -> broadcast::Receiver<SyncState>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_codes_roundtrip() {
        for code in 0u8..=0xff {
            if let Some(phase) = SyncPhase::from_code(code) {
                assert_eq!(phase.code(), code);
            }
        }
        assert_eq!(SyncPhase::from_code(0x07), Some(SyncPhase::Complete));
        assert_eq!(SyncPhase::from_code(0x42), None);
    }

    #[test]
    fn phase_classes() {
        assert!(SyncPhase::NoPath.is_failure());
        assert!(SyncPhase::Failed.is_failure());
        assert!(!SyncPhase::Complete.is_failure());
        assert!(!SyncPhase::Receiving.is_failure());
        assert!(SyncPhase::RequestSent.is_request_underway());
        assert!(!SyncPhase::PathRequested.is_request_underway());
        assert!(!SyncPhase::Complete.is_request_underway());
        assert!(SyncPhase::Complete.is_complete());
    }

    #[test]
    fn network_ready() {
        assert!(NetworkStatus::Ready.is_ready());
        assert!(!NetworkStatus::Initializing.is_ready());
        assert!(!NetworkStatus::Error("boom".into()).is_ready());
    }
}
