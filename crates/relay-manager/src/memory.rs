//! In-memory collaborators.
//!
//! Hold their state behind mutexes, publish through watch/broadcast
//! channels, record the calls the manager makes, and can be told to fail.
//! Used by the test suites and by `relay-sim`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, watch};

use crate::candidate::RelayCandidate;
use crate::error::RelayError;
use crate::ports::{
    AnnounceRepository, ContactRecord, ContactStatus, ContactStore, NetworkStatus,
    NetworkTransport, PendingOutcome, SettingsStore, SyncPhase, SyncState, DEFAULT_SYNC_INTERVAL,
};
use crate::types::{now_ms, NodeId};

const EVENT_CAPACITY: usize = 256;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Announce repository ───────────────────────────────────────────────

pub struct MemoryAnnounceRepository {
    nodes: watch::Sender<Vec<RelayCandidate>>,
    events: broadcast::Sender<RelayCandidate>,
    fail_lookups: Mutex<bool>,
}

impl MemoryAnnounceRepository {
    pub fn new() -> Self {
        let (nodes, _) = watch::channel(Vec::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            nodes,
            events,
            fail_lookups: Mutex::new(false),
        }
    }

    /// Record a propagation-node announce: update the table, then emit it.
    pub fn announce(&self, candidate: RelayCandidate) {
        self.nodes.send_modify(|nodes| {
            match nodes.iter_mut().find(|n| n.node_id == candidate.node_id) {
                Some(existing) => *existing = candidate.clone(),
                None => nodes.push(candidate.clone()),
            }
        });
        let _ = self.events.send(candidate);
    }

    /// Update the table without emitting an announce event.
    pub fn insert_silently(&self, candidate: RelayCandidate) {
        self.nodes.send_modify(|nodes| {
            nodes.retain(|n| n.node_id != candidate.node_id);
            nodes.push(candidate);
        });
    }

    pub fn remove(&self, node_id: &NodeId) {
        self.nodes.send_modify(|nodes| nodes.retain(|n| n.node_id != *node_id));
    }

    pub fn set_fail_lookups(&self, fail: bool) {
        *lock(&self.fail_lookups) = fail;
    }
}

impl Default for MemoryAnnounceRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl AnnounceRepository for MemoryAnnounceRepository {
    fn propagation_nodes(&self) -> watch::Receiver<Vec<RelayCandidate>> {
        self.nodes.subscribe()
    }

    fn announces(&self) -> broadcast::Receiver<RelayCandidate> {
        self.events.subscribe()
    }

    async fn get(&self, node_id: &NodeId) -> Result<Option<RelayCandidate>, RelayError> {
        if *lock(&self.fail_lookups) {
            return Err(RelayError::Announce("memory: lookup failed".into()));
        }
        Ok(self
            .nodes
            .borrow()
            .iter()
            .find(|n| n.node_id == *node_id)
            .cloned())
    }
}

// ── Contact store ─────────────────────────────────────────────────────

pub struct MemoryContactStore {
    contacts: Mutex<Vec<ContactRecord>>,
    relay: watch::Sender<Option<ContactRecord>>,
    relay_assignments: Mutex<Vec<NodeId>>,
    fail_adds: Mutex<bool>,
    fail_relay_writes: Mutex<bool>,
}

impl MemoryContactStore {
    pub fn new() -> Self {
        let (relay, _) = watch::channel(None);
        Self {
            contacts: Mutex::new(Vec::new()),
            relay,
            relay_assignments: Mutex::new(Vec::new()),
            fail_adds: Mutex::new(false),
            fail_relay_writes: Mutex::new(false),
        }
    }

    /// Insert or replace a contact record as-is.
    pub fn insert(&self, record: ContactRecord) {
        {
            let mut contacts = lock(&self.contacts);
            contacts.retain(|c| c.node_id != record.node_id);
            contacts.push(record);
        }
        self.publish();
    }

    /// Delete a contact; deleting the relay contact clears the relay.
    pub fn remove(&self, node_id: &NodeId) {
        lock(&self.contacts).retain(|c| c.node_id != *node_id);
        self.publish();
    }

    pub fn contact(&self, node_id: &NodeId) -> Option<ContactRecord> {
        lock(&self.contacts)
            .iter()
            .find(|c| c.node_id == *node_id)
            .cloned()
    }

    pub fn contacts(&self) -> Vec<ContactRecord> {
        lock(&self.contacts).clone()
    }

    /// Every node passed to `set_as_relay`, in call order.
    pub fn relay_assignments(&self) -> Vec<NodeId> {
        lock(&self.relay_assignments).clone()
    }

    pub fn set_fail_adds(&self, fail: bool) {
        *lock(&self.fail_adds) = fail;
    }

    pub fn set_fail_relay_writes(&self, fail: bool) {
        *lock(&self.fail_relay_writes) = fail;
    }

    fn publish(&self) {
        let relay = lock(&self.contacts).iter().find(|c| c.is_my_relay).cloned();
        self.relay.send_if_modified(|current| {
            if *current == relay {
                false
            } else {
                *current = relay;
                true
            }
        });
    }

    fn check_adds(&self) -> Result<(), RelayError> {
        if *lock(&self.fail_adds) {
            return Err(RelayError::Contact("memory: add failed".into()));
        }
        Ok(())
    }

    fn check_relay_writes(&self) -> Result<(), RelayError> {
        if *lock(&self.fail_relay_writes) {
            return Err(RelayError::Contact("memory: relay write failed".into()));
        }
        Ok(())
    }
}

impl Default for MemoryContactStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ContactStore for MemoryContactStore {
    fn my_relay(&self) -> watch::Receiver<Option<ContactRecord>> {
        self.relay.subscribe()
    }

    async fn set_as_relay(&self, node_id: &NodeId, clear_other: bool) -> Result<(), RelayError> {
        self.check_relay_writes()?;
        lock(&self.relay_assignments).push(*node_id);
        {
            let mut contacts = lock(&self.contacts);
            if !contacts.iter().any(|c| c.node_id == *node_id) {
                return Err(RelayError::Contact(format!("unknown contact {node_id}")));
            }
            for contact in contacts.iter_mut() {
                if contact.node_id == *node_id {
                    contact.is_my_relay = true;
                } else if clear_other {
                    contact.is_my_relay = false;
                }
            }
        }
        self.publish();
        Ok(())
    }

    async fn clear_relay(&self) -> Result<(), RelayError> {
        self.check_relay_writes()?;
        for contact in lock(&self.contacts).iter_mut() {
            contact.is_my_relay = false;
        }
        self.publish();
        Ok(())
    }

    async fn has_contact(&self, node_id: &NodeId) -> Result<bool, RelayError> {
        Ok(lock(&self.contacts).iter().any(|c| c.node_id == *node_id))
    }

    async fn add_from_announce(
        &self,
        node_id: &NodeId,
        public_key: &[u8],
    ) -> Result<(), RelayError> {
        self.check_adds()?;
        let mut contacts = lock(&self.contacts);
        if !contacts.iter().any(|c| c.node_id == *node_id) {
            contacts.push(ContactRecord {
                node_id: *node_id,
                public_key: Some(public_key.to_vec()),
                custom_nickname: None,
                last_interaction: Some(now_ms()),
                status: ContactStatus::Confirmed,
                is_my_relay: false,
            });
        }
        Ok(())
    }

    async fn add_pending(
        &self,
        node_id: &NodeId,
        nickname: Option<&str>,
    ) -> Result<PendingOutcome, RelayError> {
        self.check_adds()?;
        let mut contacts = lock(&self.contacts);
        if contacts.iter().any(|c| c.node_id == *node_id) {
            return Ok(PendingOutcome::AlreadyExists);
        }
        contacts.push(ContactRecord {
            node_id: *node_id,
            public_key: None,
            custom_nickname: nickname.map(str::to_string),
            last_interaction: None,
            status: ContactStatus::Pending,
            is_my_relay: false,
        });
        Ok(PendingOutcome::AddedAsPending)
    }
}

// ── Settings store ────────────────────────────────────────────────────

pub struct MemorySettingsStore {
    auto_select: watch::Sender<bool>,
    manual_node_id: watch::Sender<Option<NodeId>>,
    last_sync: watch::Sender<Option<u64>>,
    sync_interval: watch::Sender<Duration>,
    fail_writes: Mutex<bool>,
    fail_manual_writes: Mutex<bool>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self {
            auto_select: watch::channel(true).0,
            manual_node_id: watch::channel(None).0,
            last_sync: watch::channel(None).0,
            sync_interval: watch::channel(DEFAULT_SYNC_INTERVAL).0,
            fail_writes: Mutex::new(false),
            fail_manual_writes: Mutex::new(false),
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        *lock(&self.fail_writes) = fail;
    }

    /// Fail only `set_manual_node_id`, leaving the other setters working.
    pub fn set_fail_manual_writes(&self, fail: bool) {
        *lock(&self.fail_manual_writes) = fail;
    }

    fn check_writes(&self) -> Result<(), RelayError> {
        if *lock(&self.fail_writes) {
            return Err(RelayError::Settings("memory: write failed".into()));
        }
        Ok(())
    }
}

impl Default for MemorySettingsStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn auto_select_enabled(&self) -> Result<bool, RelayError> {
        Ok(*self.auto_select.borrow())
    }

    fn watch_auto_select_enabled(&self) -> watch::Receiver<bool> {
        self.auto_select.subscribe()
    }

    async fn set_auto_select_enabled(&self, enabled: bool) -> Result<(), RelayError> {
        self.check_writes()?;
        self.auto_select.send_replace(enabled);
        Ok(())
    }

    async fn manual_node_id(&self) -> Result<Option<NodeId>, RelayError> {
        Ok(*self.manual_node_id.borrow())
    }

    fn watch_manual_node_id(&self) -> watch::Receiver<Option<NodeId>> {
        self.manual_node_id.subscribe()
    }

    async fn set_manual_node_id(&self, node_id: Option<NodeId>) -> Result<(), RelayError> {
        self.check_writes()?;
        if *lock(&self.fail_manual_writes) {
            return Err(RelayError::Settings(
                "memory: manual relay write failed".into(),
            ));
        }
        self.manual_node_id.send_replace(node_id);
        Ok(())
    }

    async fn last_sync_timestamp(&self) -> Result<Option<u64>, RelayError> {
        Ok(*self.last_sync.borrow())
    }

    fn watch_last_sync_timestamp(&self) -> watch::Receiver<Option<u64>> {
        self.last_sync.subscribe()
    }

    async fn set_last_sync_timestamp(&self, timestamp_ms: u64) -> Result<(), RelayError> {
        self.check_writes()?;
        self.last_sync.send_replace(Some(timestamp_ms));
        Ok(())
    }

    async fn sync_interval(&self) -> Result<Duration, RelayError> {
        Ok(*self.sync_interval.borrow())
    }

    fn watch_sync_interval(&self) -> watch::Receiver<Duration> {
        self.sync_interval.subscribe()
    }

    async fn set_sync_interval(&self, interval: Duration) -> Result<(), RelayError> {
        self.check_writes()?;
        self.sync_interval.send_replace(interval);
        Ok(())
    }
}

// ── Network transport ─────────────────────────────────────────────────

/// How [`MemoryTransport`] answers `request_stored_messages`.
#[derive(Debug, Clone)]
pub enum RequestBehaviour {
    /// Return a complete state straight from the request call.
    CompleteImmediately { messages: u32 },
    /// Return `RequestSent`, then report completion after `delay`.
    CompleteAfter { delay: Duration, messages: u32 },
    /// Return `RequestSent`, then play these states in order.
    Script(Vec<SyncState>),
    /// Fail the request call itself.
    Fail(String),
    /// Return `PathRequested` and never report anything else.
    Hang,
}

pub struct MemoryTransport {
    status: watch::Sender<NetworkStatus>,
    progress: broadcast::Sender<SyncState>,
    behaviour: Mutex<RequestBehaviour>,
    outbound_calls: Mutex<Vec<Option<NodeId>>>,
    requests: AtomicUsize,
    fail_outbound: Mutex<bool>,
}

impl MemoryTransport {
    /// A ready transport whose requests complete immediately with no messages.
    pub fn new() -> Self {
        Self {
            status: watch::channel(NetworkStatus::Ready).0,
            progress: broadcast::channel(EVENT_CAPACITY).0,
            behaviour: Mutex::new(RequestBehaviour::CompleteImmediately { messages: 0 }),
            outbound_calls: Mutex::new(Vec::new()),
            requests: AtomicUsize::new(0),
            fail_outbound: Mutex::new(false),
        }
    }

    pub fn set_status(&self, status: NetworkStatus) {
        self.status.send_replace(status);
    }

    pub fn set_behaviour(&self, behaviour: RequestBehaviour) {
        *lock(&self.behaviour) = behaviour;
    }

    pub fn set_fail_outbound(&self, fail: bool) {
        *lock(&self.fail_outbound) = fail;
    }

    /// Push a progress event as if the network layer reported it.
    pub fn emit_progress(&self, state: SyncState) {
        let _ = self.progress.send(state);
    }

    /// Every `set_outbound_relay` argument that succeeded, in call order.
    pub fn outbound_calls(&self) -> Vec<Option<NodeId>> {
        lock(&self.outbound_calls).clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl NetworkTransport for MemoryTransport {
    fn network_status(&self) -> watch::Receiver<NetworkStatus> {
        self.status.subscribe()
    }

    async fn set_outbound_relay(&self, node_id: Option<NodeId>) -> Result<(), RelayError> {
        if *lock(&self.fail_outbound) {
            return Err(RelayError::Transport(
                "memory: outbound relay rejected".into(),
            ));
        }
        lock(&self.outbound_calls).push(node_id);
        Ok(())
    }

    async fn request_stored_messages(&self) -> Result<SyncState, RelayError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let behaviour = lock(&self.behaviour).clone();
        let sent = SyncState::new(SyncPhase::RequestSent, 0.0, 0);

        match behaviour {
            RequestBehaviour::CompleteImmediately { messages } => Ok(SyncState::complete(messages)),
            RequestBehaviour::CompleteAfter { delay, messages } => {
                let progress = self.progress.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = progress.send(SyncState::new(SyncPhase::Receiving, 0.5, 0));
                    let _ = progress.send(SyncState::complete(messages));
                });
                Ok(sent)
            }
            RequestBehaviour::Script(states) => {
                let progress = self.progress.clone();
                tokio::spawn(async move {
                    for state in states {
                        tokio::task::yield_now().await;
                        let _ = progress.send(state);
                    }
                });
                Ok(sent)
            }
            RequestBehaviour::Fail(reason) => Err(RelayError::Transport(reason)),
            RequestBehaviour::Hang => Ok(SyncState::new(SyncPhase::PathRequested, 0.0, 0)),
        }
    }

    fn sync_progress(&self) -> broadcast::Receiver<SyncState> {
        self.progress.subscribe()
    }
}

/// Bundle of in-memory collaborators sharing nothing but the caller's handles.
#[derive(Clone)]
pub struct MemoryWorld {
    pub announces: Arc<MemoryAnnounceRepository>,
    pub contacts: Arc<MemoryContactStore>,
    pub settings: Arc<MemorySettingsStore>,
    pub transport: Arc<MemoryTransport>,
}

impl MemoryWorld {
    pub fn new() -> Self {
        Self {
            announces: Arc::new(MemoryAnnounceRepository::new()),
            contacts: Arc::new(MemoryContactStore::new()),
            settings: Arc::new(MemorySettingsStore::new()),
            transport: Arc::new(MemoryTransport::new()),
        }
    }

    pub fn collaborators(&self) -> crate::Collaborators {
        crate::Collaborators {
            announces: self.announces.clone(),
            contacts: self.contacts.clone(),
            settings: self.settings.clone(),
            transport: self.transport.clone(),
        }
    }
}

impl Default for MemoryWorld {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NODE_ID_LEN;

    fn node_id(seed: u8) -> NodeId {
        NodeId::from_bytes([seed; NODE_ID_LEN])
    }

    #[tokio::test]
    async fn set_as_relay_clears_others() {
        let store = MemoryContactStore::new();
        store
            .add_from_announce(&node_id(1), &[1; 32])
            .await
            .unwrap();
        store
            .add_from_announce(&node_id(2), &[2; 32])
            .await
            .unwrap();

        store.set_as_relay(&node_id(1), true).await.unwrap();
        store.set_as_relay(&node_id(2), true).await.unwrap();

        let flagged: Vec<_> = store
            .contacts()
            .into_iter()
            .filter(|c| c.is_my_relay)
            .collect();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].node_id, node_id(2));
        assert_eq!(
            store.my_relay().borrow().as_ref().map(|c| c.node_id),
            Some(node_id(2))
        );
    }

    #[tokio::test]
    async fn set_as_relay_requires_contact() {
        let store = MemoryContactStore::new();
        assert!(store.set_as_relay(&node_id(9), true).await.is_err());
        assert!(store.my_relay().borrow().is_none());
    }

    #[tokio::test]
    async fn add_pending_is_idempotent() {
        let store = MemoryContactStore::new();
        let first = store.add_pending(&node_id(3), Some("home")).await.unwrap();
        let second = store.add_pending(&node_id(3), None).await.unwrap();
        assert_eq!(first, PendingOutcome::AddedAsPending);
        assert_eq!(second, PendingOutcome::AlreadyExists);
        assert_eq!(
            store.contact(&node_id(3)).unwrap().status,
            ContactStatus::Pending
        );
    }

    #[tokio::test]
    async fn removing_relay_contact_clears_stream() {
        let store = MemoryContactStore::new();
        store
            .add_from_announce(&node_id(1), &[1; 32])
            .await
            .unwrap();
        store.set_as_relay(&node_id(1), true).await.unwrap();
        store.remove(&node_id(1));
        assert!(store.my_relay().borrow().is_none());
    }

    #[tokio::test]
    async fn announce_upserts_and_emits() {
        let repo = MemoryAnnounceRepository::new();
        let mut events = repo.announces();
        let mut candidate = RelayCandidate {
            node_id: node_id(4),
            display_name: "a".into(),
            hops: Some(2),
            public_key: vec![4; 32],
            last_seen: 1,
        };
        repo.announce(candidate.clone());
        candidate.hops = Some(1);
        repo.announce(candidate.clone());

        assert_eq!(repo.propagation_nodes().borrow().len(), 1);
        assert_eq!(repo.get(&node_id(4)).await.unwrap().unwrap().hops, Some(1));
        assert_eq!(events.recv().await.unwrap().hops, Some(2));
        assert_eq!(events.recv().await.unwrap().hops, Some(1));
    }

    #[tokio::test]
    async fn transport_records_outbound_calls() {
        let transport = MemoryTransport::new();
        transport.set_outbound_relay(Some(node_id(1))).await.unwrap();
        transport.set_outbound_relay(None).await.unwrap();
        transport.set_fail_outbound(true);
        assert!(transport
            .set_outbound_relay(Some(node_id(2)))
            .await
            .is_err());
        assert_eq!(transport.outbound_calls(), vec![Some(node_id(1)), None]);
    }
}
