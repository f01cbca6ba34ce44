//! Manager lifecycle and relay propagation to the transport.

use std::time::Duration;

use relay_manager::memory::{MemoryTransport, MemoryWorld};
use relay_manager::{
    AvailableRelaysState, NodeId, RelayCandidate, RelayManager, RelayManagerConfig, RelayState,
    SelectionOutcome, NODE_ID_LEN,
};

fn node_id(seed: u8) -> NodeId {
    NodeId::from_bytes([seed; NODE_ID_LEN])
}

fn candidate(seed: u8, name: &str, hops: Option<u32>) -> RelayCandidate {
    RelayCandidate {
        node_id: node_id(seed),
        display_name: name.to_string(),
        hops,
        public_key: vec![seed; 32],
        last_seen: 1_000,
    }
}

fn manager(world: &MemoryWorld) -> RelayManager {
    RelayManager::new(world.collaborators(), RelayManagerConfig::new())
}

/// Poll until `cond` holds, for up to two seconds.
async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Poll until the last outbound relay pushed to `transport` is `expected`.
async fn outbound_becomes(transport: &MemoryTransport, expected: Option<NodeId>) -> bool {
    eventually(|| transport.outbound_calls().last() == Some(&expected)).await
}

#[tokio::test]
async fn adopted_relay_reaches_transport() {
    let world = MemoryWorld::new();
    let manager = manager(&world);
    manager.start();

    world.announces.announce(candidate(0x01, "alpha", Some(2)));

    let transport = world.transport.clone();
    assert!(outbound_becomes(&transport, Some(node_id(0x01))).await);
    assert!(manager.metrics().outbound_relay_pushes >= 1);
    manager.stop();
}

#[tokio::test]
async fn clearing_relay_clears_transport_exactly_once() {
    let world = MemoryWorld::new();
    let manager = manager(&world);
    manager.start();
    manager.set_manual_relay_by_hash(node_id(0x02), None).await;

    let transport = world.transport.clone();
    assert!(outbound_becomes(&transport, Some(node_id(0x02))).await);
    let before = transport.outbound_calls().len();

    assert_eq!(manager.clear_relay().await, SelectionOutcome::Cleared);

    let pushed_again = || transport.outbound_calls().len() > before;
    assert!(eventually(pushed_again).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.outbound_calls()[before..], [None]);
    assert!(manager.current_relay().borrow().is_none());
    manager.stop();
}

#[tokio::test]
async fn metadata_refresh_does_not_reconfigure_transport() {
    let world = MemoryWorld::new();
    let manager = manager(&world);
    manager.start();

    world.announces.announce(candidate(0x03, "before", Some(3)));
    let transport = world.transport.clone();
    assert!(outbound_becomes(&transport, Some(node_id(0x03))).await);
    let before = transport.outbound_calls().len();

    world.announces.announce(candidate(0x03, "after", Some(1)));
    let mut current = manager.current_relay();
    tokio::time::timeout(
        Duration::from_secs(2),
        current.wait_for(|r| r.as_ref().is_some_and(|i| i.display_name == "after")),
    )
    .await
    .expect("renamed relay not projected")
    .unwrap();

    assert_eq!(current.borrow().as_ref().unwrap().hops, Some(1));
    assert_eq!(transport.outbound_calls().len(), before);
    manager.stop();
}

#[tokio::test]
async fn transport_failure_does_not_stop_propagation() {
    let world = MemoryWorld::new();
    let manager = manager(&world);
    world.transport.set_fail_outbound(true);
    manager.start();

    manager.set_manual_relay_by_hash(node_id(0x04), None).await;
    let mut state = manager.relay_state();
    tokio::time::timeout(
        Duration::from_secs(2),
        state.wait_for(|s| s.relay().is_some()),
    )
    .await
    .unwrap()
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(world.transport.outbound_calls().is_empty());

    world.transport.set_fail_outbound(false);
    manager.set_manual_relay_by_hash(node_id(0x05), None).await;

    let transport = world.transport.clone();
    assert!(outbound_becomes(&transport, Some(node_id(0x05))).await);
    assert_eq!(transport.outbound_calls(), vec![Some(node_id(0x05))]);
    manager.stop();
}

#[tokio::test]
async fn projection_falls_back_when_lookup_fails() {
    let world = MemoryWorld::new();
    world.announces.set_fail_lookups(true);
    let manager = manager(&world);
    manager.start();

    manager
        .set_manual_relay_by_hash(node_id(0x06), Some("fallback"))
        .await;

    let mut current = manager.current_relay();
    tokio::time::timeout(Duration::from_secs(2), current.wait_for(|r| r.is_some()))
        .await
        .unwrap()
        .unwrap();
    let info = current.borrow().clone().unwrap();
    assert_eq!(info.display_name, "fallback");
    assert_eq!(info.hop_count_or_unknown(), -1);
    manager.stop();
}

#[tokio::test]
async fn available_relays_are_ranked() {
    let world = MemoryWorld::new();
    world.announces.insert_silently(candidate(0x0a, "far", Some(6)));
    world.announces.insert_silently(candidate(0x0b, "unknown", None));
    world.announces.insert_silently(candidate(0x0c, "near", Some(1)));
    let manager = manager(&world);
    assert_eq!(
        *manager.available_relays().borrow(),
        AvailableRelaysState::Loading
    );
    manager.start();

    let mut available = manager.available_relays();
    let ranked = tokio::time::timeout(
        Duration::from_secs(2),
        available.wait_for(|a| matches!(a, AvailableRelaysState::Loaded(list) if list.len() == 3)),
    )
    .await
    .unwrap()
    .unwrap()
    .clone();

    let AvailableRelaysState::Loaded(list) = ranked else {
        unreachable!()
    };
    let order: Vec<_> = list.iter().map(|c| c.node_id).collect();
    assert_eq!(order, vec![node_id(0x0c), node_id(0x0a), node_id(0x0b)]);
    manager.stop();
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let world = MemoryWorld::new();
    let manager = manager(&world);

    manager.stop();
    manager.start();
    manager.start();
    assert!(manager.is_started());

    let mut state = manager.relay_state();
    tokio::time::timeout(
        Duration::from_secs(2),
        state.wait_for(RelayState::is_loaded),
    )
    .await
    .unwrap()
    .unwrap();

    manager.stop();
    manager.stop();
    assert!(!manager.is_started());

    manager.start();
    assert!(manager.is_started());
    let mut state = manager.relay_state();
    tokio::time::timeout(
        Duration::from_secs(2),
        state.wait_for(RelayState::is_loaded),
    )
    .await
    .unwrap()
    .unwrap();
    manager.stop();
}

#[tokio::test]
async fn stopped_manager_ignores_announces() {
    let world = MemoryWorld::new();
    let manager = manager(&world);
    manager.start();
    manager.stop();

    world.announces.announce(candidate(0x0d, "late", Some(1)));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(world.contacts.relay_assignments().is_empty());
}

#[test]
fn start_outside_runtime_is_a_no_op() {
    let world = MemoryWorld::new();
    let manager = manager(&world);
    manager.start();
    assert!(!manager.is_started());
    manager.stop();
}
