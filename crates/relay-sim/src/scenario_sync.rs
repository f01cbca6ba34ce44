/// Sync scenario: no-relay short circuit, readiness gate on the background
/// path, coalescing, bounded wait and failure phases.
use std::time::{Duration, Instant};

use relay_manager::memory::RequestBehaviour;
use relay_manager::{NetworkStatus, SyncPhase, SyncResult, SyncState};

use crate::scenario_common::{node_id, timed_step_async, ScenarioResult, Sim, SimOptions};

pub async fn run(opts: &SimOptions) -> anyhow::Result<ScenarioResult> {
    let mut result = ScenarioResult::new("sync");
    let start = Instant::now();

    // Short bound so the stuck-transfer step finishes quickly.
    let opts = SimOptions {
        config: opts.config.clone().sync_timeout(Duration::from_millis(300)),
        ..opts.clone()
    };
    let sim = Sim::new(&opts)?;
    sim.world.transport.set_status(NetworkStatus::Initializing);
    sim.manager.start();

    let step = timed_step_async("no relay, no request", || async {
        match sim.manager.trigger_sync().await {
            Some(SyncResult::NoRelay) if sim.world.transport.request_count() == 0 => {
                Ok(String::new())
            }
            other => Err(format!("unexpected {other:?}")),
        }
    })
    .await;
    result.add(step);

    let relay = node_id(0x5e);
    sim.manager
        .set_manual_relay_by_hash(relay, Some("store"))
        .await;
    sim.wait_relay(Some(relay))
        .await
        .map_err(anyhow::Error::msg)?;

    let step = timed_step_async("background sync waits for network", || async {
        if sim.manager.sync_with_propagation_node().await.is_some() {
            return Err("sync ran while network initializing".into());
        }
        if sim.world.transport.request_count() != 0 {
            return Err("transport contacted while initializing".into());
        }
        sim.world.transport.set_status(NetworkStatus::Ready);
        sim.world.transport.set_behaviour(RequestBehaviour::CompleteAfter {
            delay: Duration::from_millis(20),
            messages: 5,
        });
        match sim.manager.sync_with_propagation_node().await {
            Some(SyncResult::Success { messages_received }) => {
                Ok(format!("{messages_received} messages"))
            }
            other => Err(format!("unexpected {other:?}")),
        }
    })
    .await;
    result.add(step);

    let step = timed_step_async("concurrent triggers coalesce", || async {
        let before = sim.world.transport.request_count();
        let (x, y) = tokio::join!(sim.manager.trigger_sync(), sim.manager.trigger_sync());
        let issued = sim.world.transport.request_count() - before;
        let results = [x, y].iter().filter(|r| r.is_some()).count();
        if issued == 1 && results == 1 {
            Ok(String::new())
        } else {
            Err(format!("{issued} requests, {results} results"))
        }
    })
    .await;
    result.add(step);

    let step = timed_step_async("stuck transfer ends pending", || async {
        sim.world.transport.set_behaviour(RequestBehaviour::Hang);
        match sim.manager.trigger_sync().await {
            Some(SyncResult::Pending) if !sim.manager.is_syncing() => Ok(String::new()),
            other => Err(format!("unexpected {other:?}")),
        }
    })
    .await;
    result.add(step);

    let step = timed_step_async("failure phase reported", || async {
        sim.world.transport.set_behaviour(RequestBehaviour::Script(vec![
            SyncState::new(SyncPhase::LinkEstablishing, 0.1, 0),
            SyncState::new(SyncPhase::LinkFailed, 0.0, 0),
        ]));
        match sim.manager.trigger_sync().await {
            Some(SyncResult::Error { message }) => Ok(message),
            other => Err(format!("unexpected {other:?}")),
        }
    })
    .await;
    result.add(step);

    let step = timed_step_async("metrics", || async {
        let snap = sim.manager.metrics();
        let json = serde_json::to_string(&snap).map_err(|e| e.to_string())?;
        if snap.syncs_succeeded >= 2 && snap.syncs_pending == 1 && snap.syncs_failed == 1 {
            Ok(json)
        } else {
            Err(json)
        }
    })
    .await;
    result.add(step);

    sim.manager.stop();
    result.finalize(start);
    Ok(result)
}

