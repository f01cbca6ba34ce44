/// Auto-select scenario: first announce adopted, equal distance ignored,
/// closer node wins, and the transport follows every switch.
use std::time::Instant;

use relay_manager::SelectionMode;

use crate::scenario_common::{
    candidate, describe, node_id, settle, timed_step_async, ScenarioResult, Sim, SimOptions,
};

pub async fn run(opts: &SimOptions) -> anyhow::Result<ScenarioResult> {
    let mut result = ScenarioResult::new("auto-select");
    let start = Instant::now();
    let sim = Sim::new(opts)?;
    sim.manager.start();

    let (a, b, c) = (node_id(0xa1), node_id(0xb2), node_id(0xc3));

    let step = timed_step_async("starts in auto mode", || async {
        match sim.manager.selection_mode().await {
            Some(SelectionMode::Auto) => Ok(String::new()),
            other => Err(format!("unexpected mode {other:?}")),
        }
    })
    .await;
    result.add(step);

    let step = timed_step_async("first announce adopted", || async {
        sim.world.announces.announce(candidate(a, "alpha", Some(4)));
        sim.wait_relay(Some(a)).await?;
        sim.wait_outbound(Some(a)).await?;
        Ok(format!("relay {}", a.short()))
    })
    .await;
    result.add(step);

    let step = timed_step_async("equal distance keeps incumbent", || async {
        sim.world.announces.announce(candidate(b, "bravo", Some(4)));
        settle().await;
        if sim.world.contacts.relay_assignments().contains(&b) {
            return Err("bravo was flagged as relay".into());
        }
        match sim.flagged_relay() {
            Some(id) if id == a => Ok(String::new()),
            other => Err(format!("relay is {}", describe(other))),
        }
    })
    .await;
    result.add(step);

    let step = timed_step_async("closer node switches", || async {
        sim.world.announces.announce(candidate(c, "charlie", Some(2)));
        sim.wait_relay(Some(c)).await?;
        sim.wait_outbound(Some(c)).await?;
        let info = sim.manager.current_relay().borrow().clone();
        match info {
            Some(info) if info.display_name == "charlie" && info.hops == Some(2) => {
                Ok(format!("{} at {} hops", info.display_name, info.hop_count_or_unknown()))
            }
            other => Err(format!("unexpected projection {other:?}")),
        }
    })
    .await;
    result.add(step);

    let step = timed_step_async("available relays ranked", || async {
        settle().await;
        let available = sim.manager.available_relays().borrow().clone();
        match available {
            relay_manager::AvailableRelaysState::Loaded(list) => {
                let order: Vec<_> = list.iter().map(|r| r.node_id).collect();
                if order == vec![c, a, b] {
                    Ok(format!("{} candidates", order.len()))
                } else {
                    Err(format!("unexpected order {order:?}"))
                }
            }
            relay_manager::AvailableRelaysState::Loading => Err("still loading".into()),
        }
    })
    .await;
    result.add(step);

    sim.manager.stop();
    result.finalize(start);
    Ok(result)
}
