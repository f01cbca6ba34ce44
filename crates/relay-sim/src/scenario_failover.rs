/// Failover scenario: the relay contact is deleted, the next closest node
/// takes over without the deleted one ever being re-flagged, then the
/// relay is cleared and the transport follows.
use std::time::Instant;

use relay_manager::SelectionOutcome;

use crate::scenario_common::{
    candidate, node_id, timed_step_async, ScenarioResult, Sim, SimOptions,
};

pub async fn run(opts: &SimOptions) -> anyhow::Result<ScenarioResult> {
    let mut result = ScenarioResult::new("failover");
    let start = Instant::now();
    let sim = Sim::new(opts)?;

    let (primary, backup, distant) = (node_id(0x01), node_id(0x02), node_id(0x03));
    sim.world.announces.insert_silently(candidate(primary, "primary", Some(1)));
    sim.world.announces.insert_silently(candidate(backup, "backup", Some(3)));
    sim.world.announces.insert_silently(candidate(distant, "distant", Some(7)));
    sim.manager.start();

    let step = timed_step_async("startup scan adopts closest", || async {
        sim.wait_relay(Some(primary)).await?;
        sim.wait_outbound(Some(primary)).await?;
        Ok(format!("relay {}", primary.short()))
    })
    .await;
    result.add(step);

    let step = timed_step_async("delete relay, fail over", || async {
        let flagged_before = sim.world.contacts.relay_assignments().len();
        sim.world.contacts.remove(&primary);
        let outcome = sim.manager.on_relay_deleted(true, Some(primary)).await;
        if outcome != (SelectionOutcome::Adopted { node_id: backup }) {
            return Err(format!("unexpected outcome {outcome:?}"));
        }
        let later = &sim.world.contacts.relay_assignments()[flagged_before..];
        if later.contains(&primary) {
            return Err("deleted relay was flagged again".into());
        }
        sim.wait_relay(Some(backup)).await?;
        sim.wait_outbound(Some(backup)).await?;
        Ok(format!("relay {}", backup.short()))
    })
    .await;
    result.add(step);

    let step = timed_step_async("clear relay", || async {
        let calls_before = sim.world.transport.outbound_calls().len();
        if sim.manager.clear_relay().await != SelectionOutcome::Cleared {
            return Err("clear_relay did not clear".into());
        }
        sim.wait_relay(None).await?;
        sim.wait_outbound(None).await?;
        let cleared = sim.world.transport.outbound_calls()[calls_before..]
            .iter()
            .filter(|c| c.is_none())
            .count();
        if cleared == 1 {
            Ok(String::new())
        } else {
            Err(format!("{cleared} clear calls reached the transport"))
        }
    })
    .await;
    result.add(step);

    sim.manager.stop();
    result.finalize(start);
    Ok(result)
}
