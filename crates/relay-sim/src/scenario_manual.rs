/// Manual pin scenario: a pinned relay survives closer announces until
/// auto-select is switched back on.
use std::time::Instant;

use relay_manager::{ContactStatus, SelectionMode, SelectionOutcome};

use crate::scenario_common::{
    candidate, describe, node_id, settle, timed_step_async, ScenarioResult, Sim, SimOptions,
};

pub async fn run(opts: &SimOptions) -> anyhow::Result<ScenarioResult> {
    let mut result = ScenarioResult::new("manual-pin");
    let start = Instant::now();
    let sim = Sim::new(opts)?;
    sim.manager.start();

    let pinned = node_id(0x4d);
    let close = node_id(0x0c);

    let step = timed_step_async("pin relay by hash", || async {
        let outcome = sim
            .manager
            .set_manual_relay_by_hash(pinned, Some("home relay"))
            .await;
        if outcome != (SelectionOutcome::Adopted { node_id: pinned }) {
            return Err(format!("unexpected outcome {outcome:?}"));
        }
        sim.wait_relay(Some(pinned)).await?;
        sim.wait_outbound(Some(pinned)).await?;
        match sim.world.contacts.contact(&pinned) {
            Some(contact) if contact.status == ContactStatus::Pending => {
                Ok("pending contact created".into())
            }
            other => Err(format!("unexpected contact {other:?}")),
        }
    })
    .await;
    result.add(step);

    let step = timed_step_async("closer announce ignored", || async {
        sim.world.announces.announce(candidate(close, "close", Some(0)));
        settle().await;
        match sim.flagged_relay() {
            Some(id) if id == pinned => Ok(String::new()),
            other => Err(format!("relay moved to {}", describe(other))),
        }
    })
    .await;
    result.add(step);

    let step = timed_step_async("mode reports manual pin", || async {
        match sim.manager.selection_mode().await {
            Some(SelectionMode::Manual(Some(id))) if id == pinned => Ok(String::new()),
            other => Err(format!("unexpected mode {other:?}")),
        }
    })
    .await;
    result.add(step);

    let step = timed_step_async("re-enable auto-select", || async {
        let outcome = sim.manager.enable_auto_select().await;
        if outcome != (SelectionOutcome::Adopted { node_id: close }) {
            return Err(format!("unexpected outcome {outcome:?}"));
        }
        sim.wait_relay(Some(close)).await?;
        sim.wait_outbound(Some(close)).await?;
        let manual = sim
            .settings
            .manual_node_id()
            .await
            .map_err(|e| e.to_string())?;
        if manual.is_some() {
            return Err("manual relay setting not cleared".into());
        }
        Ok(format!("relay {}", close.short()))
    })
    .await;
    result.add(step);

    sim.manager.stop();
    result.finalize(start);
    Ok(result)
}
