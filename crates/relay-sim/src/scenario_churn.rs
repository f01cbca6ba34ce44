/// Churn scenario: a seeded stream of announces from random nodes at random
/// distances. Whatever the order, the relay must end on a closest node and
/// the transport on the same node.
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use relay_manager::{compare_hops, NodeId, NODE_ID_LEN};

use crate::scenario_common::{
    candidate, describe, timed_step_async, ScenarioResult, Sim, SimOptions,
};

pub struct ChurnConfig {
    pub announces: u32,
    pub seed: u64,
}

pub async fn run(opts: &SimOptions, churn: &ChurnConfig) -> anyhow::Result<ScenarioResult> {
    let mut result = ScenarioResult::new("churn");
    let start = Instant::now();
    let sim = Sim::new(opts)?;
    sim.manager.start();

    let mut rng = StdRng::seed_from_u64(churn.seed);
    let mut best: Option<(NodeId, Option<u32>)> = None;

    let step = timed_step_async("announce stream", || async {
        for i in 0..churn.announces {
            let id = NodeId::from_bytes(rng.random::<[u8; NODE_ID_LEN]>());
            // Roughly one in eight announces carries no distance.
            let hops = if rng.random_ratio(1, 8) {
                None
            } else {
                Some(rng.random_range(0..12u32))
            };
            sim.world
                .announces
                .announce(candidate(id, &format!("node-{i}"), hops));

            let closer = best.is_none_or(|(_, best_hops)| compare_hops(hops, best_hops).is_lt());
            if closer {
                best = Some((id, hops));
            }
            // Give the listener a chance to interleave with the stream.
            if i % 8 == 0 {
                tokio::task::yield_now().await;
            }
        }
        Ok(format!("{} announces, seed {}", churn.announces, churn.seed))
    })
    .await;
    result.add(step);

    let expected = best.map(|(id, _)| id);
    let expected_hops = best.and_then(|(_, hops)| hops);

    let step = timed_step_async("relay settles on a closest node", || async {
        sim.wait_relay(expected).await?;
        sim.wait_outbound(expected).await?;
        let info = sim.manager.current_relay().borrow().clone();
        match info {
            Some(info) if info.hops == expected_hops => Ok(format!(
                "{} at {} hops",
                describe(expected),
                info.hop_count_or_unknown()
            )),
            None if expected.is_none() => Ok("no announces".into()),
            other => Err(format!("unexpected projection {other:?}")),
        }
    })
    .await;
    result.add(step);

    let step = timed_step_async("at most one relay flag", || async {
        let flagged = sim
            .world
            .contacts
            .contacts()
            .iter()
            .filter(|c| c.is_my_relay)
            .count();
        if flagged <= 1 {
            Ok(format!("{} adoptions", sim.manager.metrics().adoptions))
        } else {
            Err(format!("{flagged} contacts flagged as relay"))
        }
    })
    .await;
    result.add(step);

    sim.manager.stop();
    result.finalize(start);
    Ok(result)
}
