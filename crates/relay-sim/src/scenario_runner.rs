/// Runs every scenario in turn and closes with one summary record.
use std::future::Future;
use std::time::Instant;

use serde::Serialize;

use crate::output::emit;
use crate::scenario_churn::ChurnConfig;
use crate::scenario_common::{ScenarioResult, SimOptions, StepResult};
use crate::{scenario_auto, scenario_churn, scenario_failover, scenario_manual, scenario_sync};

#[derive(Serialize)]
struct RunSummary<'a> {
    event: &'static str,
    passed: Vec<&'a str>,
    failed: Vec<&'a str>,
    steps_passed: usize,
    steps_failed: usize,
    elapsed_ms: f64,
}

impl<'a> RunSummary<'a> {
    fn new(results: &'a [ScenarioResult], start: Instant) -> Self {
        let (passed, failed): (Vec<_>, Vec<_>) = results.iter().partition(|r| r.success());
        Self {
            event: "run_summary",
            passed: passed.into_iter().map(|r| r.scenario.as_str()).collect(),
            failed: failed.into_iter().map(|r| r.scenario.as_str()).collect(),
            steps_passed: results.iter().map(|r| r.passed).sum(),
            steps_failed: results.iter().map(|r| r.failed).sum(),
            elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
        }
    }
}

/// Returns `false` when any scenario failed.
pub async fn run(opts: &SimOptions, churn: &ChurnConfig) -> bool {
    let start = Instant::now();
    let results = [
        run_one("auto-select", scenario_auto::run(opts)).await,
        run_one("manual-pin", scenario_manual::run(opts)).await,
        run_one("failover", scenario_failover::run(opts)).await,
        run_one("sync", scenario_sync::run(opts)).await,
        run_one("churn", scenario_churn::run(opts, churn)).await,
    ];

    let summary = RunSummary::new(&results, start);
    emit(&summary);

    eprintln!(
        "\n{}/{} scenarios passed, {} failed steps, {:.1}ms",
        summary.passed.len(),
        results.len(),
        summary.steps_failed,
        summary.elapsed_ms
    );
    for name in &summary.failed {
        eprintln!("  failed: {name}");
    }
    summary.failed.is_empty()
}

/// Run and report one scenario. A scenario that cannot set up counts as
/// a single failed step.
async fn run_one(
    name: &str,
    scenario: impl Future<Output = anyhow::Result<ScenarioResult>>,
) -> ScenarioResult {
    eprintln!("\n── {name}");
    let result = scenario.await.unwrap_or_else(|e| {
        let mut failed = ScenarioResult::new(name);
        failed.add(StepResult {
            step: "setup".into(),
            ok: false,
            elapsed_ms: 0.0,
            detail: Some(format!("{e:#}")),
        });
        failed
    });
    result.print_summary();
    result.emit_jsonl();
    result
}
