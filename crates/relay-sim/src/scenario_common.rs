/// Common types and helpers for relay scenarios.
use std::sync::Arc;
use std::time::{Duration, Instant};

use relay_manager::memory::MemoryWorld;
use relay_manager::{
    NodeId, RelayCandidate, RelayManager, RelayManagerConfig, SettingsStore, SqliteSettingsStore,
    NODE_ID_LEN,
};
use serde::Serialize;

use crate::output::emit;

/// Upper bound for any single wait inside a step.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a scenario step.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step: String,
    pub ok: bool,
    pub elapsed_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Result of a full scenario run.
#[derive(Debug, Serialize)]
pub struct ScenarioResult {
    pub scenario: String,
    pub steps: Vec<StepResult>,
    pub total_ms: f64,
    pub passed: usize,
    pub failed: usize,
}

impl ScenarioResult {
    pub fn new(scenario: &str) -> Self {
        Self {
            scenario: scenario.into(),
            steps: Vec::new(),
            total_ms: 0.0,
            passed: 0,
            failed: 0,
        }
    }

    pub fn add(&mut self, step: StepResult) {
        if step.ok {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        self.steps.push(step);
    }

    pub fn finalize(&mut self, start: Instant) {
        self.total_ms = start.elapsed().as_secs_f64() * 1000.0;
    }

    pub fn success(&self) -> bool {
        self.failed == 0
    }

    pub fn print_summary(&self) {
        let icon = if self.success() { "PASS" } else { "FAIL" };
        eprintln!("\n[{icon}] Scenario: {} ({:.1}ms)", self.scenario, self.total_ms);
        eprintln!("  {} passed, {} failed", self.passed, self.failed);
        for step in &self.steps {
            let mark = if step.ok { " ok" } else { "FAIL" };
            eprint!("  [{mark}] {} ({:.1}ms)", step.step, step.elapsed_ms);
            if let Some(detail) = &step.detail {
                eprint!(": {detail}");
            }
            eprintln!();
        }
    }

    pub fn emit_jsonl(&self) {
        emit(self);
    }
}

/// Run a timed async step.
pub async fn timed_step_async<F, Fut>(name: &str, f: F) -> StepResult
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<String, String>>,
{
    let start = Instant::now();
    let outcome = f().await;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    match outcome {
        Ok(detail) => StepResult {
            step: name.into(),
            ok: true,
            elapsed_ms,
            detail: if detail.is_empty() { None } else { Some(detail) },
        },
        Err(detail) => {
            tracing::warn!(step = name, "step failed: {detail}");
            StepResult {
                step: name.into(),
                ok: false,
                elapsed_ms,
                detail: Some(detail),
            }
        }
    }
}

// ── Simulated peer ────────────────────────────────────────────────────

/// Options shared by every scenario.
#[derive(Clone)]
pub struct SimOptions {
    pub config: RelayManagerConfig,
    /// Keep settings in an in-memory SQLite database instead of the memory store.
    pub sqlite_settings: bool,
}

/// One peer: in-memory collaborators plus a manager wired to them.
pub struct Sim {
    pub world: MemoryWorld,
    pub settings: Arc<dyn SettingsStore>,
    pub manager: RelayManager,
}

impl Sim {
    pub fn new(opts: &SimOptions) -> anyhow::Result<Self> {
        let world = MemoryWorld::new();
        let mut collaborators = world.collaborators();
        if opts.sqlite_settings {
            collaborators.settings = Arc::new(SqliteSettingsStore::open_in_memory()?);
        }
        let settings = collaborators.settings.clone();
        let manager = RelayManager::new(collaborators, opts.config.clone());
        Ok(Self {
            world,
            settings,
            manager,
        })
    }

    /// Node the contact store currently flags as relay.
    pub fn flagged_relay(&self) -> Option<NodeId> {
        use relay_manager::ContactStore;
        self.world
            .contacts
            .my_relay()
            .borrow()
            .as_ref()
            .map(|c| c.node_id)
    }

    /// Wait until the projected relay is `expected`.
    pub async fn wait_relay(&self, expected: Option<NodeId>) -> Result<(), String> {
        let mut rx = self.manager.current_relay();
        let waited = tokio::time::timeout(
            STEP_TIMEOUT,
            rx.wait_for(|r| r.as_ref().map(|i| i.node_id) == expected),
        )
        .await;
        match waited {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err("relay channel closed".into()),
            Err(_) => Err(format!("timeout waiting for relay {}", describe(expected))),
        }
    }

    /// Wait until the transport's last outbound relay call is `expected`.
    pub async fn wait_outbound(&self, expected: Option<NodeId>) -> Result<(), String> {
        let deadline = Instant::now() + STEP_TIMEOUT;
        while Instant::now() < deadline {
            if self.world.transport.outbound_calls().last() == Some(&expected) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Err(format!(
            "transport outbound relay never became {}",
            describe(expected)
        ))
    }
}

/// Let listeners drain queued events.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub fn node_id(seed: u8) -> NodeId {
    NodeId::from_bytes([seed; NODE_ID_LEN])
}

pub fn candidate(node_id: NodeId, name: &str, hops: Option<u32>) -> RelayCandidate {
    RelayCandidate {
        node_id,
        display_name: name.to_string(),
        hops,
        public_key: node_id.as_bytes().repeat(2),
        last_seen: relay_manager::now_ms(),
    }
}

pub fn describe(node: Option<NodeId>) -> String {
    node.map_or_else(|| "none".to_string(), |id| id.short())
}
