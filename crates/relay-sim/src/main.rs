mod output;
mod scenario_auto;
mod scenario_churn;
mod scenario_common;
mod scenario_failover;
mod scenario_manual;
mod scenario_runner;
mod scenario_sync;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use relay_manager::RelayManagerConfig;

use crate::scenario_churn::ChurnConfig;
use crate::scenario_common::{ScenarioResult, SimOptions};

#[derive(Parser)]
#[command(name = "relay-sim", about = "Drive the propagation relay manager through scenarios")]
struct Cli {
    /// Also append JSONL results to a timestamped file in this directory.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Sync timeout in ms (defaults to RELAY_SYNC_TIMEOUT_SECS or 300 s).
    #[arg(long)]
    sync_timeout_ms: Option<u64>,

    /// How long a completed sync stays visible, in ms.
    #[arg(long, default_value = "2000")]
    complete_display_ms: u64,

    /// Keep settings in an in-memory SQLite store.
    #[arg(long)]
    sqlite: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Announce-driven selection: adopt, keep on ties, switch when closer.
    AutoSelect,

    /// Manual pin survives closer announces until auto-select is re-enabled.
    ManualPin,

    /// Relay deletion picks the next closest node; clearing reaches the transport.
    Failover,

    /// Sync gating, coalescing, timeouts and failure phases.
    Sync,

    /// Seeded random announce stream.
    Churn {
        /// Number of announces.
        #[arg(long, default_value = "200")]
        announces: u32,
        /// RNG seed.
        #[arg(long, default_value = "7")]
        seed: u64,
    },

    /// Run every scenario and print an aggregated report.
    All {
        #[arg(long, default_value = "200")]
        announces: u32,
        #[arg(long, default_value = "7")]
        seed: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config =
        RelayManagerConfig::new().complete_display(Duration::from_millis(cli.complete_display_ms));
    if let Some(ms) = cli.sync_timeout_ms {
        config = config.sync_timeout(Duration::from_millis(ms));
    }
    let opts = SimOptions {
        config,
        sqlite_settings: cli.sqlite,
    };

    let mode = match &cli.command {
        Command::AutoSelect => "auto-select",
        Command::ManualPin => "manual-pin",
        Command::Failover => "failover",
        Command::Sync => "sync",
        Command::Churn { .. } => "churn",
        Command::All { .. } => "all",
    };
    if let Some(dir) = &cli.output_dir {
        let path = output::open_run_file(dir, mode)?;
        eprintln!("JSONL: {}", path.display());
    }

    eprintln!("relay-sim v{}", env!("CARGO_PKG_VERSION"));

    let passed = match cli.command {
        Command::AutoSelect => report(scenario_auto::run(&opts).await?),
        Command::ManualPin => report(scenario_manual::run(&opts).await?),
        Command::Failover => report(scenario_failover::run(&opts).await?),
        Command::Sync => report(scenario_sync::run(&opts).await?),
        Command::Churn { announces, seed } => {
            report(scenario_churn::run(&opts, &ChurnConfig { announces, seed }).await?)
        }
        Command::All { announces, seed } => {
            scenario_runner::run(&opts, &ChurnConfig { announces, seed }).await
        }
    };

    if !passed {
        std::process::exit(1);
    }
    Ok(())
}

fn report(result: ScenarioResult) -> bool {
    result.print_summary();
    result.emit_jsonl();
    result.success()
}
