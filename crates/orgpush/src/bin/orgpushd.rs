use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast;

use orgpush::config::{load_config, load_config_from_env};
use orgpush::gateway::rest::RestConnector;
use orgpush::logging::{init_logging, LogFormat};
use orgpush::monitor::{MonitorLoop, PassOutcome};
use orgpush::{Database, Orchestrator, UpgradeEventBus};

#[derive(Parser)]
#[command(name = "orgpushd", about = "Monitors and advances staged package upgrades")]
struct Cli {
    /// Path to the JSON config file. Without it the defaults plus
    /// environment overrides are used.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Run a single monitor pass and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    init_logging(if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Text
    });

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => load_config_from_env()?,
    };
    let db_path = config
        .database_path()
        .ok_or("cannot determine database path; set ORGPUSH_DATABASE_PATH")?;
    let db = Database::open(&db_path)?;

    let connector = RestConnector::from_config(&config.gateway)?;
    let events = UpgradeEventBus::new(config.event_capacity);
    let orchestrator = Orchestrator::new(db, Arc::new(connector), events, &config);
    tracing::info!(
        enforce_activation_policy = orchestrator.enforces_activation_policy(),
        interval_secs = config.monitor_interval_secs,
        "orgpushd starting"
    );

    let monitor = MonitorLoop::new(orchestrator, config.monitor_interval());

    if cli.once {
        match monitor.run_pass().await? {
            PassOutcome::Completed(summary) => tracing::info!(?summary, "pass complete"),
            outcome => tracing::info!(?outcome, "nothing to do"),
        }
        return Ok(());
    }

    let (trigger_tx, trigger_rx) = broadcast::channel(16);
    let handle = monitor.start(trigger_rx);
    // First pass right away instead of after one full interval.
    let _ = trigger_tx.send(());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    monitor.stop();
    let _ = trigger_tx.send(());
    handle.await?;

    Ok(())
}
