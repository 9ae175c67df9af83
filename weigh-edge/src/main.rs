mod config;
mod control_loop;
mod erp_worker;
mod orchestrator;
mod print_worker;
mod sim;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use weigh_core::detector::Calibration;
use weigh_core::fsm::{Fsm, FsmParams};
use weigh_core::store::{SqliteStore, Store};

use config::Config;
use control_loop::ControlLoop;
use erp_worker::ErpWorker;
use orchestrator::Orchestrator;
use print_worker::PrintWorker;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config_path = parse_config_path();
    let cfg = Config::load(&config_path)?;
    tracing::info!(device_id = %cfg.device_id, database_path = %cfg.database_path, "starting weigh-edge");

    let calibration = load_calibration(&cfg).await?;

    let store: Arc<dyn Store> = Arc::new(SqliteStore::connect(&cfg.database_path).await?);
    store.initialize().await?;
    tracing::info!("store initialized");

    let fsm_params = FsmParams {
        t_settle: cfg.fsm.t_settle_secs,
        t_clear: cfg.fsm.t_clear_secs,
        n_min: cfg.fsm.n_min,
    };
    let fsm = Fsm::new(cfg.device_id.clone(), calibration, fsm_params);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let (action_tx, action_rx) = tokio::sync::mpsc::channel(cfg.queues.control_queue_capacity);

    let (control_loop, control_handle) = ControlLoop::new(
        cfg.device_id.clone(),
        fsm,
        cfg.queues.control_queue_capacity,
        action_tx,
        shutdown_rx.clone(),
    );

    let orchestrator = Orchestrator::new(
        action_rx,
        store.clone(),
        control_handle.clone(),
        cfg.queues.max_erp_queue_depth,
    );

    let transport = Arc::new(sim::SimulatedPrinter);
    let print_worker = PrintWorker::new(
        store.clone(),
        transport,
        control_handle.clone(),
        cfg.print_worker.clone(),
        shutdown_rx.clone(),
    );

    let erp_client = Arc::new(sim::SimulatedErp);
    let erp_poll_interval_ms = cfg.erp.poll_interval_ms;
    let erp_worker = ErpWorker::new(
        store.clone(),
        erp_client,
        cfg.erp.clone(),
        erp_poll_interval_ms,
        shutdown_rx.clone(),
    );

    let control_task = tokio::spawn(control_loop.run());
    let orchestrator_task = tokio::spawn(orchestrator.run());
    let print_task = tokio::spawn(print_worker.run());
    let erp_task = tokio::spawn(erp_worker.run());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = tokio::join!(control_task, orchestrator_task, print_task, erp_task);
    tracing::info!("weigh-edge stopped");

    Ok(())
}

/// `--config <path>` CLI arg, else `WEIGH_CONFIG` env var, else `./weigh-edge.toml`.
fn parse_config_path() -> String {
    let args: Vec<String> = std::env::args().collect();
    if let Some(path) = args.windows(2).find(|w| w[0] == "--config").map(|w| w[1].clone()) {
        return path;
    }
    std::env::var("WEIGH_CONFIG").unwrap_or_else(|_| "./weigh-edge.toml".to_string())
}

/// Loads a JSON array of `[mono_seconds, raw_value]` pairs recorded from an
/// empty pan at startup and derives the detector's calibration constants.
async fn load_calibration(cfg: &Config) -> anyhow::Result<Calibration> {
    let raw = tokio::fs::read_to_string(&cfg.calibration_seed_path)
        .await
        .map_err(|e| anyhow::anyhow!("failed to read calibration seed {}: {e}", cfg.calibration_seed_path))?;
    let pairs: Vec<(f64, f64)> = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("malformed calibration seed {}: {e}", cfg.calibration_seed_path))?;
    Calibration::from_empty_pan_log(&pairs, cfg.fsm.placement_min_kg)
        .map_err(|e| anyhow::anyhow!("calibration failed: {e}"))
}
