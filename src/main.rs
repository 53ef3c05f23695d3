//! Focusgate daemon - Entry point.
//!
//! Loads the protected site list, restores persisted bypasses, and serves the
//! JSON control protocol until interrupted.

use std::borrow::Cow;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use focusgate::clock::{Clock, SystemClock};
use focusgate::config::Config;
use focusgate::controller::AccessController;
use focusgate::gateway::RuleTable;
use focusgate::notifier::LogNotifier;
use focusgate::scheduler::TokioScheduler;
use focusgate::server::{run_wakeups, serve};
use focusgate::store::JsonFileStore;

async fn run() -> Result<()> {
    let config_path = std::env::var("CONFIG_PATH")
        .map(Cow::Owned)
        .unwrap_or(Cow::Borrowed("config.toml"));
    let config = Config::load(config_path.as_ref()).context("Failed to load configuration")?;

    // Initialize metrics (must be done early, before any metrics are recorded)
    focusgate::metrics::init(&config.metrics).context("Failed to initialize metrics")?;
    if config.metrics.enabled {
        info!("Metrics enabled on {}", config.metrics.listen);
    }

    info!("Starting focusgate...");

    let directory = Arc::new(
        config
            .rule_directory()
            .await
            .context("Failed to build rule directory")?,
    );
    info!("Protecting {} sites", directory.len());

    let state_path = config.state_path();
    let store = JsonFileStore::open(&state_path)
        .await
        .with_context(|| format!("Failed to open bypass store at {}", state_path.display()))?;

    let gateway = Arc::new(RuleTable::from_directory(&directory));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (scheduler, wakeups) = TokioScheduler::new(Arc::clone(&clock));

    let controller = Arc::new(AccessController::new(
        directory,
        store,
        gateway,
        Arc::new(scheduler),
        Arc::new(LogNotifier),
        clock,
    ));

    let report = controller
        .reconcile()
        .await
        .context("Failed to reconcile persisted bypasses")?;
    info!(
        "Startup reconciliation: {} cleared, {} restored",
        report.cleared, report.restored
    );

    let blocking_enabled = controller
        .restore_blocking_switch(config.blocking_enabled)
        .await
        .context("Failed to restore blocking switch")?;
    if !blocking_enabled {
        info!("Blocking is paused");
    }

    let wakeup_handle = tokio::spawn(run_wakeups(wakeups, Arc::clone(&controller)));

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind control server on {}", config.listen))?;
    let server_handle = tokio::spawn(serve(listener, Arc::clone(&controller)));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down...");
        }
        result = server_handle => {
            match result {
                Ok(Err(err)) => error!("Control server failed: {err}"),
                Err(err) => error!("Control server task failed: {err}"),
                Ok(Ok(())) => {}
            }
        }
    }

    wakeup_handle.abort();
    info!("Shutdown complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    run().await
}
