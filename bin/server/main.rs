//! Challenge Control Server
//!
//! Runs the instance control plane: the reconciliation loop against the
//! orchestrator plus the read-only HTTP surface.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use chal_control::flag::{FlagResolver, HttpSecretClient};
use chal_control::orchestrator::OrchestratorClient;
use chal_control::reconciler::{spawn_reconciler, Reconciler, ReconcilerConfig};
use chal_control::store::PgInstanceStore;
use chal_control::{run_api, ApiState, ControlConfig};

#[derive(Parser, Debug)]
#[command(name = "chal-control-server")]
#[command(about = "Challenge Instance Control Plane")]
struct Args {
    /// Server port
    #[arg(short, long, default_value = "8080", env = "CONTROL_PORT")]
    port: u16,

    /// Server host
    #[arg(long, default_value = "0.0.0.0", env = "CONTROL_HOST")]
    host: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chal_control=debug".parse().unwrap())
                .add_directive("info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let config = ControlConfig::from_env();

    info!("Starting Challenge Control Server");
    info!("  Orchestrator:   {}", config.orchestrator_url);
    info!("  Type dir:       {}", config.typedef_dir);
    info!("  Cycle interval: {}s", config.reconcile_interval_secs);
    info!("  Listening on:   {}:{}", args.host, args.port);

    let store = Arc::new(
        PgInstanceStore::connect(
            config.database_url.as_deref(),
            config.database_pool_url.as_deref(),
        )
        .await?,
    );

    let orchestrator = OrchestratorClient::new(&config.orchestrator_url, config.http_timeout())?;
    let secrets = HttpSecretClient::new(
        config.secret_store_base(),
        config.secret_namespace.clone(),
        config.http_timeout(),
    )?;
    let flags = FlagResolver::new(secrets);

    let reconciler = Reconciler::new(
        store.clone(),
        orchestrator,
        flags,
        ReconcilerConfig {
            interval: config.reconcile_interval(),
        },
    );
    let engine = reconciler.status_handle();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler_handle = spawn_reconciler(reconciler, shutdown_rx);

    let state = Arc::new(ApiState::new(store, engine));

    info!("Challenge Control Server ready");

    tokio::select! {
        result = run_api(state, &args.host, args.port) => {
            if let Err(e) = result {
                error!("API server exited: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    // Stop the loop and let the current cycle finish.
    let _ = shutdown_tx.send(true);
    if let Err(e) = reconciler_handle.await {
        error!("Reconciler task failed to join: {}", e);
    }

    info!("Stopped.");
    Ok(())
}
