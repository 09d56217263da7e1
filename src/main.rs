//! Concord - Cluster node entry point
//!
//! Starts one cluster: connects the shared store, starts the rate limiter
//! background tasks and the IPC coordinator, then runs until signalled.

use clap::Parser;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use concord::concord_core::config::Validate;
use concord::{Config, create_app, init_tracing};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Node CLI arguments; anything not given here comes from config files
/// and `CONCORD__*` environment variables
#[derive(Parser, Debug)]
#[command(name = "concord")]
#[command(about = "Cluster node for shared rate limiting, locks and IPC")]
struct Args {
    /// Identity of this cluster (overrides ipc.cluster_id)
    #[arg(long, env = "CLUSTER_ID")]
    cluster_id: Option<u32>,

    /// Number of clusters in the deployment (overrides ipc.cluster_count)
    #[arg(long, env = "CLUSTER_COUNT")]
    cluster_count: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    if let Err(e) = dotenvy::dotenv() {
        // Only warn if it's not a "file not found" error
        if !e.not_found() {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    let mut config = Config::load().map_err(|e| {
        std::io::Error::other(format!(
            "Failed to load configuration. Check REDIS_URL and CONCORD__* env vars: {}",
            e
        ))
    })?;

    if let Some(cluster_id) = args.cluster_id {
        config.ipc.cluster_id = cluster_id;
    }
    if let Some(cluster_count) = args.cluster_count {
        config.ipc.cluster_count = cluster_count;
    }
    config
        .validate()
        .map_err(|e| std::io::Error::other(format!("Configuration validation failed: {}", e)))?;

    init_tracing(&config.logging)?;

    tracing::info!(
        cluster_id = config.ipc.cluster_id,
        cluster_count = config.ipc.cluster_count,
        backend = ?config.store.backend,
        "Starting concord node"
    );

    let app = create_app(config).await?;

    shutdown_signal(app.shutdown_token.clone()).await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, app.shutdown())
        .await
        .is_err()
    {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Shutdown timed out, exiting anyway"
        );
    }

    tracing::info!("Node shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM, or for the token to be cancelled elsewhere
async fn shutdown_signal(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
        _ = shutdown_token.cancelled() => {
            tracing::info!("Shutdown requested");
        },
    }
}
