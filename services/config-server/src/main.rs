//! Fleet config server
//!
//! Serves reindexing status and service convergence for deployed
//! applications, and runs the maintainers that keep fleet state current.

use std::sync::Arc;

use anyhow::Result;
use fleet_config_server::{
    api,
    config,
    convergence::{ConvergenceChecker, HttpConvergenceOracle},
    maintenance::{ReindexingMaintainer, ReindexingMaintainerConfig},
    state::AppState,
    tenant::TenantRepository,
};
use fleet_coordination::{LockManager, LockStats, MemoryLeases, MemoryStore, VersionedStore};
use fleet_node_repository::{LogMetric, MetricsReporter, NodeRepository, NodeRepositoryConfig};
use fleet_reconcile::{Clock, MaintainerWorker, SystemClock};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to FLEET_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleet config server");
    info!(listen_addr = %config.listen_addr, "Configuration loaded");

    // Single-process deployment: coordination state lives in memory.
    let store: Arc<dyn VersionedStore> = Arc::new(MemoryStore::new());
    let lock_stats = LockStats::new();
    let locks = Arc::new(LockManager::new(Arc::new(MemoryLeases::new()), lock_stats.clone()));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let tenants = Arc::new(TenantRepository::new(
        store.clone(),
        locks.clone(),
        clock.clone(),
        config.lock_timeout,
    ));
    let nodes = Arc::new(NodeRepository::new(
        store,
        locks,
        clock.clone(),
        NodeRepositoryConfig {
            lock_timeout: config.lock_timeout,
        },
    ));
    let convergence = Arc::new(ConvergenceChecker::new(
        Arc::new(HttpConvergenceOracle::new(reqwest::Client::new())),
        config.convergence_policy,
        config.convergence_timeout,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reindexing_worker = MaintainerWorker::new(
        Arc::new(ReindexingMaintainer::new(
            tenants.clone(),
            convergence.clone(),
            clock,
            ReindexingMaintainerConfig {
                reindexing_interval: config.reindexing_interval,
            },
        )),
        config.reindexing_maintainer_interval,
    );
    let reindexing_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            reindexing_worker.run(shutdown_rx).await;
        }
    });

    let metrics_worker = MaintainerWorker::new(
        Arc::new(MetricsReporter::new(nodes, Arc::new(LogMetric), lock_stats)),
        config.metrics_interval,
    );
    let metrics_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            metrics_worker.run(shutdown_rx).await;
        }
    });

    let app = api::create_router(AppState::new(tenants, convergence));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for maintainers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, reindexing_handle).await {
        warn!(error = %e, "Reindexing maintainer did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, metrics_handle).await {
        warn!(error = %e, "Metrics reporter did not shut down in time");
    }

    info!("Config server shutdown complete");
    Ok(())
}
