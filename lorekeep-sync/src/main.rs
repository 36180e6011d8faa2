//! Lorekeep Sync Entry Point
//!
//! Loads configuration, opens the cache store, connects to the game event
//! log and runs the background workers until Ctrl-C.

use std::sync::Arc;

use lorekeep_core::{EventLogClient, LorekeepResult};
use lorekeep_storage::{CacheStore, InMemoryCacheStore, LmdbCacheStore};
use lorekeep_sync::{init_tracing, GrpcEventLogClient, SyncConfig, WorkerSet};

#[tokio::main]
async fn main() -> LorekeepResult<()> {
    let config = SyncConfig::try_from_env()?;
    init_tracing(config.log_format)?;

    let store: Arc<dyn CacheStore> = match &config.cache_path {
        Some(path) => {
            tracing::info!(
                path = %path.display(),
                max_size_mb = config.cache_max_size_mb,
                "Opening LMDB cache store"
            );
            Arc::new(LmdbCacheStore::new(path, config.cache_max_size_mb)?)
        }
        None => {
            tracing::warn!("No cache path configured, using in-memory cache store");
            Arc::new(InMemoryCacheStore::new())
        }
    };

    let events: Arc<dyn EventLogClient> =
        Arc::new(GrpcEventLogClient::connect_lazy(&config.game_addr)?);

    tracing::info!(
        game_addr = %config.game_addr,
        interval_secs = config.invalidation.effective_interval().as_secs(),
        projection_enabled = config.projection.enabled,
        "Starting lorekeep sync workers"
    );
    let workers = WorkerSet::start(Some(store), Some(events), &config);

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");

    let report = workers.shutdown().await;
    tracing::info!(
        passes = report.invalidation.passes,
        campaigns_invalidated = report.invalidation.campaigns_invalidated,
        projection_updates = report
            .projection
            .as_ref()
            .map(|snapshot| snapshot.updates_applied)
            .unwrap_or(0),
        "Lorekeep sync stopped"
    );
    Ok(())
}
