//! Lifecycle of the background workers.

use std::sync::Arc;

use lorekeep_core::EventLogClient;
use lorekeep_storage::CacheStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::jobs::{
    InvalidationMetricsSnapshot, InvalidationPoller, ProjectionConsumer,
    ProjectionMetricsSnapshot,
};
use crate::selector::RoundRobinSelector;

/// Final metrics of every worker, collected at shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub invalidation: InvalidationMetricsSnapshot,
    /// `None` when the consumer was disabled
    pub projection: Option<ProjectionMetricsSnapshot>,
}

/// Running workers sharing one store, event log and selector.
pub struct WorkerSet {
    shutdown_tx: watch::Sender<bool>,
    invalidation: JoinHandle<InvalidationMetricsSnapshot>,
    projection: Option<JoinHandle<ProjectionMetricsSnapshot>>,
}

impl WorkerSet {
    /// Spawn the poller, and the consumer unless disabled.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(
        store: Option<Arc<dyn CacheStore>>,
        events: Option<Arc<dyn EventLogClient>>,
        config: &SyncConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let selector = Arc::new(RoundRobinSelector::new());

        let invalidation = InvalidationPoller::new(
            store.clone(),
            events.clone(),
            Arc::clone(&selector),
            config.invalidation.clone(),
        )
        .spawn(shutdown_rx.clone());

        let projection = if config.projection.enabled {
            let consumer =
                ProjectionConsumer::new(store, events, selector, config.projection.clone());
            Some(consumer.spawn(shutdown_rx))
        } else {
            tracing::info!("Projection subscription consumer disabled by configuration");
            None
        };

        Self {
            shutdown_tx,
            invalidation,
            projection,
        }
    }

    /// Signal shutdown and wait for every worker to stop.
    pub async fn shutdown(self) -> WorkerReport {
        // Workers also stop when every receiver sees the sender dropped.
        let _ = self.shutdown_tx.send(true);

        let invalidation = self.invalidation.await.unwrap_or_else(|e| {
            tracing::error!(error = %e, "Invalidation poller task failed");
            InvalidationMetricsSnapshot::default()
        });

        let projection = match self.projection {
            Some(handle) => Some(handle.await.unwrap_or_else(|e| {
                tracing::error!(error = %e, "Projection consumer task failed");
                ProjectionMetricsSnapshot::default()
            })),
            None => None,
        };

        WorkerReport {
            invalidation,
            projection,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lorekeep_core::CampaignEventCursor;
    use lorekeep_storage::InMemoryCacheStore;
    use lorekeep_test_utils::FakeEventLog;

    #[tokio::test]
    async fn test_disabled_projection_is_not_spawned() {
        let mut config = SyncConfig::default();
        config.projection.enabled = false;

        let workers = WorkerSet::start(None, None, &config);
        let report = workers.shutdown().await;

        assert_eq!(report.projection, None);
        assert_eq!(report.invalidation, InvalidationMetricsSnapshot::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_shutdown_collects_reports() {
        let store = Arc::new(InMemoryCacheStore::with_tracked(["c1"]));
        store
            .put_campaign_event_cursor(&CampaignEventCursor::now("c1", 0))
            .await
            .expect("seeding cursor should succeed");
        let log = Arc::new(FakeEventLog::new());
        log.push_event("c1", 1, "session.started");

        let workers = WorkerSet::start(Some(store.clone()), Some(log), &SyncConfig::default());
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        let report = workers.shutdown().await;

        assert!(report.invalidation.passes >= 1);
        assert!(report.projection.is_some());
        let cursor = store
            .get_campaign_event_cursor("c1")
            .await
            .expect("cursor read should succeed");
        assert_eq!(cursor.map(|c| c.latest_seq), Some(1));
    }
}
