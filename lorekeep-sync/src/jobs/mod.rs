//! Background workers for campaign cache consistency.
//!
//! - `invalidation`: periodic poller reconciling cursors with the event log head
//! - `projection`: streaming consumer applying campaign updates as they happen
//!
//! Both run as one tokio task each, share a `CacheStore` and a
//! `RoundRobinSelector`, and stop when the shutdown watch flips to `true`.
//!
//! ```ignore
//! use tokio::sync::watch;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let poller = InvalidationPoller::new(Some(store), Some(events), selector, config);
//! let handle = poller.spawn(shutdown_rx);
//!
//! // On shutdown
//! let _ = shutdown_tx.send(true);
//! let snapshot = handle.await?;
//! ```

pub mod invalidation;
pub mod projection;

pub use invalidation::{
    InvalidationConfig, InvalidationMetrics, InvalidationMetricsSnapshot, InvalidationPoller,
    SyncPassReport,
};
pub use projection::{
    jittered_backoff, BackoffConfig, BatchOutcome, ProjectionConfig, ProjectionConsumer,
    ProjectionMetrics, ProjectionMetricsSnapshot,
};

use lorekeep_core::{
    EventLogClient, EventSeq, ListEventsRequest, LorekeepResult, SyncResultExt, SyncStage,
};
use tokio::sync::watch;

/// Resolve once shutdown is requested or the sender is gone.
pub(crate) async fn shutdown_signal(shutdown: &mut watch::Receiver<bool>) {
    // Err means the sender was dropped, which also ends the worker.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Sequence of the newest event of a campaign, 0 when it has none.
pub(crate) async fn read_event_head(
    events: &dyn EventLogClient,
    campaign_id: &str,
) -> LorekeepResult<EventSeq> {
    let page = events
        .list_events(ListEventsRequest::head(campaign_id))
        .await
        .in_campaign(campaign_id, SyncStage::ReadHead)?;
    Ok(page
        .events
        .into_iter()
        .flatten()
        .next()
        .map(|event| event.seq)
        .unwrap_or(0))
}
