//! Projection Subscription Consumer
//!
//! Keeps campaign cursors current between poller passes by holding one
//! `SubscribeCampaignUpdates` stream per campaign of a round-robin batch.
//! Each update past the cursor is classified, its scopes are marked stale
//! as of the update's sequence, and the cursor advances to that sequence.
//!
//! Every campaign of a batch is supervised on its own: when its stream ends
//! or fails it waits an exponential, jittered backoff and resubscribes from
//! its cursor, whatever the other streams are doing. The batch is reselected
//! once the rotation interval elapses, so a bounded cap still reaches every
//! tracked campaign.
//!
//! Running alongside the invalidation poller is safe. Updates the cursor has
//! already passed are skipped, since whoever advanced the cursor marked
//! their scopes at or above it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use futures_util::StreamExt;
use lorekeep_core::{
    is_blank_campaign_id, CampaignEventCursor, ConfigError, EventLogClient, EventSeq,
    LorekeepResult, ScopeClassifier, SyncResultExt, SyncStage,
};
use lorekeep_storage::CacheStore;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{read_event_head, shutdown_signal};
use crate::config::{parse_cap, parse_flag, parse_or, parse_positive_or};
use crate::constants::{
    DEFAULT_BACKOFF_INITIAL_MS, DEFAULT_BACKOFF_JITTER_MS, DEFAULT_BACKOFF_MAX_MS,
    DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_PROJECTION_MAX_CAMPAIGNS,
    DEFAULT_PROJECTION_ROTATION_SECS, ENV_BACKOFF_INITIAL_MS, ENV_BACKOFF_JITTER_MS,
    ENV_BACKOFF_MAX_MS, ENV_BACKOFF_MULTIPLIER, ENV_PROJECTION_ENABLED,
    ENV_PROJECTION_MAX_CAMPAIGNS, ENV_PROJECTION_ROTATION_SECS,
};
use crate::selector::RoundRobinSelector;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Resubscribe backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: DEFAULT_BACKOFF_INITIAL_MS,
            max_ms: DEFAULT_BACKOFF_MAX_MS,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter_ms: DEFAULT_BACKOFF_JITTER_MS,
        }
    }
}

impl BackoffConfig {
    /// Delay that follows `current_ms`, capped at `max_ms`.
    pub fn next_ms(&self, current_ms: u64) -> u64 {
        let next = (current_ms as f64 * self.multiplier) as u64;
        next.min(self.max_ms)
    }

    /// `current_ms` plus this config's jitter.
    pub fn delay(&self, current_ms: u64) -> Duration {
        Duration::from_millis(jittered_backoff(current_ms, self.jitter_ms))
    }
}

/// `base_ms` plus a uniformly random jitter in `0..jitter_ms`.
pub fn jittered_backoff(base_ms: u64, jitter_ms: u64) -> u64 {
    if jitter_ms == 0 {
        return base_ms;
    }
    base_ms.saturating_add(rand::rng().random_range(0..jitter_ms))
}

/// Configuration for the projection subscription consumer.
#[derive(Debug, Clone)]
pub struct ProjectionConfig {
    /// Whether the consumer runs at all (default: true)
    pub enabled: bool,

    /// Campaigns subscribed per batch, 0 for all of them (default: 0)
    pub max_campaigns: usize,

    /// How long a batch is held before reselecting (default: 300 seconds)
    pub rotation_interval: Duration,

    pub backoff: BackoffConfig,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_campaigns: DEFAULT_PROJECTION_MAX_CAMPAIGNS,
            rotation_interval: Duration::from_secs(DEFAULT_PROJECTION_ROTATION_SECS),
            backoff: BackoffConfig::default(),
        }
    }
}

impl ProjectionConfig {
    /// Read the consumer configuration through `lookup`.
    ///
    /// # Environment Variables
    /// - `LOREKEEP_PROJECTION_SUBSCRIPTION_ENABLED`: run the consumer (default: true)
    /// - `LOREKEEP_PROJECTION_MAX_CAMPAIGNS`: cap per batch, 0 = unbounded (default: 0)
    /// - `LOREKEEP_PROJECTION_ROTATION_SECS`: batch rotation (default: 300)
    /// - `LOREKEEP_PROJECTION_BACKOFF_INITIAL_MS` (default: 1000)
    /// - `LOREKEEP_PROJECTION_BACKOFF_MAX_MS` (default: 30000)
    /// - `LOREKEEP_PROJECTION_BACKOFF_MULTIPLIER` (default: 2.0)
    /// - `LOREKEEP_PROJECTION_BACKOFF_JITTER_MS` (default: 250)
    pub fn from_lookup<F>(lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self {
            enabled: parse_flag(lookup, ENV_PROJECTION_ENABLED, true)?,
            max_campaigns: parse_cap(
                lookup,
                ENV_PROJECTION_MAX_CAMPAIGNS,
                DEFAULT_PROJECTION_MAX_CAMPAIGNS,
            )?,
            rotation_interval: Duration::from_secs(parse_positive_or(
                lookup,
                ENV_PROJECTION_ROTATION_SECS,
                DEFAULT_PROJECTION_ROTATION_SECS,
            )?),
            backoff: BackoffConfig {
                initial_ms: parse_or(lookup, ENV_BACKOFF_INITIAL_MS, DEFAULT_BACKOFF_INITIAL_MS)?,
                max_ms: parse_or(lookup, ENV_BACKOFF_MAX_MS, DEFAULT_BACKOFF_MAX_MS)?,
                multiplier: parse_or(lookup, ENV_BACKOFF_MULTIPLIER, DEFAULT_BACKOFF_MULTIPLIER)?,
                jitter_ms: parse_or(lookup, ENV_BACKOFF_JITTER_MS, DEFAULT_BACKOFF_JITTER_MS)?,
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let backoff = &self.backoff;
        if backoff.initial_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: ENV_BACKOFF_INITIAL_MS.to_string(),
                value: "0".to_string(),
                reason: "must be > 0".to_string(),
            });
        }
        if backoff.max_ms < backoff.initial_ms {
            return Err(ConfigError::InvalidValue {
                field: ENV_BACKOFF_MAX_MS.to_string(),
                value: backoff.max_ms.to_string(),
                reason: "must be >= initial backoff".to_string(),
            });
        }
        if !backoff.multiplier.is_finite() || backoff.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: ENV_BACKOFF_MULTIPLIER.to_string(),
                value: backoff.multiplier.to_string(),
                reason: "must be >= 1.0".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters for subscription activity since startup.
#[derive(Debug, Default)]
pub struct ProjectionMetrics {
    /// Batches started
    pub batches: AtomicU64,

    /// Batches ended by the rotation interval
    pub rotations: AtomicU64,

    /// Subscribe attempts, including resubscribes
    pub subscriptions: AtomicU64,

    /// Updates that marked scopes stale
    pub updates_applied: AtomicU64,

    /// Updates at or below the cursor
    pub updates_skipped: AtomicU64,

    /// Updates dropped because they named another campaign
    pub updates_ignored: AtomicU64,

    /// Streams that failed to open or ended with an error
    pub stream_errors: AtomicU64,

    /// Cursors created at the head on first subscribe
    pub campaigns_seeded: AtomicU64,
}

impl ProjectionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ProjectionMetricsSnapshot {
        ProjectionMetricsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            subscriptions: self.subscriptions.load(Ordering::Relaxed),
            updates_applied: self.updates_applied.load(Ordering::Relaxed),
            updates_skipped: self.updates_skipped.load(Ordering::Relaxed),
            updates_ignored: self.updates_ignored.load(Ordering::Relaxed),
            stream_errors: self.stream_errors.load(Ordering::Relaxed),
            campaigns_seeded: self.campaigns_seeded.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of subscription metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectionMetricsSnapshot {
    pub batches: u64,
    pub rotations: u64,
    pub subscriptions: u64,
    pub updates_applied: u64,
    pub updates_skipped: u64,
    pub updates_ignored: u64,
    pub stream_errors: u64,
    pub campaigns_seeded: u64,
}

/// What one batch did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub campaigns: usize,
    pub subscriptions: u64,
    pub updates_applied: u64,
    pub stream_errors: u64,
}

/// Per-campaign counters within one batch.
#[derive(Debug, Default)]
struct CampaignCounters {
    subscriptions: AtomicU64,
    applied: AtomicU64,
    errors: AtomicU64,
}

// ============================================================================
// CONSUMER
// ============================================================================

/// Streaming consumer advancing campaign cursors from update subscriptions.
pub struct ProjectionConsumer {
    store: Option<Arc<dyn CacheStore>>,
    events: Option<Arc<dyn EventLogClient>>,
    selector: Arc<RoundRobinSelector>,
    classifier: ScopeClassifier,
    config: ProjectionConfig,
    metrics: Arc<ProjectionMetrics>,
}

impl ProjectionConsumer {
    pub fn new(
        store: Option<Arc<dyn CacheStore>>,
        events: Option<Arc<dyn EventLogClient>>,
        selector: Arc<RoundRobinSelector>,
        config: ProjectionConfig,
    ) -> Self {
        Self {
            store,
            events,
            selector,
            classifier: ScopeClassifier::default(),
            config,
            metrics: Arc::new(ProjectionMetrics::new()),
        }
    }

    pub fn with_classifier(mut self, classifier: ScopeClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn metrics(&self) -> Arc<ProjectionMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Hold subscriptions for a round-robin batch of campaigns until the
    /// rotation interval elapses.
    ///
    /// Stream failures are logged and counted as they happen, and the failed
    /// campaign is resubscribed after its own backoff. Only a failure to list
    /// tracked campaigns is returned as an error. An empty selection returns
    /// at once.
    pub async fn run_batch(&self) -> LorekeepResult<BatchOutcome> {
        let (Some(store), Some(events)) = (self.store.as_deref(), self.events.as_deref()) else {
            return Ok(BatchOutcome::default());
        };

        let tracked = store.list_tracked_campaign_ids().await?;
        let selected: Vec<String> = self
            .selector
            .select(&tracked, self.config.max_campaigns)
            .into_iter()
            .filter(|id| !is_blank_campaign_id(id))
            .collect();
        if selected.is_empty() {
            return Ok(BatchOutcome::default());
        }
        self.metrics.batches.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(campaigns = selected.len(), "Subscribing to campaign updates");

        let counters: Vec<CampaignCounters> =
            selected.iter().map(|_| CampaignCounters::default()).collect();
        let supervisors = join_all(
            selected
                .iter()
                .zip(&counters)
                .map(|(campaign_id, counters)| {
                    self.supervise_campaign(store, events, campaign_id, counters)
                }),
        );

        tokio::select! {
            _ = supervisors => {}
            _ = tokio::time::sleep(self.config.rotation_interval) => {}
        }
        self.metrics.rotations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Rotating campaign subscription batch");

        let outcome = counters.iter().fold(
            BatchOutcome {
                campaigns: selected.len(),
                ..Default::default()
            },
            |mut outcome, counters| {
                outcome.subscriptions += counters.subscriptions.load(Ordering::Relaxed);
                outcome.updates_applied += counters.applied.load(Ordering::Relaxed);
                outcome.stream_errors += counters.errors.load(Ordering::Relaxed);
                outcome
            },
        );
        Ok(outcome)
    }

    /// Subscribe, consume and resubscribe one campaign until dropped.
    async fn supervise_campaign(
        &self,
        store: &dyn CacheStore,
        events: &dyn EventLogClient,
        campaign_id: &str,
        counters: &CampaignCounters,
    ) {
        let backoff = &self.config.backoff;
        let mut delay_ms = backoff.initial_ms;
        loop {
            counters.subscriptions.fetch_add(1, Ordering::Relaxed);
            self.metrics.subscriptions.fetch_add(1, Ordering::Relaxed);
            let applied_before = counters.applied.load(Ordering::Relaxed);

            let result = self
                .consume_campaign(store, events, campaign_id, &counters.applied)
                .await;

            if counters.applied.load(Ordering::Relaxed) > applied_before {
                delay_ms = backoff.initial_ms;
            }
            if let Err(e) = result {
                counters.errors.fetch_add(1, Ordering::Relaxed);
                self.metrics.stream_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    campaign_id = %campaign_id,
                    error = %e,
                    transient = e.is_transient(),
                    "Campaign update stream failed"
                );
            }

            let delay = backoff.delay(delay_ms);
            tracing::debug!(
                campaign_id = %campaign_id,
                delay_ms = delay.as_millis() as u64,
                "Resubscribing after backoff"
            );
            tokio::time::sleep(delay).await;
            delay_ms = backoff.next_ms(delay_ms);
        }
    }

    async fn consume_campaign(
        &self,
        store: &dyn CacheStore,
        events: &dyn EventLogClient,
        campaign_id: &str,
        applied: &AtomicU64,
    ) -> LorekeepResult<()> {
        let cursor = read_cursor(store, campaign_id).await?;

        // Without a cursor the backlog is skipped: start from the head.
        let mut latest_seq = match cursor {
            Some(seq) => seq,
            None => {
                let head = read_event_head(events, campaign_id).await?;
                store
                    .put_campaign_event_cursor(&CampaignEventCursor::now(campaign_id, head))
                    .await
                    .in_campaign(campaign_id, SyncStage::WriteCursor)?;
                self.metrics.campaigns_seeded.fetch_add(1, Ordering::Relaxed);
                head
            }
        };

        let mut updates = events
            .subscribe_campaign_updates(campaign_id, latest_seq)
            .await
            .in_campaign(campaign_id, SyncStage::Subscribe)?;

        while let Some(item) = updates.next().await {
            let update = item.in_campaign(campaign_id, SyncStage::Subscribe)?;
            if !update.campaign_id.is_empty() && update.campaign_id != campaign_id {
                self.metrics.updates_ignored.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    campaign_id = %campaign_id,
                    update_campaign_id = %update.campaign_id,
                    seq = update.seq,
                    "Ignoring update for another campaign"
                );
                continue;
            }

            // The poller may have moved the cursor since the stream opened.
            if let Some(stored) = read_cursor(store, campaign_id).await? {
                latest_seq = latest_seq.max(stored);
            }
            if update.seq <= latest_seq {
                self.metrics.updates_skipped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(
                    campaign_id = %campaign_id,
                    seq = update.seq,
                    latest_seq,
                    "Skipping update at or below cursor"
                );
                continue;
            }

            let now = Utc::now();
            let scopes = self.classifier.classify(&update.event_type);
            for scope in scopes.iter() {
                store
                    .mark_campaign_scope_stale(campaign_id, scope, update.seq, now)
                    .await
                    .in_campaign(campaign_id, SyncStage::MarkStale)?;
            }
            store
                .put_campaign_event_cursor(&CampaignEventCursor::new(campaign_id, update.seq, now))
                .await
                .in_campaign(campaign_id, SyncStage::WriteCursor)?;
            latest_seq = update.seq;

            applied.fetch_add(1, Ordering::Relaxed);
            self.metrics.updates_applied.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                campaign_id = %campaign_id,
                seq = update.seq,
                event_type = %update.event_type,
                scopes = ?scopes.tags(),
                "Applied campaign update"
            );
        }

        tracing::debug!(campaign_id = %campaign_id, latest_seq, "Campaign update stream ended");
        Ok(())
    }

    // ========================================================================
    // BACKGROUND TASK
    // ========================================================================

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<ProjectionMetricsSnapshot> {
        tokio::spawn(self.run(shutdown))
    }

    /// Run batches back to back until shutdown.
    ///
    /// When nothing can be subscribed (no tracked campaigns, or listing them
    /// failed) the next batch waits out a backoff first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> ProjectionMetricsSnapshot {
        if self.store.is_none() || self.events.is_none() {
            tracing::info!(
                has_store = self.store.is_some(),
                has_event_log = self.events.is_some(),
                "Projection subscription consumer disabled"
            );
            return self.metrics.snapshot();
        }

        tracing::info!(
            max_campaigns = self.config.max_campaigns,
            rotation_secs = self.config.rotation_interval.as_secs(),
            "Projection subscription consumer started"
        );

        let backoff = &self.config.backoff;
        let mut delay_ms = backoff.initial_ms;
        loop {
            let outcome = tokio::select! {
                _ = shutdown_signal(&mut shutdown) => break,
                outcome = self.run_batch() => outcome,
            };

            match outcome {
                Ok(outcome) if outcome.campaigns > 0 => {
                    delay_ms = backoff.initial_ms;
                    continue;
                }
                Ok(_) => tracing::trace!("No campaigns to subscribe"),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        transient = e.is_transient(),
                        "Projection batch failed"
                    );
                }
            }

            if !wait_with_shutdown(backoff.delay(delay_ms), &mut shutdown).await {
                break;
            }
            delay_ms = backoff.next_ms(delay_ms);
        }

        let snapshot = self.metrics.snapshot();
        tracing::info!(
            batches = snapshot.batches,
            subscriptions = snapshot.subscriptions,
            updates_applied = snapshot.updates_applied,
            updates_skipped = snapshot.updates_skipped,
            updates_ignored = snapshot.updates_ignored,
            stream_errors = snapshot.stream_errors,
            campaigns_seeded = snapshot.campaigns_seeded,
            "Projection subscription consumer stopped"
        );
        snapshot
    }
}

async fn read_cursor(store: &dyn CacheStore, campaign_id: &str) -> LorekeepResult<Option<EventSeq>> {
    Ok(store
        .get_campaign_event_cursor(campaign_id)
        .await
        .in_campaign(campaign_id, SyncStage::ReadCursor)?
        .map(|cursor| cursor.latest_seq))
}

/// Sleep for `delay` unless shutdown comes first.
///
/// Returns `false` when shutdown was requested.
pub async fn wait_with_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = shutdown_signal(shutdown) => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use lorekeep_core::{CacheScope, EventLogError, LorekeepError};
    use lorekeep_storage::InMemoryCacheStore;
    use lorekeep_test_utils::fixtures::{cursor_seq, stale_scopes, update};
    use lorekeep_test_utils::{AuditingCacheStore, FakeEventLog};

    fn consumer(
        store: Arc<dyn CacheStore>,
        log: &Arc<FakeEventLog>,
        config: ProjectionConfig,
    ) -> ProjectionConsumer {
        ProjectionConsumer::new(
            Some(store),
            Some(log.clone()),
            Arc::new(RoundRobinSelector::new()),
            config,
        )
    }

    /// Consume one subscription of `campaign_id` to its end.
    async fn consume_once(
        consumer: &ProjectionConsumer,
        store: &dyn CacheStore,
        log: &FakeEventLog,
        campaign_id: &str,
    ) -> (LorekeepResult<()>, u64) {
        let applied = AtomicU64::new(0);
        let result = consumer
            .consume_campaign(store, log, campaign_id, &applied)
            .await;
        (result, applied.into_inner())
    }

    async fn store_with_cursors(cursors: &[(&str, EventSeq)]) -> Arc<InMemoryCacheStore> {
        let store = Arc::new(InMemoryCacheStore::with_tracked(
            cursors.iter().map(|(campaign_id, _)| *campaign_id),
        ));
        for (campaign_id, seq) in cursors {
            store
                .put_campaign_event_cursor(&CampaignEventCursor::now(*campaign_id, *seq))
                .await
                .expect("seeding cursor should succeed");
        }
        store
    }

    fn fixed_backoff(rotation_secs: u64, initial_ms: u64, max_ms: u64) -> ProjectionConfig {
        ProjectionConfig {
            rotation_interval: Duration::from_secs(rotation_secs),
            backoff: BackoffConfig {
                initial_ms,
                max_ms,
                multiplier: 2.0,
                jitter_ms: 0,
            },
            ..Default::default()
        }
    }

    fn unavailable(reason: &str) -> EventLogError {
        EventLogError::Unavailable {
            reason: reason.to_string(),
        }
    }

    // ========================================================================
    // BACKOFF AND CONFIG
    // ========================================================================

    #[test]
    fn test_backoff_growth_is_capped() {
        let backoff = BackoffConfig {
            initial_ms: 1_000,
            max_ms: 5_000,
            multiplier: 2.0,
            jitter_ms: 0,
        };
        assert_eq!(backoff.next_ms(1_000), 2_000);
        assert_eq!(backoff.next_ms(2_000), 4_000);
        assert_eq!(backoff.next_ms(4_000), 5_000);
        assert_eq!(backoff.next_ms(5_000), 5_000);
        assert_eq!(backoff.delay(1_500), Duration::from_millis(1_500));
    }

    #[test]
    fn test_jitter_is_bounded() {
        assert_eq!(jittered_backoff(1_000, 0), 1_000);
        for _ in 0..200 {
            let delay = jittered_backoff(1_000, 250);
            assert!((1_000..1_250).contains(&delay), "got {delay}");
        }
        assert_eq!(jittered_backoff(u64::MAX, 10), u64::MAX);
    }

    #[test]
    fn test_config_validation() {
        assert!(ProjectionConfig::default().validate().is_ok());

        let mut config = ProjectionConfig::default();
        config.backoff.initial_ms = 0;
        assert!(config.validate().is_err());

        let mut config = ProjectionConfig::default();
        config.backoff.max_ms = 10;
        assert!(config.validate().is_err());

        let mut config = ProjectionConfig::default();
        config.backoff.multiplier = f64::NAN;
        assert!(config.validate().is_err());
    }

    // ========================================================================
    // SINGLE STREAM
    // ========================================================================

    #[tokio::test]
    async fn test_updates_mark_scopes_and_advance_cursor() {
        let store = store_with_cursors(&[("c1", 5)]).await;
        let log = Arc::new(FakeEventLog::new());
        let tx = log.open_subscription("c1");
        tx.send(Ok(update("c1", 6, "invite.created")))
            .expect("receiver should be queued");
        tx.send(Ok(update("c1", 7, "session.started")))
            .expect("receiver should be queued");
        drop(tx);
        let consumer = consumer(store.clone(), &log, ProjectionConfig::default());

        let (result, applied) = consume_once(&consumer, store.as_ref(), &log, "c1").await;

        result.expect("stream should end cleanly");
        assert_eq!(applied, 2);
        assert_eq!(log.subscribe_calls(), vec![("c1".to_string(), 5)]);
        assert_eq!(
            stale_scopes(&store, "c1").await,
            vec![(CacheScope::Sessions, 7), (CacheScope::Invites, 6)]
        );
        assert_eq!(cursor_seq(store.as_ref(), "c1").await, Some(7));
    }

    #[tokio::test]
    async fn test_first_subscribe_starts_at_head() {
        let store = Arc::new(InMemoryCacheStore::with_tracked(["c1"]));
        let log = Arc::new(FakeEventLog::new());
        log.push_events("c1", [(3, "session.started"), (9, "character.created")]);
        let consumer = consumer(store.clone(), &log, ProjectionConfig::default());

        let (result, applied) = consume_once(&consumer, store.as_ref(), &log, "c1").await;

        result.expect("stream should end cleanly");
        assert_eq!(applied, 0);
        assert_eq!(log.subscribe_calls(), vec![("c1".to_string(), 9)]);
        assert_eq!(cursor_seq(store.as_ref(), "c1").await, Some(9));
        assert_eq!(store.stale_mark_count().await, 0);
        assert_eq!(consumer.metrics().snapshot().campaigns_seeded, 1);
    }

    #[tokio::test]
    async fn test_updates_at_or_below_cursor_are_skipped() {
        let store = store_with_cursors(&[("c1", 10)]).await;
        let audited = Arc::new(AuditingCacheStore::new(store.clone()));
        let log = Arc::new(FakeEventLog::new());
        log.script_subscription(
            "c1",
            vec![
                Ok(update("c1", 4, "character.died")),
                Ok(update("c1", 10, "session.ended")),
                Ok(update("c1", 11, "invite.created")),
            ],
            false,
        );
        let consumer = consumer(audited.clone(), &log, ProjectionConfig::default());

        let (result, applied) = consume_once(&consumer, audited.as_ref(), &log, "c1").await;

        result.expect("stream should end cleanly");
        assert_eq!(applied, 1);
        assert_eq!(stale_scopes(&store, "c1").await, vec![(CacheScope::Invites, 11)]);
        assert_eq!(cursor_seq(store.as_ref(), "c1").await, Some(11));
        assert!(audited.marks_below_cursor().is_empty());
        assert_eq!(consumer.metrics().snapshot().updates_skipped, 2);
    }

    #[tokio::test]
    async fn test_cursor_advanced_elsewhere_is_respected() {
        let store = store_with_cursors(&[("c1", 1)]).await;
        let audited = Arc::new(AuditingCacheStore::new(store.clone()));
        let log = Arc::new(FakeEventLog::new());
        let tx = log.open_subscription("c1");
        let consumer = consumer(audited.clone(), &log, ProjectionConfig::default());

        // Another worker moves the cursor to 8 while the stream is open.
        let other_worker = async {
            store
                .put_campaign_event_cursor(&CampaignEventCursor::now("c1", 8))
                .await
                .expect("cursor write should succeed");
            tx.send(Ok(update("c1", 5, "invite.created")))
                .expect("stream should be open");
            tx.send(Ok(update("c1", 9, "session.started")))
                .expect("stream should be open");
            drop(tx);
        };
        let ((result, applied), ()) = tokio::join!(
            consume_once(&consumer, audited.as_ref(), &log, "c1"),
            other_worker
        );

        result.expect("stream should end cleanly");
        assert_eq!(applied, 1);
        assert_eq!(stale_scopes(&store, "c1").await, vec![(CacheScope::Sessions, 9)]);
        assert_eq!(cursor_seq(store.as_ref(), "c1").await, Some(9));
        assert!(audited.marks_below_cursor().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_campaign_updates_are_ignored() {
        let store = store_with_cursors(&[("c1", 1)]).await;
        let log = Arc::new(FakeEventLog::new());
        log.script_subscription(
            "c1",
            vec![
                Ok(update("other", 2, "invite.created")),
                Ok(update("", 3, "session.ended")),
            ],
            false,
        );
        let consumer = consumer(store.clone(), &log, ProjectionConfig::default());

        let (result, applied) = consume_once(&consumer, store.as_ref(), &log, "c1").await;

        result.expect("stream should end cleanly");
        assert_eq!(applied, 1);
        assert_eq!(stale_scopes(&store, "c1").await, vec![(CacheScope::Sessions, 3)]);
        assert_eq!(cursor_seq(store.as_ref(), "c1").await, Some(3));
        assert_eq!(consumer.metrics().snapshot().updates_ignored, 1);
    }

    #[tokio::test]
    async fn test_stream_error_ends_consumption() {
        let store = store_with_cursors(&[("c1", 1)]).await;
        let log = Arc::new(FakeEventLog::new());
        log.script_subscription(
            "c1",
            vec![
                Ok(update("c1", 2, "invite.created")),
                Err(unavailable("stream reset")),
                Ok(update("c1", 3, "invite.revoked")),
            ],
            false,
        );
        let consumer = consumer(store.clone(), &log, ProjectionConfig::default());

        let (result, applied) = consume_once(&consumer, store.as_ref(), &log, "c1").await;

        let err = result.expect_err("stream error should surface");
        assert!(matches!(
            err,
            LorekeepError::CampaignSync { stage: SyncStage::Subscribe, .. }
        ));
        assert!(err.is_transient());
        assert_eq!(applied, 1);
        assert_eq!(cursor_seq(store.as_ref(), "c1").await, Some(2));
    }

    // ========================================================================
    // BATCHES
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_failed_campaign_resubscribes_while_sibling_stays_open() {
        let store = store_with_cursors(&[("c1", 1), ("c2", 1)]).await;
        let log = Arc::new(FakeEventLog::new());
        log.fail_subscribe("c1", unavailable("connection refused"));
        log.script_subscription("c2", vec![Ok(update("c2", 2, "session.started"))], true);
        let consumer = consumer(store.clone(), &log, fixed_backoff(10, 1_000, 4_000));

        let outcome = consumer.run_batch().await.expect("batch should succeed");

        // c1 retries at 0s, 1s, 3s and 7s; c2 keeps its first stream.
        let calls = log.subscribe_calls();
        let c1_calls = calls.iter().filter(|(id, _)| id == "c1").count();
        let c2_calls: Vec<_> = calls.iter().filter(|(id, _)| id == "c2").collect();
        assert_eq!(c1_calls, 4);
        assert_eq!(c2_calls, vec![&("c2".to_string(), 1)]);
        assert_eq!(
            outcome,
            BatchOutcome {
                campaigns: 2,
                subscriptions: 5,
                updates_applied: 1,
                stream_errors: 4,
            }
        );
        assert_eq!(consumer.metrics().snapshot().stream_errors, 4);
        assert_eq!(cursor_seq(store.as_ref(), "c2").await, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ended_stream_resubscribes_from_new_cursor() {
        let store = store_with_cursors(&[("c1", 1)]).await;
        let log = Arc::new(FakeEventLog::new());
        log.push_events("c1", [(2, "invite.created"), (3, "character.created")]);
        log.script_subscription("c1", vec![Ok(update("c1", 2, "invite.created"))], false);
        let consumer = consumer(store.clone(), &log, fixed_backoff(5, 1_000, 4_000));

        let outcome = consumer.run_batch().await.expect("batch should succeed");

        let calls = log.subscribe_calls();
        assert_eq!(
            calls[..3].to_vec(),
            vec![
                ("c1".to_string(), 1),
                ("c1".to_string(), 2),
                ("c1".to_string(), 3),
            ]
        );
        assert_eq!(outcome.updates_applied, 2);
        assert_eq!(outcome.stream_errors, 0);
        assert_eq!(cursor_seq(store.as_ref(), "c1").await, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cap_rotates_subscriptions() {
        let store = Arc::new(InMemoryCacheStore::with_tracked(["c0", "c1", "c2"]));
        let log = Arc::new(FakeEventLog::new());
        let config = ProjectionConfig {
            max_campaigns: 2,
            ..fixed_backoff(5, 10_000, 10_000)
        };
        let consumer = consumer(store.clone(), &log, config);

        consumer.run_batch().await.expect("batch should succeed");
        consumer.run_batch().await.expect("batch should succeed");

        let subscribed: Vec<String> = log
            .subscribe_calls()
            .into_iter()
            .map(|(campaign_id, _)| campaign_id)
            .collect();
        assert_eq!(subscribed, vec!["c0", "c1", "c2", "c0"]);
        assert_eq!(consumer.metrics().snapshot().rotations, 2);
    }

    #[tokio::test]
    async fn test_empty_selection_returns_immediately() {
        let store = Arc::new(InMemoryCacheStore::new());
        let log = Arc::new(FakeEventLog::new());
        let consumer = consumer(store, &log, ProjectionConfig::default());

        let outcome = consumer.run_batch().await.expect("batch should succeed");

        assert_eq!(outcome, BatchOutcome::default());
        assert_eq!(consumer.metrics().snapshot().batches, 0);
    }

    // ========================================================================
    // BACKGROUND TASK
    // ========================================================================

    #[tokio::test]
    async fn test_backoff_wait_returns_on_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).expect("receiver is alive");
        assert!(!wait_with_shutdown(Duration::from_secs(3600), &mut rx).await);

        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        assert!(!wait_with_shutdown(Duration::from_secs(3600), &mut rx).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_wait_completes_without_shutdown() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(wait_with_shutdown(Duration::from_millis(500), &mut rx).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_survives_stream_errors() {
        let store = store_with_cursors(&[("c1", 1)]).await;
        let log = Arc::new(FakeEventLog::new());
        log.fail_subscribe(
            "c1",
            EventLogError::DeadlineExceeded {
                reason: "slow".to_string(),
            },
        );
        let (tx, rx) = watch::channel(false);
        let handle = consumer(store.clone(), &log, fixed_backoff(300, 1_000, 4_000)).spawn(rx);

        tokio::time::sleep(Duration::from_secs(8)).await;
        tx.send(true).expect("consumer should be listening");
        let snapshot = handle.await.expect("consumer task should not panic");

        assert_eq!(snapshot.batches, 1);
        assert!(snapshot.stream_errors >= 3, "got {:?}", snapshot);
        assert_eq!(snapshot.subscriptions, snapshot.stream_errors);
    }

    #[tokio::test]
    async fn test_run_without_dependencies_exits_immediately() {
        let consumer = ProjectionConsumer::new(
            Some(Arc::new(InMemoryCacheStore::new())),
            None,
            Arc::new(RoundRobinSelector::new()),
            ProjectionConfig::default(),
        );
        let (_tx, rx) = watch::channel(false);
        assert_eq!(consumer.run(rx).await, ProjectionMetricsSnapshot::default());
    }
}
