//! Cache Invalidation Poller
//!
//! Periodically compares each tracked campaign's stored event cursor with the
//! head of the game service event log. When the head has moved past the
//! cursor, the events in between are classified into cache scopes and every
//! implicated scope is marked stale as of the head.
//!
//! Per campaign, strictly in order:
//!
//! 1. Read the head: `ListEvents(order_by = "seq desc", page_size = 1)`, 0 if empty
//! 2. Read the stored cursor
//! 3. No cursor: first observation, persist the cursor at head, mark nothing
//! 4. `head <= cursor`: nothing to do, nothing written
//! 5. `head > cursor`: page through events after the cursor, classify and
//!    union them (an empty delta means all scopes), mark each scope stale
//!    with the head, then persist the cursor at head
//!
//! Any error aborts the rest of the pass. Campaigns processed before the
//! failure keep their writes; the next tick starts over.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lorekeep_core::{
    is_blank_campaign_id, CampaignEventCursor, ConfigError, EventLogClient, EventSeq,
    ListEventsRequest, LorekeepResult, ScopeClassifier, ScopeSet, SyncResultExt, SyncStage,
};
use lorekeep_storage::CacheStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::{read_event_head, shutdown_signal};
use crate::config::{parse_cap, parse_positive_or};
use crate::constants::{
    DEFAULT_INVALIDATION_INTERVAL_SECS, DEFAULT_INVALIDATION_MAX_CAMPAIGNS, DELTA_PAGE_SIZE,
    ENV_INVALIDATION_INTERVAL_SECS, ENV_INVALIDATION_MAX_CAMPAIGNS,
};
use crate::selector::RoundRobinSelector;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the invalidation poller.
#[derive(Debug, Clone)]
pub struct InvalidationConfig {
    /// Time between passes (default: 30 seconds)
    pub interval: Duration,

    /// Campaigns checked per pass, 0 for all of them (default: 0)
    pub max_campaigns_per_sync: usize,

    /// Page size for delta listings (default: 200)
    pub page_size: u32,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_INVALIDATION_INTERVAL_SECS),
            max_campaigns_per_sync: DEFAULT_INVALIDATION_MAX_CAMPAIGNS,
            page_size: DELTA_PAGE_SIZE,
        }
    }
}

impl InvalidationConfig {
    /// Read the poller configuration through `lookup`.
    ///
    /// # Environment Variables
    /// - `LOREKEEP_CACHE_INVALIDATION_INTERVAL_SECS`: seconds between passes; 0 or
    ///   negative uses the default (default: 30)
    /// - `LOREKEEP_CACHE_INVALIDATION_MAX_CAMPAIGNS`: cap per pass; 0 or negative
    ///   means unbounded (default: 0)
    pub fn from_lookup<F>(lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            interval: Duration::from_secs(parse_positive_or(
                lookup,
                ENV_INVALIDATION_INTERVAL_SECS,
                DEFAULT_INVALIDATION_INTERVAL_SECS,
            )?),
            max_campaigns_per_sync: parse_cap(
                lookup,
                ENV_INVALIDATION_MAX_CAMPAIGNS,
                DEFAULT_INVALIDATION_MAX_CAMPAIGNS,
            )?,
            page_size: DELTA_PAGE_SIZE,
        })
    }

    /// Interval actually used; a zero interval falls back to the default.
    pub fn effective_interval(&self) -> Duration {
        if self.interval.is_zero() {
            Duration::from_secs(DEFAULT_INVALIDATION_INTERVAL_SECS)
        } else {
            self.interval
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters for invalidation activity since startup.
#[derive(Debug, Default)]
pub struct InvalidationMetrics {
    /// Passes that completed without error
    pub passes: AtomicU64,

    /// Passes aborted by an error
    pub failed_passes: AtomicU64,

    /// Campaigns whose cursor was created on first observation
    pub campaigns_seeded: AtomicU64,

    /// Campaigns whose head had advanced past the cursor
    pub campaigns_invalidated: AtomicU64,

    /// Stale marks written
    pub stale_marks: AtomicU64,
}

impl InvalidationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> InvalidationMetricsSnapshot {
        InvalidationMetricsSnapshot {
            passes: self.passes.load(Ordering::Relaxed),
            failed_passes: self.failed_passes.load(Ordering::Relaxed),
            campaigns_seeded: self.campaigns_seeded.load(Ordering::Relaxed),
            campaigns_invalidated: self.campaigns_invalidated.load(Ordering::Relaxed),
            stale_marks: self.stale_marks.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of invalidation metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationMetricsSnapshot {
    pub passes: u64,
    pub failed_passes: u64,
    pub campaigns_seeded: u64,
    pub campaigns_invalidated: u64,
    pub stale_marks: u64,
}

/// What one successful pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPassReport {
    pub campaigns_selected: usize,
    pub campaigns_seeded: usize,
    pub campaigns_invalidated: usize,
    pub stale_marks_written: usize,
}

/// Result of syncing one campaign.
enum CampaignOutcome {
    Seeded,
    UpToDate,
    Invalidated { stale_marks: usize },
}

// ============================================================================
// POLLER
// ============================================================================

/// Periodic reconciler of event cursors against the event log head.
///
/// A missing store or event-log client turns every pass into a no-op.
pub struct InvalidationPoller {
    store: Option<Arc<dyn CacheStore>>,
    events: Option<Arc<dyn EventLogClient>>,
    selector: Arc<RoundRobinSelector>,
    classifier: ScopeClassifier,
    config: InvalidationConfig,
    metrics: Arc<InvalidationMetrics>,
}

impl InvalidationPoller {
    pub fn new(
        store: Option<Arc<dyn CacheStore>>,
        events: Option<Arc<dyn EventLogClient>>,
        selector: Arc<RoundRobinSelector>,
        config: InvalidationConfig,
    ) -> Self {
        Self {
            store,
            events,
            selector,
            classifier: ScopeClassifier::default(),
            config,
            metrics: Arc::new(InvalidationMetrics::new()),
        }
    }

    /// Replace the canonical scope rules.
    pub fn with_classifier(mut self, classifier: ScopeClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn metrics(&self) -> Arc<InvalidationMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Run one reconcile pass over a round-robin batch of tracked campaigns.
    ///
    /// Campaign IDs that are blank after trimming are skipped. The first
    /// error stops the pass and is returned with the campaign and step that
    /// failed.
    pub async fn sync_campaign_event_heads(&self) -> LorekeepResult<SyncPassReport> {
        let (Some(store), Some(events)) = (self.store.as_deref(), self.events.as_deref()) else {
            return Ok(SyncPassReport::default());
        };

        let tracked = store.list_tracked_campaign_ids().await?;
        if tracked.is_empty() {
            tracing::trace!("No tracked campaigns to check");
            return Ok(SyncPassReport::default());
        }

        let selected = self
            .selector
            .select(&tracked, self.config.max_campaigns_per_sync);
        let mut report = SyncPassReport {
            campaigns_selected: selected.len(),
            ..Default::default()
        };

        for campaign_id in &selected {
            if is_blank_campaign_id(campaign_id) {
                tracing::debug!("Skipping blank campaign id");
                continue;
            }

            match self.sync_campaign(store, events, campaign_id).await? {
                CampaignOutcome::Seeded => {
                    report.campaigns_seeded += 1;
                    self.metrics.campaigns_seeded.fetch_add(1, Ordering::Relaxed);
                }
                CampaignOutcome::UpToDate => {}
                CampaignOutcome::Invalidated { stale_marks } => {
                    report.campaigns_invalidated += 1;
                    report.stale_marks_written += stale_marks;
                    self.metrics
                        .campaigns_invalidated
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        Ok(report)
    }

    async fn sync_campaign(
        &self,
        store: &dyn CacheStore,
        events: &dyn EventLogClient,
        campaign_id: &str,
    ) -> LorekeepResult<CampaignOutcome> {
        let head = read_event_head(events, campaign_id).await?;
        let cursor = store
            .get_campaign_event_cursor(campaign_id)
            .await
            .in_campaign(campaign_id, SyncStage::ReadCursor)?;
        let now = Utc::now();

        let Some(cursor) = cursor else {
            store
                .put_campaign_event_cursor(&CampaignEventCursor::new(campaign_id, head, now))
                .await
                .in_campaign(campaign_id, SyncStage::WriteCursor)?;
            tracing::debug!(campaign_id = %campaign_id, head, "Seeded event cursor");
            return Ok(CampaignOutcome::Seeded);
        };

        if head <= cursor.latest_seq {
            return Ok(CampaignOutcome::UpToDate);
        }

        let mut scopes = self
            .collect_delta_scopes(events, campaign_id, cursor.latest_seq)
            .await?;
        if scopes.is_empty() {
            tracing::warn!(
                campaign_id = %campaign_id,
                cursor = cursor.latest_seq,
                head,
                "Event head advanced without delta events; invalidating all scopes"
            );
            scopes = ScopeSet::all();
        }

        for scope in scopes.iter() {
            store
                .mark_campaign_scope_stale(campaign_id, scope, head, now)
                .await
                .in_campaign(campaign_id, SyncStage::MarkStale)?;
            self.metrics.stale_marks.fetch_add(1, Ordering::Relaxed);
        }

        store
            .put_campaign_event_cursor(&CampaignEventCursor::new(campaign_id, head, now))
            .await
            .in_campaign(campaign_id, SyncStage::WriteCursor)?;

        tracing::info!(
            campaign_id = %campaign_id,
            previous = cursor.latest_seq,
            head,
            scopes = ?scopes.tags(),
            "Marked campaign cache scopes stale"
        );
        Ok(CampaignOutcome::Invalidated {
            stale_marks: scopes.len(),
        })
    }

    /// Union of the scopes implicated by every event after `after_seq`.
    async fn collect_delta_scopes(
        &self,
        events: &dyn EventLogClient,
        campaign_id: &str,
        after_seq: EventSeq,
    ) -> LorekeepResult<ScopeSet> {
        let mut scopes = ScopeSet::new();
        let mut request = ListEventsRequest::after(campaign_id, after_seq, self.config.page_size);

        loop {
            let page = events
                .list_events(request.clone())
                .await
                .in_campaign(campaign_id, SyncStage::ListDelta)?;

            for event in page.events.iter().flatten() {
                scopes.union_with(&self.classifier.classify(&event.event_type));
            }

            if !page.has_next_page() {
                return Ok(scopes);
            }
            request = request.with_page_token(page.next_page_token);
        }
    }

    // ========================================================================
    // BACKGROUND TASK
    // ========================================================================

    /// Spawn the poller on the current runtime.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<InvalidationMetricsSnapshot> {
        tokio::spawn(self.run(shutdown))
    }

    /// Run passes on the configured interval until shutdown.
    ///
    /// The first pass starts immediately. A shutdown request during a pass
    /// drops the in-flight pass.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> InvalidationMetricsSnapshot {
        if self.store.is_none() || self.events.is_none() {
            tracing::info!(
                has_store = self.store.is_some(),
                has_event_log = self.events.is_some(),
                "Cache invalidation poller disabled"
            );
            return self.metrics.snapshot();
        }

        let period = self.config.effective_interval();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            interval_secs = period.as_secs(),
            max_campaigns = self.config.max_campaigns_per_sync,
            "Cache invalidation poller started"
        );

        loop {
            tokio::select! {
                _ = shutdown_signal(&mut shutdown) => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = shutdown_signal(&mut shutdown) => break,
                        _ = self.run_pass() => {}
                    }
                }
            }
        }

        let snapshot = self.metrics.snapshot();
        tracing::info!(
            passes = snapshot.passes,
            failed_passes = snapshot.failed_passes,
            campaigns_seeded = snapshot.campaigns_seeded,
            campaigns_invalidated = snapshot.campaigns_invalidated,
            stale_marks = snapshot.stale_marks,
            "Cache invalidation poller stopped"
        );
        snapshot
    }

    async fn run_pass(&self) {
        match self.sync_campaign_event_heads().await {
            Ok(report) => {
                self.metrics.passes.fetch_add(1, Ordering::Relaxed);
                if report.campaigns_invalidated > 0 || report.campaigns_seeded > 0 {
                    tracing::info!(
                        selected = report.campaigns_selected,
                        seeded = report.campaigns_seeded,
                        invalidated = report.campaigns_invalidated,
                        stale_marks = report.stale_marks_written,
                        "Invalidation pass completed"
                    );
                } else {
                    tracing::trace!(
                        selected = report.campaigns_selected,
                        "Invalidation pass completed with no changes"
                    );
                }
            }
            Err(e) => {
                self.metrics.failed_passes.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    error = %e,
                    transient = e.is_transient(),
                    "Invalidation pass failed; retrying next tick"
                );
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
