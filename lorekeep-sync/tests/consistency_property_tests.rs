//! Property-Based Tests for Campaign Cache Consistency
//!
//! **Property 1: Delta Invalidation**
//!
//! For any campaign whose head advances past a known cursor, one sync pass
//! marks every scope implicated by the events in `(cursor, head]` stale at
//! `head` and persists the cursor at `head`.
//!
//! **Property 2: Idempotent No-op**
//!
//! A pass over a campaign whose head equals its cursor writes nothing.
//!
//! **Property 3: Seeding**
//!
//! The first pass over an unseen campaign seeds its cursor at the head and
//! produces no stale marks.
//!
//! **Property 4: Worker Convergence**
//!
//! The poller and the subscription consumer may process the same campaign
//! in either order; the cursor ends at the head and never moves back.
//!
//! Across all of them, no stale mark is ever written below the cursor stored
//! at the time of the mark.

use std::sync::Arc;
use std::time::Duration;

use lorekeep_core::{classify_events, CacheScope, CampaignEvent, CampaignEventCursor, EventSeq};
use lorekeep_storage::{CacheStore, InMemoryCacheStore};
use lorekeep_sync::{
    BackoffConfig, InvalidationConfig, InvalidationPoller, ProjectionConfig, ProjectionConsumer,
    RoundRobinSelector, SyncConfig, WorkerSet,
};
use lorekeep_test_utils::fixtures::{cursor_seq, stale_scopes, update};
use lorekeep_test_utils::generators::{arb_campaign_events, arb_campaign_id};
use lorekeep_test_utils::{AuditingCacheStore, FakeEventLog};
use proptest::prelude::*;

// ============================================================================
// TEST HARNESS
// ============================================================================

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .expect("test runtime should build")
}

struct Harness {
    store: Arc<InMemoryCacheStore>,
    audited: Arc<AuditingCacheStore>,
    log: Arc<FakeEventLog>,
    selector: Arc<RoundRobinSelector>,
}

impl Harness {
    fn new(campaign_id: &str, events: &[CampaignEvent]) -> Self {
        let harness = Self::tracking(&[campaign_id]);
        for event in events {
            harness.log.push_event(campaign_id, event.seq, &event.event_type);
        }
        harness
    }

    fn tracking(campaign_ids: &[&str]) -> Self {
        let store = Arc::new(InMemoryCacheStore::with_tracked(campaign_ids.iter().copied()));
        Self {
            audited: Arc::new(AuditingCacheStore::new(store.clone())),
            store,
            log: Arc::new(FakeEventLog::new()),
            selector: Arc::new(RoundRobinSelector::new()),
        }
    }

    async fn seed_cursor(&self, campaign_id: &str, seq: EventSeq) {
        self.store
            .put_campaign_event_cursor(&CampaignEventCursor::now(campaign_id, seq))
            .await
            .expect("seeding cursor should succeed");
    }

    fn poller(&self) -> InvalidationPoller {
        InvalidationPoller::new(
            Some(self.audited.clone()),
            Some(self.log.clone()),
            Arc::clone(&self.selector),
            InvalidationConfig::default(),
        )
    }

    fn consumer(&self) -> ProjectionConsumer {
        self.consumer_with(ProjectionConfig {
            rotation_interval: Duration::from_secs(5),
            ..Default::default()
        })
    }

    fn consumer_with(&self, config: ProjectionConfig) -> ProjectionConsumer {
        ProjectionConsumer::new(
            Some(self.audited.clone()),
            Some(self.log.clone()),
            Arc::clone(&self.selector),
            config,
        )
    }

    fn subscribe_calls_for(&self, campaign_id: &str) -> Vec<EventSeq> {
        self.log
            .subscribe_calls()
            .into_iter()
            .filter(|(id, _)| id == campaign_id)
            .map(|(_, after_seq)| after_seq)
            .collect()
    }
}

/// Events plus a split point: everything before the split is already synced.
fn arb_history() -> impl Strategy<Value = (String, Vec<CampaignEvent>, usize)> {
    arb_campaign_id()
        .prop_flat_map(|campaign_id| {
            let events = arb_campaign_events(campaign_id.clone(), 1..40);
            (Just(campaign_id), events)
        })
        .prop_flat_map(|(campaign_id, events)| {
            let len = events.len();
            (Just(campaign_id), Just(events), 0..len)
        })
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_delta_pass_marks_implicated_scopes((campaign_id, events, split) in arb_history()) {
        let cursor = if split == 0 { 0 } else { events[split - 1].seq };
        let head = events[events.len() - 1].seq;
        let expected: Vec<(CacheScope, EventSeq)> =
            classify_events(events[split..].iter().map(|event| event.event_type.as_str()))
                .iter()
                .map(|scope| (scope, head))
                .collect();

        let (marks, synced, below) = runtime().block_on(async {
            let harness = Harness::new(&campaign_id, &events);
            harness.seed_cursor(&campaign_id, cursor).await;
            harness
                .poller()
                .sync_campaign_event_heads()
                .await
                .expect("sync pass should succeed");
            (
                stale_scopes(&harness.store, &campaign_id).await,
                cursor_seq(harness.store.as_ref(), &campaign_id).await,
                harness.audited.marks_below_cursor(),
            )
        });

        prop_assert_eq!(marks, expected);
        prop_assert_eq!(synced, Some(head));
        prop_assert!(below.is_empty(), "marks below cursor: {:?}", below);
    }

    #[test]
    fn prop_pass_at_head_is_noop((campaign_id, events, _split) in arb_history()) {
        let head = events[events.len() - 1].seq;

        let (mark_count, synced) = runtime().block_on(async {
            let harness = Harness::new(&campaign_id, &events);
            harness.seed_cursor(&campaign_id, head).await;
            harness
                .poller()
                .sync_campaign_event_heads()
                .await
                .expect("sync pass should succeed");
            (
                harness.store.stale_mark_count().await,
                cursor_seq(harness.store.as_ref(), &campaign_id).await,
            )
        });

        prop_assert_eq!(mark_count, 0);
        prop_assert_eq!(synced, Some(head));
    }

    #[test]
    fn prop_first_pass_seeds_without_marks((campaign_id, events, _split) in arb_history()) {
        let head = events[events.len() - 1].seq;

        let (mark_count, synced) = runtime().block_on(async {
            let harness = Harness::new(&campaign_id, &events);
            harness
                .poller()
                .sync_campaign_event_heads()
                .await
                .expect("sync pass should succeed");
            (
                harness.store.stale_mark_count().await,
                cursor_seq(harness.store.as_ref(), &campaign_id).await,
            )
        });

        prop_assert_eq!(mark_count, 0);
        prop_assert_eq!(synced, Some(head));
    }

    #[test]
    fn prop_workers_converge_in_any_order(
        (campaign_id, events, split) in arb_history(),
        consumer_first in any::<bool>(),
    ) {
        let cursor = if split == 0 { 0 } else { events[split - 1].seq };
        let head = events[events.len() - 1].seq;

        let (marks, synced, below_after_each) = runtime().block_on(async {
            let harness = Harness::new(&campaign_id, &events);
            harness.seed_cursor(&campaign_id, cursor).await;
            let poller = harness.poller();
            let consumer = harness.consumer();

            let mut below_after_each = Vec::new();
            for consumer_turn in [consumer_first, !consumer_first] {
                if consumer_turn {
                    consumer.run_batch().await.expect("batch should succeed");
                } else {
                    poller.sync_campaign_event_heads().await.expect("sync pass should succeed");
                }
                below_after_each.push(harness.audited.marks_below_cursor());
            }
            (
                stale_scopes(&harness.store, &campaign_id).await,
                cursor_seq(harness.store.as_ref(), &campaign_id).await,
                below_after_each,
            )
        });

        prop_assert_eq!(synced, Some(head));
        for below in &below_after_each {
            prop_assert!(below.is_empty(), "marks below cursor: {:?}", below);
        }
        // Every implicated scope carries a mark at or past its last event.
        for event in &events[split..] {
            for scope in classify_events([event.event_type.as_str()]).iter() {
                let mark = marks.iter().find(|(marked, _)| *marked == scope);
                prop_assert!(
                    matches!(mark, Some((_, seq)) if *seq >= event.seq),
                    "scope {:?} from seq {} not marked: {:?}",
                    scope,
                    event.seq,
                    marks
                );
            }
        }
    }
}

// ============================================================================
// CONCURRENT WORKERS
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_workers_share_store_and_converge() {
    let harness = Harness::new("c1", &[]);
    harness.seed_cursor("c1", 0).await;
    let live = harness.log.open_subscription("c1");

    let workers = WorkerSet::start(
        Some(harness.audited.clone()),
        Some(harness.log.clone()),
        &SyncConfig::default(),
    );

    // Delivered on the live stream and visible to the poller.
    harness.log.push_event("c1", 1, "invite.created");
    live.send(Ok(update("c1", 1, "invite.created")))
        .expect("consumer should hold the stream");
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(cursor_seq(harness.store.as_ref(), "c1").await, Some(1));

    // Only visible to the poller, picked up on its next tick.
    harness.log.push_event("c1", 2, "character.created");
    tokio::time::sleep(Duration::from_secs(31)).await;

    let report = workers.shutdown().await;
    assert!(report.invalidation.passes >= 2);
    assert_eq!(cursor_seq(harness.store.as_ref(), "c1").await, Some(2));
    assert_eq!(
        stale_scopes(&harness.store, "c1").await,
        vec![
            (CacheScope::Summary, 2),
            (CacheScope::Characters, 2),
            (CacheScope::Invites, 1),
        ]
    );
    assert!(harness.audited.marks_below_cursor().is_empty());
    drop(live);
}

#[tokio::test(start_paused = true)]
async fn test_batch_with_streams_ending_at_different_times() {
    let harness = Harness::tracking(&["c1", "c2"]);
    harness.seed_cursor("c1", 1).await;
    harness.seed_cursor("c2", 1).await;
    harness.log.push_event("c1", 2, "invite.created");
    harness
        .log
        .script_subscription("c1", vec![Ok(update("c1", 2, "invite.created"))], false);
    let live = harness.log.open_subscription("c2");
    let consumer = harness.consumer_with(ProjectionConfig {
        rotation_interval: Duration::from_secs(10),
        backoff: BackoffConfig {
            initial_ms: 1_000,
            max_ms: 4_000,
            multiplier: 2.0,
            jitter_ms: 0,
        },
        ..Default::default()
    });

    // c1's first stream ends at once; c2's stays open for the whole batch.
    let upstream = async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        harness.log.push_event("c1", 3, "character.created");
        live.send(Ok(update("c2", 5, "session.started")))
            .expect("consumer should hold the stream");
    };
    let (outcome, ()) = tokio::join!(consumer.run_batch(), upstream);
    let outcome = outcome.expect("batch should succeed");

    assert_eq!(&harness.subscribe_calls_for("c1")[..3], &[1, 2, 3]);
    assert_eq!(harness.subscribe_calls_for("c2"), vec![1]);
    assert_eq!(outcome.campaigns, 2);
    assert_eq!(outcome.updates_applied, 3);
    assert_eq!(outcome.stream_errors, 0);
    assert_eq!(cursor_seq(harness.store.as_ref(), "c1").await, Some(3));
    assert_eq!(cursor_seq(harness.store.as_ref(), "c2").await, Some(5));
    assert_eq!(
        stale_scopes(&harness.store, "c1").await,
        vec![
            (CacheScope::Summary, 3),
            (CacheScope::Characters, 3),
            (CacheScope::Invites, 2),
        ]
    );
    assert_eq!(
        stale_scopes(&harness.store, "c2").await,
        vec![(CacheScope::Sessions, 5)]
    );
    assert!(harness.audited.marks_below_cursor().is_empty());
    drop(live);
}

#[tokio::test]
async fn test_workers_without_dependencies_stop_cleanly() {
    let workers = WorkerSet::start(None, None, &SyncConfig::default());
    let report = workers.shutdown().await;

    assert_eq!(report.invalidation.passes, 0);
    assert_eq!(report.projection.map(|snapshot| snapshot.batches), Some(0));
}
