//! Lorekeep Test Utilities
//!
//! Shared test infrastructure for the lorekeep workspace:
//! - `FakeEventLog`: scripted event log with pagination and update streams
//! - `FailingCacheStore`: store wrapper that injects write/read failures
//! - `AuditingCacheStore`: store wrapper recording the cursor behind each stale mark
//! - Proptest generators for campaign IDs, event types and scopes
//! - Fixtures for building events and inspecting stale marks

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

pub use lorekeep_core::{
    CacheEntry, CacheScope, CampaignEvent, CampaignEventCursor, CampaignUpdate,
    CampaignUpdateStream, EventLogClient, EventLogError, EventOrder, EventSeq, ListEventsPage,
    ListEventsRequest, LorekeepError, LorekeepResult, ScopeSet, StaleMark, StoreError, Timestamp,
};
pub use lorekeep_storage::{CacheStore, InMemoryCacheStore};

/// Page size the fake uses when a request asks for 0.
const FAKE_DEFAULT_PAGE_SIZE: usize = 100;

fn lock_recovering<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// FAKE EVENT LOG
// ============================================================================

/// Sender half of a live subscription opened with
/// [`FakeEventLog::open_subscription`]. Dropping it ends the stream.
pub type UpdateSender = mpsc::UnboundedSender<Result<CampaignUpdate, EventLogError>>;

#[derive(Debug)]
enum ScriptedSubscription {
    Items {
        items: Vec<Result<CampaignUpdate, EventLogError>>,
        hold_open: bool,
    },
    Live(mpsc::UnboundedReceiver<Result<CampaignUpdate, EventLogError>>),
}

#[derive(Debug, Default)]
struct FakeLogState {
    events: HashMap<String, Vec<CampaignEvent>>,
    blank_entries: HashMap<String, usize>,
    list_failures: HashMap<String, EventLogError>,
    subscribe_failures: HashMap<String, EventLogError>,
    subscriptions: HashMap<String, VecDeque<ScriptedSubscription>>,
    list_requests: Vec<ListEventsRequest>,
    subscribe_calls: Vec<(String, EventSeq)>,
}

/// In-memory event log that behaves like the game service's `ListEvents`
/// and `SubscribeCampaignUpdates` RPCs.
///
/// Page tokens are decimal offsets into the filtered, ordered listing.
/// Subscriptions are served from a per-campaign queue of scripted streams;
/// when the queue is empty the stored events after `after_seq` are replayed
/// and the stream ends.
#[derive(Debug, Default)]
pub struct FakeEventLog {
    state: Mutex<FakeLogState>,
}

impl FakeEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeLogState> {
        lock_recovering(&self.state)
    }

    /// Append one event. Events are kept ordered by sequence.
    pub fn push_event(&self, campaign_id: &str, seq: EventSeq, event_type: &str) {
        let mut state = self.lock();
        let events = state.events.entry(campaign_id.to_string()).or_default();
        events.push(CampaignEvent::new(campaign_id, seq, event_type));
        events.sort_by_key(|event| event.seq);
    }

    /// Append several `(seq, event_type)` events.
    pub fn push_events<'a, I>(&self, campaign_id: &str, events: I)
    where
        I: IntoIterator<Item = (EventSeq, &'a str)>,
    {
        for (seq, event_type) in events {
            self.push_event(campaign_id, seq, event_type);
        }
    }

    /// Prepend `count` empty entries to ascending listings of a campaign.
    pub fn push_blank_entries(&self, campaign_id: &str, count: usize) {
        self.lock()
            .blank_entries
            .insert(campaign_id.to_string(), count);
    }

    /// Highest stored sequence for a campaign, 0 when it has no events.
    pub fn head_seq(&self, campaign_id: &str) -> EventSeq {
        self.lock()
            .events
            .get(campaign_id)
            .and_then(|events| events.last())
            .map(|event| event.seq)
            .unwrap_or(0)
    }

    /// Make every `ListEvents` call for a campaign fail.
    pub fn fail_list_events(&self, campaign_id: &str, error: EventLogError) {
        self.lock()
            .list_failures
            .insert(campaign_id.to_string(), error);
    }

    /// Make every subscribe call for a campaign fail.
    pub fn fail_subscribe(&self, campaign_id: &str, error: EventLogError) {
        self.lock()
            .subscribe_failures
            .insert(campaign_id.to_string(), error);
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.list_failures.clear();
        state.subscribe_failures.clear();
    }

    /// Queue a subscription that yields `items` and then either ends or,
    /// with `hold_open`, stays pending until dropped.
    pub fn script_subscription(
        &self,
        campaign_id: &str,
        items: Vec<Result<CampaignUpdate, EventLogError>>,
        hold_open: bool,
    ) {
        self.lock()
            .subscriptions
            .entry(campaign_id.to_string())
            .or_default()
            .push_back(ScriptedSubscription::Items { items, hold_open });
    }

    /// Queue a live subscription fed through the returned sender.
    pub fn open_subscription(&self, campaign_id: &str) -> UpdateSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock()
            .subscriptions
            .entry(campaign_id.to_string())
            .or_default()
            .push_back(ScriptedSubscription::Live(rx));
        tx
    }

    /// Every `ListEvents` request received, in order.
    pub fn list_requests(&self) -> Vec<ListEventsRequest> {
        self.lock().list_requests.clone()
    }

    /// Every subscribe call received as `(campaign_id, after_seq)`.
    pub fn subscribe_calls(&self) -> Vec<(String, EventSeq)> {
        self.lock().subscribe_calls.clone()
    }
}

#[async_trait]
impl EventLogClient for FakeEventLog {
    async fn list_events(&self, request: ListEventsRequest) -> LorekeepResult<ListEventsPage> {
        let mut state = self.lock();
        state.list_requests.push(request.clone());
        if let Some(error) = state.list_failures.get(&request.campaign_id) {
            return Err(error.clone().into());
        }

        let mut listing: Vec<Option<CampaignEvent>> = state
            .events
            .get(&request.campaign_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|event| event.seq > request.after_seq)
                    .cloned()
                    .map(Some)
                    .collect()
            })
            .unwrap_or_default();

        match request.order_by {
            EventOrder::SeqDesc => listing.reverse(),
            EventOrder::SeqAsc => {
                let blanks = state
                    .blank_entries
                    .get(&request.campaign_id)
                    .copied()
                    .unwrap_or(0);
                if blanks > 0 {
                    let mut padded = vec![None; blanks];
                    padded.append(&mut listing);
                    listing = padded;
                }
            }
        }

        let start: usize = if request.page_token.is_empty() {
            0
        } else {
            request
                .page_token
                .parse()
                .map_err(|_| EventLogError::Rpc {
                    code: "invalid_argument".to_string(),
                    message: format!("unknown page token {}", request.page_token),
                })?
        };
        let page_size = match request.page_size {
            0 => FAKE_DEFAULT_PAGE_SIZE,
            n => n as usize,
        };
        let end = start.saturating_add(page_size).min(listing.len());
        let events = listing.get(start..end).map(<[_]>::to_vec).unwrap_or_default();
        let next_page_token = if end < listing.len() {
            end.to_string()
        } else {
            String::new()
        };

        Ok(ListEventsPage {
            events,
            next_page_token,
        })
    }

    async fn subscribe_campaign_updates(
        &self,
        campaign_id: &str,
        after_seq: EventSeq,
    ) -> LorekeepResult<CampaignUpdateStream> {
        let mut state = self.lock();
        state
            .subscribe_calls
            .push((campaign_id.to_string(), after_seq));
        if let Some(error) = state.subscribe_failures.get(campaign_id) {
            return Err(error.clone().into());
        }

        let scripted = state
            .subscriptions
            .get_mut(campaign_id)
            .and_then(VecDeque::pop_front);

        let stream = match scripted {
            Some(ScriptedSubscription::Items { items, hold_open }) => {
                let items = stream::iter(items);
                if hold_open {
                    items.chain(stream::pending()).boxed()
                } else {
                    items.boxed()
                }
            }
            Some(ScriptedSubscription::Live(rx)) => UnboundedReceiverStream::new(rx).boxed(),
            None => {
                let replay: Vec<Result<CampaignUpdate, EventLogError>> = state
                    .events
                    .get(campaign_id)
                    .map(|events| {
                        events
                            .iter()
                            .filter(|event| event.seq > after_seq)
                            .cloned()
                            .map(|event| Ok(CampaignUpdate::from(event)))
                            .collect()
                    })
                    .unwrap_or_default();
                stream::iter(replay).boxed()
            }
        };
        Ok(stream)
    }
}

// ============================================================================
// FAILING STORE
// ============================================================================

/// Store operations that [`FailingCacheStore`] can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    ListTracked,
    ReadCursor,
    WriteCursor,
    MarkStale,
}

/// Wraps a cache store and fails chosen operations for chosen campaigns.
///
/// Everything not configured to fail is delegated to the inner store, so
/// writes made before a failure stay visible through [`Self::inner`].
pub struct FailingCacheStore {
    inner: Arc<dyn CacheStore>,
    faults: Mutex<HashSet<(StoreOp, String)>>,
}

impl FailingCacheStore {
    pub fn new(inner: Arc<dyn CacheStore>) -> Self {
        Self {
            inner,
            faults: Mutex::new(HashSet::new()),
        }
    }

    pub fn inner(&self) -> &Arc<dyn CacheStore> {
        &self.inner
    }

    /// Fail `op` for one campaign. `ListTracked` ignores the campaign.
    pub fn fail_on(&self, op: StoreOp, campaign_id: &str) {
        let key = match op {
            StoreOp::ListTracked => String::new(),
            _ => campaign_id.to_string(),
        };
        lock_recovering(&self.faults).insert((op, key));
    }

    /// Stop failing anything.
    pub fn heal(&self) {
        lock_recovering(&self.faults).clear();
    }

    fn check(&self, op: StoreOp, campaign_id: &str) -> LorekeepResult<()> {
        if !lock_recovering(&self.faults).contains(&(op, campaign_id.to_string())) {
            return Ok(());
        }
        let record = format!("{op:?} {campaign_id}");
        let error = match op {
            StoreOp::ListTracked | StoreOp::ReadCursor => StoreError::ReadFailed {
                record,
                reason: "injected failure".to_string(),
            },
            StoreOp::WriteCursor | StoreOp::MarkStale => StoreError::WriteFailed {
                record,
                reason: "injected failure".to_string(),
            },
        };
        Err(error.into())
    }
}

#[async_trait]
impl CacheStore for FailingCacheStore {
    async fn list_tracked_campaign_ids(&self) -> LorekeepResult<Vec<String>> {
        self.check(StoreOp::ListTracked, "")?;
        self.inner.list_tracked_campaign_ids().await
    }

    async fn track_campaign(&self, campaign_id: &str) -> LorekeepResult<()> {
        self.inner.track_campaign(campaign_id).await
    }

    async fn get_campaign_event_cursor(
        &self,
        campaign_id: &str,
    ) -> LorekeepResult<Option<CampaignEventCursor>> {
        self.check(StoreOp::ReadCursor, campaign_id)?;
        self.inner.get_campaign_event_cursor(campaign_id).await
    }

    async fn put_campaign_event_cursor(&self, cursor: &CampaignEventCursor) -> LorekeepResult<()> {
        self.check(StoreOp::WriteCursor, &cursor.campaign_id)?;
        self.inner.put_campaign_event_cursor(cursor).await
    }

    async fn mark_campaign_scope_stale(
        &self,
        campaign_id: &str,
        scope: CacheScope,
        head_seq: EventSeq,
        checked_at: Timestamp,
    ) -> LorekeepResult<()> {
        self.check(StoreOp::MarkStale, campaign_id)?;
        self.inner
            .mark_campaign_scope_stale(campaign_id, scope, head_seq, checked_at)
            .await
    }

    async fn get_campaign_scope_stale_mark(
        &self,
        campaign_id: &str,
        scope: CacheScope,
    ) -> LorekeepResult<Option<StaleMark>> {
        self.inner
            .get_campaign_scope_stale_mark(campaign_id, scope)
            .await
    }

    async fn get_cache_entry(&self, key: &str) -> LorekeepResult<Option<CacheEntry>> {
        self.inner.get_cache_entry(key).await
    }

    async fn put_cache_entry(&self, entry: &CacheEntry) -> LorekeepResult<()> {
        self.inner.put_cache_entry(entry).await
    }

    async fn delete_cache_entry(&self, key: &str) -> LorekeepResult<()> {
        self.inner.delete_cache_entry(key).await
    }
}

// ============================================================================
// AUDITING STORE
// ============================================================================

/// A stale mark together with the cursor stored when it was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkAudit {
    pub campaign_id: String,
    pub scope: CacheScope,
    pub head_seq: EventSeq,
    pub cursor_seq: Option<EventSeq>,
}

impl MarkAudit {
    /// A mark may never be older than the cursor it was written against.
    pub fn is_below_cursor(&self) -> bool {
        self.cursor_seq.is_some_and(|cursor| self.head_seq < cursor)
    }
}

/// Wraps a cache store and records every stale mark along with the cursor
/// seen at the time of the mark.
pub struct AuditingCacheStore {
    inner: Arc<dyn CacheStore>,
    marks: Mutex<Vec<MarkAudit>>,
}

impl AuditingCacheStore {
    pub fn new(inner: Arc<dyn CacheStore>) -> Self {
        Self {
            inner,
            marks: Mutex::new(Vec::new()),
        }
    }

    pub fn marks(&self) -> Vec<MarkAudit> {
        lock_recovering(&self.marks).clone()
    }

    /// Marks written with a `head_seq` below the campaign's cursor.
    pub fn marks_below_cursor(&self) -> Vec<MarkAudit> {
        self.marks()
            .into_iter()
            .filter(MarkAudit::is_below_cursor)
            .collect()
    }
}

#[async_trait]
impl CacheStore for AuditingCacheStore {
    async fn list_tracked_campaign_ids(&self) -> LorekeepResult<Vec<String>> {
        self.inner.list_tracked_campaign_ids().await
    }

    async fn track_campaign(&self, campaign_id: &str) -> LorekeepResult<()> {
        self.inner.track_campaign(campaign_id).await
    }

    async fn get_campaign_event_cursor(
        &self,
        campaign_id: &str,
    ) -> LorekeepResult<Option<CampaignEventCursor>> {
        self.inner.get_campaign_event_cursor(campaign_id).await
    }

    async fn put_campaign_event_cursor(&self, cursor: &CampaignEventCursor) -> LorekeepResult<()> {
        self.inner.put_campaign_event_cursor(cursor).await
    }

    async fn mark_campaign_scope_stale(
        &self,
        campaign_id: &str,
        scope: CacheScope,
        head_seq: EventSeq,
        checked_at: Timestamp,
    ) -> LorekeepResult<()> {
        let cursor_seq = self
            .inner
            .get_campaign_event_cursor(campaign_id)
            .await?
            .map(|cursor| cursor.latest_seq);
        lock_recovering(&self.marks).push(MarkAudit {
            campaign_id: campaign_id.to_string(),
            scope,
            head_seq,
            cursor_seq,
        });
        self.inner
            .mark_campaign_scope_stale(campaign_id, scope, head_seq, checked_at)
            .await
    }

    async fn get_campaign_scope_stale_mark(
        &self,
        campaign_id: &str,
        scope: CacheScope,
    ) -> LorekeepResult<Option<StaleMark>> {
        self.inner
            .get_campaign_scope_stale_mark(campaign_id, scope)
            .await
    }

    async fn get_cache_entry(&self, key: &str) -> LorekeepResult<Option<CacheEntry>> {
        self.inner.get_cache_entry(key).await
    }

    async fn put_cache_entry(&self, entry: &CacheEntry) -> LorekeepResult<()> {
        self.inner.put_cache_entry(entry).await
    }

    async fn delete_cache_entry(&self, key: &str) -> LorekeepResult<()> {
        self.inner.delete_cache_entry(key).await
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for campaign IDs, event types and scopes.

    use super::*;
    use proptest::collection::btree_set;
    use proptest::prelude::*;

    /// A non-blank campaign ID.
    pub fn arb_campaign_id() -> impl Strategy<Value = String> {
        "[a-z0-9]{1,8}(-[a-z0-9]{1,4})?"
    }

    /// `count` distinct campaign IDs, sorted.
    pub fn arb_campaign_ids(count: std::ops::Range<usize>) -> impl Strategy<Value = Vec<String>> {
        btree_set(arb_campaign_id(), count).prop_map(|ids| ids.into_iter().collect())
    }

    /// An event type from one of the known namespaces.
    pub fn arb_known_event_type() -> impl Strategy<Value = String> {
        let namespace = prop_oneof![
            Just("campaign."),
            Just("participant."),
            Just("session."),
            Just("character."),
            Just("invite."),
        ];
        prop_oneof![
            (namespace, "[a-z_]{1,12}").prop_map(|(ns, action)| format!("{ns}{action}")),
            Just("seat.reassigned".to_string()),
        ]
    }

    /// Any event type, including unknown namespaces and junk.
    pub fn arb_event_type() -> impl Strategy<Value = String> {
        prop_oneof![
            3 => arb_known_event_type(),
            1 => "[a-z]{1,8}\\.[a-z_]{1,8}",
            1 => "\\PC{0,24}",
        ]
    }

    pub fn arb_cache_scope() -> impl Strategy<Value = CacheScope> {
        prop_oneof![
            Just(CacheScope::Summary),
            Just(CacheScope::Participants),
            Just(CacheScope::Sessions),
            Just(CacheScope::Characters),
            Just(CacheScope::Invites),
        ]
    }

    /// Events for one campaign with strictly increasing, gapped sequences.
    pub fn arb_campaign_events(
        campaign_id: String,
        count: std::ops::Range<usize>,
    ) -> impl Strategy<Value = Vec<CampaignEvent>> {
        proptest::collection::vec((1u64..5, arb_event_type()), count).prop_map(move |steps| {
            let mut seq = 0;
            steps
                .into_iter()
                .map(|(gap, event_type)| {
                    seq += gap;
                    CampaignEvent::new(campaign_id.clone(), seq, event_type)
                })
                .collect()
        })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Builders and inspectors for common test scenarios.

    use super::*;

    pub fn update(campaign_id: &str, seq: EventSeq, event_type: &str) -> CampaignUpdate {
        CampaignUpdate::new(campaign_id, seq, event_type)
    }

    /// `(scope, head_seq)` of every stale mark recorded for a campaign.
    pub async fn stale_scopes(
        store: &InMemoryCacheStore,
        campaign_id: &str,
    ) -> Vec<(CacheScope, EventSeq)> {
        store
            .stale_marks_for(campaign_id)
            .await
            .into_iter()
            .map(|mark| (mark.scope, mark.head_seq))
            .collect()
    }

    /// Stored cursor sequence, `None` when never synced.
    pub async fn cursor_seq(store: &dyn CacheStore, campaign_id: &str) -> Option<EventSeq> {
        store
            .get_campaign_event_cursor(campaign_id)
            .await
            .ok()
            .flatten()
            .map(|cursor| cursor.latest_seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_fake_log_paginates_ascending() {
        let log = FakeEventLog::new();
        log.push_events("c1", (1..=5).map(|seq| (seq, "session.started")));

        let first = log
            .list_events(ListEventsRequest::after("c1", 1, 3))
            .await
            .expect("list should succeed");
        assert_eq!(first.events.len(), 3);
        assert_eq!(first.next_page_token, "3");

        let second = log
            .list_events(ListEventsRequest::after("c1", 1, 3).with_page_token("3"))
            .await
            .expect("list should succeed");
        assert_eq!(second.events.len(), 1);
        assert!(!second.has_next_page());
    }

    #[tokio::test]
    async fn test_fake_log_head_query() {
        let log = FakeEventLog::new();
        log.push_events("c1", [(4, "invite.created"), (9, "campaign.renamed")]);

        let page = log
            .list_events(ListEventsRequest::head("c1"))
            .await
            .expect("list should succeed");
        assert_eq!(page.events, vec![Some(CampaignEvent::new("c1", 9, "campaign.renamed"))]);
        assert_eq!(log.head_seq("c1"), 9);
        assert_eq!(log.head_seq("missing"), 0);
    }

    #[tokio::test]
    async fn test_fake_log_replays_after_seq_when_unscripted() {
        let log = FakeEventLog::new();
        log.push_events("c1", [(1, "a.x"), (2, "b.y"), (3, "c.z")]);

        let updates: Vec<_> = log
            .subscribe_campaign_updates("c1", 1)
            .await
            .expect("subscribe should succeed")
            .collect()
            .await;
        let seqs: Vec<EventSeq> = updates
            .into_iter()
            .map(|update| update.expect("update should be ok").seq)
            .collect();
        assert_eq!(seqs, vec![2, 3]);
        assert_eq!(log.subscribe_calls(), vec![("c1".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_failing_store_fails_only_configured_campaign() {
        let store = FailingCacheStore::new(Arc::new(InMemoryCacheStore::new()));
        store.fail_on(StoreOp::MarkStale, "c2");

        store
            .mark_campaign_scope_stale("c1", CacheScope::Summary, 3, chrono::Utc::now())
            .await
            .expect("c1 should succeed");
        let err = store
            .mark_campaign_scope_stale("c2", CacheScope::Summary, 3, chrono::Utc::now())
            .await
            .expect_err("c2 should fail");
        assert!(matches!(
            err,
            LorekeepError::Store(StoreError::WriteFailed { .. })
        ));

        store.heal();
        store
            .mark_campaign_scope_stale("c2", CacheScope::Summary, 3, chrono::Utc::now())
            .await
            .expect("healed store should succeed");
    }

    #[tokio::test]
    async fn test_auditing_store_records_cursor_at_mark_time() {
        let store = AuditingCacheStore::new(Arc::new(InMemoryCacheStore::new()));
        store
            .mark_campaign_scope_stale("c1", CacheScope::Invites, 2, chrono::Utc::now())
            .await
            .expect("mark should succeed");
        store
            .put_campaign_event_cursor(&CampaignEventCursor::now("c1", 5))
            .await
            .expect("cursor write should succeed");
        store
            .mark_campaign_scope_stale("c1", CacheScope::Sessions, 4, chrono::Utc::now())
            .await
            .expect("mark should succeed");

        let marks = store.marks();
        assert_eq!(marks.len(), 2);
        assert_eq!(marks[0].cursor_seq, None);
        assert_eq!(
            store.marks_below_cursor(),
            vec![MarkAudit {
                campaign_id: "c1".to_string(),
                scope: CacheScope::Sessions,
                head_seq: 4,
                cursor_seq: Some(5),
            }]
        );
    }
}
