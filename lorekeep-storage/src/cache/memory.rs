//! In-memory cache store.
//!
//! Uses tokio::sync::RwLock for safe async access. Used by tests and by the
//! sync binary when no LMDB path is configured.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use lorekeep_core::{
    CacheEntry, CacheScope, CampaignEventCursor, EventSeq, LorekeepResult, StaleMark, Timestamp,
};

use super::traits::CacheStore;

#[derive(Debug, Default)]
struct StoreState {
    tracked: BTreeSet<String>,
    cursors: HashMap<String, CampaignEventCursor>,
    stale_marks: HashMap<(String, CacheScope), StaleMark>,
    entries: HashMap<String, CacheEntry>,
}

/// Cache store held entirely in process memory.
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    state: tokio::sync::RwLock<StoreState>,
}

impl InMemoryCacheStore {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already tracks the given campaigns.
    pub fn with_tracked<I, S>(campaign_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let state = StoreState {
            tracked: campaign_ids.into_iter().map(Into::into).collect(),
            ..Default::default()
        };
        Self {
            state: tokio::sync::RwLock::new(state),
        }
    }

    /// All stale marks currently recorded for a campaign, ordered by scope.
    pub async fn stale_marks_for(&self, campaign_id: &str) -> Vec<StaleMark> {
        let state = self.state.read().await;
        let mut marks: Vec<StaleMark> = state
            .stale_marks
            .values()
            .filter(|mark| mark.campaign_id == campaign_id)
            .cloned()
            .collect();
        marks.sort_by_key(|mark| mark.scope);
        marks
    }

    /// Total number of stale marks across all campaigns.
    pub async fn stale_mark_count(&self) -> usize {
        self.state.read().await.stale_marks.len()
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn list_tracked_campaign_ids(&self) -> LorekeepResult<Vec<String>> {
        let state = self.state.read().await;
        Ok(state.tracked.iter().cloned().collect())
    }

    async fn track_campaign(&self, campaign_id: &str) -> LorekeepResult<()> {
        let mut state = self.state.write().await;
        state.tracked.insert(campaign_id.to_string());
        Ok(())
    }

    async fn get_campaign_event_cursor(
        &self,
        campaign_id: &str,
    ) -> LorekeepResult<Option<CampaignEventCursor>> {
        let state = self.state.read().await;
        Ok(state.cursors.get(campaign_id).cloned())
    }

    async fn put_campaign_event_cursor(&self, cursor: &CampaignEventCursor) -> LorekeepResult<()> {
        let mut state = self.state.write().await;
        match state.cursors.get(&cursor.campaign_id) {
            Some(existing) if existing.latest_seq > cursor.latest_seq => {
                tracing::debug!(
                    campaign_id = %cursor.campaign_id,
                    stored = existing.latest_seq,
                    proposed = cursor.latest_seq,
                    "Ignoring regressive cursor write"
                );
            }
            _ => {
                state
                    .cursors
                    .insert(cursor.campaign_id.clone(), cursor.clone());
            }
        }
        Ok(())
    }

    async fn mark_campaign_scope_stale(
        &self,
        campaign_id: &str,
        scope: CacheScope,
        head_seq: EventSeq,
        checked_at: Timestamp,
    ) -> LorekeepResult<()> {
        let mut state = self.state.write().await;
        let key = (campaign_id.to_string(), scope);
        let keep_existing = state
            .stale_marks
            .get(&key)
            .is_some_and(|existing| existing.head_seq > head_seq);
        if !keep_existing {
            state.stale_marks.insert(
                key,
                StaleMark::new(campaign_id, scope, head_seq, checked_at),
            );
        }
        Ok(())
    }

    async fn get_campaign_scope_stale_mark(
        &self,
        campaign_id: &str,
        scope: CacheScope,
    ) -> LorekeepResult<Option<StaleMark>> {
        let state = self.state.read().await;
        Ok(state
            .stale_marks
            .get(&(campaign_id.to_string(), scope))
            .cloned())
    }

    async fn get_cache_entry(&self, key: &str) -> LorekeepResult<Option<CacheEntry>> {
        let state = self.state.read().await;
        Ok(state.entries.get(key).cloned())
    }

    async fn put_cache_entry(&self, entry: &CacheEntry) -> LorekeepResult<()> {
        let mut state = self.state.write().await;
        state.tracked.insert(entry.campaign_id.clone());
        state.entries.insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn delete_cache_entry(&self, key: &str) -> LorekeepResult<()> {
        let mut state = self.state.write().await;
        state.entries.remove(key);
        Ok(())
    }
}
