//! Cache store trait.
//!
//! This module defines the contract the sync workers rely on. Consistency is
//! delegated to the implementation: a completed write must be visible to any
//! later read of the same record. No cross-campaign ordering is assumed.

use async_trait::async_trait;
use lorekeep_core::{
    CacheEntry, CacheScope, CampaignEventCursor, EventSeq, LorekeepResult, StaleMark, Timestamp,
};

/// Durable store for cache entries, event cursors and stale marks.
///
/// Implementations must be thread-safe; both sync workers share one store
/// through `Arc<dyn CacheStore>`.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// List the campaigns whose projections are cached, in key order.
    async fn list_tracked_campaign_ids(&self) -> LorekeepResult<Vec<String>>;

    /// Register a campaign for invalidation tracking. Idempotent.
    async fn track_campaign(&self, campaign_id: &str) -> LorekeepResult<()>;

    /// Get the stored event cursor.
    ///
    /// `None` means the campaign was never synced, which is distinct from a
    /// cursor at sequence 0.
    async fn get_campaign_event_cursor(
        &self,
        campaign_id: &str,
    ) -> LorekeepResult<Option<CampaignEventCursor>>;

    /// Persist an event cursor. Writes below the stored sequence are ignored.
    async fn put_campaign_event_cursor(&self, cursor: &CampaignEventCursor) -> LorekeepResult<()>;

    /// Record that `scope` is invalid as of at least `head_seq`.
    ///
    /// Marks below the stored `head_seq` are ignored.
    async fn mark_campaign_scope_stale(
        &self,
        campaign_id: &str,
        scope: CacheScope,
        head_seq: EventSeq,
        checked_at: Timestamp,
    ) -> LorekeepResult<()>;

    /// Latest stale mark for a scope, if any.
    async fn get_campaign_scope_stale_mark(
        &self,
        campaign_id: &str,
        scope: CacheScope,
    ) -> LorekeepResult<Option<StaleMark>>;

    /// Get an opaque cache entry.
    async fn get_cache_entry(&self, key: &str) -> LorekeepResult<Option<CacheEntry>>;

    /// Put an opaque cache entry. Also tracks the entry's campaign.
    async fn put_cache_entry(&self, entry: &CacheEntry) -> LorekeepResult<()>;

    /// Delete an opaque cache entry. Deleting a missing key is not an error.
    async fn delete_cache_entry(&self, key: &str) -> LorekeepResult<()>;
}
