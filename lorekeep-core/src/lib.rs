//! Lorekeep Core - Campaign Cache Types
//!
//! Data structures shared by the storage and sync crates: campaign events,
//! event cursors, cache scopes and stale marks, plus the event log client
//! contract. The only behavior here is the scope classifier, which is a pure
//! function of an event type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

pub mod classify;
pub mod error;
pub mod event_log;

pub use classify::{classify_event, classify_events, RuleMatcher, ScopeClassifier, ScopeRule};
pub use event_log::{
    CampaignUpdateStream, EventLogClient, EventOrder, ListEventsPage, ListEventsRequest,
};
pub use error::{
    ConfigError, EventLogError, LorekeepError, LorekeepResult, StoreError, SyncResultExt,
    SyncStage,
};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Campaign identifier as issued by the game service.
///
/// Campaign IDs are opaque strings; blank IDs are never serviced.
pub type CampaignId = String;

/// Per-campaign event sequence number. Strictly increasing, not gap-free.
pub type EventSeq = u64;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Returns true when a campaign ID is empty or whitespace-only.
pub fn is_blank_campaign_id(campaign_id: &str) -> bool {
    campaign_id.trim().is_empty()
}

// ============================================================================
// EVENTS
// ============================================================================

/// A single entry of the upstream campaign event log.
///
/// Owned by the game service; this crate only ever reads events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignEvent {
    pub campaign_id: CampaignId,
    pub seq: EventSeq,
    /// Namespaced event type, e.g. `session.started`.
    pub event_type: String,
}

impl CampaignEvent {
    pub fn new(campaign_id: impl Into<String>, seq: EventSeq, event_type: impl Into<String>) -> Self {
        Self {
            campaign_id: campaign_id.into(),
            seq,
            event_type: event_type.into(),
        }
    }
}

/// One item of a campaign-update subscription stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignUpdate {
    pub campaign_id: CampaignId,
    pub seq: EventSeq,
    pub event_type: String,
}

impl CampaignUpdate {
    pub fn new(campaign_id: impl Into<String>, seq: EventSeq, event_type: impl Into<String>) -> Self {
        Self {
            campaign_id: campaign_id.into(),
            seq,
            event_type: event_type.into(),
        }
    }
}

impl From<CampaignEvent> for CampaignUpdate {
    fn from(event: CampaignEvent) -> Self {
        Self {
            campaign_id: event.campaign_id,
            seq: event.seq,
            event_type: event.event_type,
        }
    }
}

// ============================================================================
// CURSORS
// ============================================================================

/// The last event sequence reconciled for a campaign.
///
/// `latest_seq` never decreases across successive writes for the same
/// campaign; stores enforce this by ignoring regressive writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignEventCursor {
    pub campaign_id: CampaignId,
    pub latest_seq: EventSeq,
    pub checked_at: Timestamp,
}

impl CampaignEventCursor {
    pub fn new(campaign_id: impl Into<String>, latest_seq: EventSeq, checked_at: Timestamp) -> Self {
        Self {
            campaign_id: campaign_id.into(),
            latest_seq,
            checked_at,
        }
    }

    /// Create a cursor checked at the current wall-clock time.
    pub fn now(campaign_id: impl Into<String>, latest_seq: EventSeq) -> Self {
        Self::new(campaign_id, latest_seq, Utc::now())
    }
}

// ============================================================================
// CACHE SCOPES
// ============================================================================

/// Partition of the cached projections of one campaign.
///
/// Every cached artifact belongs to exactly one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CacheScope {
    #[serde(rename = "campaign.summary")]
    Summary,
    #[serde(rename = "campaign.participants")]
    Participants,
    #[serde(rename = "campaign.sessions")]
    Sessions,
    #[serde(rename = "campaign.characters")]
    Characters,
    #[serde(rename = "campaign.invites")]
    Invites,
}

impl CacheScope {
    /// All five canonical scopes, in declaration order.
    pub const ALL: [CacheScope; 5] = [
        CacheScope::Summary,
        CacheScope::Participants,
        CacheScope::Sessions,
        CacheScope::Characters,
        CacheScope::Invites,
    ];

    /// The canonical string tag of this scope.
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheScope::Summary => "campaign.summary",
            CacheScope::Participants => "campaign.participants",
            CacheScope::Sessions => "campaign.sessions",
            CacheScope::Characters => "campaign.characters",
            CacheScope::Invites => "campaign.invites",
        }
    }

    /// Single-byte discriminant used in binary store keys.
    pub fn as_byte(&self) -> u8 {
        match self {
            CacheScope::Summary => 1,
            CacheScope::Participants => 2,
            CacheScope::Sessions => 3,
            CacheScope::Characters => 4,
            CacheScope::Invites => 5,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(CacheScope::Summary),
            2 => Some(CacheScope::Participants),
            3 => Some(CacheScope::Sessions),
            4 => Some(CacheScope::Characters),
            5 => Some(CacheScope::Invites),
            _ => None,
        }
    }
}

impl fmt::Display for CacheScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CacheScope::ALL
            .iter()
            .copied()
            .find(|scope| scope.as_str() == s.trim())
            .ok_or_else(|| format!("Unknown cache scope: {}", s))
    }
}

/// Deduplicated, ordered set of cache scopes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeSet(BTreeSet<CacheScope>);

impl ScopeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The set of all five canonical scopes.
    pub fn all() -> Self {
        CacheScope::ALL.into_iter().collect()
    }

    pub fn insert(&mut self, scope: CacheScope) -> bool {
        self.0.insert(scope)
    }

    pub fn contains(&self, scope: CacheScope) -> bool {
        self.0.contains(&scope)
    }

    /// Add every scope of `other` to this set.
    pub fn union_with(&mut self, other: &ScopeSet) {
        self.0.extend(other.0.iter().copied());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_all(&self) -> bool {
        self.0.len() == CacheScope::ALL.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = CacheScope> + '_ {
        self.0.iter().copied()
    }

    /// Canonical tags of the contained scopes, for logging.
    pub fn tags(&self) -> Vec<&'static str> {
        self.iter().map(|scope| scope.as_str()).collect()
    }
}

impl FromIterator<CacheScope> for ScopeSet {
    fn from_iter<I: IntoIterator<Item = CacheScope>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[CacheScope; N]> for ScopeSet {
    fn from(scopes: [CacheScope; N]) -> Self {
        scopes.into_iter().collect()
    }
}

impl IntoIterator for ScopeSet {
    type Item = CacheScope;
    type IntoIter = std::collections::btree_set::IntoIter<CacheScope>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

// ============================================================================
// STALE MARKS
// ============================================================================

/// Durable assertion that a cache scope is invalid as of `head_seq`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleMark {
    pub campaign_id: CampaignId,
    pub scope: CacheScope,
    pub head_seq: EventSeq,
    pub checked_at: Timestamp,
}

impl StaleMark {
    pub fn new(
        campaign_id: impl Into<String>,
        scope: CacheScope,
        head_seq: EventSeq,
        checked_at: Timestamp,
    ) -> Self {
        Self {
            campaign_id: campaign_id.into(),
            scope,
            head_seq,
            checked_at,
        }
    }

    /// Whether a payload built at `build_seq` must be rebuilt.
    pub fn invalidates(&self, build_seq: EventSeq) -> bool {
        build_seq < self.head_seq
    }
}

// ============================================================================
// CACHE ENTRIES
// ============================================================================

/// An opaque cached projection. The engine never interprets `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub campaign_id: CampaignId,
    pub scope: CacheScope,
    /// Event sequence the payload was built from.
    pub build_seq: EventSeq,
    pub payload: serde_json::Value,
    pub cached_at: Timestamp,
}

impl CacheEntry {
    /// Whether this entry is still valid against the given stale mark.
    pub fn is_fresh_against(&self, mark: Option<&StaleMark>) -> bool {
        match mark {
            Some(mark) => !mark.invalidates(self.build_seq),
            None => true,
        }
    }
}
