//! Event log client contract.
//!
//! The campaign event log belongs to the game service. This module describes
//! the two RPCs the sync workers consume: an ordered, paginated listing and a
//! server-streaming subscription to campaign updates. The tonic client lives
//! in lorekeep-sync; tests use the scripted fake in lorekeep-test-utils.

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::{CampaignEvent, CampaignUpdate, EventLogError, EventSeq, LorekeepResult};

/// Sort order for event listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventOrder {
    /// Ascending by sequence (`seq`).
    #[default]
    SeqAsc,
    /// Descending by sequence (`seq desc`).
    SeqDesc,
}

impl EventOrder {
    /// Wire form of the `order_by` field.
    pub fn as_order_by(&self) -> &'static str {
        match self {
            EventOrder::SeqAsc => "seq",
            EventOrder::SeqDesc => "seq desc",
        }
    }
}

/// Logical `ListEvents` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEventsRequest {
    pub campaign_id: String,
    pub page_size: u32,
    /// Empty for the first page.
    pub page_token: String,
    pub order_by: EventOrder,
    /// Exclusive lower bound; 0 lists from the beginning.
    pub after_seq: EventSeq,
}

impl ListEventsRequest {
    /// Request for the single newest event of a campaign.
    pub fn head(campaign_id: impl Into<String>) -> Self {
        Self {
            campaign_id: campaign_id.into(),
            page_size: 1,
            page_token: String::new(),
            order_by: EventOrder::SeqDesc,
            after_seq: 0,
        }
    }

    /// Request for events strictly after `after_seq`, oldest first.
    pub fn after(campaign_id: impl Into<String>, after_seq: EventSeq, page_size: u32) -> Self {
        Self {
            campaign_id: campaign_id.into(),
            page_size,
            page_token: String::new(),
            order_by: EventOrder::SeqAsc,
            after_seq,
        }
    }

    /// Same request positioned at another page.
    pub fn with_page_token(mut self, page_token: impl Into<String>) -> Self {
        self.page_token = page_token.into();
        self
    }
}

/// One page of a `ListEvents` response.
///
/// Entries may be `None` when the upstream sends an empty message; callers
/// skip them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListEventsPage {
    pub events: Vec<Option<CampaignEvent>>,
    /// Empty when there are no further pages.
    pub next_page_token: String,
}

impl ListEventsPage {
    pub fn has_next_page(&self) -> bool {
        !self.next_page_token.is_empty()
    }
}

/// Stream of campaign updates; an `Err` item ends the subscription.
pub type CampaignUpdateStream = BoxStream<'static, Result<CampaignUpdate, EventLogError>>;

/// Client for the upstream campaign event log.
#[async_trait]
pub trait EventLogClient: Send + Sync {
    /// List one page of events.
    async fn list_events(&self, request: ListEventsRequest) -> LorekeepResult<ListEventsPage>;

    /// Open a server stream of updates with `seq > after_seq`.
    async fn subscribe_campaign_updates(
        &self,
        campaign_id: &str,
        after_seq: EventSeq,
    ) -> LorekeepResult<CampaignUpdateStream>;
}
