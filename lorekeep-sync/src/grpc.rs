//! gRPC client for the game service event log.
//!
//! Wraps the tonic client generated from proto/game.proto and maps wire
//! messages and `tonic::Status` into lorekeep types.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};

use lorekeep_core::{
    CampaignEvent, CampaignUpdate, CampaignUpdateStream, ConfigError, EventLogClient,
    EventLogError, EventSeq, ListEventsPage, ListEventsRequest, LorekeepResult,
};

use crate::constants::{ENV_GAME_ADDR, GAME_CONNECT_TIMEOUT_SECS};

// Include the generated protobuf code
pub mod proto {
    tonic::include_proto!("lorekeep.game.v1");
}

use proto::event_service_client::EventServiceClient;

// ============================================================================
// CONVERSIONS
// ============================================================================

/// Map a gRPC status onto the event-log error taxonomy.
pub fn event_log_error_from_status(status: &Status) -> EventLogError {
    match status.code() {
        Code::Unavailable | Code::Cancelled | Code::Aborted | Code::ResourceExhausted => {
            EventLogError::Unavailable {
                reason: status.message().to_string(),
            }
        }
        Code::DeadlineExceeded => EventLogError::DeadlineExceeded {
            reason: status.message().to_string(),
        },
        code => EventLogError::Rpc {
            code: format!("{:?}", code),
            message: status.message().to_string(),
        },
    }
}

/// A default-valued message stands for a missing event.
fn event_from_proto(event: proto::Event) -> Option<CampaignEvent> {
    if event.seq == 0 && event.campaign_id.is_empty() && event.event_type.is_empty() {
        return None;
    }
    Some(CampaignEvent::new(event.campaign_id, event.seq, event.event_type))
}

fn update_from_proto(update: proto::CampaignUpdate) -> CampaignUpdate {
    CampaignUpdate::new(update.campaign_id, update.seq, update.event_type)
}

fn request_to_proto(request: ListEventsRequest) -> proto::ListEventsRequest {
    proto::ListEventsRequest {
        campaign_id: request.campaign_id,
        page_size: i32::try_from(request.page_size).unwrap_or(i32::MAX),
        page_token: request.page_token,
        order_by: request.order_by.as_order_by().to_string(),
        after_seq: request.after_seq,
    }
}

// ============================================================================
// CLIENT
// ============================================================================

/// `EventLogClient` backed by the game service's `EventService`.
#[derive(Debug, Clone)]
pub struct GrpcEventLogClient {
    client: EventServiceClient<Channel>,
}

impl GrpcEventLogClient {
    /// Build a client whose channel connects on first use.
    ///
    /// Must be called inside a tokio runtime.
    pub fn connect_lazy(addr: &str) -> Result<Self, ConfigError> {
        let endpoint = Endpoint::from_shared(addr.to_string())
            .map_err(|e| ConfigError::InvalidValue {
                field: ENV_GAME_ADDR.to_string(),
                value: addr.to_string(),
                reason: e.to_string(),
            })?
            .connect_timeout(Duration::from_secs(GAME_CONNECT_TIMEOUT_SECS));

        tracing::info!(game_addr = %addr, "Game event log client configured");
        Ok(Self::from_channel(endpoint.connect_lazy()))
    }

    pub fn from_channel(channel: Channel) -> Self {
        Self {
            client: EventServiceClient::new(channel),
        }
    }
}

#[async_trait]
impl EventLogClient for GrpcEventLogClient {
    async fn list_events(&self, request: ListEventsRequest) -> LorekeepResult<ListEventsPage> {
        let mut client = self.client.clone();
        let response = client
            .list_events(request_to_proto(request))
            .await
            .map_err(|status| event_log_error_from_status(&status))?
            .into_inner();

        Ok(ListEventsPage {
            events: response.events.into_iter().map(event_from_proto).collect(),
            next_page_token: response.next_page_token,
        })
    }

    async fn subscribe_campaign_updates(
        &self,
        campaign_id: &str,
        after_seq: EventSeq,
    ) -> LorekeepResult<CampaignUpdateStream> {
        let mut client = self.client.clone();
        let stream = client
            .subscribe_campaign_updates(proto::SubscribeCampaignUpdatesRequest {
                campaign_id: campaign_id.to_string(),
                after_seq,
            })
            .await
            .map_err(|status| event_log_error_from_status(&status))?
            .into_inner();

        Ok(stream
            .map(|item| {
                item.map(update_from_proto)
                    .map_err(|status| event_log_error_from_status(&status))
            })
            .boxed())
    }
}
