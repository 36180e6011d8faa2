//! Error types for lorekeep operations

use std::fmt;
use thiserror::Error;

/// Cache store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Read failed for {record}: {reason}")]
    ReadFailed { record: String, reason: String },

    #[error("Write failed for {record}: {reason}")]
    WriteFailed { record: String, reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Store lock poisoned")]
    LockPoisoned,
}

/// Upstream event-log errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventLogError {
    #[error("Event log unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Event log deadline exceeded: {reason}")]
    DeadlineExceeded { reason: String },

    #[error("Event log RPC failed with {code}: {message}")]
    Rpc { code: String, message: String },

    #[error("Update stream closed for campaign {campaign_id}")]
    StreamClosed { campaign_id: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// The step of a campaign sync that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    ReadHead,
    ReadCursor,
    ListDelta,
    MarkStale,
    WriteCursor,
    Subscribe,
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStage::ReadHead => "read event head",
            SyncStage::ReadCursor => "read event cursor",
            SyncStage::ListDelta => "list delta events",
            SyncStage::MarkStale => "mark scope stale",
            SyncStage::WriteCursor => "write event cursor",
            SyncStage::Subscribe => "subscribe to campaign updates",
        };
        f.write_str(name)
    }
}

/// Master error type for all lorekeep errors.
#[derive(Debug, Clone, Error)]
pub enum LorekeepError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Event log error: {0}")]
    EventLog(#[from] EventLogError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Telemetry setup failed: {reason}")]
    Telemetry { reason: String },

    #[error("Campaign {campaign_id}: {stage} failed: {source}")]
    CampaignSync {
        campaign_id: String,
        stage: SyncStage,
        #[source]
        source: Box<LorekeepError>,
    },
}

impl LorekeepError {
    /// Wrap this error with the campaign and step it occurred in.
    pub fn in_campaign(self, campaign_id: impl Into<String>, stage: SyncStage) -> Self {
        LorekeepError::CampaignSync {
            campaign_id: campaign_id.into(),
            stage,
            source: Box::new(self),
        }
    }

    /// Whether retrying later may succeed without operator action.
    pub fn is_transient(&self) -> bool {
        match self {
            LorekeepError::Store(StoreError::Serialization { .. }) => false,
            LorekeepError::Store(_) => true,
            LorekeepError::EventLog(EventLogError::Rpc { .. }) => false,
            LorekeepError::EventLog(_) => true,
            LorekeepError::Config(_) | LorekeepError::Telemetry { .. } => false,
            LorekeepError::CampaignSync { source, .. } => source.is_transient(),
        }
    }

    /// The innermost error, skipping campaign context wrappers.
    pub fn root(&self) -> &LorekeepError {
        match self {
            LorekeepError::CampaignSync { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result type alias for lorekeep operations.
pub type LorekeepResult<T> = Result<T, LorekeepError>;

/// Extension for attaching campaign context to fallible results.
pub trait SyncResultExt<T> {
    fn in_campaign(self, campaign_id: &str, stage: SyncStage) -> LorekeepResult<T>;
}

impl<T, E: Into<LorekeepError>> SyncResultExt<T> for Result<T, E> {
    fn in_campaign(self, campaign_id: &str, stage: SyncStage) -> LorekeepResult<T> {
        self.map_err(|e| e.into().in_campaign(campaign_id, stage))
    }
}

// =============================================================================
// TESTS
// =============================================================================
