//! Campaign-scoped binary keys for LMDB stale-mark records.
//!
//! Keys sort by campaign first, so a prefix scan visits exactly one
//! campaign's records.

use lorekeep_core::CacheScope;

/// Separator byte between the campaign ID and the scope discriminant.
///
/// 0xFF never occurs in UTF-8, so the separator cannot collide with a byte
/// of the campaign ID.
const SEPARATOR: u8 = 0xFF;

/// A store key scoped to one campaign and one cache scope.
///
/// # Binary Format
///
/// - Bytes 0..n: campaign ID (UTF-8)
/// - Byte n: separator (0xFF)
/// - Byte n+1: scope discriminant
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CampaignScopedKey {
    campaign_id: String,
    scope: CacheScope,
}

impl CampaignScopedKey {
    pub fn new(campaign_id: impl Into<String>, scope: CacheScope) -> Self {
        Self {
            campaign_id: campaign_id.into(),
            scope,
        }
    }

    pub fn campaign_id(&self) -> &str {
        &self.campaign_id
    }

    pub fn scope(&self) -> CacheScope {
        self.scope
    }

    /// Encode this key for LMDB storage.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Self::campaign_prefix(&self.campaign_id);
        bytes.push(self.scope.as_byte());
        bytes
    }

    /// Decode a key from bytes.
    ///
    /// Returns `None` if the separator is missing or misplaced, the scope
    /// byte is unknown, or the campaign ID is not valid UTF-8.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (scope_byte, rest) = bytes.split_last()?;
        let (separator, campaign_bytes) = rest.split_last()?;
        if *separator != SEPARATOR {
            return None;
        }
        let scope = CacheScope::from_byte(*scope_byte)?;
        let campaign_id = std::str::from_utf8(campaign_bytes).ok()?;
        Some(Self::new(campaign_id, scope))
    }

    /// Prefix shared by every key of a campaign.
    pub fn campaign_prefix(campaign_id: &str) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(campaign_id.len() + 2);
        bytes.extend_from_slice(campaign_id.as_bytes());
        bytes.push(SEPARATOR);
        bytes
    }

    /// Whether this key belongs to the given campaign.
    pub fn belongs_to(&self, campaign_id: &str) -> bool {
        self.campaign_id == campaign_id
    }
}
