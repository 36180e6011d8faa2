//! LMDB-backed cache store.
//!
//! Uses the heed crate (Rust bindings for LMDB) to provide a memory-mapped,
//! crash-safe store for cursors, stale marks and cached projections.
//!
//! # Layout
//!
//! Four named databases live in one environment:
//! - `tracked`: campaign ID -> empty value
//! - `cursors`: campaign ID -> JSON `CampaignEventCursor`
//! - `stale_marks`: `CampaignScopedKey` -> JSON `StaleMark`
//! - `entries`: entry key -> JSON `CacheEntry`
//!
//! Monotonic cursor and stale-mark checks run inside the same write
//! transaction as the write, so concurrent workers cannot interleave between
//! the comparison and the put.

use std::path::Path;

use async_trait::async_trait;
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use lorekeep_core::{
    CacheEntry, CacheScope, CampaignEventCursor, EventSeq, LorekeepError, LorekeepResult,
    StaleMark, StoreError, Timestamp,
};

use super::campaign_key::CampaignScopedKey;
use super::traits::CacheStore;

const TRACKED_DB: &str = "tracked";
const CURSORS_DB: &str = "cursors";
const STALE_MARKS_DB: &str = "stale_marks";
const ENTRIES_DB: &str = "entries";

/// Error type for LMDB store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open a named database within the environment.
    #[error("Failed to open database {name}: {reason}")]
    DbOpen { name: &'static str, reason: String },

    /// Read transaction error.
    #[error("Read error on {record}: {reason}")]
    Read { record: String, reason: String },

    /// Write transaction error.
    #[error("Write error on {record}: {reason}")]
    Write { record: String, reason: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbStoreError> for LorekeepError {
    fn from(e: LmdbStoreError) -> Self {
        let store_error = match e {
            LmdbStoreError::Read { record, reason } => StoreError::ReadFailed { record, reason },
            LmdbStoreError::Write { record, reason } => StoreError::WriteFailed { record, reason },
            LmdbStoreError::Serialization(reason) => StoreError::Serialization { reason },
            other => StoreError::Unavailable {
                reason: other.to_string(),
            },
        };
        LorekeepError::Store(store_error)
    }
}

fn read_err(record: impl Into<String>) -> impl FnOnce(heed::Error) -> LmdbStoreError {
    let record = record.into();
    move |e| LmdbStoreError::Read {
        record,
        reason: e.to_string(),
    }
}

fn write_err(record: impl Into<String>) -> impl FnOnce(heed::Error) -> LmdbStoreError {
    let record = record.into();
    move |e| LmdbStoreError::Write {
        record,
        reason: e.to_string(),
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, LmdbStoreError> {
    serde_json::to_vec(value).map_err(|e| LmdbStoreError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, LmdbStoreError> {
    serde_json::from_slice(bytes).map_err(|e| LmdbStoreError::Serialization(e.to_string()))
}

/// LMDB-backed cache store.
///
/// # Example
///
/// ```ignore
/// use lorekeep_storage::{CacheStore, LmdbCacheStore};
///
/// let store = LmdbCacheStore::new("/var/lib/lorekeep/cache", 256)?;
/// store.track_campaign("camp-1").await?;
/// let cursor = store.get_campaign_event_cursor("camp-1").await?;
/// ```
pub struct LmdbCacheStore {
    env: Env,
    tracked: Database<Str, Bytes>,
    cursors: Database<Str, Bytes>,
    stale_marks: Database<Bytes, Bytes>,
    entries: Database<Str, Bytes>,
}

impl LmdbCacheStore {
    /// Open (or create) an LMDB cache store.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the memory map in megabytes
    pub fn new<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbStoreError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment directory is owned by this process; heed
        // requires the caller to not open the same path twice in one process.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(4)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(write_err("environment"))?;

        let tracked = env
            .create_database::<Str, Bytes>(&mut wtxn, Some(TRACKED_DB))
            .map_err(|e| LmdbStoreError::DbOpen {
                name: TRACKED_DB,
                reason: e.to_string(),
            })?;
        let cursors = env
            .create_database::<Str, Bytes>(&mut wtxn, Some(CURSORS_DB))
            .map_err(|e| LmdbStoreError::DbOpen {
                name: CURSORS_DB,
                reason: e.to_string(),
            })?;
        let stale_marks = env
            .create_database::<Bytes, Bytes>(&mut wtxn, Some(STALE_MARKS_DB))
            .map_err(|e| LmdbStoreError::DbOpen {
                name: STALE_MARKS_DB,
                reason: e.to_string(),
            })?;
        let entries = env
            .create_database::<Str, Bytes>(&mut wtxn, Some(ENTRIES_DB))
            .map_err(|e| LmdbStoreError::DbOpen {
                name: ENTRIES_DB,
                reason: e.to_string(),
            })?;

        wtxn.commit().map_err(write_err("environment"))?;

        tracing::info!(path = %path.as_ref().display(), max_size_mb, "Opened LMDB cache store");

        Ok(Self {
            env,
            tracked,
            cursors,
            stale_marks,
            entries,
        })
    }

    /// All stale marks recorded for a campaign, via a prefix scan.
    pub fn stale_marks_for(&self, campaign_id: &str) -> Result<Vec<StaleMark>, LmdbStoreError> {
        let record = format!("stale marks {}", campaign_id);
        let prefix = CampaignScopedKey::campaign_prefix(campaign_id);
        let rtxn = self.env.read_txn().map_err(read_err(record.as_str()))?;
        let iter = self
            .stale_marks
            .prefix_iter(&rtxn, &prefix)
            .map_err(read_err(record.as_str()))?;

        let mut marks = Vec::new();
        for result in iter {
            let (key, value) = result.map_err(read_err(record.as_str()))?;
            match CampaignScopedKey::decode(key) {
                Some(key) if key.belongs_to(campaign_id) => marks.push(decode(value)?),
                _ => continue,
            }
        }
        Ok(marks)
    }

    fn track_in(&self, wtxn: &mut heed::RwTxn<'_>, campaign_id: &str) -> Result<(), LmdbStoreError> {
        self.tracked
            .put(wtxn, campaign_id, &[])
            .map_err(write_err(format!("tracked {}", campaign_id)))
    }
}

#[async_trait]
impl CacheStore for LmdbCacheStore {
    async fn list_tracked_campaign_ids(&self) -> LorekeepResult<Vec<String>> {
        let rtxn = self.env.read_txn().map_err(read_err(TRACKED_DB))?;
        let iter = self.tracked.iter(&rtxn).map_err(read_err(TRACKED_DB))?;

        let mut ids = Vec::new();
        for result in iter {
            let (campaign_id, _) = result.map_err(read_err(TRACKED_DB))?;
            ids.push(campaign_id.to_string());
        }
        Ok(ids)
    }

    async fn track_campaign(&self, campaign_id: &str) -> LorekeepResult<()> {
        let mut wtxn = self.env.write_txn().map_err(write_err(TRACKED_DB))?;
        self.track_in(&mut wtxn, campaign_id)?;
        wtxn.commit().map_err(write_err(TRACKED_DB))?;
        Ok(())
    }

    async fn get_campaign_event_cursor(
        &self,
        campaign_id: &str,
    ) -> LorekeepResult<Option<CampaignEventCursor>> {
        let record = format!("cursor {}", campaign_id);
        let rtxn = self.env.read_txn().map_err(read_err(record.as_str()))?;
        let cursor = self
            .cursors
            .get(&rtxn, campaign_id)
            .map_err(read_err(record.as_str()))?
            .map(decode::<CampaignEventCursor>)
            .transpose()?;
        Ok(cursor)
    }

    async fn put_campaign_event_cursor(&self, cursor: &CampaignEventCursor) -> LorekeepResult<()> {
        let record = format!("cursor {}", cursor.campaign_id);
        let mut wtxn = self.env.write_txn().map_err(write_err(record.as_str()))?;

        let existing = self
            .cursors
            .get(&wtxn, &cursor.campaign_id)
            .map_err(read_err(record.as_str()))?
            .map(decode::<CampaignEventCursor>)
            .transpose()?;
        if let Some(existing) = existing {
            if existing.latest_seq > cursor.latest_seq {
                tracing::debug!(
                    campaign_id = %cursor.campaign_id,
                    stored = existing.latest_seq,
                    proposed = cursor.latest_seq,
                    "Ignoring regressive cursor write"
                );
                return Ok(());
            }
        }

        let bytes = encode(cursor)?;
        self.cursors
            .put(&mut wtxn, &cursor.campaign_id, &bytes)
            .map_err(write_err(record.as_str()))?;
        wtxn.commit().map_err(write_err(record.as_str()))?;
        Ok(())
    }

    async fn mark_campaign_scope_stale(
        &self,
        campaign_id: &str,
        scope: CacheScope,
        head_seq: EventSeq,
        checked_at: Timestamp,
    ) -> LorekeepResult<()> {
        let record = format!("stale mark {} {}", campaign_id, scope);
        let key = CampaignScopedKey::new(campaign_id, scope).encode();
        let mut wtxn = self.env.write_txn().map_err(write_err(record.as_str()))?;

        let existing = self
            .stale_marks
            .get(&wtxn, &key)
            .map_err(read_err(record.as_str()))?
            .map(decode::<StaleMark>)
            .transpose()?;
        if existing.is_some_and(|mark| mark.head_seq > head_seq) {
            return Ok(());
        }

        let bytes = encode(&StaleMark::new(campaign_id, scope, head_seq, checked_at))?;
        self.stale_marks
            .put(&mut wtxn, &key, &bytes)
            .map_err(write_err(record.as_str()))?;
        wtxn.commit().map_err(write_err(record.as_str()))?;
        Ok(())
    }

    async fn get_campaign_scope_stale_mark(
        &self,
        campaign_id: &str,
        scope: CacheScope,
    ) -> LorekeepResult<Option<StaleMark>> {
        let record = format!("stale mark {} {}", campaign_id, scope);
        let key = CampaignScopedKey::new(campaign_id, scope).encode();
        let rtxn = self.env.read_txn().map_err(read_err(record.as_str()))?;
        let mark = self
            .stale_marks
            .get(&rtxn, &key)
            .map_err(read_err(record.as_str()))?
            .map(decode::<StaleMark>)
            .transpose()?;
        Ok(mark)
    }

    async fn get_cache_entry(&self, key: &str) -> LorekeepResult<Option<CacheEntry>> {
        let record = format!("entry {}", key);
        let rtxn = self.env.read_txn().map_err(read_err(record.as_str()))?;
        let entry = self
            .entries
            .get(&rtxn, key)
            .map_err(read_err(record.as_str()))?
            .map(decode::<CacheEntry>)
            .transpose()?;
        Ok(entry)
    }

    async fn put_cache_entry(&self, entry: &CacheEntry) -> LorekeepResult<()> {
        let record = format!("entry {}", entry.key);
        let bytes = encode(entry)?;
        let mut wtxn = self.env.write_txn().map_err(write_err(record.as_str()))?;
        self.entries
            .put(&mut wtxn, &entry.key, &bytes)
            .map_err(write_err(record.as_str()))?;
        self.track_in(&mut wtxn, &entry.campaign_id)?;
        wtxn.commit().map_err(write_err(record.as_str()))?;
        Ok(())
    }

    async fn delete_cache_entry(&self, key: &str) -> LorekeepResult<()> {
        let record = format!("entry {}", key);
        let mut wtxn = self.env.write_txn().map_err(write_err(record.as_str()))?;
        self.entries
            .delete(&mut wtxn, key)
            .map_err(write_err(record.as_str()))?;
        wtxn.commit().map_err(write_err(record.as_str()))?;
        Ok(())
    }
}
