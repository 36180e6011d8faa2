//! Cache store for campaign projections, event cursors and stale marks.
//!
//! The store is the single point both sync workers meet: the invalidation
//! poller and the projection subscription consumer read and write the same
//! cursor and stale-mark records through [`CacheStore`].
//!
//! # Monotonic Writes
//!
//! Cursor and stale-mark writes never move a sequence backwards. A write
//! carrying a lower sequence than the stored record is accepted and ignored,
//! which makes re-applying an older observation from either worker harmless.
//!
//! # Example
//!
//! ```ignore
//! let store = InMemoryCacheStore::new();
//! store.track_campaign("camp-1").await?;
//! store
//!     .mark_campaign_scope_stale("camp-1", CacheScope::Sessions, 42, Utc::now())
//!     .await?;
//!
//! // A reader compares the payload build sequence with the stale mark.
//! let mark = store
//!     .get_campaign_scope_stale_mark("camp-1", CacheScope::Sessions)
//!     .await?;
//! if !entry.is_fresh_against(mark.as_ref()) {
//!     rebuild_sessions_view().await?;
//! }
//! ```

pub mod campaign_key;
pub mod lmdb_backend;
pub mod memory;
pub mod traits;

pub use campaign_key::CampaignScopedKey;
pub use lmdb_backend::{LmdbCacheStore, LmdbStoreError};
pub use memory::InMemoryCacheStore;
pub use traits::CacheStore;
