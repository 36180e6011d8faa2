//! Lorekeep Storage - Cache Store Contract and Implementations
//!
//! Defines the `CacheStore` abstraction the sync workers write cursors and
//! stale marks through, plus an in-memory store for tests and development
//! and an LMDB-backed store for production.

pub mod cache;

pub use cache::{
    CacheStore, CampaignScopedKey, InMemoryCacheStore, LmdbCacheStore, LmdbStoreError,
};
