//! Constants for lorekeep-sync
//!
//! Default values for the sync workers and their environment variables.

// ============================================================================
// GAME SERVICE
// ============================================================================

/// Default gRPC endpoint of the game service
pub const DEFAULT_GAME_ADDR: &str = "http://127.0.0.1:8082";

/// Connect timeout for the game service channel in seconds
pub const GAME_CONNECT_TIMEOUT_SECS: u64 = 5;

// ============================================================================
// CACHE STORE
// ============================================================================

/// Default LMDB map size in megabytes
pub const DEFAULT_CACHE_MAX_SIZE_MB: usize = 256;

// ============================================================================
// INVALIDATION POLLER
// ============================================================================

/// Default poll interval in seconds
pub const DEFAULT_INVALIDATION_INTERVAL_SECS: u64 = 30;

/// Default cap on campaigns per pass (0 = unbounded)
pub const DEFAULT_INVALIDATION_MAX_CAMPAIGNS: usize = 0;

/// Page size used when listing delta events
pub const DELTA_PAGE_SIZE: u32 = 200;

// ============================================================================
// PROJECTION CONSUMER
// ============================================================================

/// Default cap on concurrently subscribed campaigns (0 = unbounded)
pub const DEFAULT_PROJECTION_MAX_CAMPAIGNS: usize = 0;

/// Default batch rotation interval in seconds
pub const DEFAULT_PROJECTION_ROTATION_SECS: u64 = 300;

/// Default initial resubscribe backoff in milliseconds
pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 1_000;

/// Default maximum resubscribe backoff in milliseconds
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

/// Default backoff growth factor
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Default backoff jitter in milliseconds
pub const DEFAULT_BACKOFF_JITTER_MS: u64 = 250;

// ============================================================================
// LOGGING
// ============================================================================

/// Filter used when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = "lorekeep_sync=debug,lorekeep_storage=info,info";

// ============================================================================
// ENVIRONMENT VARIABLES
// ============================================================================

pub const ENV_GAME_ADDR: &str = "LOREKEEP_GAME_ADDR";
pub const ENV_CACHE_PATH: &str = "LOREKEEP_CACHE_PATH";
pub const ENV_CACHE_MAX_SIZE_MB: &str = "LOREKEEP_CACHE_MAX_SIZE_MB";
pub const ENV_INVALIDATION_INTERVAL_SECS: &str = "LOREKEEP_CACHE_INVALIDATION_INTERVAL_SECS";
pub const ENV_INVALIDATION_MAX_CAMPAIGNS: &str = "LOREKEEP_CACHE_INVALIDATION_MAX_CAMPAIGNS";
pub const ENV_PROJECTION_ENABLED: &str = "LOREKEEP_PROJECTION_SUBSCRIPTION_ENABLED";
pub const ENV_PROJECTION_MAX_CAMPAIGNS: &str = "LOREKEEP_PROJECTION_MAX_CAMPAIGNS";
pub const ENV_PROJECTION_ROTATION_SECS: &str = "LOREKEEP_PROJECTION_ROTATION_SECS";
pub const ENV_BACKOFF_INITIAL_MS: &str = "LOREKEEP_PROJECTION_BACKOFF_INITIAL_MS";
pub const ENV_BACKOFF_MAX_MS: &str = "LOREKEEP_PROJECTION_BACKOFF_MAX_MS";
pub const ENV_BACKOFF_MULTIPLIER: &str = "LOREKEEP_PROJECTION_BACKOFF_MULTIPLIER";
pub const ENV_BACKOFF_JITTER_MS: &str = "LOREKEEP_PROJECTION_BACKOFF_JITTER_MS";
pub const ENV_LOG_FORMAT: &str = "LOREKEEP_LOG_FORMAT";
