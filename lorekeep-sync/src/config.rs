//! Sync service configuration.
//!
//! Everything is read from environment variables. Parsing goes through a
//! lookup function so tests can supply values without touching the process
//! environment.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use lorekeep_core::ConfigError;

use crate::constants::{
    DEFAULT_CACHE_MAX_SIZE_MB, DEFAULT_GAME_ADDR, ENV_CACHE_MAX_SIZE_MB, ENV_CACHE_PATH,
    ENV_GAME_ADDR, ENV_LOG_FORMAT,
};
use crate::jobs::{InvalidationConfig, ProjectionConfig};
use crate::telemetry::LogFormat;

// ============================================================================
// LOOKUP HELPERS
// ============================================================================

fn invalid(key: &str, value: &str, reason: impl Display) -> ConfigError {
    ConfigError::InvalidValue {
        field: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Parse `key`, falling back to `default` when it is unset or blank.
pub(crate) fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|e| invalid(key, &raw, e))
        }
        _ => Ok(default),
    }
}

/// Parse a signed count where zero or a negative value means "use `fallback`".
pub(crate) fn parse_positive_or<F>(lookup: &F, key: &str, fallback: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value: i64 = parse_or(lookup, key, 0)?;
    Ok(u64::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .unwrap_or(fallback))
}

/// Parse a campaign cap where zero or a negative value means unbounded (0).
pub(crate) fn parse_cap<F>(lookup: &F, key: &str, default: usize) -> Result<usize, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value: i64 = parse_or(lookup, key, default as i64)?;
    Ok(usize::try_from(value).unwrap_or(0))
}

/// Parse a boolean flag (`true/false`, `1/0`, `yes/no`, `on/off`).
pub(crate) fn parse_flag<F>(lookup: &F, key: &str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(invalid(key, &raw, "expected a boolean")),
        },
        _ => Ok(default),
    }
}

// ============================================================================
// SYNC CONFIG
// ============================================================================

/// Complete configuration of the sync binary.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// gRPC endpoint of the game service
    pub game_addr: String,

    /// LMDB directory; `None` keeps the cache in memory
    pub cache_path: Option<PathBuf>,

    /// LMDB map size in megabytes
    pub cache_max_size_mb: usize,

    pub log_format: LogFormat,

    pub invalidation: InvalidationConfig,

    pub projection: ProjectionConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            game_addr: DEFAULT_GAME_ADDR.to_string(),
            cache_path: None,
            cache_max_size_mb: DEFAULT_CACHE_MAX_SIZE_MB,
            log_format: LogFormat::default(),
            invalidation: InvalidationConfig::default(),
            projection: ProjectionConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Load and validate the configuration from the process environment.
    ///
    /// # Environment Variables
    /// - `LOREKEEP_GAME_ADDR`: game service endpoint (default: http://127.0.0.1:8082)
    /// - `LOREKEEP_CACHE_PATH`: LMDB directory (default: in-memory store)
    /// - `LOREKEEP_CACHE_MAX_SIZE_MB`: LMDB map size (default: 256)
    /// - `LOREKEEP_LOG_FORMAT`: `json` or `pretty` (default: json)
    ///
    /// plus the worker variables documented on [`InvalidationConfig`] and
    /// [`ProjectionConfig`].
    pub fn try_from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load and validate the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let game_addr = lookup(ENV_GAME_ADDR)
            .map(|addr| addr.trim().to_string())
            .filter(|addr| !addr.is_empty())
            .unwrap_or_else(|| DEFAULT_GAME_ADDR.to_string());

        let cache_path = lookup(ENV_CACHE_PATH)
            .map(|path| path.trim().to_string())
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);

        let config = Self {
            game_addr,
            cache_path,
            cache_max_size_mb: parse_or(&lookup, ENV_CACHE_MAX_SIZE_MB, DEFAULT_CACHE_MAX_SIZE_MB)?,
            log_format: parse_or(&lookup, ENV_LOG_FORMAT, LogFormat::default())?,
            invalidation: InvalidationConfig::from_lookup(&lookup)?,
            projection: ProjectionConfig::from_lookup(&lookup)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.game_addr.starts_with("http://") || self.game_addr.starts_with("https://")) {
            return Err(invalid(
                ENV_GAME_ADDR,
                &self.game_addr,
                "must be an http:// or https:// URL",
            ));
        }
        if self.cache_max_size_mb == 0 {
            return Err(invalid(ENV_CACHE_MAX_SIZE_MB, "0", "must be > 0"));
        }
        self.projection.validate()
    }
}
