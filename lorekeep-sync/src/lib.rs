//! Lorekeep Sync - Campaign Cache Consistency Workers
//!
//! Keeps cached campaign projections consistent with the authoritative game
//! event log. Two background workers share one `CacheStore`:
//!
//! - the invalidation poller reconciles each tracked campaign's event cursor
//!   with the log head on a fixed interval and marks affected scopes stale
//! - the projection subscription consumer follows live campaign updates and
//!   applies them between poller passes
//!
//! The game service is reached over gRPC (`grpc`); everything else talks to
//! the `EventLogClient` trait so tests can substitute an in-memory log.

pub mod config;
pub mod constants;
pub mod grpc;
pub mod jobs;
pub mod selector;
pub mod telemetry;
pub mod workers;

pub use config::SyncConfig;
pub use grpc::{event_log_error_from_status, GrpcEventLogClient};
pub use jobs::{
    jittered_backoff, BackoffConfig, BatchOutcome, InvalidationConfig, InvalidationMetrics,
    InvalidationMetricsSnapshot, InvalidationPoller, ProjectionConfig, ProjectionConsumer,
    ProjectionMetrics, ProjectionMetricsSnapshot, SyncPassReport,
};
pub use selector::RoundRobinSelector;
pub use telemetry::{init_tracing, LogFormat};
pub use workers::{WorkerReport, WorkerSet};
