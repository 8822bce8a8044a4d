#![allow(clippy::must_use_candidate)]

pub mod auth;
mod duration;
mod env;
mod loader;
pub mod selection;
pub mod server;
pub mod storage;
pub mod sync;
pub mod telemetry;

use serde::Deserialize;

pub use auth::AuthConfig;
pub use selection::{BreakerConfig, RetryConfig};
pub use server::ServerConfig;
pub use storage::{RedisStorageConfig, StorageConfig};
pub use sync::SyncConfig;
pub use telemetry::{LogFormat, TelemetryConfig};

/// Top-level Switchyard configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Operational HTTP listener
    #[serde(default)]
    pub server: ServerConfig,
    /// Source of truth, fast counters and change bus backend
    #[serde(default)]
    pub storage: StorageConfig,
    /// Full refresh and subscriber behavior
    #[serde(default)]
    pub sync: SyncConfig,
    /// Auto-disable thresholds
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Per-request retry budget
    #[serde(default)]
    pub retry: RetryConfig,
    /// Credential resolution
    #[serde(default)]
    pub auth: AuthConfig,
    /// Logging
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}
