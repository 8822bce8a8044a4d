use serde::Deserialize;
use url::Url;

/// Backend holding the source of truth, fast counters and change bus
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Process-local storage (single instance, tests and local runs)
    #[default]
    Memory,
    /// Redis-backed storage shared by every gateway instance
    Redis(RedisStorageConfig),
}

/// Redis connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisStorageConfig {
    /// Redis connection URL
    pub url: Url,
    /// Prefix for every key and channel
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_key_prefix() -> String {
    "switchyard".to_owned()
}
