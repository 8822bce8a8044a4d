use std::time::Duration;

use serde::Deserialize;

/// Credential resolution settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// How long an unknown secret is remembered as invalid
    #[serde(default = "default_negative_cache_ttl", deserialize_with = "crate::duration::deserialize")]
    pub negative_cache_ttl: Duration,
    /// Maximum number of remembered invalid secrets
    #[serde(default = "default_negative_cache_capacity")]
    pub negative_cache_capacity: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            negative_cache_ttl: default_negative_cache_ttl(),
            negative_cache_capacity: default_negative_cache_capacity(),
        }
    }
}

const fn default_negative_cache_ttl() -> Duration {
    Duration::from_secs(60)
}

const fn default_negative_cache_capacity() -> u64 {
    10_000
}
