use serde::Deserialize;

/// Daily error thresholds for auto-disabling backends
///
/// Counters reset at local midnight. A threshold of `0` turns
/// auto-disable off for that kind.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakerConfig {
    #[serde(default = "default_threshold")]
    pub agent_error_threshold: u64,
    #[serde(default = "default_threshold")]
    pub key_error_threshold: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            agent_error_threshold: default_threshold(),
            key_error_threshold: default_threshold(),
        }
    }
}

const fn default_threshold() -> u64 {
    10
}

/// Retry budget for a single request
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Maximum attempts per request; negative means one per distinct candidate
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

const fn default_max_attempts() -> i32 {
    3
}
