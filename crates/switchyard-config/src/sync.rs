use std::time::Duration;

use serde::Deserialize;

/// Cache synchronization settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Interval between full refreshes from the source of truth
    #[serde(default = "default_refresh_interval", deserialize_with = "crate::duration::deserialize")]
    pub refresh_interval: Duration,
    /// Wait before resubscribing after the change bus drops
    #[serde(default = "default_reconnect_backoff", deserialize_with = "crate::duration::deserialize")]
    pub reconnect_backoff: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            refresh_interval: default_refresh_interval(),
            reconnect_backoff: default_reconnect_backoff(),
        }
    }
}

const fn default_refresh_interval() -> Duration {
    Duration::from_secs(30 * 60)
}

const fn default_reconnect_backoff() -> Duration {
    Duration::from_secs(5)
}
