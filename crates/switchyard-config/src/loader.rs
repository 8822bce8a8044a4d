use std::path::Path;

use secrecy::ExposeSecret;

use crate::{Config, StorageConfig};

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Reads the file, expands `{{ env.VAR }}` placeholders, then
    /// deserializes and validates the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, variable expansion
    /// fails, TOML parsing fails, or validation fails
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

        Self::parse(&raw)
    }

    /// Parse configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns an error if variable expansion, parsing or validation fails
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let expanded =
            crate::env::expand_env(raw).map_err(|e| anyhow::anyhow!("config variable expansion failed: {e}"))?;

        let config: Self = toml::from_str(&expanded).map_err(|e| anyhow::anyhow!("failed to parse config: {e}"))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate that the configuration is internally consistent
    ///
    /// # Errors
    ///
    /// Returns an error describing the first inconsistent setting
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sync.refresh_interval.is_zero() {
            anyhow::bail!("sync.refresh_interval must be greater than 0");
        }

        if self.sync.reconnect_backoff.is_zero() {
            anyhow::bail!("sync.reconnect_backoff must be greater than 0");
        }

        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must not be 0 (use a negative value to retry once per candidate)");
        }

        if self.auth.negative_cache_capacity > 1_000_000 {
            anyhow::bail!("auth.negative_cache_capacity exceeds maximum of 1,000,000");
        }

        if let StorageConfig::Redis(ref redis) = self.storage {
            if !matches!(redis.url.scheme(), "redis" | "rediss") {
                anyhow::bail!("storage.url must use the redis:// or rediss:// scheme");
            }
            if redis.key_prefix.is_empty() {
                anyhow::bail!("storage.key_prefix must not be empty");
            }
        }

        if let Some(ref secret) = self.server.gateway_secret
            && secret.expose_secret().is_empty()
        {
            anyhow::bail!("server.gateway_secret must not be empty when set");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use crate::{Config, LogFormat, StorageConfig};

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();

        assert!(matches!(config.storage, StorageConfig::Memory));
        assert_eq!(config.sync.refresh_interval, Duration::from_secs(1800));
        assert_eq!(config.sync.reconnect_backoff, Duration::from_secs(5));
        assert_eq!(config.breaker.agent_error_threshold, 10);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.telemetry.format, LogFormat::Text);
    }

    #[test]
    fn full_config_parses() {
        let raw = r#"
            [server]
            listen_address = "127.0.0.1:8089"
            gateway_secret = "s3cret"

            [storage]
            type = "redis"
            url = "redis://127.0.0.1:6379/0"
            key_prefix = "edge"

            [sync]
            refresh_interval = "10m"
            reconnect_backoff = "2s"

            [breaker]
            agent_error_threshold = 5
            key_error_threshold = 0

            [retry]
            max_attempts = -1

            [auth]
            negative_cache_ttl = "30s"

            [telemetry]
            log_filter = "switchyard=debug"
            format = "json"
        "#;

        let config = Config::parse(raw).unwrap();

        let StorageConfig::Redis(redis) = &config.storage else {
            panic!("expected redis storage");
        };
        assert_eq!(redis.key_prefix, "edge");
        assert_eq!(config.sync.refresh_interval, Duration::from_secs(600));
        assert_eq!(config.breaker.key_error_threshold, 0);
        assert_eq!(config.retry.max_attempts, -1);
        assert_eq!(config.auth.negative_cache_ttl, Duration::from_secs(30));
        assert_eq!(config.telemetry.format, LogFormat::Json);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(Config::parse("[sync]\nrefresh = \"1m\"\n").is_err());
    }

    #[test]
    fn invalid_duration_is_rejected() {
        let err = Config::parse("[sync]\nrefresh_interval = \"soon\"\n").unwrap_err();
        assert!(err.to_string().contains("failed to parse config"));
    }

    #[test]
    fn zero_attempts_is_rejected() {
        assert!(Config::parse("[retry]\nmax_attempts = 0\n").is_err());
    }

    #[test]
    fn non_redis_scheme_is_rejected() {
        let raw = "[storage]\ntype = \"redis\"\nurl = \"http://localhost:6379\"\n";
        assert!(Config::parse(raw).is_err());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[retry]\nmax_attempts = 7").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.retry.max_attempts, 7);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = Config::load(std::path::Path::new("/nonexistent/switchyard.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/switchyard.toml"));
    }
}
