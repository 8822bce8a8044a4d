//! Logging for Switchyard via the `tracing` ecosystem

use switchyard_config::{LogFormat, TelemetryConfig};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Build the event filter
///
/// `RUST_LOG` wins when set and valid; otherwise the configured directive
/// is used, falling back to `info` if it does not parse.
fn filter(config: &TelemetryConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed
pub fn init(config: &TelemetryConfig) -> anyhow::Result<()> {
    let registry = tracing_subscriber::registry().with(filter(config));

    match config.format {
        LogFormat::Text => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false);
            registry.with(fmt_layer).try_init()?;
        }
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .with_target(true);
            registry.with(fmt_layer).try_init()?;
        }
    }

    tracing::debug!(filter = %config.log_filter, format = ?config.format, "logging initialized");
    Ok(())
}
