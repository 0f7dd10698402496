//! Logging initialisation for the runner process

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Default filter when neither `RUST_LOG` nor `LOG_LEVEL` is set
///
/// Targets match by prefix, so this covers both tasklane crates.
pub const DEFAULT_LOG_FILTER: &str = "tasklane=info";

/// Logging configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name reported in the startup line
    pub service_name: String,
    /// Log filter (e.g., "info", "tasklane_durable=debug")
    pub log_filter: Option<String>,
    /// Include the event target in console output
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "tasklane-worker".to_string(),
            log_filter: None,
            with_target: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `TASKLANE_SERVICE_NAME`: Service name (default: "tasklane-worker")
    /// - `RUST_LOG`: Full filter directive
    /// - `LOG_LEVEL`: Level applied to the tasklane crates when `RUST_LOG` is unset
    pub fn from_env() -> Self {
        let log_filter = std::env::var("RUST_LOG").ok().or_else(|| {
            std::env::var("LOG_LEVEL")
                .ok()
                .map(|level| level_filter(&level))
        });

        Self {
            service_name: std::env::var("TASKLANE_SERVICE_NAME")
                .unwrap_or_else(|_| "tasklane-worker".to_string()),
            log_filter,
            ..Self::default()
        }
    }

    /// Resolved filter directive
    pub fn filter_directive(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }
}

fn level_filter(level: &str) -> String {
    format!("tasklane={level}")
}

/// Install the global tracing subscriber
///
/// An unparsable filter falls back to [`DEFAULT_LOG_FILTER`]. Calling this
/// twice leaves the first subscriber in place.
pub fn init_telemetry(config: &TelemetryConfig) {
    let filter = EnvFilter::try_new(config.filter_directive())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(config.with_target)
        .with_filter(filter);

    if tracing_subscriber::registry()
        .with(console_layer)
        .try_init()
        .is_ok()
    {
        tracing::debug!(service = %config.service_name, "telemetry initialised");
    }
}
