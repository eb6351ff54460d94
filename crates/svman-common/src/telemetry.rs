//! Tracing subscriber initialization
//!
//! Structured JSON logs by default, plain text when `SVMAN_LOG_FORMAT=text`.
//! `RUST_LOG` overrides the default filter.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,svman=debug,h2=warn,tower=warn,hyper=warn";

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// Human-readable lines
    Text,
}

impl LogFormat {
    /// Parse a format name; anything other than "text" means JSON
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("text") {
            Self::Text
        } else {
            Self::Json
        }
    }
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name recorded on startup (e.g., "svman-master")
    pub service_name: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "svman".to_string(),
            format: std::env::var("SVMAN_LOG_FORMAT")
                .map(|v| LogFormat::parse(&v))
                .unwrap_or_default(),
        }
    }
}

/// Install the global tracing subscriber
///
/// Fails if a subscriber is already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match config.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
    };

    result.map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

    tracing::info!(
        service = %config.service_name,
        version = env!("CARGO_PKG_VERSION"),
        "telemetry initialized"
    );

    Ok(())
}
