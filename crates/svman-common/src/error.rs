//! Top-level error type shared by the svman binaries
//!
//! Subsystem crates carry their own error enums (`MtlsError`,
//! `TransportError`, `SessionError`...). This type covers process setup:
//! configuration validation and telemetry.

use thiserror::Error;

use crate::telemetry::TelemetryError;

/// Main error type for svman process setup
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or missing configuration value
    #[error("configuration error [{field}]: {message}")]
    Config {
        /// Name of the offending setting (e.g. "machine_name")
        field: String,
        /// Description of what's invalid
        message: String,
    },

    /// Telemetry could not be initialized
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
}

impl Error {
    /// Create a configuration error for the given field
    pub fn config(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            message: msg.into(),
        }
    }

    /// Reject an empty (or whitespace-only) setting
    pub fn require_non_empty(field: &str, value: &str) -> Result<(), Self> {
        if value.trim().is_empty() {
            return Err(Self::config(field, "must not be empty"));
        }
        Ok(())
    }
}
