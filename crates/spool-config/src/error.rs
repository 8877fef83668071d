//! Error types for configuration loading.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Field contained an invalid value.
    #[error("invalid configuration field")]
    InvalidField {
        /// Section that failed validation.
        section: &'static str,
        /// Field that failed validation.
        field: &'static str,
        /// Offending value when available.
        value: Option<String>,
        /// Machine-readable reason for the failure.
        reason: &'static str,
    },
    /// Reading the configuration document failed.
    #[error("configuration io failed")]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// Document path.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// The configuration document was not valid JSON for the schema.
    #[error("configuration document invalid")]
    Parse {
        /// Document path.
        path: PathBuf,
        /// Underlying parse error.
        source: serde_json::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(
        section: &'static str,
        field: &'static str,
        value: Option<String>,
        reason: &'static str,
    ) -> Self {
        Self::InvalidField {
            section,
            field,
            value,
            reason,
        }
    }
}

/// Convenience alias for configuration results.
pub type ConfigResult<T> = Result<T, ConfigError>;
