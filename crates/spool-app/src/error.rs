//! # Design
//!
//! - Centralize application-level errors for bootstrap and the CLI.
//! - Keep error messages constant while carrying context fields for debugging.
//! - Preserve source errors without re-logging at call sites.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias for application operations.
pub type AppResult<T> = Result<T, AppError>;

/// Application-level error type.
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration could not be loaded or validated.
    #[error("configuration operation failed")]
    Config {
        /// Operation identifier.
        operation: &'static str,
        /// Source configuration error.
        source: spool_config::ConfigError,
    },
    /// Telemetry setup failed.
    #[error("telemetry operation failed")]
    Telemetry {
        /// Operation identifier.
        operation: &'static str,
        /// Source telemetry error.
        source: spool_telemetry::TelemetryError,
    },
    /// The state file could not be inspected.
    #[error("runtime persistence failed")]
    Runtime {
        /// Operation identifier.
        operation: &'static str,
        /// Source runtime error.
        source: spool_runtime::RuntimeError,
    },
    /// A queue command was rejected.
    #[error("queue command failed")]
    Command {
        /// Operation identifier.
        operation: &'static str,
        /// Source command error.
        source: spool_core::CommandError,
    },
    /// JSON encoding failed.
    #[error("serialization failed")]
    Serialize {
        /// Operation identifier.
        operation: &'static str,
        /// Source serde error.
        source: serde_json::Error,
    },
    /// IO operations failed.
    #[error("io operation failed")]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// Optional path involved in the failure.
        path: Option<PathBuf>,
        /// Source IO error.
        source: io::Error,
    },
}

impl AppError {
    pub(crate) const fn config(operation: &'static str, source: spool_config::ConfigError) -> Self {
        Self::Config { operation, source }
    }

    pub(crate) const fn telemetry(
        operation: &'static str,
        source: spool_telemetry::TelemetryError,
    ) -> Self {
        Self::Telemetry { operation, source }
    }

    pub(crate) const fn runtime(
        operation: &'static str,
        source: spool_runtime::RuntimeError,
    ) -> Self {
        Self::Runtime { operation, source }
    }

    pub(crate) const fn command(operation: &'static str, source: spool_core::CommandError) -> Self {
        Self::Command { operation, source }
    }

    pub(crate) const fn io(operation: &'static str, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: None,
            source,
        }
    }
}
