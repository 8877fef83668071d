//! Error types for state file persistence.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures reading or writing the state file.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Filesystem operation failed.
    #[error("state file io failed")]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// Path involved in the failure.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// Snapshot could not be encoded.
    #[error("state snapshot encoding failed")]
    Serialize {
        /// Underlying serde error.
        source: serde_json::Error,
    },
    /// State file contents were not a valid snapshot.
    #[error("state file invalid")]
    Parse {
        /// State file path.
        path: PathBuf,
        /// Underlying serde error.
        source: serde_json::Error,
    },
}

impl RuntimeError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }
}

/// Convenience alias for persistence results.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
