//! Error types for the engine adapter.

use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::io;
use std::path::PathBuf;

use spool_core::TransferHandle;

/// Result alias for session operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Failures raised by the session worker or the adapter in front of it.
#[derive(Debug)]
pub enum EngineError {
    /// The handle does not name a live transfer.
    UnknownTransfer {
        /// Handle supplied by the caller.
        handle: TransferHandle,
    },
    /// The transfer source was rejected before admission.
    InvalidSource {
        /// Field that failed validation.
        field: &'static str,
        /// Static reason for the rejection.
        reason: &'static str,
    },
    /// The metainfo file could not be inspected.
    SourceIo {
        /// Path of the metainfo file.
        path: PathBuf,
        /// Underlying IO failure.
        source: io::Error,
    },
    /// The background worker is gone.
    WorkerUnavailable {
        /// Operation that could not be delivered.
        operation: &'static str,
    },
}

impl Display for EngineError {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownTransfer { handle } => {
                let _ = handle;
                formatter.write_str("unknown transfer")
            }
            Self::InvalidSource { field, reason } => {
                let _ = (field, reason);
                formatter.write_str("invalid transfer source")
            }
            Self::SourceIo { path, .. } => {
                let _ = path;
                formatter.write_str("transfer source unreadable")
            }
            Self::WorkerUnavailable { operation } => {
                let _ = operation;
                formatter.write_str("engine worker unavailable")
            }
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::SourceIo { source, .. } => Some(source),
            _ => None,
        }
    }
}
