//! Error types for lifecycle transitions and inbound commands.

use thiserror::Error;

use crate::model::OwnerId;

/// Raised when a transition has no meaning in the job's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LifecycleError {
    /// The requested transition is not defined for the current state.
    #[error("invalid lifecycle transition")]
    InvalidTransition {
        /// State the job was in.
        from: &'static str,
        /// Transition or signal that was requested.
        action: &'static str,
    },
}

/// Convenience alias for lifecycle transitions.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Errors returned to callers of the inbound command surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// The owner has no running download to act on.
    #[error("no active download")]
    NoActiveDownload {
        /// Owner the command targeted.
        owner: OwnerId,
    },
    /// The running download cannot accept the command in its current state.
    #[error("command rejected by download lifecycle")]
    Lifecycle {
        /// Command identifier.
        operation: &'static str,
        /// Underlying transition failure.
        #[source]
        source: LifecycleError,
    },
    /// The process is draining and no longer accepts work.
    #[error("shutting down")]
    ShuttingDown,
    /// A batch enqueue carried no requests.
    #[error("batch contains no downloads")]
    EmptyBatch {
        /// Owner the batch was for.
        owner: OwnerId,
    },
}

impl CommandError {
    /// Wrap a lifecycle failure with the command that triggered it.
    #[must_use]
    pub const fn lifecycle(operation: &'static str, source: LifecycleError) -> Self {
        Self::Lifecycle { operation, source }
    }
}

/// Convenience alias for inbound commands.
pub type CommandResult<T> = Result<T, CommandError>;
