//! Download lifecycle state machine.
//!
//! # Design
//! - A single tagged enum replaces independent pause/cancel/requeue booleans so
//!   combinations such as "requeued while a cancel prompt is open" cannot exist.
//! - Interruptions are resolved through [`DownloadStatus::interrupt`], a table
//!   keyed by `(state, signal)`. The resulting state determines the cleanup the
//!   supervisor performs against the engine.
//! - Every transition consumes the current state and returns the next one, so
//!   callers holding the job lock apply them atomically.

use serde::{Deserialize, Serialize};

use crate::error::{LifecycleError, LifecycleResult};
use crate::service::RemoveTransfer;

/// External events that interrupt a running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Owner confirmed the cancel prompt.
    UserCancel,
    /// Process is draining for shutdown.
    Shutdown,
    /// Owner queued a new job while this one sat paused.
    PausePreempt,
    /// Metadata did not arrive within the configured window.
    TimeoutElapsed,
}

impl Signal {
    /// Stable label used in logs and errors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UserCancel => "user_cancel",
            Self::Shutdown => "shutdown",
            Self::PausePreempt => "pause_preempt",
            Self::TimeoutElapsed => "timeout_elapsed",
        }
    }
}

/// Why a running job is being handed back to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequeueReason {
    /// Preempted by a newer job while paused.
    PausePreempt,
    /// Metadata fetch exceeded its timeout.
    MetadataTimeout,
    /// Interrupted by process shutdown; resumed directly on the next start.
    Shutdown {
        /// Pause preference to restore on restart.
        paused: bool,
    },
}

impl RequeueReason {
    /// Stable label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PausePreempt => "pause_preempt",
            Self::MetadataTimeout => "metadata_timeout",
            Self::Shutdown { .. } => "shutdown",
        }
    }
}

/// Lifecycle state of a download job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DownloadStatus {
    /// Waiting in the owner's queue.
    Queued {
        /// Start the transfer paused once dispatched.
        #[serde(default)]
        paused: bool,
        /// The previous attempt timed out fetching metadata.
        #[serde(default)]
        after_timeout: bool,
    },
    /// Transfer added; waiting for the engine to resolve metadata.
    FetchingMetadata {
        /// Owner asked for the transfer to be paused.
        paused: bool,
        /// A cancel confirmation prompt is on screen.
        #[serde(default)]
        confirming: bool,
    },
    /// Transferring data.
    Active {
        /// A cancel confirmation prompt is on screen.
        #[serde(default)]
        confirming: bool,
    },
    /// Paused by the owner after metadata arrived.
    Paused {
        /// A cancel confirmation prompt is on screen.
        #[serde(default)]
        confirming: bool,
    },
    /// Stopping the transfer without deleting data.
    Requeuing {
        /// Why the job is leaving its slot.
        reason: RequeueReason,
    },
    /// Owner-confirmed cancellation is underway.
    Cancelling,
    /// Transfer finished and post-processing ran.
    Completed,
    /// Engine or transport failure.
    Failed,
    /// Cancellation finished; transfer and data removed.
    Cancelled,
}

impl Default for DownloadStatus {
    fn default() -> Self {
        Self::queued()
    }
}

impl DownloadStatus {
    /// Freshly confirmed job waiting for its slot.
    #[must_use]
    pub const fn queued() -> Self {
        Self::Queued {
            paused: false,
            after_timeout: false,
        }
    }

    /// Stable label used in logs and errors.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Queued { .. } => "queued",
            Self::FetchingMetadata { .. } => "fetching_metadata",
            Self::Active { .. } => "active",
            Self::Paused { .. } => "paused",
            Self::Requeuing { .. } => "requeuing",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the owner wants the transfer paused.
    #[must_use]
    pub const fn is_paused(&self) -> bool {
        match self {
            Self::Queued { paused, .. }
            | Self::FetchingMetadata { paused, .. }
            | Self::Requeuing {
                reason: RequeueReason::Shutdown { paused },
            } => *paused,
            Self::Paused { .. }
            | Self::Requeuing {
                reason: RequeueReason::PausePreempt,
            } => true,
            _ => false,
        }
    }

    /// Whether a cancel confirmation prompt is on screen.
    #[must_use]
    pub const fn cancellation_pending(&self) -> bool {
        match self {
            Self::FetchingMetadata { confirming, .. }
            | Self::Active { confirming }
            | Self::Paused { confirming } => *confirming,
            _ => false,
        }
    }

    /// Whether the job is on its way back to the queue.
    ///
    /// Shutdown interruptions are not counted: those jobs stay in the active
    /// section of the snapshot and resume directly on restart.
    #[must_use]
    pub const fn is_requeued(&self) -> bool {
        matches!(
            self,
            Self::Requeuing {
                reason: RequeueReason::PausePreempt | RequeueReason::MetadataTimeout
            }
        )
    }

    /// Whether the last attempt timed out waiting for metadata.
    #[must_use]
    pub const fn metadata_timeout_occurred(&self) -> bool {
        matches!(
            self,
            Self::Queued {
                after_timeout: true,
                ..
            } | Self::Requeuing {
                reason: RequeueReason::MetadataTimeout
            }
        )
    }

    /// Whether a supervisor is driving the transfer normally.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(
            self,
            Self::FetchingMetadata { .. } | Self::Active { .. } | Self::Paused { .. }
        )
    }

    /// Whether the job reached an end state and will be destroyed.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Engine cleanup owed by an interrupted job, if any.
    #[must_use]
    pub const fn pending_removal(&self) -> Option<RemoveTransfer> {
        match self {
            Self::Cancelling => Some(RemoveTransfer { with_data: true }),
            Self::Requeuing { .. } => Some(RemoveTransfer { with_data: false }),
            _ => None,
        }
    }

    /// Resolve an interruption against the current state.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] when the signal has no
    /// meaning in the current state (for example cancelling a finished job).
    pub const fn interrupt(self, signal: Signal) -> LifecycleResult<Self> {
        let next = match (self, signal) {
            (
                Self::FetchingMetadata { .. } | Self::Active { .. } | Self::Paused { .. },
                Signal::UserCancel,
            ) => Self::Cancelling,
            (Self::FetchingMetadata { paused, .. }, Signal::Shutdown) => Self::Requeuing {
                reason: RequeueReason::Shutdown { paused },
            },
            (Self::Active { .. }, Signal::Shutdown) => Self::Requeuing {
                reason: RequeueReason::Shutdown { paused: false },
            },
            (Self::Paused { .. }, Signal::Shutdown) => Self::Requeuing {
                reason: RequeueReason::Shutdown { paused: true },
            },
            // An interruption already in flight is finished before exiting.
            (Self::Cancelling | Self::Requeuing { .. }, Signal::Shutdown) => self,
            (Self::FetchingMetadata { paused: true, .. } | Self::Paused { .. }, Signal::PausePreempt) => {
                Self::Requeuing {
                    reason: RequeueReason::PausePreempt,
                }
            }
            (Self::FetchingMetadata { paused: false, .. }, Signal::TimeoutElapsed) => {
                Self::Requeuing {
                    reason: RequeueReason::MetadataTimeout,
                }
            }
            _ => {
                return Err(LifecycleError::InvalidTransition {
                    from: self.label(),
                    action: signal.as_str(),
                });
            }
        };
        Ok(next)
    }

    /// Leave the queue and begin fetching metadata.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] unless the job is queued.
    pub const fn start(self) -> LifecycleResult<Self> {
        match self {
            Self::Queued { paused, .. } => Ok(Self::FetchingMetadata {
                paused,
                confirming: false,
            }),
            other => Err(LifecycleError::InvalidTransition {
                from: other.label(),
                action: "start",
            }),
        }
    }

    /// State a persisted active job restarts in after a process restart.
    ///
    /// Prompts do not survive a restart, and the engine handle is gone, so the
    /// job always re-enters metadata fetching with its pause preference.
    #[must_use]
    pub const fn resume_after_restart(self) -> Self {
        match self {
            Self::Queued { paused, .. }
            | Self::FetchingMetadata { paused, .. }
            | Self::Requeuing {
                reason: RequeueReason::Shutdown { paused },
            } => Self::FetchingMetadata {
                paused,
                confirming: false,
            },
            Self::Active { .. } => Self::FetchingMetadata {
                paused: false,
                confirming: false,
            },
            Self::Paused { .. }
            | Self::Requeuing {
                reason: RequeueReason::PausePreempt,
            } => Self::FetchingMetadata {
                paused: true,
                confirming: false,
            },
            Self::Requeuing {
                reason: RequeueReason::MetadataTimeout,
            } => Self::FetchingMetadata {
                paused: false,
                confirming: false,
            },
            other => other,
        }
    }

    /// Record the owner's request to pause. Pausing a paused job is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] when no transfer is running.
    pub const fn pause(self) -> LifecycleResult<Self> {
        match self {
            Self::FetchingMetadata { confirming, .. } => Ok(Self::FetchingMetadata {
                paused: true,
                confirming,
            }),
            Self::Active { confirming } | Self::Paused { confirming } => {
                Ok(Self::Paused { confirming })
            }
            other => Err(LifecycleError::InvalidTransition {
                from: other.label(),
                action: "pause",
            }),
        }
    }

    /// Record the owner's request to resume. Resuming a running job is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] when no transfer is running.
    pub const fn resume(self) -> LifecycleResult<Self> {
        match self {
            Self::FetchingMetadata { confirming, .. } => Ok(Self::FetchingMetadata {
                paused: false,
                confirming,
            }),
            Self::Active { confirming } | Self::Paused { confirming } => {
                Ok(Self::Active { confirming })
            }
            other => Err(LifecycleError::InvalidTransition {
                from: other.label(),
                action: "resume",
            }),
        }
    }

    /// Open a cancel confirmation prompt; progress renders are suppressed until
    /// it is confirmed or dismissed.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] when no transfer is running.
    pub const fn begin_cancel_confirmation(self) -> LifecycleResult<Self> {
        match self {
            Self::FetchingMetadata { paused, .. } => Ok(Self::FetchingMetadata {
                paused,
                confirming: true,
            }),
            Self::Active { .. } => Ok(Self::Active { confirming: true }),
            Self::Paused { .. } => Ok(Self::Paused { confirming: true }),
            other => Err(LifecycleError::InvalidTransition {
                from: other.label(),
                action: "cancel_prompt",
            }),
        }
    }

    /// Dismiss any open cancel prompt.
    #[must_use]
    pub const fn without_confirmation(self) -> Self {
        match self {
            Self::FetchingMetadata { paused, .. } => Self::FetchingMetadata {
                paused,
                confirming: false,
            },
            Self::Active { .. } => Self::Active { confirming: false },
            Self::Paused { .. } => Self::Paused { confirming: false },
            other => other,
        }
    }

    /// Metadata arrived; move on to transferring data (or stay paused).
    #[must_use]
    pub const fn metadata_ready(self) -> Self {
        match self {
            Self::FetchingMetadata {
                paused: true,
                confirming,
            } => Self::Paused { confirming },
            Self::FetchingMetadata {
                paused: false,
                confirming,
            } => Self::Active { confirming },
            other => other,
        }
    }

    /// Turn a requeue interruption back into a queue entry.
    ///
    /// Preempted jobs come back paused. Timed-out jobs come back paused while
    /// other work is waiting, and unpaused when `cooldown` applies because they
    /// are the only entry left.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] unless the job is
    /// requeuing for preemption or timeout.
    pub const fn into_queued(self, cooldown: bool) -> LifecycleResult<Self> {
        match self {
            Self::Requeuing {
                reason: RequeueReason::PausePreempt,
            } => Ok(Self::Queued {
                paused: true,
                after_timeout: false,
            }),
            Self::Requeuing {
                reason: RequeueReason::MetadataTimeout,
            } => Ok(Self::Queued {
                paused: !cooldown,
                after_timeout: true,
            }),
            other => Err(LifecycleError::InvalidTransition {
                from: other.label(),
                action: "requeue",
            }),
        }
    }

    /// Engine reported the transfer finished.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] when no transfer is running.
    pub const fn complete(self) -> LifecycleResult<Self> {
        if self.is_running() {
            Ok(Self::Completed)
        } else {
            Err(LifecycleError::InvalidTransition {
                from: self.label(),
                action: "complete",
            })
        }
    }

    /// Engine or transport failure; valid from any non-terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] for terminal states.
    pub const fn fail(self) -> LifecycleResult<Self> {
        if self.is_terminal() {
            Err(LifecycleError::InvalidTransition {
                from: self.label(),
                action: "fail",
            })
        } else {
            Ok(Self::Failed)
        }
    }

    /// Cancellation cleanup finished.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] unless a cancel is underway.
    pub const fn finish_cancel(self) -> LifecycleResult<Self> {
        match self {
            Self::Cancelling => Ok(Self::Cancelled),
            other => Err(LifecycleError::InvalidTransition {
                from: other.label(),
                action: "finish_cancel",
            }),
        }
    }
}
