//! Event payload types published by the queue and the supervisors.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Identifier assigned to each published event.
pub type EventId = u64;

/// Default buffer size for the in-memory replay ring.
pub const DEFAULT_REPLAY_CAPACITY: usize = 1_024;

/// Typed lifecycle events.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A job was appended to its owner's queue.
    JobQueued {
        /// Owning user or chat.
        owner: i64,
        /// Job identifier.
        job_id: Uuid,
        /// 1-based position counting the running job.
        position: usize,
    },
    /// A supervisor task took over a job.
    JobStarted {
        /// Owning user or chat.
        owner: i64,
        /// Job identifier.
        job_id: Uuid,
        /// Whether the job was restored from the state file.
        resumed: bool,
    },
    /// The engine resolved metadata for a job.
    MetadataReady {
        /// Owning user or chat.
        owner: i64,
        /// Job identifier.
        job_id: Uuid,
    },
    /// The engine transfer was paused.
    JobPaused {
        /// Owning user or chat.
        owner: i64,
        /// Job identifier.
        job_id: Uuid,
    },
    /// The engine transfer was resumed.
    JobResumed {
        /// Owning user or chat.
        owner: i64,
        /// Job identifier.
        job_id: Uuid,
    },
    /// A job left its slot and went back to the queue (or to the state file).
    JobRequeued {
        /// Owning user or chat.
        owner: i64,
        /// Job identifier.
        job_id: Uuid,
        /// Requeue reason label.
        reason: String,
    },
    /// A job finished and post-processing ran.
    JobCompleted {
        /// Owning user or chat.
        owner: i64,
        /// Job identifier.
        job_id: Uuid,
    },
    /// A job failed.
    JobFailed {
        /// Owning user or chat.
        owner: i64,
        /// Job identifier.
        job_id: Uuid,
        /// Technical detail for operators.
        message: String,
    },
    /// A job was cancelled by its owner.
    JobCancelled {
        /// Owning user or chat.
        owner: i64,
        /// Job identifier.
        job_id: Uuid,
    },
    /// An owner's waiting jobs were discarded.
    QueueCleared {
        /// Owning user or chat.
        owner: i64,
        /// Number of discarded jobs.
        removed: usize,
    },
    /// The last job of a season batch finished.
    BatchCompleted {
        /// Owning user or chat.
        owner: i64,
        /// Batch identifier.
        batch_id: Uuid,
        /// Jobs that completed successfully.
        done: usize,
        /// Jobs queued under the batch.
        total: usize,
    },
    /// Degraded components changed.
    HealthChanged {
        /// Components currently degraded.
        degraded: Vec<String>,
    },
}

impl Event {
    /// Machine-friendly discriminator.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::JobQueued { .. } => "job_queued",
            Self::JobStarted { .. } => "job_started",
            Self::MetadataReady { .. } => "metadata_ready",
            Self::JobPaused { .. } => "job_paused",
            Self::JobResumed { .. } => "job_resumed",
            Self::JobRequeued { .. } => "job_requeued",
            Self::JobCompleted { .. } => "job_completed",
            Self::JobFailed { .. } => "job_failed",
            Self::JobCancelled { .. } => "job_cancelled",
            Self::QueueCleared { .. } => "queue_cleared",
            Self::BatchCompleted { .. } => "batch_completed",
            Self::HealthChanged { .. } => "health_changed",
        }
    }

    /// Job the event refers to, if any.
    #[must_use]
    pub const fn job_id(&self) -> Option<Uuid> {
        match self {
            Self::JobQueued { job_id, .. }
            | Self::JobStarted { job_id, .. }
            | Self::MetadataReady { job_id, .. }
            | Self::JobPaused { job_id, .. }
            | Self::JobResumed { job_id, .. }
            | Self::JobRequeued { job_id, .. }
            | Self::JobCompleted { job_id, .. }
            | Self::JobFailed { job_id, .. }
            | Self::JobCancelled { job_id, .. } => Some(*job_id),
            Self::QueueCleared { .. }
            | Self::BatchCompleted { .. }
            | Self::HealthChanged { .. } => None,
        }
    }
}

/// Metadata wrapper around events carrying the id and emission timestamp.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct EventEnvelope {
    /// Sequential identifier.
    pub id: EventId,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Event payload.
    pub event: Event,
}
