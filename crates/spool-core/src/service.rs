//! Engine adapter contract and the outbound callbacks the supervisor drives.

use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};

use anyhow::bail;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{BatchId, DownloadJob, JobId, JobSource, OwnerId};

/// Opaque reference to one transfer inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferHandle(pub Uuid);

impl TransferHandle {
    /// Allocate a fresh random handle.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransferHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TransferHandle {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, formatter)
    }
}

/// Options applied when removing a transfer from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoveTransfer {
    /// Whether downloaded data should also be deleted.
    #[serde(default)]
    pub with_data: bool,
}

/// Coarse engine-side phase of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum TransferPhase {
    /// Waiting for an engine slot.
    #[default]
    Queued,
    /// Resolving metadata from peers.
    FetchingMetadata,
    /// Verifying existing data on disk.
    Checking,
    /// Receiving payload data.
    Downloading,
    /// Payload complete and uploading to peers.
    Seeding,
    /// Payload complete and no longer uploading.
    Finished,
    /// Engine-level failure.
    Error {
        /// Engine-provided detail; logged, never shown to owners.
        message: String,
    },
}

impl TransferPhase {
    /// Whether the payload is fully on disk.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self, Self::Seeding | Self::Finished)
    }

    /// Human-readable label for status messages.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::FetchingMetadata => "Fetching metadata",
            Self::Checking => "Checking",
            Self::Downloading => "Downloading",
            Self::Seeding => "Seeding",
            Self::Finished => "Finished",
            Self::Error { .. } => "Error",
        }
    }
}

/// Point-in-time view of a transfer as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransferStatus {
    /// Name reported once metadata is known.
    pub name: Option<String>,
    /// Engine-side phase.
    pub phase: TransferPhase,
    /// Whether metadata has been resolved.
    pub has_metadata: bool,
    /// Bytes downloaded so far.
    pub bytes_downloaded: u64,
    /// Total payload size; zero until metadata arrives.
    pub bytes_total: u64,
    /// Current download rate in bytes per second.
    pub download_bps: u64,
    /// Connected peers.
    pub peers: u32,
}

impl TransferStatus {
    /// Completion percentage in `0.0..=100.0`.
    #[must_use]
    pub fn percent_complete(&self) -> f64 {
        if self.bytes_total == 0 {
            0.0
        } else {
            (to_f64(self.bytes_downloaded) / to_f64(self.bytes_total)) * 100.0
        }
    }
}

#[expect(
    clippy::cast_precision_loss,
    reason = "progress ratios tolerate f64 precision on byte counts"
)]
fn to_f64(value: u64) -> f64 {
    value as f64
}

/// File produced by a finished transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFile {
    /// Path relative to the save directory.
    pub path: PathBuf,
    /// File size in bytes.
    pub size_bytes: u64,
}

/// Engine-provided result handed to the completion callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOutcome {
    /// Name reported by the engine.
    pub name: String,
    /// Directory the payload was written to.
    pub save_path: PathBuf,
    /// Files in the payload, when the engine can list them.
    pub files: Vec<TransferFile>,
    /// Batch progress after counting this completion, for batch jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchProgress>,
}

/// Where a completed job leaves its season batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    /// Batch the job was queued with.
    pub id: BatchId,
    /// Completed jobs, this one included.
    pub done: usize,
    /// Jobs queued under the batch.
    pub total: usize,
    /// Whether no job of the batch is left running or waiting.
    pub last: bool,
}

/// Narrow engine interface the supervisor depends on.
///
/// One engine is shared by every running job; each job only ever touches its
/// own handle.
#[async_trait]
pub trait TransferEngine: Send + Sync {
    /// Admit a transfer and return its handle.
    async fn add_transfer(
        &self,
        source: &JobSource,
        save_path: &Path,
    ) -> anyhow::Result<TransferHandle>;

    /// Current status of a transfer.
    async fn status(&self, handle: TransferHandle) -> anyhow::Result<TransferStatus>;

    /// Remove a transfer, optionally deleting its data.
    async fn remove_transfer(
        &self,
        handle: TransferHandle,
        options: RemoveTransfer,
    ) -> anyhow::Result<()>;

    /// Stop transferring data while keeping the transfer admitted.
    async fn pause(&self, handle: TransferHandle) -> anyhow::Result<()>;

    /// Continue a paused transfer.
    async fn resume(&self, handle: TransferHandle) -> anyhow::Result<()>;

    /// List payload files; default implementation reports lack of support.
    async fn files(&self, handle: TransferHandle) -> anyhow::Result<Vec<TransferFile>> {
        let _ = handle;
        bail!("file listing not supported by this engine");
    }
}

/// Button offered alongside a status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusAction {
    /// Pause the transfer.
    Pause,
    /// Resume the transfer.
    Resume,
    /// Open the cancel prompt.
    Cancel,
    /// Open the cancel-all prompt.
    CancelAll,
}

impl StatusAction {
    /// Button label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pause => "Pause",
            Self::Resume => "Resume",
            Self::Cancel => "Cancel",
            Self::CancelAll => "Cancel All",
        }
    }
}

/// Rendered status message and its buttons.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RenderedStatus {
    /// Message body.
    pub text: String,
    /// Buttons offered under the message; empty for final messages.
    pub actions: Vec<StatusAction>,
}

impl RenderedStatus {
    /// Final message without buttons.
    #[must_use]
    pub fn final_message(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            actions: Vec::new(),
        }
    }
}

/// Outbound callback that shows status messages to an owner.
#[async_trait]
pub trait StatusRenderer: Send + Sync {
    /// Show or replace the status message for `job`.
    async fn render(
        &self,
        owner: OwnerId,
        job: JobId,
        status: &RenderedStatus,
    ) -> anyhow::Result<()>;
}

/// Outbound callback invoked once a transfer completes.
#[async_trait]
pub trait CompletionHandler: Send + Sync {
    /// Post-process a finished transfer and return the message to show.
    async fn on_completed(
        &self,
        job: &DownloadJob,
        outcome: &TransferOutcome,
    ) -> anyhow::Result<String>;
}
