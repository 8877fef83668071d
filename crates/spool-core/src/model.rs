//! Job descriptors shared by the queue, the supervisor, and the state file.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lifecycle::DownloadStatus;

/// Stable identifier of the user or chat that requested a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub i64);

impl Display for OwnerId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, formatter)
    }
}

/// Identifier assigned to a job when the caller confirms it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Allocate a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for JobId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, formatter)
    }
}

/// Identifier shared by every job queued together as one season batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub Uuid);

impl BatchId {
    /// Allocate a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for BatchId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, formatter)
    }
}

/// Completion count of one batch, persisted so it survives restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTally {
    /// Jobs queued under the batch.
    pub total: usize,
    /// Jobs that completed successfully so far.
    #[serde(default)]
    pub done: usize,
}

/// Where the engine should fetch the transfer from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobSource {
    /// Magnet URI resolved by the engine.
    Magnet {
        /// Magnet URI to resolve and add.
        uri: String,
    },
    /// `.torrent` metainfo file already on disk.
    TorrentFile {
        /// Location of the metainfo file.
        path: PathBuf,
    },
}

impl JobSource {
    #[must_use]
    /// Convenience constructor for magnet-based sources.
    pub fn magnet(uri: impl Into<String>) -> Self {
        Self::Magnet { uri: uri.into() }
    }

    #[must_use]
    /// Convenience constructor for metainfo files.
    pub fn torrent_file(path: impl Into<PathBuf>) -> Self {
        Self::TorrentFile { path: path.into() }
    }
}

/// Caller-supplied labels used only when rendering progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayMetadata {
    /// Primary title (movie or show name).
    pub title: String,
    /// Season number for TV content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season: Option<u32>,
    /// Episode number for TV content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode: Option<u32>,
    /// Episode title for TV content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_title: Option<String>,
    /// Whether the transfer is a full-season pack.
    #[serde(default)]
    pub season_pack: bool,
    /// Opaque payload carried through untouched for the completion callback.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl DisplayMetadata {
    /// Metadata carrying only a title.
    #[must_use]
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

/// Inbound request to download something for an owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    /// Requesting owner.
    pub owner: OwnerId,
    /// Where to fetch the transfer from.
    pub source: JobSource,
    /// Destination directory.
    pub save_path: PathBuf,
    /// Labels for progress rendering.
    pub display: DisplayMetadata,
}

/// One user-requested transfer tracked across queueing, supervision and restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadJob {
    /// Stable job identifier.
    pub id: JobId,
    /// Requesting owner.
    pub owner: OwnerId,
    /// Where to fetch the transfer from.
    pub source: JobSource,
    /// Destination directory.
    pub save_path: PathBuf,
    /// Labels for progress rendering.
    pub display: DisplayMetadata,
    /// Lifecycle state; carries the pause/cancel/requeue flags.
    pub status: DownloadStatus,
    /// Season batch the job was queued with, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchId>,
    /// When the owner confirmed the request.
    pub created_at: DateTime<Utc>,
}

impl DownloadJob {
    /// Build a freshly queued job from an inbound request.
    #[must_use]
    pub fn from_request(request: DownloadRequest) -> Self {
        Self {
            id: JobId::new(),
            owner: request.owner,
            source: request.source,
            save_path: request.save_path,
            display: request.display,
            status: DownloadStatus::queued(),
            batch: None,
            created_at: Utc::now(),
        }
    }
}

/// Serializable projection of the active slots and every owner's queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    /// Jobs that were running when the snapshot was taken.
    #[serde(default)]
    pub active_downloads: BTreeMap<OwnerId, DownloadJob>,
    /// Waiting jobs per owner, in dispatch order.
    #[serde(default)]
    pub download_queues: BTreeMap<OwnerId, Vec<DownloadJob>>,
    /// Completion counts of batches that still have unfinished jobs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub batches: BTreeMap<BatchId, BatchTally>,
}

impl PersistedSnapshot {
    /// Capture the given in-memory state.
    ///
    /// Active jobs that are mid-requeue are left out so a restart does not
    /// resurrect them as running; they reappear through the queue instead.
    pub fn capture<'a>(
        active: impl IntoIterator<Item = &'a DownloadJob>,
        queues: &BTreeMap<OwnerId, VecDeque<DownloadJob>>,
    ) -> Self {
        let active_downloads = active
            .into_iter()
            .filter(|job| !job.status.is_requeued())
            .map(|job| (job.owner, job.clone()))
            .collect();
        let download_queues = queues
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(owner, queue)| (*owner, queue.iter().cloned().collect()))
            .collect();
        Self {
            active_downloads,
            download_queues,
            batches: BTreeMap::new(),
        }
    }

    /// Attach the batch tallies to a captured snapshot.
    #[must_use]
    pub fn with_batches(mut self, batches: &BTreeMap<BatchId, BatchTally>) -> Self {
        self.batches.clone_from(batches);
        self
    }

    /// Whether the snapshot carries no jobs at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active_downloads.is_empty() && self.download_queues.is_empty()
    }

    /// Total number of queued jobs across owners.
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.download_queues.values().map(Vec::len).sum()
    }
}
