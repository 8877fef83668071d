//! Per-job state shared between the command path and the supervisor task.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use spool_core::{DownloadJob, DownloadStatus, JobId, OwnerId};
use tokio::sync::Notify;

/// A running job.
///
/// `job` guards the mutable fields and is only ever held for a field update,
/// never across an await. Lock order is registry, then job.
pub(crate) struct JobCell {
    pub(crate) id: JobId,
    pub(crate) owner: OwnerId,
    job: Mutex<DownloadJob>,
    wake: Notify,
}

impl JobCell {
    pub(crate) fn new(job: DownloadJob) -> Arc<Self> {
        Arc::new(Self {
            id: job.id,
            owner: job.owner,
            job: Mutex::new(job),
            wake: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, DownloadJob> {
        self.job.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn snapshot(&self) -> DownloadJob {
        self.lock().clone()
    }

    pub(crate) fn status(&self) -> DownloadStatus {
        self.lock().status
    }

    pub(crate) fn update<T>(&self, apply: impl FnOnce(&mut DownloadJob) -> T) -> T {
        apply(&mut self.lock())
    }

    /// Nudge the supervisor out of its poll sleep. A wake sent while the
    /// supervisor is busy is kept and consumed by its next wait.
    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) async fn woken(&self) {
        self.wake.notified().await;
    }
}
