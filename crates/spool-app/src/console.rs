//! Log-backed collaborators used by the standalone daemon.

use std::fmt::Write as _;

use async_trait::async_trait;
use spool_core::{
    CompletionHandler, DownloadJob, JobId, OwnerId, RenderedStatus, StatusAction, StatusRenderer,
    TransferOutcome,
};
use tracing::info;

use crate::progress::display_name;

/// Writes status messages to the log instead of a chat transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRenderer;

#[async_trait]
impl StatusRenderer for LogRenderer {
    async fn render(
        &self,
        owner: OwnerId,
        job: JobId,
        status: &RenderedStatus,
    ) -> anyhow::Result<()> {
        let actions: Vec<&str> = status.actions.iter().copied().map(StatusAction::label).collect();
        info!(
            owner_id = %owner,
            job_id = %job,
            actions = ?actions,
            "{}",
            status.text.replace('\n', " | ")
        );
        Ok(())
    }
}

/// Leaves the payload where the engine wrote it and reports the location.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeaveInPlace;

#[async_trait]
impl CompletionHandler for LeaveInPlace {
    async fn on_completed(
        &self,
        job: &DownloadJob,
        outcome: &TransferOutcome,
    ) -> anyhow::Result<String> {
        let bytes: u64 = outcome.files.iter().map(|file| file.size_bytes).sum();
        info!(
            owner_id = %job.owner,
            job_id = %job.id,
            files = outcome.files.len(),
            bytes,
            save_path = %outcome.save_path.display(),
            "payload ready"
        );
        let name = if job.display.title.trim().is_empty() {
            outcome.name.clone()
        } else {
            display_name(&job.display, &spool_core::TransferStatus::default())
        };
        let mut message = format!(
            "Download complete: {name} ({} files in {})",
            outcome.files.len(),
            outcome.save_path.display()
        );
        if let Some(batch) = outcome.batch.filter(|batch| batch.last) {
            info!(
                owner_id = %job.owner,
                batch_id = %batch.id,
                total = batch.total,
                "batch finished"
            );
            let _ = write!(
                message,
                "\nBatch complete: {}/{} downloads finished",
                batch.done, batch.total
            );
        }
        Ok(message)
    }
}
