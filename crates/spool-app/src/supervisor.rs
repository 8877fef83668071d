//! Drives one job from dispatch to a terminal, requeued or preserved outcome.
//!
//! # Design
//! - Owner commands only flip the job's status; the supervisor observes the
//!   status once per cycle and performs the engine calls itself, so only this
//!   task ever touches the job's transfer handle.
//! - Interruptions are resolved through `DownloadStatus::interrupt`; the
//!   removal mode (keep or delete data) is read from the resulting state
//!   through `DownloadStatus::pending_removal`.
//! - Status messages are queued to the job's render task and never awaited
//!   inside the poll loop.
//! - Engine errors end the job as failed; they are never retried here.

use std::sync::Arc;

use spool_core::{
    DownloadStatus, LifecycleResult, RemoveTransfer, RenderedStatus, RequeueReason, Signal,
    StatusAction, TransferHandle, TransferOutcome, TransferPhase, TransferStatus,
};
use spool_events::Event;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::context::AppContext;
use crate::dispatch::DownloadQueue;
use crate::progress::{ProgressReporter, display_name};
use crate::slot::JobCell;

/// Generic message shown to owners when a job fails.
pub const FAILURE_MESSAGE: &str = "Download failed. Please try again later.";
/// Message shown when an owner cancels a job.
pub const CANCELLED_MESSAGE: &str = "Download cancelled.";
const PREEMPTED_MESSAGE: &str = "Paused and moved back to the queue.";
const TIMEOUT_MESSAGE: &str = "No metadata yet; moved back to the queue to retry.";
const SHUTDOWN_MESSAGE: &str = "Paused for restart; the download resumes automatically.";

/// How a supervisor came to own its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Launch {
    /// Popped from the owner's queue.
    Fresh,
    /// Restored from the state file's active section.
    Resumed,
}

enum Outcome {
    Completed(TransferStatus),
    Failed(String),
    Cancelled,
    Requeue(RequeueReason),
}

pub(crate) async fn run(queue: DownloadQueue, cell: Arc<JobCell>, launch: Launch) {
    let mut supervisor = Supervisor::new(queue, cell);
    let outcome = supervisor.drive(launch).await;
    supervisor.settle(outcome).await;
    supervisor.reporter.close().await;
}

struct Supervisor {
    ctx: AppContext,
    queue: DownloadQueue,
    cell: Arc<JobCell>,
    reporter: ProgressReporter,
    handle: Option<TransferHandle>,
    engine_paused: bool,
    fetch_started: Option<Instant>,
}

impl Supervisor {
    fn new(queue: DownloadQueue, cell: Arc<JobCell>) -> Self {
        let ctx = queue.ctx().clone();
        let reporter = ProgressReporter::spawn(
            Arc::clone(&cell),
            Arc::clone(&ctx.renderer),
            ctx.metrics.clone(),
            &ctx.policy,
        );
        Self {
            ctx,
            queue,
            cell,
            reporter,
            handle: None,
            engine_paused: false,
            fetch_started: None,
        }
    }

    async fn drive(&mut self, launch: Launch) -> Outcome {
        if self.queue.shutdown_token().is_cancelled() {
            self.interrupt(Signal::Shutdown);
        } else {
            if launch == Launch::Fresh {
                self.acknowledge();
            }
            if let Err(outcome) = self.admit().await {
                return outcome;
            }
        }

        let mut force = true;
        loop {
            let status = self.cell.status();
            match status {
                DownloadStatus::Cancelling => return Outcome::Cancelled,
                DownloadStatus::Requeuing { reason } => return Outcome::Requeue(reason),
                other if !other.is_running() => {
                    return Outcome::Failed(format!("unexpected state {}", other.label()));
                }
                _ => {}
            }
            let Some(handle) = self.handle else {
                return Outcome::Failed("transfer handle missing".to_string());
            };

            match self.sync_pause(handle, status).await {
                Ok(changed) => force |= changed,
                Err(outcome) => return outcome,
            }
            let transfer = match self.ctx.engine.status(handle).await {
                Ok(transfer) => transfer,
                Err(err) => return Outcome::Failed(format!("{err:#}")),
            };
            if let TransferPhase::Error { message } = &transfer.phase {
                return Outcome::Failed(message.clone());
            }
            if transfer.phase.is_complete() {
                return Outcome::Completed(transfer);
            }
            force |= self.track_metadata(status, &transfer);
            if !self.cell.status().is_running() {
                continue;
            }

            self.reporter.report(&self.cell, &transfer, force);
            force = false;
            self.wait(self.cell.status()).await;
        }
    }

    fn acknowledge(&self) {
        let job = self.cell.snapshot();
        let text = format!(
            "Starting download: {}",
            display_name(&job.display, &TransferStatus::default())
        );
        let mut actions = vec![StatusAction::Cancel];
        if self.queue.has_waiting(job.owner) {
            actions.push(StatusAction::CancelAll);
        }
        self.reporter.announce(RenderedStatus { text, actions });
    }

    async fn admit(&mut self) -> Result<(), Outcome> {
        let job = self.cell.snapshot();
        let handle = self
            .ctx
            .engine
            .add_transfer(&job.source, &job.save_path)
            .await
            .map_err(|err| Outcome::Failed(format!("{err:#}")))?;
        debug!(%handle, save_path = %job.save_path.display(), "transfer added");
        self.handle = Some(handle);
        Ok(())
    }

    /// Bring the engine in line with the owner's pause preference.
    async fn sync_pause(
        &mut self,
        handle: TransferHandle,
        status: DownloadStatus,
    ) -> Result<bool, Outcome> {
        let paused = status.is_paused();
        if paused == self.engine_paused {
            return Ok(false);
        }
        let result = if paused {
            self.ctx.engine.pause(handle).await
        } else {
            self.ctx.engine.resume(handle).await
        };
        result.map_err(|err| Outcome::Failed(format!("{err:#}")))?;
        self.engine_paused = paused;

        let (owner, job_id) = (self.cell.owner.0, self.cell.id.0);
        let event = if paused {
            info!("download paused");
            Event::JobPaused { owner, job_id }
        } else {
            info!("download resumed");
            Event::JobResumed { owner, job_id }
        };
        self.ctx.events.publish(event);
        Ok(true)
    }

    /// Promote on metadata arrival or enforce the fetch timeout.
    ///
    /// The timeout clock only runs while fetching unpaused and restarts on
    /// resume.
    fn track_metadata(&mut self, status: DownloadStatus, transfer: &TransferStatus) -> bool {
        let DownloadStatus::FetchingMetadata { paused, .. } = status else {
            return false;
        };
        if transfer.has_metadata {
            self.cell
                .update(|job| job.status = job.status.metadata_ready());
            self.fetch_started = None;
            info!(name = transfer.name.as_deref().unwrap_or_default(), "metadata ready");
            self.ctx.events.publish(Event::MetadataReady {
                owner: self.cell.owner.0,
                job_id: self.cell.id.0,
            });
            return true;
        }
        if paused {
            self.fetch_started = None;
            return false;
        }
        let now = Instant::now();
        let started = *self.fetch_started.get_or_insert(now);
        let timeout = self.ctx.policy.metadata_timeout();
        if now.saturating_duration_since(started) >= timeout {
            warn!(timeout_secs = timeout.as_secs(), "metadata fetch timed out");
            self.interrupt(Signal::TimeoutElapsed);
        }
        false
    }

    async fn wait(&self, status: DownloadStatus) {
        let interval = if status.is_paused() {
            self.ctx.policy.paused_poll_interval()
        } else {
            self.ctx.policy.poll_interval()
        };
        tokio::select! {
            biased;
            () = self.queue.shutdown_token().cancelled() => self.interrupt(Signal::Shutdown),
            () = self.cell.woken() => {}
            () = tokio::time::sleep(interval) => {}
        }
    }

    fn interrupt(&self, signal: Signal) {
        let result = self
            .cell
            .update(|job| job.status.interrupt(signal).map(|next| job.status = next));
        if let Err(err) = result {
            debug!(error = %err, signal = signal.as_str(), "interrupt ignored");
        }
    }

    async fn settle(&mut self, outcome: Outcome) {
        let (owner, job_id) = (self.cell.owner, self.cell.id);
        match outcome {
            Outcome::Completed(transfer) => self.complete(&transfer).await,
            Outcome::Failed(detail) => {
                error!(detail = %detail, "download failed");
                self.remove(self.removal(RemoveTransfer { with_data: true })).await;
                let status = self.advance(DownloadStatus::fail, DownloadStatus::Failed);
                self.conclude(FAILURE_MESSAGE);
                self.ctx.events.publish(Event::JobFailed {
                    owner: owner.0,
                    job_id: job_id.0,
                    message: detail,
                });
                self.queue.finish(owner, job_id, status);
            }
            Outcome::Cancelled => {
                info!("download cancelled by owner");
                self.remove(self.removal(RemoveTransfer { with_data: true })).await;
                let status = self.advance(DownloadStatus::finish_cancel, DownloadStatus::Cancelled);
                self.conclude(CANCELLED_MESSAGE);
                self.ctx.events.publish(Event::JobCancelled {
                    owner: owner.0,
                    job_id: job_id.0,
                });
                self.queue.finish(owner, job_id, status);
            }
            Outcome::Requeue(RequeueReason::Shutdown { paused }) => {
                self.remove(self.removal(RemoveTransfer { with_data: false })).await;
                info!(paused, "download preserved for restart");
                self.ctx.metrics.inc_requeue(RequeueReason::Shutdown { paused }.as_str());
                self.ctx.events.publish(Event::JobRequeued {
                    owner: owner.0,
                    job_id: job_id.0,
                    reason: RequeueReason::Shutdown { paused }.as_str().to_string(),
                });
                self.conclude(SHUTDOWN_MESSAGE);
            }
            Outcome::Requeue(reason) => {
                self.remove(self.removal(RemoveTransfer { with_data: false })).await;
                let cooldown = self.queue.requeue(owner, job_id);
                let message = if reason == RequeueReason::MetadataTimeout {
                    TIMEOUT_MESSAGE
                } else {
                    PREEMPTED_MESSAGE
                };
                self.conclude(message);
                if cooldown {
                    self.cool_down().await;
                }
            }
        }
    }

    async fn complete(&mut self, transfer: &TransferStatus) {
        let job = self.cell.snapshot();
        let files = match self.handle {
            Some(handle) => self.ctx.engine.files(handle).await.unwrap_or_else(|err| {
                warn!(error = %err, "file listing unavailable");
                Vec::new()
            }),
            None => Vec::new(),
        };
        let outcome = TransferOutcome {
            name: transfer
                .name
                .clone()
                .unwrap_or_else(|| display_name(&job.display, transfer)),
            save_path: job.save_path.clone(),
            files,
            batch: self.queue.record_completion(&job),
        };

        let result = self.ctx.completion.on_completed(&job, &outcome).await;
        // Data stays on disk when post-processing failed so it can be recovered.
        self.remove(RemoveTransfer {
            with_data: result.is_ok(),
        })
        .await;

        let (owner, job_id) = (job.owner, job.id);
        match result {
            Ok(message) => {
                let status = self.advance(DownloadStatus::complete, DownloadStatus::Completed);
                info!(files = outcome.files.len(), name = %outcome.name, "download completed");
                self.conclude(&message);
                self.ctx.events.publish(Event::JobCompleted {
                    owner: owner.0,
                    job_id: job_id.0,
                });
                self.queue.finish(owner, job_id, status);
            }
            Err(err) => {
                error!(error = %err, detail = ?err, "post-processing failed");
                let status = self.advance(DownloadStatus::fail, DownloadStatus::Failed);
                self.conclude(FAILURE_MESSAGE);
                self.ctx.events.publish(Event::JobFailed {
                    owner: owner.0,
                    job_id: job_id.0,
                    message: format!("{err:#}"),
                });
                self.queue.finish(owner, job_id, status);
            }
        }
    }

    /// Hold off re-dispatching a lone timed-out job so an unresponsive source
    /// is not retried in a tight loop.
    async fn cool_down(&self) {
        let delay = self.ctx.policy.requeue_cooldown();
        info!(cooldown_secs = delay.as_secs(), "retry delayed");
        tokio::select! {
            () = self.queue.shutdown_token().cancelled() => {}
            () = tokio::time::sleep(delay) => self.queue.dispatch(self.cell.owner),
        }
    }

    /// Removal owed by the job's current state, or `fallback` when the state
    /// does not name one.
    fn removal(&self, fallback: RemoveTransfer) -> RemoveTransfer {
        let removal = self.cell.status().pending_removal();
        if removal.is_none() {
            debug!(state = self.cell.status().label(), "no removal recorded; using default");
        }
        removal.unwrap_or(fallback)
    }

    async fn remove(&mut self, options: RemoveTransfer) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match self.ctx.engine.remove_transfer(handle, options).await {
            Ok(()) => debug!(%handle, with_data = options.with_data, "transfer removed"),
            Err(err) => warn!(
                %handle,
                with_data = options.with_data,
                error = %err,
                detail = ?err,
                "transfer removal failed"
            ),
        }
    }

    fn advance(
        &self,
        transition: fn(DownloadStatus) -> LifecycleResult<DownloadStatus>,
        fallback: DownloadStatus,
    ) -> DownloadStatus {
        self.cell.update(|job| {
            job.status = transition(job.status).unwrap_or_else(|err| {
                warn!(error = %err, state = fallback.label(), "forcing end state");
                fallback
            });
            job.status
        })
    }

    fn conclude(&self, text: &str) {
        self.reporter.conclude(RenderedStatus::final_message(text));
    }
}
