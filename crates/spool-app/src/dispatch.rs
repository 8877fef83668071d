//! Per-owner queues, the active slot map, and the inbound command surface.
//!
//! # Design
//! - `dispatch` is the only place a job leaves a queue and gains a supervisor.
//! - Every enqueue, start, requeue and terminal transition persists the full
//!   snapshot before control returns to the caller.
//! - The registry lock is never held across an await.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use spool_core::{
    BatchId, BatchProgress, BatchTally, CommandError, CommandResult, DownloadJob, DownloadRequest,
    DownloadStatus, JobId, OwnerId, PersistedSnapshot, RequeueReason, Signal,
};
use spool_events::Event;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::context::AppContext;
use crate::slot::JobCell;
use crate::supervisor::{self, Launch};

const PERSISTENCE_COMPONENT: &str = "persistence";

/// Step of a two-phase cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelStep {
    /// Open the confirmation prompt; progress renders pause until answered.
    Prompt,
    /// Cancel for real.
    Confirm,
    /// Dismiss the prompt and keep downloading.
    Deny,
}

/// Receipt returned by [`DownloadQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    /// Identifier assigned to the new job.
    pub job_id: JobId,
    /// 1-based position counting the owner's running job.
    pub position: usize,
}

/// Receipt returned by [`DownloadQueue::enqueue_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEnqueued {
    /// Identifier shared by every job of the batch.
    pub batch_id: BatchId,
    /// Jobs in dispatch order.
    pub job_ids: Vec<JobId>,
    /// 1-based position of the first job, counting the running job.
    pub first_position: usize,
}

#[derive(Default)]
struct Registry {
    active: BTreeMap<OwnerId, Arc<JobCell>>,
    queues: BTreeMap<OwnerId, VecDeque<DownloadJob>>,
    batches: BTreeMap<BatchId, BatchTally>,
    tasks: Vec<JoinHandle<()>>,
}

impl Registry {
    fn snapshot(&self) -> PersistedSnapshot {
        let active: Vec<DownloadJob> = self.active.values().map(|cell| cell.snapshot()).collect();
        PersistedSnapshot::capture(&active, &self.queues).with_batches(&self.batches)
    }

    /// Drop tallies of batches with no job left running or waiting.
    fn prune_batches(&mut self) {
        if self.batches.is_empty() {
            return;
        }
        let live: BTreeSet<BatchId> = self
            .active
            .values()
            .filter_map(|cell| cell.update(|job| job.batch))
            .chain(self.queues.values().flatten().filter_map(|job| job.batch))
            .collect();
        self.batches.retain(|id, _| live.contains(id));
    }

    fn active_cell(&self, owner: OwnerId, id: JobId) -> Option<&Arc<JobCell>> {
        self.active.get(&owner).filter(|cell| cell.id == id)
    }

    fn queued_len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }
}

struct QueueInner {
    ctx: AppContext,
    registry: Mutex<Registry>,
    shutdown: CancellationToken,
    degraded: AtomicBool,
}

/// Queue and dispatch authority for every owner.
#[derive(Clone)]
pub struct DownloadQueue {
    inner: Arc<QueueInner>,
}

impl DownloadQueue {
    /// Build an idle queue around `ctx`.
    #[must_use]
    pub fn new(ctx: AppContext) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                ctx,
                registry: Mutex::new(Registry::default()),
                shutdown: CancellationToken::new(),
                degraded: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn ctx(&self) -> &AppContext {
        &self.inner.ctx
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a job to its owner's queue and start it if the slot is free.
    ///
    /// A paused running job is preempted: its supervisor requeues it at the
    /// back of the queue and the slot passes to the next waiting job.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::ShuttingDown`] once draining has begun.
    pub fn enqueue(&self, request: DownloadRequest) -> CommandResult<Enqueued> {
        if self.inner.shutdown.is_cancelled() {
            return Err(CommandError::ShuttingDown);
        }
        let job = DownloadJob::from_request(request);
        let (owner, job_id) = (job.owner, job.id);
        let position = self
            .append(owner, vec![job], None)
            .last()
            .map_or(1, |receipt| receipt.position);
        self.dispatch(owner);
        Ok(Enqueued { job_id, position })
    }

    /// Queue a season's episodes for one owner as a single batch.
    ///
    /// The jobs land back to back in request order under one persist, a
    /// paused running job is preempted at most once, and every job carries the
    /// batch id so completions can report how far the batch has come.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::ShuttingDown`] once draining has begun and
    /// [`CommandError::EmptyBatch`] when `requests` is empty.
    pub fn enqueue_batch(
        &self,
        owner: OwnerId,
        requests: Vec<DownloadRequest>,
    ) -> CommandResult<BatchEnqueued> {
        if self.inner.shutdown.is_cancelled() {
            return Err(CommandError::ShuttingDown);
        }
        if requests.is_empty() {
            return Err(CommandError::EmptyBatch { owner });
        }
        let batch_id = BatchId::new();
        let jobs = requests
            .into_iter()
            .map(|request| {
                let mut job = DownloadJob::from_request(request);
                job.owner = owner;
                job.batch = Some(batch_id);
                job
            })
            .collect();
        let receipts = self.append(owner, jobs, Some(batch_id));
        info!(owner_id = %owner, batch_id = %batch_id, total = receipts.len(), "batch queued");
        self.dispatch(owner);
        Ok(BatchEnqueued {
            batch_id,
            first_position: receipts.first().map_or(0, |receipt| receipt.position),
            job_ids: receipts.into_iter().map(|receipt| receipt.job_id).collect(),
        })
    }

    fn append(
        &self,
        owner: OwnerId,
        jobs: Vec<DownloadJob>,
        batch: Option<BatchId>,
    ) -> Vec<Enqueued> {
        let receipts: Vec<Enqueued> = {
            let mut registry = self.registry();
            let running_ahead = match registry.active.get(&owner) {
                Some(cell) => {
                    if cell.status().is_paused() {
                        preempt(cell);
                    }
                    usize::from(!cell.status().is_requeued())
                }
                None => 0,
            };
            if let Some(id) = batch {
                registry.batches.insert(
                    id,
                    BatchTally {
                        total: jobs.len(),
                        done: 0,
                    },
                );
            }
            let queue = registry.queues.entry(owner).or_default();
            let receipts: Vec<Enqueued> = jobs
                .into_iter()
                .map(|job| {
                    let job_id = job.id;
                    queue.push_back(job);
                    Enqueued {
                        job_id,
                        position: queue.len() + running_ahead,
                    }
                })
                .collect();
            self.persist(&registry);
            receipts
        };

        for receipt in &receipts {
            info!(
                owner_id = %owner,
                job_id = %receipt.job_id,
                position = receipt.position,
                "download queued"
            );
            self.ctx().events.publish(Event::JobQueued {
                owner: owner.0,
                job_id: receipt.job_id.0,
                position: receipt.position,
            });
        }
        receipts
    }

    /// Start the head of `owner`'s queue if the owner has no running job.
    ///
    /// Safe to call from any completion path; a no-op while the slot is
    /// occupied, the queue is empty, or the process is draining.
    pub fn dispatch(&self, owner: OwnerId) {
        let mut registry = self.registry();
        if self.inner.shutdown.is_cancelled() || registry.active.contains_key(&owner) {
            return;
        }
        let Some(queue) = registry.queues.get_mut(&owner) else {
            return;
        };
        let next = loop {
            let Some(mut job) = queue.pop_front() else {
                break None;
            };
            match job.status.start() {
                Ok(status) => {
                    job.status = status;
                    break Some(job);
                }
                Err(err) => {
                    warn!(owner_id = %owner, job_id = %job.id, error = %err, "dropping unstartable queue entry");
                }
            }
        };
        if queue.is_empty() {
            registry.queues.remove(&owner);
        }
        if let Some(job) = next {
            self.launch(&mut registry, job, Launch::Fresh);
        }
        self.persist(&registry);
    }

    fn launch(&self, registry: &mut Registry, job: DownloadJob, launch: Launch) {
        let cell = JobCell::new(job);
        let (owner, job_id) = (cell.owner, cell.id);
        registry.active.insert(owner, Arc::clone(&cell));
        let span = info_span!("download", owner_id = %owner, job_id = %job_id);
        let task = tokio::spawn(supervisor::run(self.clone(), cell, launch).instrument(span));
        registry.tasks.retain(|task| !task.is_finished());
        registry.tasks.push(task);

        let resumed = matches!(launch, Launch::Resumed);
        info!(owner_id = %owner, job_id = %job_id, resumed, "download started");
        self.ctx().events.publish(Event::JobStarted {
            owner: owner.0,
            job_id: job_id.0,
            resumed,
        });
    }

    /// Ask the owner's running job to pause.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::NoActiveDownload`] when nothing is running and
    /// [`CommandError::Lifecycle`] when the job is already being torn down.
    pub fn request_pause(&self, owner: OwnerId) -> CommandResult<()> {
        self.command(owner, "pause", DownloadStatus::pause)
    }

    /// Ask the owner's running job to resume.
    ///
    /// # Errors
    ///
    /// Same as [`DownloadQueue::request_pause`].
    pub fn request_resume(&self, owner: OwnerId) -> CommandResult<()> {
        self.command(owner, "resume", DownloadStatus::resume)
    }

    fn command(
        &self,
        owner: OwnerId,
        operation: &'static str,
        transition: fn(DownloadStatus) -> spool_core::LifecycleResult<DownloadStatus>,
    ) -> CommandResult<()> {
        let cell = self.running_cell(owner)?;
        cell.update(|job| {
            job.status =
                transition(job.status).map_err(|err| CommandError::lifecycle(operation, err))?;
            Ok::<_, CommandError>(())
        })?;
        cell.wake();
        self.persist(&self.registry());
        debug!(owner_id = %owner, operation, "command applied");
        Ok(())
    }

    /// Two-phase cancel of the owner's running job.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::NoActiveDownload`] when nothing is running and
    /// [`CommandError::Lifecycle`] when the job cannot take the step.
    pub fn request_cancel(&self, owner: OwnerId, step: CancelStep) -> CommandResult<()> {
        let cell = self.running_cell(owner)?;
        cancel_step(&cell, step)
    }

    /// Two-phase cancel of the running job and every waiting job.
    ///
    /// Returns the number of waiting jobs discarded on confirmation.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::NoActiveDownload`] when the owner has neither a
    /// running job nor waiting ones.
    pub fn request_cancel_all(&self, owner: OwnerId, step: CancelStep) -> CommandResult<usize> {
        if self.inner.shutdown.is_cancelled() {
            return Err(CommandError::ShuttingDown);
        }
        let (cell, removed) = {
            let mut registry = self.registry();
            let cell = registry.active.get(&owner).cloned();
            let waiting = registry.queues.get(&owner).map_or(0, VecDeque::len);
            if cell.is_none() && waiting == 0 {
                return Err(CommandError::NoActiveDownload { owner });
            }
            let removed = if step == CancelStep::Confirm {
                let removed = registry.queues.remove(&owner).map_or(0, |queue| queue.len());
                registry.prune_batches();
                self.persist(&registry);
                removed
            } else {
                0
            };
            (cell, removed)
        };

        if removed > 0 {
            info!(owner_id = %owner, removed, "queue cleared");
            self.ctx().events.publish(Event::QueueCleared {
                owner: owner.0,
                removed,
            });
        }
        if let Some(cell) = cell.filter(|cell| cell.status().is_running()) {
            cancel_step(&cell, step)?;
        }
        Ok(removed)
    }

    fn running_cell(&self, owner: OwnerId) -> CommandResult<Arc<JobCell>> {
        if self.inner.shutdown.is_cancelled() {
            return Err(CommandError::ShuttingDown);
        }
        self.registry()
            .active
            .get(&owner)
            .cloned()
            .ok_or(CommandError::NoActiveDownload { owner })
    }

    /// Current state of the owner's running job.
    #[must_use]
    pub fn active_job(&self, owner: OwnerId) -> Option<DownloadJob> {
        self.registry().active.get(&owner).map(|cell| cell.snapshot())
    }

    /// Jobs waiting for the owner's slot, in dispatch order.
    #[must_use]
    pub fn queued_jobs(&self, owner: OwnerId) -> Vec<DownloadJob> {
        self.registry()
            .queues
            .get(&owner)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn has_waiting(&self, owner: OwnerId) -> bool {
        self.registry()
            .queues
            .get(&owner)
            .is_some_and(|queue| !queue.is_empty())
    }

    /// Count a completed batch job and report where its batch stands.
    ///
    /// The job is the batch's last when none of its siblings is still
    /// waiting; the owner's single slot means none can be running.
    pub(crate) fn record_completion(&self, job: &DownloadJob) -> Option<BatchProgress> {
        let id = job.batch?;
        let progress = {
            let mut registry = self.registry();
            let remaining = registry.queues.get(&job.owner).map_or(0, |queue| {
                queue.iter().filter(|queued| queued.batch == Some(id)).count()
            });
            let tally = registry.batches.entry(id).or_default();
            tally.done += 1;
            tally.total = tally.total.max(tally.done + remaining);
            let progress = BatchProgress {
                id,
                done: tally.done,
                total: tally.total,
                last: remaining == 0,
            };
            self.persist(&registry);
            progress
        };
        debug!(batch_id = %id, done = progress.done, total = progress.total, "batch progress");
        if progress.last {
            info!(
                owner_id = %job.owner,
                batch_id = %id,
                done = progress.done,
                total = progress.total,
                "batch complete"
            );
            self.ctx().events.publish(Event::BatchCompleted {
                owner: job.owner.0,
                batch_id: id.0,
                done: progress.done,
                total: progress.total,
            });
        }
        Some(progress)
    }

    /// Snapshot of the in-memory state as it would be persisted.
    #[must_use]
    pub fn snapshot(&self) -> PersistedSnapshot {
        self.registry().snapshot()
    }

    /// Restore state saved by a previous process.
    ///
    /// Jobs that were running go straight back into a supervisor without
    /// passing through the queue. Owners with waiting jobs but no running
    /// one are dispatched; an owner whose next job is a lone metadata-timeout
    /// retry waits out the requeue cooldown first. Returns the number of
    /// resumed jobs.
    pub fn resume_on_start(&self, snapshot: PersistedSnapshot) -> usize {
        let PersistedSnapshot {
            active_downloads,
            download_queues,
            batches,
        } = snapshot;
        let mut resumed = 0;
        let idle_owners: Vec<(OwnerId, bool)> = {
            let mut registry = self.registry();
            registry.batches.extend(batches);
            for (owner, jobs) in download_queues {
                registry.queues.entry(owner).or_default().extend(jobs);
            }
            for (owner, mut job) in active_downloads {
                if registry.active.contains_key(&owner) {
                    warn!(owner_id = %owner, job_id = %job.id, "duplicate active job in state file; queueing it");
                    job.status = DownloadStatus::queued();
                    registry.queues.entry(owner).or_default().push_front(job);
                    continue;
                }
                job.status = job.status.resume_after_restart();
                if !job.status.is_running() {
                    warn!(owner_id = %owner, job_id = %job.id, state = job.status.label(), "skipping finished job in state file");
                    continue;
                }
                job.owner = owner;
                self.launch(&mut registry, job, Launch::Resumed);
                resumed += 1;
            }
            registry.prune_batches();
            self.persist(&registry);
            registry
                .queues
                .iter()
                .filter(|(owner, _)| !registry.active.contains_key(*owner))
                .map(|(owner, queue)| (*owner, queue.front().is_some_and(awaits_cooldown)))
                .collect()
        };
        for (owner, cooldown) in idle_owners {
            if cooldown {
                self.dispatch_after_cooldown(owner);
            } else {
                self.dispatch(owner);
            }
        }
        info!(resumed, "state restored");
        resumed
    }

    fn dispatch_after_cooldown(&self, owner: OwnerId) {
        let delay = self.ctx().policy.requeue_cooldown();
        info!(owner_id = %owner, cooldown_secs = delay.as_secs(), "restored retry delayed");
        let queue = self.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                () = queue.shutdown_token().cancelled() => {}
                () = tokio::time::sleep(delay) => queue.dispatch(owner),
            }
        });
        self.registry().tasks.push(task);
    }

    /// Stop every supervisor, keeping transfers resumable, then save once more.
    ///
    /// Running jobs take the shutdown path: their engine transfers are removed
    /// without deleting data and they stay in the active section of the
    /// snapshot so the next process resumes them.
    pub async fn drain_on_shutdown(&self) {
        info!("draining downloads");
        self.inner.shutdown.cancel();
        loop {
            let tasks = std::mem::take(&mut self.registry().tasks);
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                if let Err(err) = task.await {
                    warn!(error = %err, "supervisor task ended abnormally");
                }
            }
        }
        let registry = self.registry();
        self.persist(&registry);
        info!(
            preserved = registry.active.len(),
            queued = registry.queued_len(),
            "drain complete"
        );
    }

    /// Remove a finished job from its slot and start the owner's next one.
    pub(crate) fn finish(&self, owner: OwnerId, job_id: JobId, status: DownloadStatus) {
        {
            let mut registry = self.registry();
            if registry.active_cell(owner, job_id).is_some() {
                registry.active.remove(&owner);
            }
            registry.prune_batches();
            self.persist(&registry);
        }
        self.ctx().metrics.inc_finished(status.label());
        self.dispatch(owner);
    }

    /// Move an interrupted job from its slot to the back of the owner's queue.
    ///
    /// Returns whether the retry must wait out the cooldown: a timed-out job
    /// that is the only entry left comes back unpaused and is dispatched by
    /// its supervisor after the cooldown; otherwise dispatch runs immediately.
    pub(crate) fn requeue(&self, owner: OwnerId, job_id: JobId) -> bool {
        let (cooldown, reason) = {
            let mut registry = self.registry();
            let Some(cell) = registry.active_cell(owner, job_id).cloned() else {
                warn!(owner_id = %owner, job_id = %job_id, "requeue for a job that no longer holds the slot");
                return false;
            };
            registry.active.remove(&owner);

            let mut job = cell.snapshot();
            let reason = match job.status {
                DownloadStatus::Requeuing { reason } => reason,
                other => {
                    warn!(state = other.label(), "requeue without a requeue reason");
                    RequeueReason::PausePreempt
                }
            };
            let queue = registry.queues.entry(owner).or_default();
            let cooldown = reason == RequeueReason::MetadataTimeout && queue.is_empty();
            job.status = job.status.into_queued(cooldown).unwrap_or(DownloadStatus::Queued {
                paused: true,
                after_timeout: false,
            });
            queue.push_back(job);
            self.persist(&registry);
            (cooldown, reason)
        };

        info!(owner_id = %owner, job_id = %job_id, reason = reason.as_str(), cooldown, "download requeued");
        self.ctx().metrics.inc_requeue(reason.as_str());
        self.ctx().events.publish(Event::JobRequeued {
            owner: owner.0,
            job_id: job_id.0,
            reason: reason.as_str().to_string(),
        });
        if !cooldown {
            self.dispatch(owner);
        }
        cooldown
    }

    fn persist(&self, registry: &Registry) {
        let snapshot = registry.snapshot();
        let metrics = &self.ctx().metrics;
        metrics.set_active_downloads(registry.active.len());
        metrics.set_queued_downloads(registry.queued_len());

        let saved = self.ctx().store.save(&snapshot);
        if !saved {
            metrics.inc_persistence_failure();
        }
        let was_degraded = self.inner.degraded.swap(!saved, Ordering::SeqCst);
        if was_degraded == saved {
            let degraded = if saved {
                Vec::new()
            } else {
                vec![PERSISTENCE_COMPONENT.to_string()]
            };
            self.ctx().events.publish(Event::HealthChanged { degraded });
        }
    }
}

/// A timed-out job that requeued alone comes back unpaused and must not be
/// retried before the cooldown.
const fn awaits_cooldown(job: &DownloadJob) -> bool {
    matches!(
        job.status,
        DownloadStatus::Queued {
            paused: false,
            after_timeout: true
        }
    )
}

fn preempt(cell: &JobCell) {
    let preempted = cell.update(|job| match job.status.interrupt(Signal::PausePreempt) {
        Ok(next) => {
            job.status = next;
            true
        }
        Err(err) => {
            debug!(error = %err, "paused job not preemptible");
            false
        }
    });
    if preempted {
        info!(owner_id = %cell.owner, job_id = %cell.id, "preempting paused download");
        cell.wake();
    }
}

fn cancel_step(cell: &JobCell, step: CancelStep) -> CommandResult<()> {
    cell.update(|job| {
        job.status = match step {
            CancelStep::Prompt => job
                .status
                .begin_cancel_confirmation()
                .map_err(|err| CommandError::lifecycle("cancel_prompt", err))?,
            CancelStep::Deny => job.status.without_confirmation(),
            CancelStep::Confirm => job
                .status
                .interrupt(Signal::UserCancel)
                .map_err(|err| CommandError::lifecycle("cancel", err))?,
        };
        Ok::<_, CommandError>(())
    })?;
    if step != CancelStep::Prompt {
        cell.wake();
    }
    Ok(())
}
