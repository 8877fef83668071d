//! End-to-end lifecycle tests against scripted collaborators on a paused clock.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use spool_config::DownloadPolicy;
use spool_core::{
    BatchId, BatchTally, CommandError, CompletionHandler, DisplayMetadata, DownloadJob,
    DownloadRequest, DownloadStatus, JobId, JobSource, OwnerId, PersistedSnapshot,
    RemoveTransfer, RenderedStatus, RequeueReason, StatusAction, StatusRenderer, TransferEngine,
    TransferFile, TransferHandle, TransferOutcome, TransferPhase, TransferStatus,
};
use spool_events::{Event, EventBus, EventStream};
use spool_runtime::StateStore;
use spool_telemetry::Metrics;
use tempfile::TempDir;
use tokio::time::Instant;

use crate::context::AppContext;
use crate::dispatch::{CancelStep, DownloadQueue};
use crate::supervisor::{CANCELLED_MESSAGE, FAILURE_MESSAGE};

const EVENT_WAIT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Script {
    /// Metadata is known and the payload is half done.
    Downloading,
    /// Metadata never arrives.
    NoMetadata,
    /// Seeding after the given number of polls.
    CompleteAfter(u32),
    /// Every poll errors.
    FailOnPoll,
}

struct LiveTransfer {
    dir: PathBuf,
    script: Script,
    polls: u32,
}

#[derive(Default)]
struct EngineLog {
    adds: Vec<(TransferHandle, JobSource)>,
    removes: Vec<(TransferHandle, RemoveTransfer)>,
    pauses: Vec<TransferHandle>,
    resumes: Vec<TransferHandle>,
    live: HashMap<TransferHandle, LiveTransfer>,
    max_live_per_dir: usize,
}

#[derive(Default)]
struct RecordingEngine {
    scripts: Mutex<HashMap<String, Script>>,
    log: Mutex<EngineLog>,
}

impl RecordingEngine {
    fn script(&self, uri: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(uri.to_string(), script);
    }

    fn log(&self) -> MutexGuard<'_, EngineLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handles_for(&self, uri: &str) -> Vec<TransferHandle> {
        self.log()
            .adds
            .iter()
            .filter(|(_, source)| matches!(source, JobSource::Magnet { uri: added } if added == uri))
            .map(|(handle, _)| *handle)
            .collect()
    }

    fn handle_for(&self, uri: &str) -> TransferHandle {
        self.handles_for(uri)
            .last()
            .copied()
            .expect("transfer was added")
    }

    fn removals_for(&self, handle: TransferHandle) -> Vec<RemoveTransfer> {
        self.log()
            .removes
            .iter()
            .filter(|(removed, _)| *removed == handle)
            .map(|(_, options)| *options)
            .collect()
    }

    fn max_live(&self) -> usize {
        self.log().max_live_per_dir
    }

    fn polls(&self, handle: TransferHandle) -> u32 {
        self.log()
            .live
            .get(&handle)
            .map_or(0, |transfer| transfer.polls)
    }
}

fn half_done() -> TransferStatus {
    TransferStatus {
        name: Some("payload".into()),
        phase: TransferPhase::Downloading,
        has_metadata: true,
        bytes_downloaded: 50,
        bytes_total: 100,
        download_bps: 1_500_000,
        peers: 4,
    }
}

#[async_trait]
impl TransferEngine for RecordingEngine {
    async fn add_transfer(
        &self,
        source: &JobSource,
        save_path: &Path,
    ) -> anyhow::Result<TransferHandle> {
        let script = match source {
            JobSource::Magnet { uri } => self
                .scripts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(uri)
                .copied()
                .unwrap_or(Script::Downloading),
            JobSource::TorrentFile { .. } => Script::Downloading,
        };
        let handle = TransferHandle::new();
        let mut log = self.log();
        log.adds.push((handle, source.clone()));
        log.live.insert(
            handle,
            LiveTransfer {
                dir: save_path.to_path_buf(),
                script,
                polls: 0,
            },
        );
        let here = log
            .live
            .values()
            .filter(|transfer| transfer.dir == save_path)
            .count();
        log.max_live_per_dir = log.max_live_per_dir.max(here);
        Ok(handle)
    }

    async fn status(&self, handle: TransferHandle) -> anyhow::Result<TransferStatus> {
        let mut log = self.log();
        let transfer = log
            .live
            .get_mut(&handle)
            .ok_or_else(|| anyhow!("unknown transfer"))?;
        transfer.polls += 1;
        match transfer.script {
            Script::Downloading => Ok(half_done()),
            Script::NoMetadata => Ok(TransferStatus {
                phase: TransferPhase::FetchingMetadata,
                peers: 1,
                ..TransferStatus::default()
            }),
            Script::CompleteAfter(polls) if transfer.polls > polls => Ok(TransferStatus {
                phase: TransferPhase::Seeding,
                bytes_downloaded: 100,
                download_bps: 0,
                ..half_done()
            }),
            Script::CompleteAfter(_) => Ok(half_done()),
            Script::FailOnPoll => bail!("tracker unreachable"),
        }
    }

    async fn remove_transfer(
        &self,
        handle: TransferHandle,
        options: RemoveTransfer,
    ) -> anyhow::Result<()> {
        let mut log = self.log();
        log.live.remove(&handle);
        log.removes.push((handle, options));
        Ok(())
    }

    async fn pause(&self, handle: TransferHandle) -> anyhow::Result<()> {
        self.log().pauses.push(handle);
        Ok(())
    }

    async fn resume(&self, handle: TransferHandle) -> anyhow::Result<()> {
        self.log().resumes.push(handle);
        Ok(())
    }

    async fn files(&self, _handle: TransferHandle) -> anyhow::Result<Vec<TransferFile>> {
        Ok(vec![TransferFile {
            path: PathBuf::from("payload.mkv"),
            size_bytes: 100,
        }])
    }
}

#[derive(Default)]
struct RecordingRenderer {
    delay: Duration,
    renders: Mutex<Vec<(JobId, RenderedStatus)>>,
}

impl RecordingRenderer {
    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            renders: Mutex::default(),
        }
    }

    fn statuses_for(&self, job: JobId) -> Vec<RenderedStatus> {
        self.renders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(id, _)| *id == job)
            .map(|(_, status)| status.clone())
            .collect()
    }

    fn texts_for(&self, job: JobId) -> Vec<String> {
        self.statuses_for(job)
            .into_iter()
            .map(|status| status.text)
            .collect()
    }

    fn progress_for(&self, job: JobId) -> Vec<String> {
        self.texts_for(job)
            .into_iter()
            .filter(|text| text.starts_with("Downloading:") || text.starts_with("Paused:"))
            .collect()
    }

    fn last_for(&self, job: JobId) -> Option<String> {
        self.texts_for(job).pop()
    }
}

#[async_trait]
impl StatusRenderer for RecordingRenderer {
    async fn render(
        &self,
        _owner: OwnerId,
        job: JobId,
        status: &RenderedStatus,
    ) -> anyhow::Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.renders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((job, status.clone()));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingCompletion {
    calls: Mutex<Vec<(JobId, TransferOutcome)>>,
}

#[async_trait]
impl CompletionHandler for RecordingCompletion {
    async fn on_completed(
        &self,
        job: &DownloadJob,
        outcome: &TransferOutcome,
    ) -> anyhow::Result<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((job.id, outcome.clone()));
        Ok(format!("Done: {}", outcome.name))
    }
}

struct Harness {
    dir: TempDir,
    queue: DownloadQueue,
    engine: Arc<RecordingEngine>,
    renderer: Arc<RecordingRenderer>,
    completion: Arc<RecordingCompletion>,
    store: StateStore,
    metrics: Metrics,
    events: EventStream,
}

fn policy(root: &Path) -> DownloadPolicy {
    DownloadPolicy {
        default_save_path: root.join("downloads"),
        poll_interval_ms: 1_000,
        paused_poll_interval_ms: 500,
        metadata_timeout_secs: 30,
        requeue_cooldown_secs: 60,
        progress_throttle_secs: 5,
        render_timeout_secs: 1,
    }
}

fn uri(name: &str) -> String {
    format!("magnet:?xt=urn:btih:{name}&dn={name}")
}

fn kind_for(kind: &'static str, job: JobId) -> impl Fn(&Event) -> bool {
    move |event| event.kind() == kind && event.job_id() == Some(job.0)
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let store = StateStore::new(dir.path().join("state").join("persistence.json"));
        Self::with_store(dir, store)
    }

    fn with_store(dir: TempDir, store: StateStore) -> Self {
        let policy = policy(dir.path());
        Self::assemble(dir, store, RecordingRenderer::default(), policy)
    }

    fn with_renderer(renderer: RecordingRenderer, tune: impl FnOnce(&mut DownloadPolicy)) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let store = StateStore::new(dir.path().join("state").join("persistence.json"));
        let mut policy = policy(dir.path());
        tune(&mut policy);
        Self::assemble(dir, store, renderer, policy)
    }

    fn assemble(
        dir: TempDir,
        store: StateStore,
        renderer: RecordingRenderer,
        policy: DownloadPolicy,
    ) -> Self {
        let engine = Arc::new(RecordingEngine::default());
        let renderer = Arc::new(renderer);
        let completion = Arc::new(RecordingCompletion::default());
        let metrics = Metrics::new().expect("metrics");
        let bus = EventBus::new();
        let events = bus.subscribe(None);
        let ctx = AppContext {
            engine: Arc::clone(&engine) as Arc<dyn TransferEngine>,
            renderer: Arc::clone(&renderer) as Arc<dyn StatusRenderer>,
            completion: Arc::clone(&completion) as Arc<dyn CompletionHandler>,
            store: store.clone(),
            events: bus,
            metrics: metrics.clone(),
            policy,
        };
        Self {
            queue: DownloadQueue::new(ctx),
            dir,
            engine,
            renderer,
            completion,
            store,
            metrics,
            events,
        }
    }

    fn request(&self, owner: i64, name: &str) -> DownloadRequest {
        DownloadRequest {
            owner: OwnerId(owner),
            source: JobSource::magnet(uri(name)),
            save_path: self.dir.path().join("downloads").join(owner.to_string()),
            display: DisplayMetadata::titled(name),
        }
    }

    fn season(&self, owner: i64, names: &[&str]) -> Vec<DownloadRequest> {
        names.iter().map(|name| self.request(owner, name)).collect()
    }

    fn enqueue(&self, owner: i64, name: &str) -> JobId {
        self.queue
            .enqueue(self.request(owner, name))
            .expect("enqueue accepted")
            .job_id
    }

    async fn next_event(&mut self, matches: impl Fn(&Event) -> bool) -> Event {
        tokio::time::timeout(EVENT_WAIT, async {
            loop {
                let envelope = self.events.next().await.expect("event stream open");
                if matches(&envelope.event) {
                    return envelope.event;
                }
            }
        })
        .await
        .expect("expected event was published")
    }
}

/// Let spawned supervisors run without crossing a poll boundary.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test(start_paused = true)]
async fn idle_owner_starts_immediately_at_position_one() {
    let mut h = Harness::new();
    let receipt = h.queue.enqueue(h.request(100, "alpha")).expect("enqueue");
    assert_eq!(receipt.position, 1);
    assert_eq!(
        h.queue.active_job(OwnerId(100)).map(|job| job.id),
        Some(receipt.job_id)
    );
    assert!(h.queue.queued_jobs(OwnerId(100)).is_empty());

    let started = h.next_event(kind_for("job_started", receipt.job_id)).await;
    assert!(matches!(started, Event::JobStarted { resumed: false, .. }));
    h.next_event(kind_for("metadata_ready", receipt.job_id)).await;
    settle().await;
    let texts = h.renderer.texts_for(receipt.job_id);
    assert_eq!(texts[0], "Starting download: alpha");
    assert!(texts[1].starts_with("Downloading: alpha\nProgress: 50.0%"));
}

#[tokio::test(start_paused = true)]
async fn busy_owner_queues_behind_running_job() {
    let h = Harness::new();
    let first = h.enqueue(100, "alpha");
    let second = h.queue.enqueue(h.request(100, "beta")).expect("enqueue");
    let third = h.queue.enqueue(h.request(100, "gamma")).expect("enqueue");
    assert_eq!(second.position, 2);
    assert_eq!(third.position, 3);
    assert_eq!(
        h.queue.active_job(OwnerId(100)).map(|job| job.id),
        Some(first)
    );
    let waiting: Vec<JobId> = h
        .queue
        .queued_jobs(OwnerId(100))
        .iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(waiting, vec![second.job_id, third.job_id]);

    let other = h.queue.enqueue(h.request(200, "delta")).expect("enqueue");
    assert_eq!(other.position, 1);

    let saved = h.store.load();
    assert_eq!(saved, h.queue.snapshot());
    assert_eq!(saved.download_queues[&OwnerId(100)].len(), 2);
    assert_eq!(saved.active_downloads[&OwnerId(200)].id, other.job_id);
}

#[tokio::test(start_paused = true)]
async fn paused_job_yields_its_slot_to_new_work() {
    let mut h = Harness::new();
    let paused = h.enqueue(100, "alpha");
    h.next_event(kind_for("metadata_ready", paused)).await;
    h.queue.request_pause(OwnerId(100)).expect("pause");
    h.next_event(kind_for("job_paused", paused)).await;

    let next = h.queue.enqueue(h.request(100, "beta")).expect("enqueue");
    assert_eq!(next.position, 1);
    assert!(
        h.queue
            .active_job(OwnerId(100))
            .is_some_and(|job| job.status.is_requeued())
    );

    let requeued = h.next_event(kind_for("job_requeued", paused)).await;
    assert!(matches!(requeued, Event::JobRequeued { reason, .. } if reason == "pause_preempt"));
    h.next_event(kind_for("job_started", next.job_id)).await;
    assert_eq!(
        h.queue.active_job(OwnerId(100)).map(|job| job.id),
        Some(next.job_id)
    );
    let waiting = h.queue.queued_jobs(OwnerId(100));
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].id, paused);
    assert_eq!(
        waiting[0].status,
        DownloadStatus::Queued {
            paused: true,
            after_timeout: false
        }
    );
    let first_handle = h.engine.handle_for(&uri("alpha"));
    assert_eq!(
        h.engine.removals_for(first_handle),
        vec![RemoveTransfer { with_data: false }]
    );

    // The preempted job comes back paused once the slot frees up again.
    h.queue
        .request_cancel(OwnerId(100), CancelStep::Confirm)
        .expect("cancel");
    h.next_event(kind_for("job_started", paused)).await;
    h.next_event(kind_for("job_paused", paused)).await;
    let handles = h.engine.handles_for(&uri("alpha"));
    assert_eq!(handles.len(), 2);
    assert!(h.engine.log().pauses.contains(&handles[1]));
    assert_eq!(h.engine.max_live(), 1);
}

#[tokio::test(start_paused = true)]
async fn lone_metadata_timeout_waits_out_the_cooldown() {
    let mut h = Harness::new();
    h.engine.script(&uri("slow"), Script::NoMetadata);
    let enqueued_at = Instant::now();
    let job = h.enqueue(100, "slow");

    let requeued = h.next_event(kind_for("job_requeued", job)).await;
    assert!(matches!(requeued, Event::JobRequeued { reason, .. } if reason == "metadata_timeout"));
    let requeued_at = Instant::now();
    assert!(requeued_at.duration_since(enqueued_at) >= Duration::from_secs(30));
    settle().await;
    assert!(h.queue.active_job(OwnerId(100)).is_none());
    let waiting = h.queue.queued_jobs(OwnerId(100));
    assert_eq!(
        waiting[0].status,
        DownloadStatus::Queued {
            paused: false,
            after_timeout: true
        }
    );
    assert_eq!(
        h.renderer.last_for(job).as_deref(),
        Some("No metadata yet; moved back to the queue to retry.")
    );

    h.next_event(kind_for("job_started", job)).await;
    let waited = requeued_at.elapsed();
    assert!(waited >= Duration::from_secs(60), "retried after {waited:?}");
    assert!(waited < Duration::from_secs(61), "retried after {waited:?}");
    let first = h.engine.handles_for(&uri("slow"))[0];
    assert_eq!(
        h.engine.removals_for(first),
        vec![RemoveTransfer { with_data: false }]
    );
    assert_eq!(h.metrics.requeues("metadata_timeout"), 1);
}

#[tokio::test(start_paused = true)]
async fn metadata_timeout_with_waiting_work_requeues_paused_at_once() {
    let mut h = Harness::new();
    h.engine.script(&uri("slow"), Script::NoMetadata);
    let slow = h.enqueue(100, "slow");
    let next = h.enqueue(100, "beta");

    h.next_event(kind_for("job_requeued", slow)).await;
    let requeued_at = Instant::now();
    h.next_event(kind_for("job_started", next)).await;
    assert!(requeued_at.elapsed() < Duration::from_secs(1));
    let waiting = h.queue.queued_jobs(OwnerId(100));
    assert_eq!(waiting.len(), 1);
    assert_eq!(
        waiting[0].status,
        DownloadStatus::Queued {
            paused: true,
            after_timeout: true
        }
    );
}

#[tokio::test(start_paused = true)]
async fn paused_time_does_not_count_toward_the_metadata_timeout() {
    let mut h = Harness::new();
    h.engine.script(&uri("slow"), Script::NoMetadata);
    let job = h.enqueue(100, "slow");
    tokio::time::sleep(Duration::from_secs(20)).await;
    h.queue.request_pause(OwnerId(100)).expect("pause");
    tokio::time::sleep(Duration::from_secs(60)).await;
    h.queue.request_resume(OwnerId(100)).expect("resume");
    let resumed_at = Instant::now();

    h.next_event(kind_for("job_requeued", job)).await;
    assert!(resumed_at.elapsed() >= Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn shutdown_keeps_data_while_owner_cancel_deletes_it() {
    let mut h = Harness::new();
    let cancelled = h.enqueue(100, "alpha");
    let preserved = h.enqueue(200, "beta");
    tokio::time::sleep(Duration::from_secs(2)).await;

    h.queue
        .request_cancel(OwnerId(100), CancelStep::Prompt)
        .expect("prompt");
    h.queue
        .request_cancel(OwnerId(100), CancelStep::Confirm)
        .expect("confirm");
    h.next_event(kind_for("job_cancelled", cancelled)).await;
    h.queue.drain_on_shutdown().await;

    assert_eq!(
        h.engine.removals_for(h.engine.handle_for(&uri("alpha"))),
        vec![RemoveTransfer { with_data: true }]
    );
    assert_eq!(
        h.engine.removals_for(h.engine.handle_for(&uri("beta"))),
        vec![RemoveTransfer { with_data: false }]
    );
    assert_eq!(
        h.renderer.last_for(cancelled).as_deref(),
        Some(CANCELLED_MESSAGE)
    );
    assert_eq!(h.metrics.finished("cancelled"), 1);

    let saved = h.store.load();
    assert!(!saved.active_downloads.contains_key(&OwnerId(100)));
    let kept = &saved.active_downloads[&OwnerId(200)];
    assert_eq!(kept.id, preserved);
    assert_eq!(
        kept.status,
        DownloadStatus::Requeuing {
            reason: RequeueReason::Shutdown { paused: false }
        }
    );
}

#[tokio::test(start_paused = true)]
async fn completion_runs_the_callback_then_starts_the_next_job() {
    let mut h = Harness::new();
    h.engine.script(&uri("alpha"), Script::CompleteAfter(2));
    let done = h.enqueue(100, "alpha");
    let next = h.enqueue(100, "beta");

    h.next_event(kind_for("job_completed", done)).await;
    h.next_event(kind_for("job_started", next)).await;
    settle().await;

    let calls = h
        .completion
        .calls
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, done);
    assert_eq!(calls[0].1.name, "payload");
    assert_eq!(calls[0].1.files.len(), 1);
    assert_eq!(calls[0].1.batch, None);
    assert_eq!(h.renderer.last_for(done).as_deref(), Some("Done: payload"));
    assert_eq!(
        h.engine.removals_for(h.engine.handle_for(&uri("alpha"))),
        vec![RemoveTransfer { with_data: true }]
    );
    assert_eq!(h.metrics.finished("completed"), 1);
    assert_eq!(h.engine.max_live(), 1);
}

#[tokio::test(start_paused = true)]
async fn engine_errors_fail_the_job_with_a_generic_message() {
    let mut h = Harness::new();
    h.engine.script(&uri("broken"), Script::FailOnPoll);
    let job = h.enqueue(100, "broken");

    let failed = h.next_event(kind_for("job_failed", job)).await;
    assert!(
        matches!(failed, Event::JobFailed { message, .. } if message.contains("tracker unreachable"))
    );
    settle().await;
    assert_eq!(h.renderer.last_for(job).as_deref(), Some(FAILURE_MESSAGE));
    assert!(h.queue.active_job(OwnerId(100)).is_none());
    assert_eq!(
        h.engine.removals_for(h.engine.handle_for(&uri("broken"))),
        vec![RemoveTransfer { with_data: true }]
    );
    assert_eq!(h.metrics.finished("failed"), 1);
}

#[tokio::test(start_paused = true)]
async fn restored_state_resumes_running_jobs_outside_the_queue() {
    let mut h = Harness::new();
    let mut running = DownloadJob::from_request(h.request(100, "alpha"));
    running.status = DownloadStatus::Paused { confirming: true };
    let waiting = DownloadJob::from_request(h.request(100, "beta"));
    let orphan = DownloadJob::from_request(h.request(300, "gamma"));
    let snapshot = PersistedSnapshot {
        active_downloads: BTreeMap::from([(OwnerId(100), running.clone())]),
        download_queues: BTreeMap::from([
            (OwnerId(100), vec![waiting.clone()]),
            (OwnerId(300), vec![orphan.clone()]),
        ]),
        batches: BTreeMap::new(),
    };

    assert_eq!(h.queue.resume_on_start(snapshot), 1);
    let started = h.next_event(kind_for("job_started", running.id)).await;
    assert!(matches!(started, Event::JobStarted { resumed: true, .. }));
    h.next_event(kind_for("job_started", orphan.id)).await;
    h.next_event(kind_for("job_paused", running.id)).await;
    settle().await;

    let active = h.queue.active_job(OwnerId(100)).expect("running job restored");
    assert_eq!(active.id, running.id);
    assert!(active.status.is_paused());
    assert!(!active.status.cancellation_pending());
    assert_eq!(
        h.queue
            .queued_jobs(OwnerId(100))
            .iter()
            .map(|job| job.id)
            .collect::<Vec<_>>(),
        vec![waiting.id]
    );
    assert_eq!(
        h.queue.active_job(OwnerId(300)).map(|job| job.id),
        Some(orphan.id)
    );
    let restored = h.engine.handle_for(&uri("alpha"));
    assert!(h.engine.log().pauses.contains(&restored));
    // Resumed jobs skip the start acknowledgement.
    assert!(
        !h.renderer
            .texts_for(running.id)
            .iter()
            .any(|text| text.starts_with("Starting download"))
    );
}

#[tokio::test(start_paused = true)]
async fn cancel_prompt_holds_progress_until_answered() {
    let mut h = Harness::new();
    let job = h.enqueue(100, "alpha");
    h.next_event(kind_for("metadata_ready", job)).await;
    settle().await;

    h.queue
        .request_cancel(OwnerId(100), CancelStep::Prompt)
        .expect("prompt");
    assert!(
        h.queue
            .active_job(OwnerId(100))
            .is_some_and(|job| job.status.cancellation_pending())
    );
    let before = h.renderer.progress_for(job).len();
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(h.renderer.progress_for(job).len(), before);

    h.queue
        .request_cancel(OwnerId(100), CancelStep::Deny)
        .expect("deny");
    settle().await;
    let after = h.renderer.progress_for(job);
    assert_eq!(after.len(), before + 1);
    assert!(after[before].starts_with("Downloading: alpha"));
    assert!(
        h.queue
            .active_job(OwnerId(100))
            .is_some_and(|job| job.status.is_running() && !job.status.cancellation_pending())
    );
}

#[tokio::test(start_paused = true)]
async fn progress_is_throttled_but_pause_and_resume_render_at_once() {
    let mut h = Harness::new();
    let job = h.enqueue(100, "alpha");
    h.next_event(kind_for("metadata_ready", job)).await;
    tokio::time::sleep(Duration::from_millis(12_500)).await;
    assert_eq!(h.renderer.progress_for(job).len(), 3);

    h.queue.request_pause(OwnerId(100)).expect("pause");
    h.next_event(kind_for("job_paused", job)).await;
    settle().await;
    let renders = h.renderer.progress_for(job);
    assert_eq!(renders.len(), 4);
    assert!(renders[3].starts_with("Paused: alpha"));
    assert!(renders[3].contains("Speed: 0.00 MB/s"));

    h.queue.request_resume(OwnerId(100)).expect("resume");
    h.next_event(kind_for("job_resumed", job)).await;
    settle().await;
    let renders = h.renderer.progress_for(job);
    assert_eq!(renders.len(), 5);
    assert!(renders[4].starts_with("Downloading: alpha"));
    let handle = h.engine.handle_for(&uri("alpha"));
    assert_eq!(h.engine.log().pauses, vec![handle]);
    assert_eq!(h.engine.log().resumes, vec![handle]);
}

#[tokio::test(start_paused = true)]
async fn commands_need_a_running_job_and_draining_refuses_new_work() {
    let h = Harness::new();
    assert!(matches!(
        h.queue.request_pause(OwnerId(9)),
        Err(CommandError::NoActiveDownload { owner: OwnerId(9) })
    ));
    assert!(matches!(
        h.queue.request_cancel_all(OwnerId(9), CancelStep::Prompt),
        Err(CommandError::NoActiveDownload { .. })
    ));

    h.queue.drain_on_shutdown().await;
    assert!(matches!(
        h.queue.enqueue(h.request(9, "late")),
        Err(CommandError::ShuttingDown)
    ));
    assert!(matches!(
        h.queue.request_resume(OwnerId(9)),
        Err(CommandError::ShuttingDown)
    ));
}

#[tokio::test(start_paused = true)]
async fn cancel_all_discards_waiting_jobs_and_cancels_the_running_one() {
    let mut h = Harness::new();
    let running = h.enqueue(100, "alpha");
    h.enqueue(100, "beta");
    h.enqueue(100, "gamma");
    h.next_event(kind_for("metadata_ready", running)).await;

    let removed = h
        .queue
        .request_cancel_all(OwnerId(100), CancelStep::Prompt)
        .expect("prompt");
    assert_eq!(removed, 0);
    assert_eq!(h.queue.queued_jobs(OwnerId(100)).len(), 2);

    let removed = h
        .queue
        .request_cancel_all(OwnerId(100), CancelStep::Confirm)
        .expect("confirm");
    assert_eq!(removed, 2);
    let cleared = h
        .next_event(|event| matches!(event, Event::QueueCleared { owner: 100, .. }))
        .await;
    assert!(matches!(cleared, Event::QueueCleared { removed: 2, .. }));
    h.next_event(kind_for("job_cancelled", running)).await;
    settle().await;

    assert!(h.queue.active_job(OwnerId(100)).is_none());
    assert!(h.queue.queued_jobs(OwnerId(100)).is_empty());
    assert_eq!(h.engine.log().adds.len(), 1);
    assert!(h.store.load().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_state_writes_degrade_health_until_a_write_succeeds() {
    let dir = TempDir::new().expect("tempdir");
    let blocker = dir.path().join("state");
    fs::write(&blocker, b"not a directory").expect("blocker file");
    let store = StateStore::new(blocker.join("persistence.json"));
    let mut h = Harness::with_store(dir, store);

    h.enqueue(100, "alpha");
    let degraded = h
        .next_event(|event| matches!(event, Event::HealthChanged { .. }))
        .await;
    assert_eq!(
        degraded,
        Event::HealthChanged {
            degraded: vec!["persistence".to_string()]
        }
    );
    assert!(h.metrics.snapshot().persistence_failures_total >= 1);
    assert!(h.queue.active_job(OwnerId(100)).is_some());

    fs::remove_file(&blocker).expect("remove blocker");
    h.queue.request_pause(OwnerId(100)).expect("pause");
    let recovered = h
        .next_event(|event| matches!(event, Event::HealthChanged { .. }))
        .await;
    assert_eq!(recovered, Event::HealthChanged { degraded: vec![] });
    assert_eq!(h.store.load().active_downloads.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn restored_queue_entries_keep_their_order() {
    let h = Harness::new();
    let jobs: VecDeque<DownloadJob> = ["alpha", "beta", "gamma"]
        .into_iter()
        .map(|name| DownloadJob::from_request(h.request(100, name)))
        .collect();
    let expected: Vec<JobId> = jobs.iter().map(|job| job.id).collect();
    let queues = BTreeMap::from([(OwnerId(100), jobs)]);
    let stale = BTreeMap::from([(BatchId::new(), BatchTally { total: 2, done: 2 })]);
    let snapshot = PersistedSnapshot::capture(std::iter::empty::<&DownloadJob>(), &queues)
        .with_batches(&stale);

    assert_eq!(h.queue.resume_on_start(snapshot), 0);
    assert!(h.queue.snapshot().batches.is_empty());
    assert_eq!(
        h.queue.active_job(OwnerId(100)).map(|job| job.id),
        Some(expected[0])
    );
    let waiting: Vec<JobId> = h
        .queue
        .queued_jobs(OwnerId(100))
        .iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(waiting, expected[1..].to_vec());
}

#[tokio::test(start_paused = true)]
async fn slow_renders_never_hold_up_polling_or_commands() {
    let renderer = RecordingRenderer::slow(Duration::from_secs(9));
    let mut h = Harness::with_renderer(renderer, |policy| policy.render_timeout_secs = 10);
    let job = h.enqueue(100, "alpha");
    h.next_event(kind_for("metadata_ready", job)).await;
    let handle = h.engine.handle_for(&uri("alpha"));

    let polls_before = h.engine.polls(handle);
    tokio::time::sleep(Duration::from_secs(30)).await;
    let polled = h.engine.polls(handle) - polls_before;
    assert!(polled >= 29, "polled {polled} times in 30s");

    let asked = Instant::now();
    h.queue.request_pause(OwnerId(100)).expect("pause");
    assert_eq!(asked.elapsed(), Duration::ZERO);
    h.next_event(kind_for("job_paused", job)).await;
    assert!(asked.elapsed() < Duration::from_secs(1));
    assert!(h.engine.log().pauses.contains(&handle));
    assert!(!h.renderer.texts_for(job).is_empty());
}

#[tokio::test(start_paused = true)]
async fn interrupted_jobs_remove_transfers_as_their_state_records() {
    let mut h = Harness::new();
    let cancelled = h.enqueue(100, "alpha");
    let preempted = h.enqueue(200, "beta");
    h.engine.script(&uri("gamma"), Script::NoMetadata);
    let timed_out = h.enqueue(300, "gamma");
    h.enqueue(400, "delta");

    h.next_event(kind_for("metadata_ready", preempted)).await;
    h.queue.request_pause(OwnerId(200)).expect("pause");
    h.next_event(kind_for("job_paused", preempted)).await;
    h.enqueue(200, "epsilon");
    h.queue
        .request_cancel(OwnerId(100), CancelStep::Confirm)
        .expect("cancel");
    h.next_event(kind_for("job_cancelled", cancelled)).await;
    h.next_event(kind_for("job_requeued", timed_out)).await;
    h.queue.drain_on_shutdown().await;

    let owed = |status: DownloadStatus| {
        vec![
            status
                .pending_removal()
                .expect("interrupted states owe a removal"),
        ]
    };
    assert_eq!(
        h.engine.removals_for(h.engine.handle_for(&uri("alpha"))),
        owed(DownloadStatus::Cancelling)
    );
    assert_eq!(
        h.engine.removals_for(h.engine.handle_for(&uri("beta"))),
        owed(DownloadStatus::Requeuing {
            reason: RequeueReason::PausePreempt
        })
    );
    assert_eq!(
        h.engine.removals_for(h.engine.handles_for(&uri("gamma"))[0]),
        owed(DownloadStatus::Requeuing {
            reason: RequeueReason::MetadataTimeout
        })
    );
    assert_eq!(
        h.engine.removals_for(h.engine.handle_for(&uri("delta"))),
        owed(DownloadStatus::Requeuing {
            reason: RequeueReason::Shutdown { paused: false }
        })
    );
    assert_eq!(
        h.engine.removals_for(h.engine.handle_for(&uri("alpha"))),
        vec![RemoveTransfer { with_data: true }]
    );
    assert_eq!(
        h.engine.removals_for(h.engine.handle_for(&uri("delta"))),
        vec![RemoveTransfer { with_data: false }]
    );
}

#[tokio::test(start_paused = true)]
async fn start_message_offers_cancel_all_only_with_waiting_jobs() {
    let h = Harness::new();
    let lone = h.enqueue(200, "solo");
    let first = h.enqueue(100, "alpha");
    h.enqueue(100, "beta");
    settle().await;

    let lone_start = &h.renderer.statuses_for(lone)[0];
    assert_eq!(lone_start.text, "Starting download: solo");
    assert_eq!(lone_start.actions, vec![StatusAction::Cancel]);
    let busy_start = &h.renderer.statuses_for(first)[0];
    assert_eq!(busy_start.text, "Starting download: alpha");
    assert_eq!(
        busy_start.actions,
        vec![StatusAction::Cancel, StatusAction::CancelAll]
    );
}

#[tokio::test(start_paused = true)]
async fn restored_lone_timeout_retry_waits_out_the_cooldown() {
    let mut h = Harness::new();
    let mut retry = DownloadJob::from_request(h.request(100, "slow"));
    retry.status = DownloadStatus::Queued {
        paused: false,
        after_timeout: true,
    };
    let mut parked = DownloadJob::from_request(h.request(200, "parked"));
    parked.status = DownloadStatus::Queued {
        paused: true,
        after_timeout: true,
    };
    let fresh = DownloadJob::from_request(h.request(300, "fresh"));
    let snapshot = PersistedSnapshot {
        active_downloads: BTreeMap::new(),
        download_queues: BTreeMap::from([
            (OwnerId(100), vec![retry.clone()]),
            (OwnerId(200), vec![parked.clone()]),
            (OwnerId(300), vec![fresh.clone()]),
        ]),
        batches: BTreeMap::new(),
    };

    let restored_at = Instant::now();
    assert_eq!(h.queue.resume_on_start(snapshot), 0);
    assert!(h.queue.active_job(OwnerId(100)).is_none());
    assert_eq!(h.queue.queued_jobs(OwnerId(100))[0].id, retry.id);
    assert_eq!(
        h.queue.active_job(OwnerId(200)).map(|job| job.id),
        Some(parked.id)
    );
    assert_eq!(
        h.queue.active_job(OwnerId(300)).map(|job| job.id),
        Some(fresh.id)
    );

    h.next_event(kind_for("job_started", retry.id)).await;
    let waited = restored_at.elapsed();
    assert!(waited >= Duration::from_secs(60), "retried after {waited:?}");
    assert!(waited < Duration::from_secs(61), "retried after {waited:?}");
}

#[tokio::test(start_paused = true)]
async fn season_batch_queues_in_order_behind_one_preemption() {
    let mut h = Harness::new();
    let movie = h.enqueue(100, "movie");
    h.next_event(kind_for("metadata_ready", movie)).await;
    h.queue.request_pause(OwnerId(100)).expect("pause");
    h.next_event(kind_for("job_paused", movie)).await;

    let receipt = h
        .queue
        .enqueue_batch(OwnerId(100), h.season(100, &["e01", "e02", "e03"]))
        .expect("batch accepted");
    assert_eq!(receipt.job_ids.len(), 3);
    assert_eq!(receipt.first_position, 1);
    for (index, job) in receipt.job_ids.iter().enumerate() {
        let queued = h.next_event(kind_for("job_queued", *job)).await;
        assert!(matches!(queued, Event::JobQueued { position, .. } if position == index + 1));
    }
    assert_eq!(
        h.store.load().batches[&receipt.batch_id],
        BatchTally { total: 3, done: 0 }
    );

    h.next_event(kind_for("job_started", receipt.job_ids[0])).await;
    let waiting = h.queue.queued_jobs(OwnerId(100));
    let order: Vec<JobId> = waiting.iter().map(|job| job.id).collect();
    assert_eq!(order, vec![receipt.job_ids[1], receipt.job_ids[2], movie]);
    assert!(
        waiting[..2]
            .iter()
            .all(|job| job.batch == Some(receipt.batch_id))
    );
    assert_eq!(waiting[2].batch, None);
    assert_eq!(h.metrics.requeues("pause_preempt"), 1);

    assert!(matches!(
        h.queue.enqueue_batch(OwnerId(100), Vec::new()),
        Err(CommandError::EmptyBatch { owner: OwnerId(100) })
    ));
}

#[tokio::test(start_paused = true)]
async fn batch_completions_count_up_and_flag_the_last_episode() {
    let mut h = Harness::new();
    let names = ["e01", "e02", "e03"];
    for name in names {
        h.engine.script(&uri(name), Script::CompleteAfter(1));
    }
    let receipt = h
        .queue
        .enqueue_batch(OwnerId(100), h.season(100, &names))
        .expect("batch accepted");

    let finished = h
        .next_event(|event| matches!(event, Event::BatchCompleted { .. }))
        .await;
    assert_eq!(
        finished,
        Event::BatchCompleted {
            owner: 100,
            batch_id: receipt.batch_id.0,
            done: 3,
            total: 3,
        }
    );
    h.next_event(kind_for("job_completed", receipt.job_ids[2])).await;
    settle().await;

    let progress: Vec<(usize, usize, bool)> = h
        .completion
        .calls
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(|(_, outcome)| outcome.batch.expect("batch job"))
        .map(|batch| (batch.done, batch.total, batch.last))
        .collect();
    assert_eq!(progress, vec![(1, 3, false), (2, 3, false), (3, 3, true)]);
    assert!(h.store.load().batches.is_empty());
    assert!(h.store.load().is_empty());
}
