//! Status message rendering for running jobs.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use spool_config::DownloadPolicy;
use spool_core::{
    DisplayMetadata, RenderedStatus, StatusAction, StatusRenderer, TransferStatus,
};
use spool_telemetry::Metrics;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, Span, debug, warn};

use crate::slot::JobCell;

const BYTES_PER_MEGABYTE: f64 = 1_000_000.0;
const NOTE_BUFFER: usize = 8;

/// One-off message; `last` closes the job's message stream.
struct Note {
    status: RenderedStatus,
    last: bool,
}

/// Throttled renderer bound to one supervisor task.
///
/// The supervisor only queues messages. A per-job render task delivers them,
/// so a slow renderer never delays polling or owner commands. Progress keeps
/// only the latest message; announcements are delivered in order and always
/// ahead of pending progress.
pub(crate) struct ProgressReporter {
    notes: mpsc::Sender<Note>,
    latest: watch::Sender<Option<RenderedStatus>>,
    worker: JoinHandle<()>,
    throttle: Duration,
    last_render: Option<Instant>,
    suppressed: bool,
}

impl ProgressReporter {
    pub(crate) fn spawn(
        cell: Arc<JobCell>,
        renderer: Arc<dyn StatusRenderer>,
        metrics: Metrics,
        policy: &DownloadPolicy,
    ) -> Self {
        let (notes, note_rx) = mpsc::channel(NOTE_BUFFER);
        let (latest, latest_rx) = watch::channel(None);
        let worker = RenderWorker {
            cell,
            renderer,
            metrics,
            render_timeout: policy.render_timeout(),
            notes: note_rx,
            latest: latest_rx,
        };
        let worker = tokio::spawn(worker.run().instrument(Span::current()));
        Self {
            notes,
            latest,
            worker,
            throttle: policy.progress_throttle(),
            last_render: None,
            suppressed: false,
        }
    }

    /// Queue a progress render unless a cancel prompt is open or the throttle
    /// window has not passed. `force` skips the throttle for pause and resume.
    ///
    /// The first report after a prompt is dismissed is always forced so the
    /// owner gets the progress message back immediately.
    pub(crate) fn report(
        &mut self,
        cell: &JobCell,
        transfer: &TransferStatus,
        force: bool,
    ) -> bool {
        let rendered = cell.update(|job| {
            (!job.status.cancellation_pending())
                .then(|| render_progress(&job.display, transfer, job.status.is_paused()))
        });
        let Some(rendered) = rendered else {
            self.suppressed = true;
            return false;
        };
        let force = force || std::mem::take(&mut self.suppressed);
        let now = Instant::now();
        if !force
            && self
                .last_render
                .is_some_and(|at| now.saturating_duration_since(at) < self.throttle)
        {
            return false;
        }
        self.last_render = Some(now);
        self.latest.send_replace(Some(rendered));
        true
    }

    /// Queue a one-off message regardless of throttle or prompts.
    pub(crate) fn announce(&self, rendered: RenderedStatus) -> bool {
        self.note(rendered, false)
    }

    /// Queue the job's final message; nothing is rendered after it.
    pub(crate) fn conclude(&self, rendered: RenderedStatus) -> bool {
        self.note(rendered, true)
    }

    fn note(&self, status: RenderedStatus, last: bool) -> bool {
        match self.notes.try_send(Note { status, last }) {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "status message dropped");
                false
            }
        }
    }

    /// Wait for queued messages to be delivered, each within the render
    /// timeout.
    pub(crate) async fn close(self) {
        let Self {
            notes,
            latest,
            worker,
            ..
        } = self;
        drop(notes);
        drop(latest);
        if let Err(err) = worker.await {
            warn!(error = %err, "render task ended abnormally");
        }
    }
}

struct RenderWorker {
    cell: Arc<JobCell>,
    renderer: Arc<dyn StatusRenderer>,
    metrics: Metrics,
    render_timeout: Duration,
    notes: mpsc::Receiver<Note>,
    latest: watch::Receiver<Option<RenderedStatus>>,
}

impl RenderWorker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                note = self.notes.recv() => {
                    let Some(note) = note else { break };
                    self.deliver(&note.status).await;
                    if note.last {
                        break;
                    }
                }
                changed = self.latest.changed() => {
                    if changed.is_err() {
                        self.drain().await;
                        break;
                    }
                    let pending = self.latest.borrow_and_update().clone();
                    let Some(rendered) = pending else { continue };
                    // A prompt may have opened since the progress was queued.
                    if !self.cell.status().cancellation_pending() {
                        self.deliver(&rendered).await;
                    }
                }
            }
        }
    }

    async fn drain(&mut self) {
        while let Some(note) = self.notes.recv().await {
            self.deliver(&note.status).await;
            if note.last {
                break;
            }
        }
    }

    async fn deliver(&self, rendered: &RenderedStatus) {
        let (owner, job) = (self.cell.owner, self.cell.id);
        match tokio::time::timeout(
            self.render_timeout,
            self.renderer.render(owner, job, rendered),
        )
        .await
        {
            Ok(Ok(())) => debug!("status rendered"),
            Ok(Err(err)) => {
                self.metrics.inc_render_failure();
                warn!(error = %err, detail = ?err, "status render failed");
            }
            Err(_) => {
                self.metrics.inc_render_failure();
                warn!(timeout_ms = self.render_timeout.as_millis(), "status render timed out");
            }
        }
    }
}

/// Message and buttons for a running job.
#[must_use]
pub fn render_progress(
    display: &DisplayMetadata,
    transfer: &TransferStatus,
    paused: bool,
) -> RenderedStatus {
    let header = if paused { "Paused" } else { "Downloading" };
    let state = if paused {
        "Paused"
    } else {
        transfer.phase.label()
    };
    let speed = if paused {
        0.0
    } else {
        megabytes(transfer.download_bps)
    };
    let mut text = format!("{header}: {}\n", display_name(display, transfer));
    let _ = writeln!(text, "Progress: {:.1}%", transfer.percent_complete());
    let _ = writeln!(text, "State: {state}");
    let _ = writeln!(text, "Peers: {}", transfer.peers);
    let _ = write!(text, "Speed: {speed:.2} MB/s");

    let toggle = if paused {
        StatusAction::Resume
    } else {
        StatusAction::Pause
    };
    RenderedStatus {
        text,
        actions: vec![toggle, StatusAction::Cancel, StatusAction::CancelAll],
    }
}

/// Human-readable name: the title, then season and episode for TV content.
#[must_use]
pub fn display_name(display: &DisplayMetadata, transfer: &TransferStatus) -> String {
    let title = if display.title.trim().is_empty() {
        transfer.name.as_deref().unwrap_or("download")
    } else {
        display.title.as_str()
    };
    match (display.season_pack, display.season, display.episode) {
        (true, Some(season), _) => format!("{title} Season {season:02}"),
        (false, Some(season), Some(episode)) => {
            let mut name = format!("{title} S{season:02}E{episode:02}");
            if let Some(episode_title) = display.episode_title.as_deref() {
                let _ = write!(name, " - {episode_title}");
            }
            name
        }
        _ => title.to_string(),
    }
}

#[expect(
    clippy::cast_precision_loss,
    reason = "transfer rates are display-only and tolerate f64 rounding"
)]
fn megabytes(bytes_per_second: u64) -> f64 {
    bytes_per_second as f64 / BYTES_PER_MEGABYTE
}
