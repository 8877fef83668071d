//! Collaborators shared by the queue and every supervisor task.

use std::sync::Arc;

use spool_config::DownloadPolicy;
use spool_core::{CompletionHandler, StatusRenderer, TransferEngine};
use spool_events::EventBus;
use spool_runtime::StateStore;
use spool_telemetry::Metrics;

/// Everything a running spool needs, constructed once at process start.
///
/// The context is handed to [`DownloadQueue::new`](crate::DownloadQueue::new);
/// the queue then owns the construct, run and drain lifecycle.
#[derive(Clone)]
pub struct AppContext {
    /// Engine session shared by every running job.
    pub engine: Arc<dyn TransferEngine>,
    /// Outbound status message callback.
    pub renderer: Arc<dyn StatusRenderer>,
    /// Outbound post-processing callback for finished transfers.
    pub completion: Arc<dyn CompletionHandler>,
    /// Persisted snapshot location.
    pub store: StateStore,
    /// Lifecycle event bus.
    pub events: EventBus,
    /// Prometheus collectors.
    pub metrics: Metrics,
    /// Timing policy.
    pub policy: DownloadPolicy,
}
