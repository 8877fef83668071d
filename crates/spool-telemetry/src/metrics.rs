//! Prometheus-backed metrics registry and snapshot helpers.
//!
//! # Design
//! - Encapsulates collector registration to keep the public API small.
//! - Exposes only the gauges and counters the download spool reports.

use std::sync::Arc;

use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::error::{CollectorStep, ExpositionFailure, Result, TelemetryError};

/// Prometheus-backed metrics registry shared across the application.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    active_downloads: IntGauge,
    queued_downloads: IntGauge,
    requeues_total: IntCounterVec,
    downloads_finished_total: IntCounterVec,
    persistence_failures_total: IntCounter,
    render_failures_total: IntCounter,
}

/// Snapshot of selected gauges and counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Jobs currently holding an active slot.
    pub active_downloads: i64,
    /// Jobs waiting across all queues.
    pub queued_downloads: i64,
    /// Failed state file writes.
    pub persistence_failures_total: u64,
    /// Failed or timed-out status renders.
    pub render_failures_total: u64,
}

impl Metrics {
    /// Construct a registry with the standard collectors registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any collector cannot be built or registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let active_downloads = gauge("active_downloads", "Jobs holding an active slot")?;
        let queued_downloads = gauge("queued_downloads", "Jobs waiting in owner queues")?;
        let requeues_total = counter_vec(
            "requeues_total",
            "Jobs handed back to the queue by reason",
            &["reason"],
        )?;
        let downloads_finished_total = counter_vec(
            "downloads_finished_total",
            "Jobs that reached a terminal state by outcome",
            &["outcome"],
        )?;
        let persistence_failures_total =
            counter("persistence_failures_total", "Failed state file writes")?;
        let render_failures_total =
            counter("render_failures_total", "Failed or timed-out status renders")?;

        register(&registry, "active_downloads", &active_downloads)?;
        register(&registry, "queued_downloads", &queued_downloads)?;
        register(&registry, "requeues_total", &requeues_total)?;
        register(
            &registry,
            "downloads_finished_total",
            &downloads_finished_total,
        )?;
        register(
            &registry,
            "persistence_failures_total",
            &persistence_failures_total,
        )?;
        register(&registry, "render_failures_total", &render_failures_total)?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                active_downloads,
                queued_downloads,
                requeues_total,
                downloads_finished_total,
                persistence_failures_total,
                render_failures_total,
            }),
        })
    }

    /// Set the active slot gauge.
    pub fn set_active_downloads(&self, count: usize) {
        self.inner.active_downloads.set(saturating_i64(count));
    }

    /// Set the queued job gauge.
    pub fn set_queued_downloads(&self, count: usize) {
        self.inner.queued_downloads.set(saturating_i64(count));
    }

    /// Count a requeue.
    pub fn inc_requeue(&self, reason: &str) {
        self.inner.requeues_total.with_label_values(&[reason]).inc();
    }

    /// Count a terminal outcome.
    pub fn inc_finished(&self, outcome: &str) {
        self.inner
            .downloads_finished_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Count a failed state file write.
    pub fn inc_persistence_failure(&self) {
        self.inner.persistence_failures_total.inc();
    }

    /// Count a failed status render.
    pub fn inc_render_failure(&self) {
        self.inner.render_failures_total.inc();
    }

    /// Requeues recorded for `reason`.
    #[must_use]
    pub fn requeues(&self, reason: &str) -> u64 {
        self.inner.requeues_total.with_label_values(&[reason]).get()
    }

    /// Terminal outcomes recorded for `outcome`.
    #[must_use]
    pub fn finished(&self, outcome: &str) -> u64 {
        self.inner
            .downloads_finished_total
            .with_label_values(&[outcome])
            .get()
    }

    /// Render the registry using the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or produces invalid UTF-8.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|err| TelemetryError::Exposition {
                source: ExpositionFailure::Encode(err),
            })?;
        String::from_utf8(buffer).map_err(|err| TelemetryError::Exposition {
            source: ExpositionFailure::Utf8(err),
        })
    }

    /// Point-in-time snapshot of the gauges and failure counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_downloads: self.inner.active_downloads.get(),
            queued_downloads: self.inner.queued_downloads.get(),
            persistence_failures_total: self.inner.persistence_failures_total.get(),
            render_failures_total: self.inner.render_failures_total.get(),
        }
    }
}

fn gauge(name: &'static str, help: &str) -> Result<IntGauge> {
    IntGauge::with_opts(Opts::new(name, help))
        .map_err(|source| TelemetryError::Collector {
            name,
            step: CollectorStep::Build,
            source,
        })
}

fn counter(name: &'static str, help: &str) -> Result<IntCounter> {
    IntCounter::with_opts(Opts::new(name, help))
        .map_err(|source| TelemetryError::Collector {
            name,
            step: CollectorStep::Build,
            source,
        })
}

fn counter_vec(name: &'static str, help: &str, labels: &[&str]) -> Result<IntCounterVec> {
    IntCounterVec::new(Opts::new(name, help), labels)
        .map_err(|source| TelemetryError::Collector {
            name,
            step: CollectorStep::Build,
            source,
        })
}

fn register<C>(registry: &Registry, name: &'static str, collector: &C) -> Result<()>
where
    C: Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|source| TelemetryError::Collector {
            name,
            step: CollectorStep::Register,
            source,
        })
}

fn saturating_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
