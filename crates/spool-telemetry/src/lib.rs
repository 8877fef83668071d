#![forbid(unsafe_code)]
#![warn(
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    missing_docs
)]

//! Logging and metrics primitives for the download spool.
//!
//! Layout: `init.rs` (subscriber installation), `context.rs` (process span
//! guard), `metrics.rs` (Prometheus registry), `error.rs` (error type).

pub mod context;
pub mod error;
pub mod init;
pub mod metrics;

pub use context::GlobalContextGuard;
pub use error::{CollectorStep, ExpositionFailure, Result, TelemetryError};
pub use init::{DEFAULT_LOG_LEVEL, LogFormat, LoggingConfig, build_sha, init_logging};
pub use metrics::{Metrics, MetricsSnapshot};
