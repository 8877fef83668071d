#![forbid(unsafe_code)]
#![warn(
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    missing_docs
)]

//! Download spool application: per-owner queues, the job supervisor and the
//! daemon bootstrap.
//!
//! Layout: `dispatch.rs` (queues, active slots, inbound commands),
//! `supervisor.rs` (one task per running job), `progress.rs` (status
//! rendering), `bootstrap.rs` (process wiring).

/// Process wiring and the `spool` command line.
pub mod bootstrap;
/// Log-backed collaborators for the standalone daemon.
pub mod console;
/// Shared application context.
pub mod context;
/// Queue and dispatch authority.
pub mod dispatch;
/// Application error type.
pub mod error;
/// Progress message rendering.
pub mod progress;
mod slot;
/// Per-job lifecycle supervisor.
pub mod supervisor;

#[cfg(test)]
mod lifecycle_tests;

pub use bootstrap::run_app;
pub use context::AppContext;
pub use dispatch::{BatchEnqueued, CancelStep, DownloadQueue, Enqueued};
pub use error::{AppError, AppResult};
