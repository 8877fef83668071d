#![forbid(unsafe_code)]
#![warn(
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    missing_docs
)]

//! Engine-agnostic download lifecycle model.
//!
//! Layout: `model.rs` (job descriptors and the persisted snapshot),
//! `lifecycle.rs` (status state machine), `service.rs` (engine adapter and
//! outbound callbacks), `error.rs` (transition and command errors).

pub mod error;
pub mod lifecycle;
pub mod model;
pub mod service;

pub use error::{CommandError, CommandResult, LifecycleError, LifecycleResult};
pub use lifecycle::{DownloadStatus, RequeueReason, Signal};
pub use model::{
    BatchId, BatchTally, DisplayMetadata, DownloadJob, DownloadRequest, JobId, JobSource, OwnerId,
    PersistedSnapshot,
};
pub use service::{
    BatchProgress, CompletionHandler, RemoveTransfer, RenderedStatus, StatusAction, StatusRenderer,
    TransferEngine, TransferFile, TransferHandle, TransferOutcome, TransferPhase, TransferStatus,
};
