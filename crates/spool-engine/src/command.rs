use std::path::PathBuf;

use spool_core::{JobSource, RemoveTransfer, TransferFile, TransferHandle, TransferStatus};
use tokio::sync::oneshot;

use crate::error::EngineResult;

/// Reply channel carried by every command.
pub(crate) type Responder<T> = oneshot::Sender<EngineResult<T>>;

/// Requests processed sequentially by the session worker.
#[derive(Debug)]
pub(crate) enum EngineCommand {
    Add {
        handle: TransferHandle,
        source: JobSource,
        save_path: PathBuf,
        respond_to: Responder<()>,
    },
    Remove {
        handle: TransferHandle,
        options: RemoveTransfer,
        respond_to: Responder<()>,
    },
    Pause {
        handle: TransferHandle,
        respond_to: Responder<()>,
    },
    Resume {
        handle: TransferHandle,
        respond_to: Responder<()>,
    },
    Status {
        handle: TransferHandle,
        respond_to: Responder<TransferStatus>,
    },
    Files {
        handle: TransferHandle,
        respond_to: Responder<Vec<TransferFile>>,
    },
}

impl EngineCommand {
    pub(crate) const fn operation(&self) -> &'static str {
        match self {
            Self::Add { .. } => "add",
            Self::Remove { .. } => "remove",
            Self::Pause { .. } => "pause",
            Self::Resume { .. } => "resume",
            Self::Status { .. } => "status",
            Self::Files { .. } => "files",
        }
    }
}
