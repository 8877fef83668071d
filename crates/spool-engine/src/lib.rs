#![forbid(unsafe_code)]
#![warn(
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    missing_docs
)]

//! Transfer engine adapter.
//!
//! A single background worker owns the session; the cloneable
//! [`SessionEngine`] handle forwards requests over a bounded channel and
//! awaits the reply, so every caller sees session operations serialized.

mod command;
/// Error types raised by the adapter and session.
pub mod error;
/// Session abstraction and the in-process implementation.
pub mod session;
mod worker;

pub use error::{EngineError, EngineResult};
pub use session::SimulationProfile;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use command::{EngineCommand, Responder};
use spool_core::{
    JobSource, RemoveTransfer, TransferEngine, TransferFile, TransferHandle, TransferStatus,
};
use tokio::sync::{mpsc, oneshot};

const COMMAND_BUFFER: usize = 128;
const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Cloneable handle to the session worker.
#[derive(Clone, Debug)]
pub struct SessionEngine {
    commands: mpsc::Sender<EngineCommand>,
}

impl SessionEngine {
    /// Spawn a worker driving an in-process session paced by `profile`.
    ///
    /// Must be called from within a Tokio runtime. The worker stops once the
    /// last handle is dropped.
    #[must_use]
    pub fn simulated(profile: SimulationProfile) -> Self {
        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
        worker::spawn(rx, session::create_session(profile), TICK_INTERVAL);
        Self { commands }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Responder<T>) -> EngineCommand,
    ) -> EngineResult<T> {
        let (respond_to, reply) = oneshot::channel();
        let command = build(respond_to);
        let operation = command.operation();
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::WorkerUnavailable { operation })?;
        reply
            .await
            .map_err(|_| EngineError::WorkerUnavailable { operation })?
    }
}

#[async_trait]
impl TransferEngine for SessionEngine {
    async fn add_transfer(
        &self,
        source: &JobSource,
        save_path: &Path,
    ) -> anyhow::Result<TransferHandle> {
        let handle = TransferHandle::new();
        self.request(|respond_to| EngineCommand::Add {
            handle,
            source: source.clone(),
            save_path: save_path.to_path_buf(),
            respond_to,
        })
        .await?;
        Ok(handle)
    }

    async fn status(&self, handle: TransferHandle) -> anyhow::Result<TransferStatus> {
        Ok(self
            .request(|respond_to| EngineCommand::Status { handle, respond_to })
            .await?)
    }

    async fn remove_transfer(
        &self,
        handle: TransferHandle,
        options: RemoveTransfer,
    ) -> anyhow::Result<()> {
        Ok(self
            .request(|respond_to| EngineCommand::Remove {
                handle,
                options,
                respond_to,
            })
            .await?)
    }

    async fn pause(&self, handle: TransferHandle) -> anyhow::Result<()> {
        Ok(self
            .request(|respond_to| EngineCommand::Pause { handle, respond_to })
            .await?)
    }

    async fn resume(&self, handle: TransferHandle) -> anyhow::Result<()> {
        Ok(self
            .request(|respond_to| EngineCommand::Resume { handle, respond_to })
            .await?)
    }

    async fn files(&self, handle: TransferHandle) -> anyhow::Result<Vec<TransferFile>> {
        Ok(self
            .request(|respond_to| EngineCommand::Files { handle, respond_to })
            .await?)
    }
}
