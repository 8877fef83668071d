#![allow(clippy::redundant_pub_crate)]

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use spool_core::{JobSource, RemoveTransfer, TransferFile, TransferHandle, TransferStatus};

use crate::error::EngineResult;

mod simulated;

pub use simulated::SimulationProfile;
pub(crate) use simulated::SimulatedSession;

/// Session owned by the worker; every call happens on the worker task.
#[async_trait]
pub(crate) trait EngineSession: Send {
    async fn add(
        &mut self,
        handle: TransferHandle,
        source: &JobSource,
        save_path: &Path,
    ) -> EngineResult<()>;
    async fn remove(&mut self, handle: TransferHandle, options: RemoveTransfer)
    -> EngineResult<()>;
    async fn pause(&mut self, handle: TransferHandle) -> EngineResult<()>;
    async fn resume(&mut self, handle: TransferHandle) -> EngineResult<()>;
    async fn status(&mut self, handle: TransferHandle) -> EngineResult<TransferStatus>;
    async fn files(&mut self, handle: TransferHandle) -> EngineResult<Vec<TransferFile>>;
    /// Move every running transfer forward by `elapsed`.
    async fn advance(&mut self, elapsed: Duration) -> EngineResult<()>;
}

pub(crate) fn create_session(profile: SimulationProfile) -> Box<dyn EngineSession> {
    Box::new(SimulatedSession::new(profile))
}
