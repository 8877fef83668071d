use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use spool_core::{
    JobSource, RemoveTransfer, TransferFile, TransferHandle, TransferPhase, TransferStatus,
};
use tracing::{debug, info};

use super::EngineSession;
use crate::error::{EngineError, EngineResult};

const MAGNET_PREFIX: &str = "magnet:?";
const FALLBACK_NAME: &str = "transfer";

/// Pacing used by the in-process session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulationProfile {
    /// Running time before metadata resolves.
    pub metadata_delay: Duration,
    /// Payload size reported once metadata is known.
    pub payload_bytes: u64,
    /// Download rate while running.
    pub download_bps: u64,
    /// Peers reported while running.
    pub peers: u32,
}

impl Default for SimulationProfile {
    fn default() -> Self {
        Self {
            metadata_delay: Duration::from_secs(3),
            payload_bytes: 512 * 1024 * 1024,
            download_bps: 8 * 1024 * 1024,
            peers: 12,
        }
    }
}

/// In-memory session that advances transfers on worker ticks.
pub(crate) struct SimulatedSession {
    profile: SimulationProfile,
    transfers: HashMap<TransferHandle, SimulatedTransfer>,
}

struct SimulatedTransfer {
    name: String,
    save_path: PathBuf,
    paused: bool,
    running_for: Duration,
}

impl SimulatedSession {
    pub(crate) fn new(profile: SimulationProfile) -> Self {
        Self {
            profile,
            transfers: HashMap::new(),
        }
    }

    fn transfer(&self, handle: TransferHandle) -> EngineResult<&SimulatedTransfer> {
        self.transfers
            .get(&handle)
            .ok_or(EngineError::UnknownTransfer { handle })
    }

    fn transfer_mut(&mut self, handle: TransferHandle) -> EngineResult<&mut SimulatedTransfer> {
        self.transfers
            .get_mut(&handle)
            .ok_or(EngineError::UnknownTransfer { handle })
    }

    fn downloaded(&self, transfer: &SimulatedTransfer) -> u64 {
        let Some(downloading_for) = transfer.running_for.checked_sub(self.profile.metadata_delay)
        else {
            return 0;
        };
        let bytes = u128::from(self.profile.download_bps) * downloading_for.as_millis() / 1000;
        u64::try_from(bytes)
            .unwrap_or(u64::MAX)
            .min(self.profile.payload_bytes)
    }

    fn snapshot(&self, transfer: &SimulatedTransfer) -> TransferStatus {
        let has_metadata = transfer.running_for >= self.profile.metadata_delay;
        if !has_metadata {
            return TransferStatus {
                phase: TransferPhase::FetchingMetadata,
                peers: if transfer.paused { 0 } else { self.profile.peers },
                ..TransferStatus::default()
            };
        }
        let bytes_downloaded = self.downloaded(transfer);
        let complete = bytes_downloaded >= self.profile.payload_bytes;
        let moving = !transfer.paused && !complete;
        TransferStatus {
            name: Some(transfer.name.clone()),
            phase: if complete {
                TransferPhase::Seeding
            } else {
                TransferPhase::Downloading
            },
            has_metadata,
            bytes_downloaded,
            bytes_total: self.profile.payload_bytes,
            download_bps: if moving { self.profile.download_bps } else { 0 },
            peers: if transfer.paused { 0 } else { self.profile.peers },
        }
    }
}

#[async_trait]
impl EngineSession for SimulatedSession {
    async fn add(
        &mut self,
        handle: TransferHandle,
        source: &JobSource,
        save_path: &Path,
    ) -> EngineResult<()> {
        let name = match source {
            JobSource::Magnet { uri } => magnet_name(uri)?,
            JobSource::TorrentFile { path } => metainfo_name(path).await?,
        };
        info!(%handle, name = %name, save_path = %save_path.display(), "transfer admitted");
        self.transfers.insert(
            handle,
            SimulatedTransfer {
                name,
                save_path: save_path.to_path_buf(),
                paused: false,
                running_for: Duration::ZERO,
            },
        );
        Ok(())
    }

    async fn remove(
        &mut self,
        handle: TransferHandle,
        options: RemoveTransfer,
    ) -> EngineResult<()> {
        let transfer = self
            .transfers
            .remove(&handle)
            .ok_or(EngineError::UnknownTransfer { handle })?;
        debug!(
            %handle,
            with_data = options.with_data,
            save_path = %transfer.save_path.display(),
            "transfer removed"
        );
        Ok(())
    }

    async fn pause(&mut self, handle: TransferHandle) -> EngineResult<()> {
        self.transfer_mut(handle)?.paused = true;
        Ok(())
    }

    async fn resume(&mut self, handle: TransferHandle) -> EngineResult<()> {
        self.transfer_mut(handle)?.paused = false;
        Ok(())
    }

    async fn status(&mut self, handle: TransferHandle) -> EngineResult<TransferStatus> {
        let transfer = self.transfer(handle)?;
        Ok(self.snapshot(transfer))
    }

    async fn files(&mut self, handle: TransferHandle) -> EngineResult<Vec<TransferFile>> {
        let transfer = self.transfer(handle)?;
        if transfer.running_for < self.profile.metadata_delay {
            return Ok(Vec::new());
        }
        Ok(vec![TransferFile {
            path: PathBuf::from(&transfer.name),
            size_bytes: self.profile.payload_bytes,
        }])
    }

    async fn advance(&mut self, elapsed: Duration) -> EngineResult<()> {
        for transfer in self.transfers.values_mut().filter(|t| !t.paused) {
            transfer.running_for = transfer.running_for.saturating_add(elapsed);
        }
        Ok(())
    }
}

fn magnet_name(uri: &str) -> EngineResult<String> {
    let query = uri
        .strip_prefix(MAGNET_PREFIX)
        .ok_or(EngineError::InvalidSource {
            field: "uri",
            reason: "not a magnet URI",
        })?;
    if !query.split('&').any(|pair| pair.starts_with("xt=")) {
        return Err(EngineError::InvalidSource {
            field: "uri",
            reason: "magnet URI has no exact topic",
        });
    }
    let name = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("dn="))
        .map(percent_decode)
        .filter(|name| !name.trim().is_empty());
    Ok(name.unwrap_or_else(|| FALLBACK_NAME.to_string()))
}

async fn metainfo_name(path: &Path) -> EngineResult<String> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|source| EngineError::SourceIo {
            path: path.to_path_buf(),
            source,
        })?;
    if !metadata.is_file() {
        return Err(EngineError::InvalidSource {
            field: "path",
            reason: "metainfo path is not a file",
        });
    }
    Ok(path
        .file_stem()
        .map_or_else(|| FALLBACK_NAME.to_string(), |stem| stem.to_string_lossy().into_owned()))
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'+' => decoded.push(b' '),
            b'%' if index + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[index + 1..=index + 2]).ok();
                match hex.and_then(|hex| u8::from_str_radix(hex, 16).ok()) {
                    Some(byte) => {
                        decoded.push(byte);
                        index += 2;
                    }
                    None => decoded.push(b'%'),
                }
            }
            byte => decoded.push(byte),
        }
        index += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}
