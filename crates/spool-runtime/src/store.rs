//! JSON state file holding the active slots and owner queues.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use spool_core::PersistedSnapshot;
use tracing::{debug, info, warn};

use crate::error::{RuntimeError, RuntimeResult};

/// Single-writer store for the queue snapshot.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Store backed by the file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// State file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `snapshot`, logging instead of failing.
    ///
    /// Returns whether the write succeeded so callers can report degradation;
    /// in-memory state stays authoritative either way.
    pub fn save(&self, snapshot: &PersistedSnapshot) -> bool {
        match self.write(snapshot) {
            Ok(()) => {
                debug!(
                    path = %self.path.display(),
                    active = snapshot.active_downloads.len(),
                    queued = snapshot.queued_len(),
                    "state saved"
                );
                true
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, detail = ?err, "state save failed");
                false
            }
        }
    }

    /// Read the snapshot, falling back to an empty one on any failure.
    #[must_use]
    pub fn load(&self) -> PersistedSnapshot {
        match self.read() {
            Ok(Some(snapshot)) => {
                info!(
                    path = %self.path.display(),
                    active = snapshot.active_downloads.len(),
                    queued = snapshot.queued_len(),
                    "state loaded"
                );
                snapshot
            }
            Ok(None) => {
                info!(path = %self.path.display(), "no state file; starting empty");
                PersistedSnapshot::default()
            }
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    detail = ?err,
                    "state file unreadable; starting empty"
                );
                PersistedSnapshot::default()
            }
        }
    }

    /// Serialize and atomically replace the state file.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the file cannot be written.
    pub fn write(&self, snapshot: &PersistedSnapshot) -> RuntimeResult<()> {
        let payload = serde_json::to_vec_pretty(snapshot)
            .map_err(|source| RuntimeError::Serialize { source })?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|source| RuntimeError::io("state.create_dir", parent, source))?;
        }
        atomic_write(&self.path, &payload)
    }

    /// Read the state file; `Ok(None)` when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a valid snapshot.
    pub fn read(&self) -> RuntimeResult<Option<PersistedSnapshot>> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(RuntimeError::io("state.read", &self.path, source)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| RuntimeError::Parse {
                path: self.path.clone(),
                source,
            })
    }
}

/// Write `data` to a sibling temp file, fsync it, then rename over `path`.
///
/// # Errors
///
/// Returns an error if any filesystem step fails; `path` keeps its previous
/// contents in that case.
pub fn atomic_write(path: &Path, data: &[u8]) -> RuntimeResult<()> {
    let tmp_path = path.with_extension("tmp");

    let mut file = fs::File::create(&tmp_path)
        .map_err(|source| RuntimeError::io("state.create_tmp", &tmp_path, source))?;
    file.write_all(data)
        .map_err(|source| RuntimeError::io("state.write_tmp", &tmp_path, source))?;
    file.sync_all()
        .map_err(|source| RuntimeError::io("state.sync_tmp", &tmp_path, source))?;
    drop(file);

    fs::rename(&tmp_path, path)
        .map_err(|source| RuntimeError::io("state.rename", path, source))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        let dir =
            fs::File::open(parent).map_err(|source| RuntimeError::io("state.open_dir", parent, source))?;
        dir.sync_all()
            .map_err(|source| RuntimeError::io("state.sync_dir", parent, source))?;
    }

    Ok(())
}
