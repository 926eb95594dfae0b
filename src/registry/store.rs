//! Durable registry state.
//!
//! The last fully written state file is canonical. Every save writes a
//! sibling temp file, fsyncs it, renames it over the state file and fsyncs
//! the directory, so a crash leaves either the old or the new state.

use crate::error::{CanopyError, Result};
use crate::overlay::types::sync_parent_dir;
use crate::registry::types::{RegistryState, STATE_VERSION};
use fs2::FileExt;
use fxhash::FxHashSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

fn corrupt(path: &Path, reason: impl Into<String>) -> CanopyError {
    CanopyError::StateCorrupt {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn lock_path(state_file: &Path) -> PathBuf {
    let mut name = state_file.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

fn temp_path(state_file: &Path) -> PathBuf {
    let mut name = state_file.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Reject states that cannot be trusted as a whole.
pub fn validate_state(path: &Path, state: &RegistryState) -> Result<()> {
    if state.version != STATE_VERSION {
        return Err(corrupt(
            path,
            format!(
                "unsupported version {} (expected {})",
                state.version, STATE_VERSION
            ),
        ));
    }

    let mut jobs = FxHashSet::default();
    let mut mount_paths = FxHashSet::default();
    for entry in &state.mounts {
        if entry.job_id.is_empty() {
            return Err(corrupt(path, "entry with empty job id"));
        }
        if !jobs.insert(entry.job_id.as_str()) {
            return Err(corrupt(path, format!("duplicate job id {}", entry.job_id)));
        }
        if !mount_paths.insert(entry.mount_path.as_path()) {
            return Err(corrupt(
                path,
                format!("duplicate mount path {}", entry.mount_path.display()),
            ));
        }
    }
    Ok(())
}

/// Read and validate a state file without taking the owner lock.
///
/// A missing file is an empty state.
pub fn read_state(path: &Path) -> Result<RegistryState> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(RegistryState::default());
        }
        Err(e) => return Err(e.into()),
    };

    let state: RegistryState =
        serde_json::from_str(&content).map_err(|e| corrupt(path, e.to_string()))?;
    validate_state(path, &state)?;
    Ok(state)
}

/// Owner handle on a state file, holding an exclusive lock on
/// `<state_file>.lock` until dropped.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    lock: File,
}

impl StateStore {
    pub fn open(path: &Path) -> Result<(StateStore, RegistryState)> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path(path))?;
        lock.try_lock_exclusive().map_err(|e| {
            CanopyError::Locked(format!(
                "state file {} is owned by another registry (is `canopy serve` running?): {}",
                path.display(),
                e
            ))
        })?;

        // A leftover temp file is an interrupted save; the state file is canonical.
        let tmp = temp_path(path);
        if tmp.exists() {
            tracing::warn!("Discarding interrupted state write {}", tmp.display());
            if let Err(e) = fs::remove_file(&tmp) {
                tracing::warn!("Failed to remove {}: {}", tmp.display(), e);
            }
        }

        let state = read_state(path)?;
        tracing::info!(
            "Loaded registry state {} (generation {}, {} entries)",
            path.display(),
            state.generation,
            state.mounts.len()
        );
        Ok((
            StateStore {
                path: path.to_path_buf(),
                lock,
            },
            state,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, state: &RegistryState) -> Result<()> {
        validate_state(&self.path, state)?;
        let content = serde_json::to_string_pretty(state)?;

        let tmp = temp_path(&self.path);
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(content.as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        sync_parent_dir(&self.path)?;
        tracing::debug!(
            "Persisted registry state generation {}",
            state.generation
        );
        Ok(())
    }
}

impl Drop for StateStore {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.lock) {
            tracing::warn!("Failed to release state lock: {}", e);
        }
    }
}
