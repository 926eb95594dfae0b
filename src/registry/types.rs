use crate::config::{get_data_dir, resolve_data_path, Config};
use crate::error::Result;
use crate::overlay::MountState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Format version of the persisted registry state.
pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelistRef {
    pub name: String,
    pub root: PathBuf,
}

/// Layer roots of one job as recorded on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRoots {
    pub upper: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changelist: Option<ChangelistRef>,
    /// Locator of the base layer provider.
    pub base: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountEntry {
    pub job_id: String,
    pub mount_path: PathBuf,
    pub layers: LayerRoots,
    #[serde(default)]
    pub locked: bool,
    pub state: MountState,
    pub created_at: DateTime<Utc>,
}

impl MountEntry {
    /// The job holds its mount path: a new mount for the same job elsewhere,
    /// or for another job here, is refused.
    pub fn is_live(&self) -> bool {
        self.state != MountState::Unmounted
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryState {
    pub version: u32,
    pub generation: u64,
    #[serde(default)]
    pub mounts: Vec<MountEntry>,
}

impl Default for RegistryState {
    fn default() -> Self {
        RegistryState {
            version: STATE_VERSION,
            generation: 0,
            mounts: Vec::new(),
        }
    }
}

impl RegistryState {
    pub fn find(&self, job_id: &str) -> Option<&MountEntry> {
        self.mounts.iter().find(|m| m.job_id == job_id)
    }

    pub fn find_mut(&mut self, job_id: &str) -> Option<&mut MountEntry> {
        self.mounts.iter_mut().find(|m| m.job_id == job_id)
    }

    pub fn by_mount_path(&self, mount_path: &Path) -> Option<&MountEntry> {
        self.mounts.iter().find(|m| m.mount_path == mount_path)
    }

    /// Insert or replace the entry for `entry.job_id`.
    pub fn upsert(&mut self, entry: MountEntry) {
        match self.find_mut(&entry.job_id) {
            Some(existing) => *existing = entry,
            None => self.mounts.push(entry),
        }
    }

    pub fn remove(&mut self, job_id: &str) -> Option<MountEntry> {
        let idx = self.mounts.iter().position(|m| m.job_id == job_id)?;
        Some(self.mounts.remove(idx))
    }

    /// Entries ordered by creation time, job id breaking ties.
    pub fn sorted(&self) -> Vec<MountEntry> {
        let mut mounts = self.mounts.clone();
        mounts.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        mounts
    }
}

/// Bounded exponential backoff for unmount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given (1-based) failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

/// Fully resolved registry configuration.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub upper_root: PathBuf,
    pub changelist_root: PathBuf,
    pub mount_root: PathBuf,
    pub state_file: PathBuf,
    pub ttl: Duration,
    pub workers: usize,
    pub retry: RetryPolicy,
}

impl RegistrySettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let data_dir = get_data_dir()?;
        Ok(RegistrySettings {
            upper_root: resolve_data_path(&config.paths.get_upper_root(), &data_dir)?,
            changelist_root: resolve_data_path(&config.paths.get_changelist_root(), &data_dir)?,
            mount_root: resolve_data_path(&config.paths.get_mount_root(), &data_dir)?,
            state_file: resolve_data_path(&config.paths.get_state_file(), &data_dir)?,
            ttl: Duration::from_secs(config.fuse.get_ttl_secs()),
            workers: config.fuse.get_workers(),
            retry: RetryPolicy {
                max_attempts: config.unmount.get_max_attempts(),
                initial_backoff: Duration::from_millis(config.unmount.get_initial_backoff_ms()),
                max_backoff: Duration::from_millis(config.unmount.get_max_backoff_ms()),
            },
        })
    }

    /// Default settings with every root under `dir`.
    pub fn under(dir: &Path) -> Self {
        RegistrySettings {
            upper_root: dir.join("uppers"),
            changelist_root: dir.join("changelists"),
            mount_root: dir.join("mounts"),
            state_file: dir.join("registry.json"),
            ttl: Duration::from_secs(1),
            workers: 4,
            retry: RetryPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(300),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(50));
        assert_eq!(policy.backoff(2), Duration::from_millis(100));
        assert_eq!(policy.backoff(3), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(300));
        assert_eq!(policy.backoff(40), Duration::from_millis(300));
    }

    #[test]
    fn test_state_round_trips_as_lowercase_json() {
        let mut state = RegistryState::default();
        state.upsert(MountEntry {
            job_id: "job-a".into(),
            mount_path: PathBuf::from("/mnt/a"),
            layers: LayerRoots {
                upper: PathBuf::from("/data/uppers/1"),
                changelist: None,
                base: "/srv/base".into(),
            },
            locked: false,
            state: MountState::Unmounting,
            created_at: Utc::now(),
        });

        let json = serde_json::to_string_pretty(&state).unwrap();
        assert!(json.contains("\"unmounting\""));
        assert!(!json.contains("changelist"));
        let back: RegistryState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
