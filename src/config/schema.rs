use crate::error::{CanopyError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PathsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_root: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changelist_root: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_root: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_file: Option<String>,
}

impl PathsConfig {
    pub fn get_upper_root(&self) -> String {
        self.upper_root
            .clone()
            .unwrap_or_else(super::default_upper_root)
    }

    pub fn get_changelist_root(&self) -> String {
        self.changelist_root
            .clone()
            .unwrap_or_else(super::default_changelist_root)
    }

    pub fn get_mount_root(&self) -> String {
        self.mount_root
            .clone()
            .unwrap_or_else(super::default_mount_root)
    }

    pub fn get_state_file(&self) -> String {
        self.state_file
            .clone()
            .unwrap_or_else(super::default_state_file)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct FuseConfig {
    /// Attribute and entry cache timeout handed to the kernel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
    /// Blocking workers serving FUSE calls across all mounts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
}

impl FuseConfig {
    pub fn get_ttl_secs(&self) -> u64 {
        self.ttl_secs.unwrap_or_else(super::default_fuse_ttl_secs)
    }

    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or_else(super::default_fuse_workers)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct UnmountConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_backoff_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backoff_ms: Option<u64>,
}

impl UnmountConfig {
    pub fn get_max_attempts(&self) -> u32 {
        self.max_attempts
            .unwrap_or_else(super::default_unmount_max_attempts)
    }

    pub fn get_initial_backoff_ms(&self) -> u64 {
        self.initial_backoff_ms
            .unwrap_or_else(super::default_unmount_initial_backoff_ms)
    }

    pub fn get_max_backoff_ms(&self) -> u64 {
        self.max_backoff_ms
            .unwrap_or_else(super::default_unmount_max_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub fuse: FuseConfig,
    #[serde(default)]
    pub unmount: UnmountConfig,
}

const MAX_FUSE_WORKERS: usize = 256;

pub fn validate_config(config: &Config) -> Result<()> {
    let workers = config.fuse.get_workers();
    if workers == 0 || workers > MAX_FUSE_WORKERS {
        return Err(CanopyError::Config(format!(
            "fuse.workers must be between 1 and {} (got {})",
            MAX_FUSE_WORKERS, workers
        )));
    }

    if config.unmount.get_max_attempts() == 0 {
        return Err(CanopyError::Config(
            "unmount.max_attempts must be at least 1".to_string(),
        ));
    }

    let initial = config.unmount.get_initial_backoff_ms();
    let max = config.unmount.get_max_backoff_ms();
    if initial > max {
        return Err(CanopyError::Config(format!(
            "unmount.initial_backoff_ms ({}) exceeds unmount.max_backoff_ms ({})",
            initial, max
        )));
    }

    if config.fuse.get_ttl_secs() > 60 {
        tracing::warn!(
            "fuse.ttl_secs ({}) is high; changes made outside the mount may stay invisible for that long",
            config.fuse.get_ttl_secs()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.fuse.get_ttl_secs(), 1);
        assert_eq!(config.fuse.get_workers(), 4);
        assert_eq!(config.unmount.get_max_attempts(), 5);
        assert_eq!(config.unmount.get_initial_backoff_ms(), 50);
        assert_eq!(config.unmount.get_max_backoff_ms(), 1000);
        assert_eq!(config.paths.get_state_file(), "registry.json");
    }

    #[rstest]
    #[case("[fuse]\nworkers = 0\n")]
    #[case("[unmount]\nmax_attempts = 0\n")]
    #[case("[unmount]\ninitial_backoff_ms = 500\nmax_backoff_ms = 100\n")]
    fn test_invalid_values_rejected(#[case] toml_str: &str) {
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(matches!(
            validate_config(&config),
            Err(CanopyError::Config(_))
        ));
    }

    #[test]
    fn test_unset_fields_are_not_serialized() {
        let config = Config {
            fuse: FuseConfig {
                ttl_secs: Some(3),
                workers: None,
            },
            ..Config::default()
        };
        let out = toml::to_string_pretty(&config).unwrap();
        assert!(out.contains("ttl_secs = 3"));
        assert!(!out.contains("workers"));
    }
}
