use crate::error::{CanopyError, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub fn expand_tilde(path: &str) -> PathBuf {
    let path = path.trim();
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    } else if path == "~" {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home);
        }
    }
    PathBuf::from(path)
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("dev", "canopy", "canopy")
        .ok_or_else(|| CanopyError::Config("Could not determine home directory".to_string()))
}

pub fn get_config_dir() -> Result<PathBuf> {
    if let Ok(config_dir) = std::env::var("CANOPY_CONFIG_DIR") {
        return Ok(PathBuf::from(config_dir));
    }
    Ok(project_dirs()?.config_dir().to_path_buf())
}

pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("config.toml"))
}

pub fn get_data_dir() -> Result<PathBuf> {
    if let Ok(data_dir) = std::env::var("CANOPY_DATA_DIR") {
        return Ok(PathBuf::from(data_dir));
    }
    Ok(project_dirs()?.data_dir().to_path_buf())
}

/// Resolve a configured path: `~` expands to the home directory and
/// relative paths live under `data_dir`.
pub fn resolve_data_path(value: &str, data_dir: &Path) -> Result<PathBuf> {
    if value.trim().is_empty() {
        return Err(CanopyError::Config("Configured path is empty".to_string()));
    }
    let expanded = expand_tilde(value);
    if expanded
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(CanopyError::Config(format!(
            "Invalid path '{}': '..' components are not allowed",
            value
        )));
    }
    if expanded.is_absolute() {
        Ok(expanded)
    } else {
        Ok(data_dir.join(expanded))
    }
}
