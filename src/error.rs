use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CanopyError>;

#[derive(Error, Debug)]
pub enum CanopyError {
    #[error("Mount path already in use: {0}")]
    PathInUse(PathBuf),

    #[error("Job already has an active mount: {0}")]
    DuplicateJob(String),

    #[error("Mount is locked: {0}")]
    Locked(String),

    #[error("Layer conflict at {path}: {detail}")]
    LayerConflict { path: PathBuf, detail: String },

    #[error("Copy-up failed for {path}: {source}")]
    CopyUpFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unmount failed for {job_id} after {attempts} attempts: {reason}")]
    UnmountFailed {
        job_id: String,
        attempts: u32,
        reason: String,
    },

    #[error("Registry state is corrupt ({path}): {reason}")]
    StateCorrupt { path: PathBuf, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("Directory not empty: {0}")]
    NotEmpty(PathBuf),

    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Is a directory: {0}")]
    IsADirectory(PathBuf),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Stale mount: {0}")]
    Stale(String),

    #[error("IO error: {0}")]
    Io(std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("FUSE error: {0}")]
    Fuse(String),

    #[error("JSON error: {0}")]
    Json(String),
}

impl CanopyError {
    pub(crate) fn copy_up(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CanopyError::CopyUpFailed {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn not_found(path: &std::path::Path) -> Self {
        CanopyError::NotFound(path.display().to_string())
    }
}

impl From<std::io::Error> for CanopyError {
    fn from(err: std::io::Error) -> Self {
        CanopyError::Io(err)
    }
}

impl From<serde_json::Error> for CanopyError {
    fn from(err: serde_json::Error) -> Self {
        CanopyError::Json(err.to_string())
    }
}
