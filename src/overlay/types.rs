use crate::error::{CanopyError, Result};
use std::ffi::OsString;
use std::fs::{self, Metadata};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Position of a layer in a stack. Declaration order is precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LayerKind {
    Upper,
    Changelist,
    Base,
}

impl LayerKind {
    pub fn is_writable(self) -> bool {
        !matches!(self, LayerKind::Base)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LayerKind::Upper => "upper",
            LayerKind::Changelist => "changelist",
            LayerKind::Base => "base",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Special,
}

impl EntryKind {
    pub fn is_dir(self) -> bool {
        self == EntryKind::Directory
    }

    pub(crate) fn from_std(ft: std::fs::FileType) -> Self {
        if ft.is_dir() {
            EntryKind::Directory
        } else if ft.is_symlink() {
            EntryKind::Symlink
        } else if ft.is_file() {
            EntryKind::File
        } else {
            EntryKind::Special
        }
    }
}

/// Layer-independent attributes of one directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStat {
    pub kind: EntryKind,
    pub size: u64,
    pub perm: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub rdev: u32,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl EntryStat {
    pub fn from_metadata(meta: &Metadata) -> Self {
        EntryStat {
            kind: EntryKind::from_std(meta.file_type()),
            size: meta.len(),
            perm: meta.mode() & 0o7777,
            uid: meta.uid(),
            gid: meta.gid(),
            nlink: meta.nlink() as u32,
            rdev: meta.rdev() as u32,
            blocks: meta.blocks(),
            atime: meta.accessed().unwrap_or(UNIX_EPOCH),
            mtime: meta.modified().unwrap_or(UNIX_EPOCH),
            ctime: system_time(meta.ctime(), meta.ctime_nsec()),
        }
    }
}

fn system_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs < 0 {
        return UNIX_EPOCH;
    }
    UNIX_EPOCH + std::time::Duration::new(secs as u64, nsecs.clamp(0, 999_999_999) as u32)
}

/// One name in a single layer's directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirItem {
    pub name: OsString,
    pub kind: EntryKind,
}

/// One name in a merged directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: OsString,
    pub kind: EntryKind,
    pub layer: LayerKind,
}

/// Attribute changes requested through `setattr`.
#[derive(Debug, Clone, Default)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

impl SetAttr {
    pub fn is_empty(&self) -> bool {
        self.mode.is_none() && self.size.is_none() && self.atime.is_none() && self.mtime.is_none()
    }
}

/// Normalize a logical path inside a mount to a relative path.
///
/// Leading `/` is accepted and stripped. `.` components are dropped; `..`
/// and prefixes are rejected. The root of the mount is the empty path.
pub fn normalize_rel(path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(name) => out.push(name),
            Component::ParentDir | Component::Prefix(_) => {
                return Err(CanopyError::InvalidPath(format!(
                    "{} escapes the mount root",
                    path.display()
                )));
            }
        }
    }
    Ok(out)
}

/// Parent of a relative path; the root has no parent.
pub(crate) fn parent_of(rel: &Path) -> Option<&Path> {
    if rel.as_os_str().is_empty() {
        None
    } else {
        rel.parent()
    }
}

/// Flush the directory entry of `path` after a rename into place.
pub(crate) fn sync_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(dir) => fs::File::open(dir)?.sync_all(),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_parent_dir_needs_an_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("state.json");
        fs::write(&file, b"{}").unwrap();
        sync_parent_dir(&file).unwrap();
        assert!(sync_parent_dir(&dir.path().join("gone/state.json")).is_err());
    }

    #[test]
    fn test_normalize_rel_strips_root_and_dots() {
        assert_eq!(
            normalize_rel(Path::new("/a/./b")).unwrap(),
            PathBuf::from("a/b")
        );
        assert_eq!(normalize_rel(Path::new("/")).unwrap(), PathBuf::new());
        assert_eq!(normalize_rel(Path::new("")).unwrap(), PathBuf::new());
    }

    #[test]
    fn test_normalize_rel_rejects_parent_components() {
        assert!(matches!(
            normalize_rel(Path::new("a/../../etc")),
            Err(CanopyError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_parent_of_root_is_none() {
        assert_eq!(parent_of(Path::new("")), None);
        assert_eq!(parent_of(Path::new("a")), Some(Path::new("")));
        assert_eq!(parent_of(Path::new("a/b")), Some(Path::new("a")));
    }

    #[test]
    fn test_layer_precedence_order() {
        assert!(LayerKind::Upper < LayerKind::Changelist);
        assert!(LayerKind::Changelist < LayerKind::Base);
        assert!(!LayerKind::Base.is_writable());
    }
}
