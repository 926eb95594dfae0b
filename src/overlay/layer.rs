use crate::overlay::fault::FaultInjector;
use crate::overlay::locks::PathLocks;
use crate::overlay::types::{DirItem, EntryStat, LayerKind};
use crate::overlay::whiteout::{WhiteoutSet, WHITEOUT_INDEX};
use std::ffi::{OsStr, OsString};
use std::fs;
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Read surface of a layer. The base is only ever reached through this trait,
/// so nothing in the engine can write to it.
pub trait BaseLayer: Send + Sync + std::fmt::Debug {
    /// Stable identifier recorded in the registry state.
    fn locator(&self) -> String;

    /// Attributes of `rel` without following a final symlink; `None` if absent.
    fn stat(&self, rel: &Path) -> io::Result<Option<EntryStat>>;

    fn read_dir(&self, rel: &Path) -> io::Result<Vec<DirItem>>;

    fn read_at(&self, rel: &Path, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    fn read_link(&self, rel: &Path) -> io::Result<PathBuf>;

    fn get_xattr(&self, _rel: &Path, _name: &OsStr) -> io::Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn list_xattr(&self, _rel: &Path) -> io::Result<Vec<OsString>> {
        Ok(Vec::new())
    }
}

/// Shared handle to the read-only base content provider.
pub type BaseRef = Arc<dyn BaseLayer>;

fn stat_host(path: &Path) -> io::Result<Option<EntryStat>> {
    match fs::symlink_metadata(path) {
        Ok(meta) => Ok(Some(EntryStat::from_metadata(&meta))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) if e.raw_os_error() == Some(libc::ENOTDIR) => Ok(None),
        Err(e) => Err(e),
    }
}

fn read_dir_host(path: &Path) -> io::Result<Vec<DirItem>> {
    let mut items = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let kind = match entry.file_type() {
            Ok(ft) => crate::overlay::types::EntryKind::from_std(ft),
            Err(_) => continue,
        };
        items.push(DirItem {
            name: entry.file_name(),
            kind,
        });
    }
    Ok(items)
}

/// Open `path` without following a final symlink.
fn open_nofollow(path: &Path, write: bool) -> io::Result<fs::File> {
    fs::OpenOptions::new()
        .read(!write)
        .write(write)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path)
}

fn read_at_host(path: &Path, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    let file = open_nofollow(path, false)?;
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn get_xattr_host(path: &Path, name: &OsStr) -> io::Result<Option<Vec<u8>>> {
    xattr::get(path, name)
}

fn list_xattr_host(path: &Path) -> io::Result<Vec<OsString>> {
    Ok(xattr::list(path)?.collect())
}

/// A host directory served as the read-only base layer.
#[derive(Debug, Clone)]
pub struct HostBase {
    root: PathBuf,
}

impl HostBase {
    pub fn new(root: PathBuf) -> io::Result<Self> {
        let meta = fs::metadata(&root)?;
        if !meta.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("base root {} is not a directory", root.display()),
            ));
        }
        Ok(HostBase { root })
    }

    pub fn shared(root: PathBuf) -> io::Result<BaseRef> {
        Ok(Arc::new(Self::new(root)?))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl BaseLayer for HostBase {
    fn locator(&self) -> String {
        self.root.display().to_string()
    }

    fn stat(&self, rel: &Path) -> io::Result<Option<EntryStat>> {
        stat_host(&self.root.join(rel))
    }

    fn read_dir(&self, rel: &Path) -> io::Result<Vec<DirItem>> {
        read_dir_host(&self.root.join(rel))
    }

    fn read_at(&self, rel: &Path, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        read_at_host(&self.root.join(rel), offset, buf)
    }

    fn read_link(&self, rel: &Path) -> io::Result<PathBuf> {
        fs::read_link(self.root.join(rel))
    }

    fn get_xattr(&self, rel: &Path, name: &OsStr) -> io::Result<Option<Vec<u8>>> {
        get_xattr_host(&self.root.join(rel), name)
    }

    fn list_xattr(&self, rel: &Path) -> io::Result<Vec<OsString>> {
        list_xattr_host(&self.root.join(rel))
    }
}

/// A read-write layer on disk: `tree/` holds content, `work/` stages
/// copy-ups on the same filesystem, `whiteouts.json` is the whiteout index.
#[derive(Debug)]
pub struct WritableLayer {
    kind: LayerKind,
    root: PathBuf,
    tree: PathBuf,
    work: PathBuf,
    whiteouts: WhiteoutSet,
    locks: PathLocks,
    faults: FaultInjector,
}

impl WritableLayer {
    /// Open (creating if absent) a writable layer rooted at `root`.
    ///
    /// Leftovers in `work/` belong to copy-ups that never committed and are
    /// discarded.
    pub fn open(kind: LayerKind, root: PathBuf) -> io::Result<Self> {
        debug_assert!(kind.is_writable());
        let tree = root.join("tree");
        let work = root.join("work");
        fs::create_dir_all(&tree)?;
        fs::create_dir_all(&work)?;

        for entry in fs::read_dir(&work)? {
            let path = entry?.path();
            tracing::debug!("discarding stale staging entry {}", path.display());
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            if let Err(e) = removed {
                tracing::warn!("Failed to discard {}: {}", path.display(), e);
            }
        }

        let whiteouts = WhiteoutSet::load(root.join(WHITEOUT_INDEX))?;

        Ok(WritableLayer {
            kind,
            root,
            tree,
            work,
            whiteouts,
            locks: PathLocks::default(),
            faults: FaultInjector::default(),
        })
    }

    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tree(&self) -> &Path {
        &self.tree
    }

    pub fn whiteouts(&self) -> &WhiteoutSet {
        &self.whiteouts
    }

    pub fn locks(&self) -> &PathLocks {
        &self.locks
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Host path of `rel` inside this layer's tree.
    pub fn path_of(&self, rel: &Path) -> PathBuf {
        self.tree.join(rel)
    }

    /// True if an ancestor of `rel` inside the tree is a symlink. Host path
    /// lookups would follow it out of the layer.
    fn crosses_symlink(&self, rel: &Path) -> bool {
        rel.ancestors()
            .skip(1)
            .filter(|p| !p.as_os_str().is_empty())
            .any(|p| {
                fs::symlink_metadata(self.tree.join(p))
                    .map(|meta| meta.file_type().is_symlink())
                    .unwrap_or(false)
            })
    }

    /// Open the regular file at `rel` for writing. Symlinks, in the final
    /// component or above it, are refused with `ELOOP`.
    pub(crate) fn open_for_write(&self, rel: &Path) -> io::Result<fs::File> {
        if self.crosses_symlink(rel) {
            return Err(io::Error::from_raw_os_error(libc::ELOOP));
        }
        open_nofollow(&self.path_of(rel), true)
    }

    /// Fresh, unique path in the staging area.
    pub(crate) fn staging_path(&self) -> PathBuf {
        self.work.join(format!("{}.tmp", uuid::Uuid::new_v4()))
    }
}

impl BaseLayer for WritableLayer {
    fn locator(&self) -> String {
        self.root.display().to_string()
    }

    fn stat(&self, rel: &Path) -> io::Result<Option<EntryStat>> {
        if self.crosses_symlink(rel) {
            return Ok(None);
        }
        stat_host(&self.path_of(rel))
    }

    fn read_dir(&self, rel: &Path) -> io::Result<Vec<DirItem>> {
        read_dir_host(&self.path_of(rel))
    }

    fn read_at(&self, rel: &Path, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if self.crosses_symlink(rel) {
            return Err(io::Error::from_raw_os_error(libc::ELOOP));
        }
        read_at_host(&self.path_of(rel), offset, buf)
    }

    fn read_link(&self, rel: &Path) -> io::Result<PathBuf> {
        fs::read_link(self.path_of(rel))
    }

    fn get_xattr(&self, rel: &Path, name: &OsStr) -> io::Result<Option<Vec<u8>>> {
        get_xattr_host(&self.path_of(rel), name)
    }

    fn list_xattr(&self, rel: &Path) -> io::Result<Vec<OsString>> {
        list_xattr_host(&self.path_of(rel))
    }
}
