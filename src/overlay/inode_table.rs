use fuser::FUSE_ROOT_ID;
use fxhash::FxHashMap;
use parking_lot::RwLock;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

#[derive(Debug)]
struct InodeEntry {
    path: PathBuf,
    /// Kernel lookup count; the entry goes away when it drops to zero.
    lookups: u64,
}

#[derive(Debug)]
struct Inner {
    by_ino: FxHashMap<u64, InodeEntry>,
    by_path: FxHashMap<PathBuf, u64>,
    next_ino: u64,
}

/// Maps kernel inode numbers to logical paths inside one mount.
///
/// Inodes are allocated on first lookup and released when the kernel
/// forgets them. The root is always `FUSE_ROOT_ID` with the empty path.
#[derive(Debug)]
pub struct InodeTable {
    inner: RwLock<Inner>,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let mut by_ino = FxHashMap::default();
        let mut by_path = FxHashMap::default();
        by_ino.insert(
            FUSE_ROOT_ID,
            InodeEntry {
                path: PathBuf::new(),
                lookups: 1,
            },
        );
        by_path.insert(PathBuf::new(), FUSE_ROOT_ID);
        InodeTable {
            inner: RwLock::new(Inner {
                by_ino,
                by_path,
                // FUSE reserves inode 1 for the root directory
                next_ino: FUSE_ROOT_ID + 1,
            }),
        }
    }

    pub fn path_of(&self, ino: u64) -> Option<PathBuf> {
        self.inner.read().by_ino.get(&ino).map(|e| e.path.clone())
    }

    pub fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.path_of(parent).map(|p| p.join(name))
    }

    pub fn ino_of(&self, path: &Path) -> Option<u64> {
        self.inner.read().by_path.get(path).copied()
    }

    /// Inode for `path`, allocating one if needed, with its lookup count bumped.
    pub fn lookup(&self, path: &Path) -> u64 {
        let mut inner = self.inner.write();
        let existing = inner.by_path.get(path).copied();
        if let Some(ino) = existing {
            if let Some(entry) = inner.by_ino.get_mut(&ino) {
                entry.lookups += 1;
            }
            return ino;
        }

        let ino = inner.next_ino;
        inner.next_ino = inner.next_ino.wrapping_add(1);
        inner.by_ino.insert(
            ino,
            InodeEntry {
                path: path.to_path_buf(),
                lookups: 1,
            },
        );
        inner.by_path.insert(path.to_path_buf(), ino);
        ino
    }

    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == FUSE_ROOT_ID {
            return;
        }
        let mut inner = self.inner.write();
        let drop_path = match inner.by_ino.get_mut(&ino) {
            Some(entry) => {
                entry.lookups = entry.lookups.saturating_sub(nlookup);
                if entry.lookups > 0 {
                    return;
                }
                entry.path.clone()
            }
            None => return,
        };
        inner.by_ino.remove(&ino);
        if inner.by_path.get(&drop_path) == Some(&ino) {
            inner.by_path.remove(&drop_path);
        }
    }

    /// The entry at `path` is gone; a later lookup gets a fresh inode.
    pub fn unlink(&self, path: &Path) {
        self.inner.write().by_path.remove(path);
    }

    /// Re-key `from` and everything below it to live under `to`.
    pub fn rename(&self, from: &Path, to: &Path) {
        let mut inner = self.inner.write();
        inner.by_path.remove(to);

        let moved: Vec<(PathBuf, u64)> = inner
            .by_path
            .iter()
            .filter(|(p, _)| p.starts_with(from))
            .map(|(p, ino)| (p.clone(), *ino))
            .collect();

        for (old, ino) in moved {
            inner.by_path.remove(&old);
            let new = match old.strip_prefix(from) {
                Ok(suffix) if suffix.as_os_str().is_empty() => to.to_path_buf(),
                Ok(suffix) => to.join(suffix),
                Err(_) => continue,
            };
            if let Some(entry) = inner.by_ino.get_mut(&ino) {
                entry.path = new.clone();
            }
            inner.by_path.insert(new, ino);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_ino.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
