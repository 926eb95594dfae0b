//! The per-job layer stack.
//!
//! `LayerStack` is the only way the rest of the crate touches layer content.
//! It normalizes paths, takes the per-path locks, resolves through a
//! `PathIndex` and hands mutations to a `CopyUpEngine` targeting the upper
//! layer (or the changelist, for shared writes). Nothing here ever writes
//! through the base.

use crate::error::{CanopyError, Result};
use crate::overlay::copy_up::{fs_error, CopyUpEngine, NewEntry};
use crate::overlay::layer::{BaseLayer, BaseRef, WritableLayer};
use crate::overlay::locks::{LockMode, PathGuard};
use crate::overlay::path_index::{PathIndex, Resolution};
use crate::overlay::types::{
    normalize_rel, parent_of, DirEntryInfo, EntryKind, EntryStat, SetAttr,
};
use std::ffi::{OsStr, OsString};
use std::fs::{self, FileTimes, Permissions};
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug)]
pub struct LayerStack {
    job_id: String,
    upper: Arc<WritableLayer>,
    changelist: Option<Arc<WritableLayer>>,
    base: BaseRef,
}

/// `mode` on each path and a shared lock on every ancestor, so a directory
/// held exclusively (rename, rmdir) excludes all work below it.
fn lock_requests(paths: &[&Path], mode: LockMode) -> Vec<(PathBuf, LockMode)> {
    let mut requests = Vec::new();
    for path in paths {
        requests.push((path.to_path_buf(), mode));
        let mut ancestor = parent_of(path);
        while let Some(dir) = ancestor.filter(|d| !d.as_os_str().is_empty()) {
            requests.push((dir.to_path_buf(), LockMode::Shared));
            ancestor = parent_of(dir);
        }
    }
    requests
}

/// Content operations only act on regular files; the kernel resolves
/// symlinks before they arrive here.
fn require_file(stat: &EntryStat, rel: &Path) -> Result<()> {
    match stat.kind {
        EntryKind::File => Ok(()),
        EntryKind::Directory => Err(CanopyError::IsADirectory(rel.to_path_buf())),
        _ => Err(CanopyError::InvalidPath(format!(
            "{} is not a regular file",
            rel.display()
        ))),
    }
}

impl LayerStack {
    pub fn new(
        job_id: impl Into<String>,
        upper: Arc<WritableLayer>,
        changelist: Option<Arc<WritableLayer>>,
        base: BaseRef,
    ) -> Self {
        LayerStack {
            job_id: job_id.into(),
            upper,
            changelist,
            base,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn upper(&self) -> &Arc<WritableLayer> {
        &self.upper
    }

    pub fn changelist(&self) -> Option<&Arc<WritableLayer>> {
        self.changelist.as_ref()
    }

    pub fn base(&self) -> &BaseRef {
        &self.base
    }

    fn index(&self) -> PathIndex<'_> {
        PathIndex::new(&self.upper, self.changelist.as_deref(), self.base.as_ref())
    }

    fn shared_layer(&self) -> Result<&WritableLayer> {
        self.changelist
            .as_deref()
            .ok_or_else(|| CanopyError::NotFound(format!("job {} has no changelist", self.job_id)))
    }

    fn read_guards(&self, rel: &Path) -> Vec<PathGuard> {
        let requests = lock_requests(&[rel], LockMode::Shared);
        let mut guards = self.upper.locks().lock_all(&requests);
        if let Some(changelist) = &self.changelist {
            guards.extend(changelist.locks().lock_all(&requests));
        }
        guards
    }

    /// Exclusive on the mutated paths in the upper (shared on their
    /// ancestors), then shared on the same paths in the changelist.
    fn write_guards(&self, paths: &[&Path]) -> Vec<PathGuard> {
        let mut guards = self
            .upper
            .locks()
            .lock_all(&lock_requests(paths, LockMode::Exclusive));
        if let Some(changelist) = &self.changelist {
            guards.extend(
                changelist
                    .locks()
                    .lock_all(&lock_requests(paths, LockMode::Shared)),
            );
        }
        guards
    }

    fn top_of(res: &Resolution, rel: &Path) -> Result<EntryStat> {
        res.top()
            .map(|hit| hit.stat.clone())
            .ok_or_else(|| CanopyError::not_found(rel))
    }

    fn upper_stat(&self, rel: &Path) -> Result<EntryStat> {
        self.upper
            .stat(rel)?
            .ok_or_else(|| CanopyError::not_found(rel))
    }

    /// All visible entries for `path`, highest precedence first.
    pub fn resolve(&self, path: &Path) -> Result<Resolution> {
        let rel = normalize_rel(path)?;
        let _guards = self.read_guards(&rel);
        self.index().resolve(&rel)
    }

    pub fn lookup(&self, path: &Path) -> Result<EntryStat> {
        let rel = normalize_rel(path)?;
        let _guards = self.read_guards(&rel);
        Self::top_of(&self.index().resolve(&rel)?, &rel)
    }

    pub fn read(&self, path: &Path, offset: u64, size: usize) -> Result<Vec<u8>> {
        let rel = normalize_rel(path)?;
        let _guards = self.read_guards(&rel);
        self.read_locked(&rel, offset, Some(size))
    }

    /// The whole content of `path`, sized and read under one guard.
    pub fn read_all(&self, path: &Path) -> Result<Vec<u8>> {
        let rel = normalize_rel(path)?;
        let _guards = self.read_guards(&rel);
        self.read_locked(&rel, 0, None)
    }

    fn read_locked(&self, rel: &Path, offset: u64, size: Option<usize>) -> Result<Vec<u8>> {
        let index = self.index();
        let res = index.resolve(rel)?;
        let hit = res.top().ok_or_else(|| CanopyError::not_found(rel))?;
        require_file(&hit.stat, rel)?;
        let source = index
            .source(hit.layer)
            .ok_or_else(|| CanopyError::not_found(rel))?;

        let size = size.unwrap_or(hit.stat.size.saturating_sub(offset) as usize);
        let mut buf = vec![0u8; size];
        let n = source.read_at(rel, offset, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Copy the entry at `path` into the upper layer if it is not there yet.
    pub fn copy_up(&self, path: &Path) -> Result<()> {
        let rel = normalize_rel(path)?;
        let _guards = self.write_guards(&[rel.as_path()]);
        let index = self.index();
        CopyUpEngine::new(&self.upper, &index).materialize(&rel, None)
    }

    pub fn write(&self, path: &Path, offset: u64, data: &[u8]) -> Result<usize> {
        let rel = normalize_rel(path)?;
        let _guards = self.write_guards(&[rel.as_path()]);
        let index = self.index();
        require_file(&Self::top_of(&index.resolve(&rel)?, &rel)?, &rel)?;
        CopyUpEngine::new(&self.upper, &index).materialize(&rel, None)?;

        let file = self
            .upper
            .open_for_write(&rel)
            .map_err(|e| fs_error(&rel, e))?;
        file.write_all_at(data, offset)?;
        Ok(data.len())
    }

    /// Replace the whole content of `path` atomically, creating it if needed.
    pub fn write_all(&self, path: &Path, data: &[u8]) -> Result<()> {
        let rel = normalize_rel(path)?;
        let _guards = self.write_guards(&[rel.as_path()]);
        let index = self.index();
        CopyUpEngine::new(&self.upper, &index).replace(&rel, data)
    }

    pub fn truncate(&self, path: &Path, size: u64) -> Result<()> {
        let rel = normalize_rel(path)?;
        let _guards = self.write_guards(&[rel.as_path()]);
        self.truncate_locked(&rel, size)
    }

    fn truncate_locked(&self, rel: &Path, size: u64) -> Result<()> {
        let index = self.index();
        require_file(&Self::top_of(&index.resolve(rel)?, rel)?, rel)?;
        // Only the bytes that survive the truncation are copied up.
        CopyUpEngine::new(&self.upper, &index).materialize(rel, Some(size))?;
        let file = self
            .upper
            .open_for_write(rel)
            .map_err(|e| fs_error(rel, e))?;
        file.set_len(size)?;
        Ok(())
    }

    pub fn set_attr(&self, path: &Path, attr: &SetAttr) -> Result<EntryStat> {
        if attr.is_empty() {
            return self.lookup(path);
        }
        let rel = normalize_rel(path)?;
        let _guards = self.write_guards(&[rel.as_path()]);

        if let Some(size) = attr.size {
            self.truncate_locked(&rel, size)?;
        } else {
            let index = self.index();
            CopyUpEngine::new(&self.upper, &index).materialize(&rel, None)?;
        }

        let host = self.upper.path_of(&rel);
        let kind = self.upper_stat(&rel)?.kind;
        if let Some(mode) = attr.mode {
            if kind != EntryKind::Symlink {
                fs::set_permissions(&host, Permissions::from_mode(mode & 0o7777))?;
            }
        }
        if attr.atime.is_some() || attr.mtime.is_some() {
            let handle = match kind {
                EntryKind::File => Some(self.upper.open_for_write(&rel)?),
                EntryKind::Directory => Some(fs::File::open(&host)?),
                _ => None,
            };
            if let Some(handle) = handle {
                let mut times = FileTimes::new();
                if let Some(atime) = attr.atime {
                    times = times.set_accessed(atime);
                }
                if let Some(mtime) = attr.mtime {
                    times = times.set_modified(mtime);
                }
                handle.set_times(times)?;
            }
        }

        self.upper_stat(&rel)
    }

    fn create_entry(&self, path: &Path, entry: NewEntry<'_>) -> Result<EntryStat> {
        let rel = normalize_rel(path)?;
        let _guards = self.write_guards(&[rel.as_path()]);
        let index = self.index();
        CopyUpEngine::new(&self.upper, &index).create(&rel, entry)?;
        self.upper_stat(&rel)
    }

    pub fn create(&self, path: &Path, perm: u32) -> Result<EntryStat> {
        self.create_entry(path, NewEntry::File { perm })
    }

    pub fn mkdir(&self, path: &Path, perm: u32) -> Result<EntryStat> {
        self.create_entry(path, NewEntry::Directory { perm })
    }

    pub fn symlink(&self, path: &Path, target: &Path) -> Result<EntryStat> {
        self.create_entry(path, NewEntry::Symlink { target })
    }

    pub fn read_link(&self, path: &Path) -> Result<PathBuf> {
        let rel = normalize_rel(path)?;
        let _guards = self.read_guards(&rel);
        let index = self.index();
        let res = index.resolve(&rel)?;
        let hit = res.top().ok_or_else(|| CanopyError::not_found(&rel))?;
        if hit.stat.kind != EntryKind::Symlink {
            return Err(CanopyError::InvalidPath(format!(
                "{} is not a symlink",
                rel.display()
            )));
        }
        let source = index
            .source(hit.layer)
            .ok_or_else(|| CanopyError::not_found(&rel))?;
        Ok(source.read_link(&rel)?)
    }

    pub fn remove(&self, path: &Path) -> Result<()> {
        let rel = normalize_rel(path)?;
        let _guards = self.write_guards(&[rel.as_path()]);
        let index = self.index();
        CopyUpEngine::new(&self.upper, &index).delete(&rel, false)
    }

    pub fn rmdir(&self, path: &Path) -> Result<()> {
        let rel = normalize_rel(path)?;
        let _guards = self.write_guards(&[rel.as_path()]);
        let index = self.index();
        CopyUpEngine::new(&self.upper, &index).delete(&rel, true)
    }

    pub fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from = normalize_rel(from)?;
        let to = normalize_rel(to)?;
        let _guards = self.write_guards(&[from.as_path(), to.as_path()]);
        let index = self.index();
        CopyUpEngine::new(&self.upper, &index).rename(&from, &to)
    }

    pub fn readdir(&self, path: &Path) -> Result<Vec<DirEntryInfo>> {
        let rel = normalize_rel(path)?;
        let _guards = self.read_guards(&rel);
        self.index().list(&rel)
    }

    /// Flush the upper copy of `path` to stable storage. Entries that were
    /// never copied up have nothing to flush.
    pub fn fsync(&self, path: &Path) -> Result<()> {
        let rel = normalize_rel(path)?;
        let _guards = self.read_guards(&rel);
        match self.upper.stat(&rel)? {
            Some(stat) if stat.kind == EntryKind::File || stat.kind.is_dir() => {
                fs::File::open(self.upper.path_of(&rel))?.sync_all()?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn get_xattr(&self, path: &Path, name: &OsStr) -> Result<Option<Vec<u8>>> {
        let rel = normalize_rel(path)?;
        let _guards = self.read_guards(&rel);
        let index = self.index();
        let res = index.resolve(&rel)?;
        let hit = res.top().ok_or_else(|| CanopyError::not_found(&rel))?;
        match index.source(hit.layer) {
            Some(source) => Ok(source.get_xattr(&rel, name)?),
            None => Ok(None),
        }
    }

    pub fn list_xattr(&self, path: &Path) -> Result<Vec<OsString>> {
        let rel = normalize_rel(path)?;
        let _guards = self.read_guards(&rel);
        let index = self.index();
        let res = index.resolve(&rel)?;
        let hit = res.top().ok_or_else(|| CanopyError::not_found(&rel))?;
        match index.source(hit.layer) {
            Some(source) => Ok(source.list_xattr(&rel)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn set_xattr(&self, path: &Path, name: &OsStr, value: &[u8]) -> Result<()> {
        let rel = normalize_rel(path)?;
        let _guards = self.write_guards(&[rel.as_path()]);
        let index = self.index();
        CopyUpEngine::new(&self.upper, &index).materialize(&rel, None)?;
        xattr::set(self.upper.path_of(&rel), name, value)?;
        Ok(())
    }

    pub fn remove_xattr(&self, path: &Path, name: &OsStr) -> Result<()> {
        let rel = normalize_rel(path)?;
        let _guards = self.write_guards(&[rel.as_path()]);
        let index = self.index();
        CopyUpEngine::new(&self.upper, &index).materialize(&rel, None)?;
        xattr::remove(self.upper.path_of(&rel), name)?;
        Ok(())
    }

    fn shared_guards(&self, changelist: &WritableLayer, rel: &Path) -> Vec<PathGuard> {
        changelist
            .locks()
            .lock_all(&lock_requests(&[rel], LockMode::Exclusive))
    }

    /// Replace `path` in the shared changelist, visible to every job attached
    /// to it. Concurrent writers to the same path each publish a complete
    /// file; the last one wins.
    pub fn write_shared(&self, path: &Path, data: &[u8]) -> Result<()> {
        let rel = normalize_rel(path)?;
        let changelist = self.shared_layer()?;
        let _guards = self.shared_guards(changelist, &rel);
        let index = PathIndex::below_upper(changelist, self.base.as_ref());
        CopyUpEngine::new(changelist, &index).replace(&rel, data)
    }

    /// Remove `path` from the shared changelist's view of the base.
    pub fn remove_shared(&self, path: &Path) -> Result<()> {
        let rel = normalize_rel(path)?;
        let changelist = self.shared_layer()?;
        let _guards = self.shared_guards(changelist, &rel);
        let index = PathIndex::below_upper(changelist, self.base.as_ref());
        let is_dir = Self::top_of(&index.resolve(&rel)?, &rel)?.kind.is_dir();
        CopyUpEngine::new(changelist, &index).delete(&rel, is_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::layer::HostBase;
    use crate::overlay::types::LayerKind;
    use tempfile::{tempdir, TempDir};

    fn stack_over(files: &[(&str, &str)]) -> (TempDir, LayerStack) {
        let dir = tempdir().unwrap();
        let base_root = dir.path().join("base");
        fs::create_dir_all(&base_root).unwrap();
        for (path, content) in files {
            let host = base_root.join(path);
            fs::create_dir_all(host.parent().unwrap()).unwrap();
            fs::write(host, content).unwrap();
        }
        let upper =
            Arc::new(WritableLayer::open(LayerKind::Upper, dir.path().join("upper")).unwrap());
        let base = HostBase::shared(base_root).unwrap();
        (dir, LayerStack::new("job", upper, None, base))
    }

    #[test]
    fn test_write_lands_in_upper_and_base_is_untouched() {
        let (dir, stack) = stack_over(&[("a/b.txt", "hello world")]);

        stack.write(Path::new("/a/b.txt"), 0, b"HELLO").unwrap();

        assert_eq!(stack.read_all(Path::new("a/b.txt")).unwrap(), b"HELLO world");
        assert_eq!(
            fs::read_to_string(dir.path().join("base/a/b.txt")).unwrap(),
            "hello world"
        );
    }

    #[test]
    fn test_truncate_copies_only_the_kept_prefix() {
        let (_dir, stack) = stack_over(&[("log.txt", "0123456789")]);

        stack.truncate(Path::new("log.txt"), 4).unwrap();

        assert_eq!(stack.read_all(Path::new("log.txt")).unwrap(), b"0123");
        assert_eq!(stack.lookup(Path::new("log.txt")).unwrap().size, 4);
    }

    #[test]
    fn test_set_attr_mode_copies_up() {
        let (_dir, stack) = stack_over(&[("run.sh", "#!/bin/sh")]);

        let stat = stack
            .set_attr(
                Path::new("run.sh"),
                &SetAttr {
                    mode: Some(0o755),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(stat.perm, 0o755);
        let res = stack.resolve(Path::new("run.sh")).unwrap();
        assert_eq!(res.top().unwrap().layer, LayerKind::Upper);
    }

    #[test]
    fn test_remove_then_recreate() {
        let (_dir, stack) = stack_over(&[("note.md", "base")]);

        stack.remove(Path::new("note.md")).unwrap();
        assert!(matches!(
            stack.lookup(Path::new("note.md")),
            Err(CanopyError::NotFound(_))
        ));

        stack.create(Path::new("note.md"), 0o644).unwrap();
        stack.write(Path::new("note.md"), 0, b"fresh").unwrap();
        assert_eq!(stack.read_all(Path::new("note.md")).unwrap(), b"fresh");
    }

    #[test]
    fn test_shared_write_without_changelist_is_not_found() {
        let (_dir, stack) = stack_over(&[]);
        assert!(matches!(
            stack.write_shared(Path::new("x"), b"x"),
            Err(CanopyError::NotFound(_))
        ));
    }

    #[test]
    fn test_symlink_and_read_link() {
        let (_dir, stack) = stack_over(&[("target.txt", "t")]);

        stack
            .symlink(Path::new("link"), Path::new("target.txt"))
            .unwrap();

        assert_eq!(
            stack.read_link(Path::new("link")).unwrap(),
            PathBuf::from("target.txt")
        );
        assert!(matches!(
            stack.read_link(Path::new("target.txt")),
            Err(CanopyError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_locks_are_released_after_operations() {
        let (_dir, stack) = stack_over(&[("f", "x")]);
        stack.write(Path::new("f"), 0, b"y").unwrap();
        let _ = stack.remove(Path::new("missing"));
        assert_eq!(stack.upper().locks().active(), 0);
    }
}
