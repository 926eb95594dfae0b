//! Copy-up: materializing lower entries into a writable layer.
//!
//! Every mutation that touches an entry living below the target layer goes
//! through `CopyUpEngine`. Content is staged in the layer's `work/` area and
//! published with a single rename, so a reader either sees the old entry or
//! the complete copy. Any step that fails unwinds the steps before it: no
//! staged files, no half-built parent directories and no whiteout records
//! survive a failed call.

use crate::error::{CanopyError, Result};
use crate::overlay::fault::FaultOp;
use crate::overlay::layer::{BaseLayer, WritableLayer};
use crate::overlay::path_index::{PathIndex, Resolution};
use crate::overlay::types::{parent_of, EntryKind, EntryStat, LayerKind};
use std::fs::{self, FileTimes, OpenOptions, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

const COPY_CHUNK: usize = 64 * 1024;
const DEFAULT_FILE_PERM: u32 = 0o644;

/// Undo steps, run in reverse order when dropped without `commit`.
#[derive(Default)]
pub(crate) struct Rollback {
    steps: Vec<Box<dyn FnOnce()>>,
}

impl Rollback {
    pub(crate) fn push(&mut self, step: impl FnOnce() + 'static) {
        self.steps.push(Box::new(step));
    }

    pub(crate) fn commit(mut self) {
        self.steps.clear();
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        while let Some(step) = self.steps.pop() {
            step();
        }
    }
}

/// What `CopyUpEngine::create` should make.
#[derive(Debug, Clone, Copy)]
pub enum NewEntry<'b> {
    File { perm: u32 },
    Directory { perm: u32 },
    Symlink { target: &'b Path },
}

pub(crate) fn remove_any(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn discard(path: &Path) {
    if let Err(e) = remove_any(path) {
        tracing::warn!("Failed to remove {}: {}", path.display(), e);
    }
}

/// Map a host error from the final step of an operation.
pub(crate) fn fs_error(rel: &Path, err: io::Error) -> CanopyError {
    match err.kind() {
        io::ErrorKind::NotFound => CanopyError::not_found(rel),
        io::ErrorKind::AlreadyExists => CanopyError::AlreadyExists(rel.to_path_buf()),
        _ => CanopyError::Io(err),
    }
}

fn copy_xattrs(source: &dyn BaseLayer, rel: &Path, staged: &Path) {
    let names = match source.list_xattr(rel) {
        Ok(names) => names,
        Err(_) => return,
    };
    for name in names {
        if let Ok(Some(value)) = source.get_xattr(rel, &name) {
            if let Err(e) = xattr::set(staged, &name, &value) {
                tracing::debug!("xattr {:?} not copied for {}: {}", name, rel.display(), e);
            }
        }
    }
}

pub(crate) struct CopyUpEngine<'a> {
    target: &'a WritableLayer,
    index: &'a PathIndex<'a>,
}

impl<'a> CopyUpEngine<'a> {
    pub(crate) fn new(target: &'a WritableLayer, index: &'a PathIndex<'a>) -> Self {
        CopyUpEngine { target, index }
    }

    fn held_by_target(&self, res: &Resolution) -> bool {
        res.in_layer(self.target.kind()).is_some()
    }

    /// Copy the entry visible at `rel` into the target unless the target
    /// already holds it. With `limit`, at most that many bytes of file
    /// content are copied.
    pub(crate) fn materialize(&self, rel: &Path, limit: Option<u64>) -> Result<()> {
        let res = self.index.resolve(rel)?;
        let top = res.top().ok_or_else(|| CanopyError::not_found(rel))?;
        if top.layer == self.target.kind() {
            return Ok(());
        }

        let mut undo = Rollback::default();
        self.ensure_parents(rel, &mut undo)?;
        self.copy_entry(rel, top.layer, &top.stat, limit)?;
        undo.commit();

        tracing::debug!(
            "copied up {} from {} into {}",
            rel.display(),
            top.layer.as_str(),
            self.target.kind().as_str()
        );
        Ok(())
    }

    /// Create every missing ancestor of `rel` in the target, mirroring the
    /// permissions of the visible lower directory.
    fn ensure_parents(&self, rel: &Path, undo: &mut Rollback) -> Result<()> {
        let parent = match parent_of(rel) {
            Some(parent) => parent,
            None => return Ok(()),
        };
        let mut chain: Vec<&Path> = parent
            .ancestors()
            .filter(|p| !p.as_os_str().is_empty())
            .collect();
        chain.reverse();

        for dir in chain {
            match self.target.stat(dir)? {
                Some(stat) if stat.kind.is_dir() => continue,
                Some(_) => return Err(CanopyError::NotADirectory(dir.to_path_buf())),
                None => {}
            }
            let res = self.index.resolve(dir)?;
            let perm = match res.top() {
                Some(hit) if hit.stat.kind.is_dir() => hit.stat.perm,
                Some(_) => return Err(CanopyError::NotADirectory(dir.to_path_buf())),
                None => return Err(CanopyError::not_found(dir)),
            };
            self.make_parent(dir, perm, undo)?;
        }
        Ok(())
    }

    fn make_parent(&self, dir: &Path, perm: u32, undo: &mut Rollback) -> Result<()> {
        let host = self.target.path_of(dir);
        self.target
            .faults()
            .check(FaultOp::CreateDir)
            .map_err(|e| CanopyError::copy_up(dir, e))?;

        match fs::create_dir(&host) {
            Ok(()) => {}
            // Raced with another copy-up building the same skeleton.
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(()),
            Err(e) => return Err(CanopyError::copy_up(dir, e)),
        }

        // Every operation below `dir` holds a shared lock on it; leave the
        // directory alone while anyone besides this call does.
        let locks = self.target.locks().clone();
        let (lock_path, undo_path) = (dir.to_path_buf(), host.clone());
        undo.push(move || {
            locks.with_sole_holder(&lock_path, || {
                let _ = fs::remove_dir(&undo_path);
            });
        });
        fs::set_permissions(&host, Permissions::from_mode(perm))
            .map_err(|e| CanopyError::copy_up(dir, e))
    }

    fn copy_entry(
        &self,
        rel: &Path,
        from: LayerKind,
        stat: &EntryStat,
        limit: Option<u64>,
    ) -> Result<()> {
        let source = self
            .index
            .source(from)
            .ok_or_else(|| CanopyError::not_found(rel))?;
        let staged = self.target.staging_path();

        let result = self
            .stage_entry(source, rel, stat, limit, &staged)
            .and_then(|()| self.publish(&staged, &self.target.path_of(rel)));

        if let Err(e) = result {
            discard(&staged);
            return Err(CanopyError::copy_up(rel, e));
        }
        Ok(())
    }

    fn stage_entry(
        &self,
        source: &dyn BaseLayer,
        rel: &Path,
        stat: &EntryStat,
        limit: Option<u64>,
        staged: &Path,
    ) -> io::Result<()> {
        match stat.kind {
            EntryKind::File => self.stage_file(source, rel, stat, limit, staged),
            EntryKind::Symlink => {
                let link = source.read_link(rel)?;
                std::os::unix::fs::symlink(link, staged)
            }
            EntryKind::Directory => {
                fs::create_dir(staged)?;
                fs::set_permissions(staged, Permissions::from_mode(stat.perm))?;
                copy_xattrs(source, rel, staged);
                Ok(())
            }
            EntryKind::Special => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "special files cannot be copied up",
            )),
        }
    }

    fn stage_file(
        &self,
        source: &dyn BaseLayer,
        rel: &Path,
        stat: &EntryStat,
        limit: Option<u64>,
        staged: &Path,
    ) -> io::Result<()> {
        let mut out = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(staged)?;

        let total = limit.map_or(stat.size, |l| l.min(stat.size));
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut offset = 0u64;
        while offset < total {
            let want = ((total - offset) as usize).min(COPY_CHUNK);
            let n = source.read_at(rel, offset, &mut buf[..want])?;
            if n == 0 {
                break;
            }
            self.target.faults().check(FaultOp::CopyData)?;
            out.write_all(&buf[..n])?;
            offset += n as u64;
        }

        out.sync_all()?;
        out.set_permissions(Permissions::from_mode(stat.perm))?;
        out.set_times(
            FileTimes::new()
                .set_accessed(stat.atime)
                .set_modified(stat.mtime),
        )?;
        copy_xattrs(source, rel, staged);
        Ok(())
    }

    fn publish(&self, staged: &Path, host: &Path) -> io::Result<()> {
        self.target.faults().check(FaultOp::Commit)?;
        fs::rename(staged, host)
    }

    /// Move the target's own entry at `rel` into the staging area so it can
    /// be restored if a later step fails.
    fn set_aside(&self, rel: &Path, undo: &mut Rollback) -> Result<PathBuf> {
        let host = self.target.path_of(rel);
        let aside = self.target.staging_path();
        fs::rename(&host, &aside).map_err(|e| fs_error(rel, e))?;
        let restore_from = aside.clone();
        undo.push(move || {
            let _ = fs::rename(&restore_from, &host);
        });
        Ok(aside)
    }

    /// Create a new entry at `rel`. The path must not be visible. A whiteout
    /// already recorded for `rel` stays, making the new entry opaque.
    pub(crate) fn create(&self, rel: &Path, entry: NewEntry<'_>) -> Result<()> {
        if rel.as_os_str().is_empty() || self.index.resolve(rel)?.is_visible() {
            return Err(CanopyError::AlreadyExists(rel.to_path_buf()));
        }

        let mut undo = Rollback::default();
        self.ensure_parents(rel, &mut undo)?;

        let host = self.target.path_of(rel);
        let created = match entry {
            NewEntry::File { perm } => OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(perm)
                .open(&host)
                .and_then(|file| file.set_permissions(Permissions::from_mode(perm))),
            NewEntry::Directory { perm } => fs::create_dir(&host)
                .and_then(|()| fs::set_permissions(&host, Permissions::from_mode(perm))),
            NewEntry::Symlink { target } => std::os::unix::fs::symlink(target, &host),
        };

        if let Err(e) = created {
            if e.kind() != io::ErrorKind::AlreadyExists {
                let _ = remove_any(&host);
            }
            return Err(fs_error(rel, e));
        }

        undo.commit();
        Ok(())
    }

    /// Replace the content at `rel` with `data` in one atomic step, creating
    /// the file if needed.
    pub(crate) fn replace(&self, rel: &Path, data: &[u8]) -> Result<()> {
        if rel.as_os_str().is_empty() {
            return Err(CanopyError::IsADirectory(rel.to_path_buf()));
        }
        let res = self.index.resolve(rel)?;
        let perm = match res.top() {
            Some(hit) if hit.stat.kind.is_dir() => {
                return Err(CanopyError::IsADirectory(rel.to_path_buf()))
            }
            Some(hit) if hit.stat.kind == EntryKind::File => hit.stat.perm,
            _ => DEFAULT_FILE_PERM,
        };

        let mut undo = Rollback::default();
        self.ensure_parents(rel, &mut undo)?;

        let staged = self.target.staging_path();
        let result = (|| -> io::Result<()> {
            let mut out = OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&staged)?;
            self.target.faults().check(FaultOp::CopyData)?;
            out.write_all(data)?;
            out.sync_all()?;
            out.set_permissions(Permissions::from_mode(perm))?;
            self.publish(&staged, &self.target.path_of(rel))
        })();

        if let Err(e) = result {
            discard(&staged);
            return Err(CanopyError::copy_up(rel, e));
        }
        undo.commit();
        Ok(())
    }

    /// Remove the entry at `rel`: the target's own copy is deleted and a
    /// whiteout hides anything still visible below.
    pub(crate) fn delete(&self, rel: &Path, expect_dir: bool) -> Result<()> {
        if rel.as_os_str().is_empty() {
            return Err(CanopyError::InvalidPath("cannot remove the mount root".into()));
        }
        let res = self.index.resolve(rel)?;
        let top = res.top().ok_or_else(|| CanopyError::not_found(rel))?;
        let is_dir = top.stat.kind.is_dir();
        if expect_dir && !is_dir {
            return Err(CanopyError::NotADirectory(rel.to_path_buf()));
        }
        if !expect_dir && is_dir {
            return Err(CanopyError::IsADirectory(rel.to_path_buf()));
        }
        if is_dir && !self.index.is_empty_dir(rel)? {
            return Err(CanopyError::NotEmpty(rel.to_path_buf()));
        }

        let lower_visible = res.visible_below(self.target.kind());
        let whiteouts = self.target.whiteouts();
        let mut undo = Rollback::default();

        let aside = if self.held_by_target(&res) {
            Some(self.set_aside(rel, &mut undo)?)
        } else {
            None
        };

        if lower_visible {
            whiteouts
                .insert(rel, self.target.faults())
                .map_err(|e| CanopyError::copy_up(rel, e))?;
        } else if is_dir && whiteouts.has_below(rel) {
            whiteouts
                .update(self.target.faults(), |set| {
                    set.retain(|p| !p.starts_with(rel) || p == rel)
                })
                .map_err(|e| CanopyError::copy_up(rel, e))?;
        }

        undo.commit();
        if let Some(aside) = aside {
            discard(&aside);
        }
        Ok(())
    }

    /// Rename `from` to `to` inside the target layer.
    ///
    /// A source still visible through a lower layer is materialized first
    /// (a directory as its complete merged subtree), and a whiteout on `from`
    /// hides the lower copy afterwards.
    pub(crate) fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        if from.as_os_str().is_empty() || to.as_os_str().is_empty() {
            return Err(CanopyError::InvalidPath("cannot rename the mount root".into()));
        }
        if from == to {
            return Ok(());
        }
        if to.starts_with(from) {
            return Err(CanopyError::InvalidPath(format!(
                "cannot move {} into itself",
                from.display()
            )));
        }

        let src = self.index.resolve(from)?;
        let src_top = src.top().ok_or_else(|| CanopyError::not_found(from))?;
        let src_is_dir = src_top.stat.kind.is_dir();
        let dst = self.index.resolve(to)?;
        if let Some(dst_top) = dst.top() {
            let dst_is_dir = dst_top.stat.kind.is_dir();
            if src_is_dir && !dst_is_dir {
                return Err(CanopyError::NotADirectory(to.to_path_buf()));
            }
            if !src_is_dir && dst_is_dir {
                return Err(CanopyError::IsADirectory(to.to_path_buf()));
            }
            if dst_is_dir && !self.index.is_empty_dir(to)? {
                return Err(CanopyError::NotEmpty(to.to_path_buf()));
            }
        }

        let kind = self.target.kind();
        let src_lower = src.visible_below(kind);
        let src_held = self.held_by_target(&src);
        let mut undo = Rollback::default();
        let mut asides = Vec::new();

        if src_is_dir && src_lower {
            if let Some(old) = self.materialize_tree(from, src_held, &mut undo)? {
                asides.push(old);
            }
        } else if !src_held {
            self.ensure_parents(from, &mut undo)?;
            self.copy_entry(from, src_top.layer, &src_top.stat, None)?;
            let copied = self.target.path_of(from);
            undo.push(move || {
                let _ = remove_any(&copied);
            });
        }

        self.ensure_parents(to, &mut undo)?;
        if self.held_by_target(&dst) {
            asides.push(self.set_aside(to, &mut undo)?);
        }

        let from_host = self.target.path_of(from);
        let to_host = self.target.path_of(to);
        self.publish(&from_host, &to_host)
            .map_err(|e| CanopyError::copy_up(from, e))?;
        undo.push(move || {
            let _ = fs::rename(&to_host, &from_host);
        });

        let whiteouts = self.target.whiteouts();
        let dst_opaque = src_is_dir && dst.visible_below(kind);
        if src_lower || dst_opaque || whiteouts.has_below(from) {
            whiteouts
                .update(self.target.faults(), |set| {
                    let moved: Vec<PathBuf> = set
                        .iter()
                        .filter(|p| p.starts_with(from) && p.as_path() != from)
                        .cloned()
                        .collect();
                    for old in moved {
                        set.remove(&old);
                        if let Ok(suffix) = old.strip_prefix(from) {
                            set.insert(to.join(suffix));
                        }
                    }
                    if src_lower {
                        set.insert(from.to_path_buf());
                    }
                    if dst_opaque {
                        set.insert(to.to_path_buf());
                    }
                })
                .map_err(|e| CanopyError::copy_up(from, e))?;
        }

        undo.commit();
        for aside in asides {
            discard(&aside);
        }
        Ok(())
    }

    /// Build the merged subtree of directory `rel` in the staging area and
    /// swap it into the target in one rename. Returns the target's previous
    /// copy, set aside, if there was one.
    fn materialize_tree(
        &self,
        rel: &Path,
        held: bool,
        undo: &mut Rollback,
    ) -> Result<Option<PathBuf>> {
        let staged = self.target.staging_path();
        if let Err(e) = self.stage_tree(rel, &staged) {
            discard(&staged);
            return Err(e);
        }

        let staged_cleanup = staged.clone();
        undo.push(move || {
            let _ = remove_any(&staged_cleanup);
        });

        self.ensure_parents(rel, undo)?;
        let old = if held {
            Some(self.set_aside(rel, undo)?)
        } else {
            None
        };

        let host = self.target.path_of(rel);
        self.publish(&staged, &host)
            .map_err(|e| CanopyError::copy_up(rel, e))?;
        undo.push(move || {
            let _ = remove_any(&host);
        });

        tracing::debug!("materialized directory {}", rel.display());
        Ok(old)
    }

    fn stage_tree(&self, rel: &Path, staged: &Path) -> Result<()> {
        let res = self.index.resolve(rel)?;
        let top = res.top().ok_or_else(|| CanopyError::not_found(rel))?;
        fs::create_dir(staged).map_err(|e| CanopyError::copy_up(rel, e))?;

        for entry in self.index.list(rel)? {
            let child_rel = rel.join(&entry.name);
            let child_staged = staged.join(&entry.name);
            let child = self.index.resolve(&child_rel)?;
            let hit = child
                .top()
                .ok_or_else(|| CanopyError::not_found(&child_rel))?;

            if hit.stat.kind.is_dir() {
                self.stage_tree(&child_rel, &child_staged)?;
            } else {
                let source = self
                    .index
                    .source(hit.layer)
                    .ok_or_else(|| CanopyError::not_found(&child_rel))?;
                self.stage_entry(source, &child_rel, &hit.stat, None, &child_staged)
                    .map_err(|e| CanopyError::copy_up(&child_rel, e))?;
            }
        }

        fs::set_permissions(staged, Permissions::from_mode(top.stat.perm))
            .map_err(|e| CanopyError::copy_up(rel, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::fault::FaultRule;
    use crate::overlay::layer::HostBase;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        base_root: PathBuf,
        upper: WritableLayer,
        base: HostBase,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let base_root = dir.path().join("base");
        fs::create_dir_all(base_root.join("pkg/nested")).unwrap();
        fs::write(base_root.join("pkg/mod.rs"), b"base module").unwrap();
        fs::write(base_root.join("pkg/nested/deep.rs"), b"deep").unwrap();
        fs::write(base_root.join("top.txt"), b"top").unwrap();
        let upper = WritableLayer::open(LayerKind::Upper, dir.path().join("upper")).unwrap();
        let base = HostBase::new(base_root.clone()).unwrap();
        Fixture {
            _dir: dir,
            base_root,
            upper,
            base,
        }
    }

    #[test]
    fn test_materialize_builds_parent_skeleton() {
        let fx = fixture();
        let index = PathIndex::new(&fx.upper, None, &fx.base);
        let engine = CopyUpEngine::new(&fx.upper, &index);

        engine
            .materialize(Path::new("pkg/nested/deep.rs"), None)
            .unwrap();

        assert!(fx.upper.path_of(Path::new("pkg/nested")).is_dir());
        assert_eq!(
            fs::read(fx.upper.path_of(Path::new("pkg/nested/deep.rs"))).unwrap(),
            b"deep"
        );
        assert!(!fx.upper.path_of(Path::new("pkg/mod.rs")).exists());
    }

    #[test]
    fn test_failed_copy_leaves_no_trace() {
        let fx = fixture();
        fx.upper
            .faults()
            .add_rule(FaultRule::new(FaultOp::CopyData));
        let index = PathIndex::new(&fx.upper, None, &fx.base);
        let engine = CopyUpEngine::new(&fx.upper, &index);

        let err = engine
            .materialize(Path::new("pkg/nested/deep.rs"), None)
            .unwrap_err();
        assert!(matches!(err, CanopyError::CopyUpFailed { .. }));

        assert!(!fx.upper.path_of(Path::new("pkg")).exists());
        assert_eq!(
            fs::read_dir(fx.upper.root().join("work")).unwrap().count(),
            0
        );
    }

    #[test]
    fn test_failed_copy_keeps_parents_other_operations_hold() {
        use crate::overlay::locks::LockMode;

        let fx = fixture();
        let locks = fx.upper.locks();
        let _mine = locks.lock_all(&[
            (PathBuf::from("pkg"), LockMode::Shared),
            (PathBuf::from("pkg/nested"), LockMode::Shared),
            (PathBuf::from("pkg/nested/deep.rs"), LockMode::Exclusive),
        ]);
        // A concurrent copy-up of pkg/mod.rs relies on `pkg` existing.
        let _other = locks.lock(Path::new("pkg"), LockMode::Shared);

        fx.upper
            .faults()
            .add_rule(FaultRule::new(FaultOp::CopyData));
        let index = PathIndex::new(&fx.upper, None, &fx.base);
        let engine = CopyUpEngine::new(&fx.upper, &index);
        assert!(engine
            .materialize(Path::new("pkg/nested/deep.rs"), None)
            .is_err());

        assert!(fx.upper.path_of(Path::new("pkg")).is_dir());
        assert!(!fx.upper.path_of(Path::new("pkg/nested")).exists());
    }

    #[test]
    fn test_delete_lower_entry_records_whiteout() {
        let fx = fixture();
        let index = PathIndex::new(&fx.upper, None, &fx.base);
        let engine = CopyUpEngine::new(&fx.upper, &index);

        engine.delete(Path::new("top.txt"), false).unwrap();

        assert!(fx.upper.whiteouts().contains(Path::new("top.txt")));
        assert!(!index.resolve(Path::new("top.txt")).unwrap().is_visible());
        assert!(fx.base_root.join("top.txt").exists());
    }

    #[test]
    fn test_delete_rejected_by_index_fault_restores_entry() {
        let fx = fixture();
        let index = PathIndex::new(&fx.upper, None, &fx.base);
        let engine = CopyUpEngine::new(&fx.upper, &index);
        engine.materialize(Path::new("top.txt"), None).unwrap();

        fx.upper
            .faults()
            .add_rule(FaultRule::new(FaultOp::Whiteout));
        assert!(engine.delete(Path::new("top.txt"), false).is_err());

        assert_eq!(
            fs::read(fx.upper.path_of(Path::new("top.txt"))).unwrap(),
            b"top"
        );
        assert!(fx.upper.whiteouts().is_empty());
    }

    #[test]
    fn test_rename_lower_directory_moves_merged_tree() {
        let fx = fixture();
        let index = PathIndex::new(&fx.upper, None, &fx.base);
        let engine = CopyUpEngine::new(&fx.upper, &index);
        engine
            .replace(Path::new("pkg/added.rs"), b"upper only")
            .unwrap();

        engine.rename(Path::new("pkg"), Path::new("moved")).unwrap();

        assert!(!index.resolve(Path::new("pkg")).unwrap().is_visible());
        let names: Vec<String> = index
            .list(Path::new("moved"))
            .unwrap()
            .into_iter()
            .map(|e| e.name.to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["added.rs", "mod.rs", "nested"]);
        assert_eq!(
            fs::read(fx.upper.path_of(Path::new("moved/nested/deep.rs"))).unwrap(),
            b"deep"
        );
        assert!(fx.base_root.join("pkg/mod.rs").exists());
    }

    #[test]
    fn test_create_over_whiteout_is_opaque() {
        let fx = fixture();
        let index = PathIndex::new(&fx.upper, None, &fx.base);
        let engine = CopyUpEngine::new(&fx.upper, &index);

        engine
            .delete(Path::new("pkg/nested/deep.rs"), false)
            .unwrap();
        engine.delete(Path::new("pkg/nested"), true).unwrap();
        engine
            .create(Path::new("pkg/nested"), NewEntry::Directory { perm: 0o755 })
            .unwrap();

        assert!(index.list(Path::new("pkg/nested")).unwrap().is_empty());
    }
}
