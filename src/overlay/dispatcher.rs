//! FUSE adapter for one mounted job.
//!
//! `FuseDispatcher` implements `fuser::Filesystem`. Each kernel call is
//! moved onto a tokio blocking worker, where `DispatchCore` runs it against
//! the job's `LayerStack`. Calls on independent paths therefore proceed in
//! parallel while the stack's path locks serialize calls on the same path.
//!
//! `MountControl` carries the mount state machine. Calls arriving once the
//! mount is `Unmounting` or `Unmounted` are refused with `ESTALE`, and the
//! unmount path waits for in-flight calls to drain before tearing down.

use crate::overlay::convert::{error_to_errno, kind_to_filetype, stat_to_fileattr};
use crate::overlay::file_handle::HandleTable;
use crate::overlay::inode_table::InodeTable;
use crate::overlay::stack::LayerStack;
use crate::overlay::types::{EntryKind, SetAttr};
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

type CallResult<T> = std::result::Result<T, i32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountState {
    Mounting,
    Active,
    Unmounting,
    Unmounted,
}

impl MountState {
    pub fn accepts_calls(self) -> bool {
        matches!(self, MountState::Mounting | MountState::Active)
    }
}

#[derive(Debug)]
struct ControlState {
    state: MountState,
    inflight: usize,
}

/// Mount state plus the count of calls currently inside the stack.
#[derive(Debug)]
pub struct MountControl {
    inner: Mutex<ControlState>,
    drained: Condvar,
}

/// One admitted call; dropping it lets a pending unmount proceed.
pub struct CallGuard {
    control: Arc<MountControl>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        let mut inner = self.control.inner.lock();
        inner.inflight -= 1;
        if inner.inflight == 0 {
            self.control.drained.notify_all();
        }
    }
}

impl MountControl {
    pub fn new() -> Arc<Self> {
        Arc::new(MountControl {
            inner: Mutex::new(ControlState {
                state: MountState::Mounting,
                inflight: 0,
            }),
            drained: Condvar::new(),
        })
    }

    pub fn state(&self) -> MountState {
        self.inner.lock().state
    }

    pub fn inflight(&self) -> usize {
        self.inner.lock().inflight
    }

    /// `Mounting -> Active`, once the mount handshake succeeded.
    pub fn activate(&self) {
        let mut inner = self.inner.lock();
        if inner.state == MountState::Mounting {
            inner.state = MountState::Active;
        }
    }

    pub fn enter(self: &Arc<Self>) -> CallResult<CallGuard> {
        let mut inner = self.inner.lock();
        if !inner.state.accepts_calls() {
            return Err(libc::ESTALE);
        }
        inner.inflight += 1;
        Ok(CallGuard {
            control: Arc::clone(self),
        })
    }

    /// Stop admitting calls. Calls already admitted keep running.
    pub fn begin_unmount(&self) {
        let mut inner = self.inner.lock();
        if inner.state != MountState::Unmounted {
            inner.state = MountState::Unmounting;
        }
    }

    /// Wait up to `timeout` for admitted calls to finish.
    pub fn drain(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        if inner.inflight == 0 {
            return true;
        }
        let deadline = std::time::Instant::now() + timeout;
        while inner.inflight > 0 {
            if self.drained.wait_until(&mut inner, deadline).timed_out() {
                return inner.inflight == 0;
            }
        }
        true
    }

    pub fn finish_unmount(&self) {
        self.inner.lock().state = MountState::Unmounted;
    }
}

/// The synchronous half of the dispatcher: every FUSE operation as a
/// method returning either its reply payload or an errno.
pub struct DispatchCore {
    stack: Arc<LayerStack>,
    control: Arc<MountControl>,
    inodes: InodeTable,
    handles: HandleTable,
    ttl: Duration,
}

/// One entry of a directory listing as handed to the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntry {
    pub ino: u64,
    pub kind: FileType,
    pub name: OsString,
}

fn errno(err: crate::error::CanopyError) -> i32 {
    error_to_errno(&err)
}

fn system_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

impl DispatchCore {
    pub fn new(stack: Arc<LayerStack>, control: Arc<MountControl>, ttl: Duration) -> Self {
        DispatchCore {
            stack,
            control,
            inodes: InodeTable::new(),
            handles: HandleTable::default(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn stack(&self) -> &Arc<LayerStack> {
        &self.stack
    }

    pub fn control(&self) -> &Arc<MountControl> {
        &self.control
    }

    fn path(&self, ino: u64) -> CallResult<PathBuf> {
        self.inodes.path_of(ino).ok_or(libc::ENOENT)
    }

    fn child(&self, parent: u64, name: &OsStr) -> CallResult<PathBuf> {
        if name.is_empty() || name == "." || name == ".." || name.as_bytes().contains(&b'/') {
            return Err(libc::EINVAL);
        }
        self.inodes.child_path(parent, name).ok_or(libc::ENOENT)
    }

    fn attr_for(&self, path: &Path, ino: u64) -> CallResult<FileAttr> {
        let stat = self.stack.lookup(path).map_err(errno)?;
        Ok(stat_to_fileattr(&stat, ino))
    }

    /// Register a newly visible entry with the kernel and return its attributes.
    fn entry(&self, path: &Path) -> CallResult<FileAttr> {
        let stat = self.stack.lookup(path).map_err(errno)?;
        let ino = self.inodes.lookup(path);
        Ok(stat_to_fileattr(&stat, ino))
    }

    pub fn lookup(&self, parent: u64, name: &OsStr) -> CallResult<FileAttr> {
        let _call = self.control.enter()?;
        let path = self.child(parent, name)?;
        self.entry(&path)
    }

    pub fn forget(&self, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    pub fn getattr(&self, ino: u64) -> CallResult<FileAttr> {
        let _call = self.control.enter()?;
        let path = self.path(ino)?;
        self.attr_for(&path, ino)
    }

    pub fn setattr(&self, ino: u64, attr: &SetAttr) -> CallResult<FileAttr> {
        let _call = self.control.enter()?;
        let path = self.path(ino)?;
        let stat = self.stack.set_attr(&path, attr).map_err(errno)?;
        Ok(stat_to_fileattr(&stat, ino))
    }

    pub fn readlink(&self, ino: u64) -> CallResult<Vec<u8>> {
        let _call = self.control.enter()?;
        let path = self.path(ino)?;
        let target = self.stack.read_link(&path).map_err(errno)?;
        Ok(target.into_os_string().into_vec())
    }

    pub fn mkdir(&self, parent: u64, name: &OsStr, mode: u32) -> CallResult<FileAttr> {
        let _call = self.control.enter()?;
        let path = self.child(parent, name)?;
        self.stack.mkdir(&path, mode & 0o7777).map_err(errno)?;
        self.entry(&path)
    }

    pub fn symlink(&self, parent: u64, name: &OsStr, target: &Path) -> CallResult<FileAttr> {
        let _call = self.control.enter()?;
        let path = self.child(parent, name)?;
        self.stack.symlink(&path, target).map_err(errno)?;
        self.entry(&path)
    }

    pub fn unlink(&self, parent: u64, name: &OsStr) -> CallResult<()> {
        let _call = self.control.enter()?;
        let path = self.child(parent, name)?;
        self.stack.remove(&path).map_err(errno)?;
        self.inodes.unlink(&path);
        Ok(())
    }

    pub fn rmdir(&self, parent: u64, name: &OsStr) -> CallResult<()> {
        let _call = self.control.enter()?;
        let path = self.child(parent, name)?;
        self.stack.rmdir(&path).map_err(errno)?;
        self.inodes.unlink(&path);
        Ok(())
    }

    pub fn rename(
        &self,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> CallResult<()> {
        let _call = self.control.enter()?;
        let from = self.child(parent, name)?;
        let to = self.child(new_parent, new_name)?;
        self.stack.rename(&from, &to).map_err(errno)?;
        self.inodes.rename(&from, &to);
        Ok(())
    }

    pub fn open(&self, ino: u64, flags: i32) -> CallResult<u64> {
        let _call = self.control.enter()?;
        let path = self.path(ino)?;
        // O_RDONLY is 0, so anything else asks for write access
        let writable = (flags & libc::O_ACCMODE) != libc::O_RDONLY;
        if writable && flags & libc::O_TRUNC != 0 {
            // One locked step: nothing of the lower content is copied.
            self.stack.truncate(&path, 0).map_err(errno)?;
        } else if writable {
            self.stack.copy_up(&path).map_err(errno)?;
        } else {
            self.stack.lookup(&path).map_err(errno)?;
        }
        Ok(self.handles.open(ino, writable))
    }

    pub fn create(
        &self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        flags: i32,
    ) -> CallResult<(FileAttr, u64)> {
        let _call = self.control.enter()?;
        let path = self.child(parent, name)?;
        match self.stack.create(&path, mode & 0o7777) {
            Ok(_) => {}
            Err(crate::error::CanopyError::AlreadyExists(_)) if flags & libc::O_EXCL == 0 => {
                if flags & libc::O_TRUNC != 0 {
                    self.stack.truncate(&path, 0).map_err(errno)?;
                } else {
                    self.stack.copy_up(&path).map_err(errno)?;
                }
            }
            Err(e) => return Err(errno(e)),
        }
        let attr = self.entry(&path)?;
        let fh = self.handles.open(attr.ino, true);
        Ok((attr, fh))
    }

    pub fn read(&self, ino: u64, offset: i64, size: u32) -> CallResult<Vec<u8>> {
        let _call = self.control.enter()?;
        if offset < 0 {
            return Err(libc::EINVAL);
        }
        let path = self.path(ino)?;
        self.stack
            .read(&path, offset as u64, size as usize)
            .map_err(errno)
    }

    pub fn write(&self, ino: u64, fh: u64, offset: i64, data: &[u8]) -> CallResult<u32> {
        let _call = self.control.enter()?;
        if offset < 0 {
            return Err(libc::EINVAL);
        }
        match self.handles.get(fh) {
            Some(handle) if handle.writable => {}
            Some(_) => return Err(libc::EBADF),
            None => return Err(libc::EBADF),
        }
        let path = self.path(ino)?;
        let written = self
            .stack
            .write(&path, offset as u64, data)
            .map_err(errno)?;
        Ok(written as u32)
    }

    pub fn flush(&self, fh: u64) -> CallResult<()> {
        let _call = self.control.enter()?;
        self.handles.get(fh).map(|_| ()).ok_or(libc::EBADF)
    }

    pub fn release(&self, fh: u64) -> CallResult<()> {
        // Releases run even while unmounting so handles never leak.
        self.handles.release(fh);
        Ok(())
    }

    pub fn fsync(&self, ino: u64) -> CallResult<()> {
        let _call = self.control.enter()?;
        let path = self.path(ino)?;
        self.stack.fsync(&path).map_err(errno)
    }

    pub fn opendir(&self, ino: u64) -> CallResult<u64> {
        let _call = self.control.enter()?;
        let path = self.path(ino)?;
        let stat = self.stack.lookup(&path).map_err(errno)?;
        if stat.kind != EntryKind::Directory {
            return Err(libc::ENOTDIR);
        }
        Ok(self.handles.open(ino, false))
    }

    /// Full listing of the directory, including `.` and `..`.
    pub fn readdir(&self, ino: u64) -> CallResult<Vec<ListedEntry>> {
        let _call = self.control.enter()?;
        let path = self.path(ino)?;
        let entries = self.stack.readdir(&path).map_err(errno)?;

        let parent_ino = crate::overlay::types::parent_of(&path)
            .and_then(|p| self.inodes.ino_of(p))
            .unwrap_or(fuser::FUSE_ROOT_ID);

        let mut listed = Vec::with_capacity(entries.len() + 2);
        listed.push(ListedEntry {
            ino,
            kind: FileType::Directory,
            name: OsString::from("."),
        });
        listed.push(ListedEntry {
            ino: parent_ino,
            kind: FileType::Directory,
            name: OsString::from(".."),
        });
        for entry in entries {
            let child = path.join(&entry.name);
            // Entries the kernel has not looked up yet get a stable synthetic
            // number; readdir inode numbers are informational only.
            let child_ino = self
                .inodes
                .ino_of(&child)
                .unwrap_or_else(|| fxhash::hash64(child.as_os_str().as_bytes()) | (1 << 63));
            listed.push(ListedEntry {
                ino: child_ino,
                kind: kind_to_filetype(entry.kind),
                name: entry.name,
            });
        }
        Ok(listed)
    }

    pub fn releasedir(&self, fh: u64) -> CallResult<()> {
        self.handles.release(fh);
        Ok(())
    }

    pub fn access(&self, ino: u64) -> CallResult<()> {
        let _call = self.control.enter()?;
        let path = self.path(ino)?;
        self.stack.lookup(&path).map(|_| ()).map_err(errno)
    }

    pub fn setxattr(&self, ino: u64, name: &OsStr, value: &[u8]) -> CallResult<()> {
        let _call = self.control.enter()?;
        let path = self.path(ino)?;
        self.stack.set_xattr(&path, name, value).map_err(errno)
    }

    pub fn getxattr(&self, ino: u64, name: &OsStr) -> CallResult<Vec<u8>> {
        let _call = self.control.enter()?;
        let path = self.path(ino)?;
        self.stack
            .get_xattr(&path, name)
            .map_err(errno)?
            .ok_or(libc::ENODATA)
    }

    /// Attribute names, each NUL-terminated, as listxattr returns them.
    pub fn listxattr(&self, ino: u64) -> CallResult<Vec<u8>> {
        let _call = self.control.enter()?;
        let path = self.path(ino)?;
        let names = self.stack.list_xattr(&path).map_err(errno)?;
        let mut out = Vec::new();
        for name in names {
            out.extend_from_slice(name.as_bytes());
            out.push(0);
        }
        Ok(out)
    }

    pub fn removexattr(&self, ino: u64, name: &OsStr) -> CallResult<()> {
        let _call = self.control.enter()?;
        let path = self.path(ino)?;
        self.stack.remove_xattr(&path, name).map_err(errno)
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }
}

fn reply_xattr(reply: ReplyXattr, size: u32, result: CallResult<Vec<u8>>) {
    match result {
        Ok(data) if size == 0 => reply.size(data.len() as u32),
        Ok(data) if data.len() <= size as usize => reply.data(&data),
        Ok(_) => reply.error(libc::ERANGE),
        Err(e) => reply.error(e),
    }
}

/// `fuser::Filesystem` for one job's mount.
pub struct FuseDispatcher {
    core: Arc<DispatchCore>,
    runtime: Option<tokio::runtime::Handle>,
}

impl FuseDispatcher {
    /// Calls run on `runtime`'s blocking pool, or inline on the FUSE session
    /// thread when no runtime is given.
    pub fn new(
        stack: Arc<LayerStack>,
        control: Arc<MountControl>,
        ttl: Duration,
        runtime: Option<tokio::runtime::Handle>,
    ) -> Self {
        FuseDispatcher {
            core: Arc::new(DispatchCore::new(stack, control, ttl)),
            runtime,
        }
    }

    pub fn core(&self) -> &Arc<DispatchCore> {
        &self.core
    }

    pub fn control(&self) -> &Arc<MountControl> {
        self.core.control()
    }

    fn dispatch<F>(&self, call: F)
    where
        F: FnOnce(&DispatchCore) + Send + 'static,
    {
        let core = Arc::clone(&self.core);
        match &self.runtime {
            Some(handle) => {
                handle.spawn_blocking(move || call(&core));
            }
            None => call(&core),
        }
    }
}

impl Filesystem for FuseDispatcher {
    fn init(
        &mut self,
        _req: &Request,
        _config: &mut KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        tracing::info!("mount for job {} initialized", self.core.stack().job_id());
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("mount for job {} destroyed", self.core.stack().job_id());
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        tracing::debug!("lookup(parent={}, name={:?})", parent, name);
        let name = name.to_os_string();
        self.dispatch(move |core| match core.lookup(parent, &name) {
            Ok(attr) => reply.entry(&core.ttl(), &attr, 0),
            Err(e) => reply.error(e),
        });
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        // Inline: a forget must not overtake a later lookup of the same inode.
        self.core.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        tracing::trace!("getattr(ino={})", ino);
        self.dispatch(move |core| match core.getattr(ino) {
            Ok(attr) => reply.attr(&core.ttl(), &attr),
            Err(e) => reply.error(e),
        });
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        tracing::debug!("setattr(ino={}, mode={:?}, size={:?})", ino, mode, size);
        let attr = SetAttr {
            mode,
            size,
            atime: atime.map(system_time),
            mtime: mtime.map(system_time),
        };
        self.dispatch(move |core| match core.setattr(ino, &attr) {
            Ok(attr) => reply.attr(&core.ttl(), &attr),
            Err(e) => reply.error(e),
        });
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        self.dispatch(move |core| match core.readlink(ino) {
            Ok(target) => reply.data(&target),
            Err(e) => reply.error(e),
        });
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        tracing::debug!("mkdir(parent={}, name={:?})", parent, name);
        let name = name.to_os_string();
        self.dispatch(move |core| match core.mkdir(parent, &name, mode & !umask) {
            Ok(attr) => reply.entry(&core.ttl(), &attr, 0),
            Err(e) => reply.error(e),
        });
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        tracing::debug!("unlink(parent={}, name={:?})", parent, name);
        let name = name.to_os_string();
        self.dispatch(move |core| match core.unlink(parent, &name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        });
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        tracing::debug!("rmdir(parent={}, name={:?})", parent, name);
        let name = name.to_os_string();
        self.dispatch(move |core| match core.rmdir(parent, &name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        });
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let name = link_name.to_os_string();
        let target = target.to_path_buf();
        self.dispatch(move |core| match core.symlink(parent, &name, &target) {
            Ok(attr) => reply.entry(&core.ttl(), &attr, 0),
            Err(e) => reply.error(e),
        });
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        tracing::debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?})",
            parent,
            name,
            newparent,
            newname
        );
        if flags != 0 {
            // RENAME_EXCHANGE / RENAME_NOREPLACE are not supported
            reply.error(libc::EINVAL);
            return;
        }
        let name = name.to_os_string();
        let newname = newname.to_os_string();
        self.dispatch(
            move |core| match core.rename(parent, &name, newparent, &newname) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e),
            },
        );
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        tracing::debug!("open(ino={}, flags={:#x})", ino, flags);
        self.dispatch(move |core| match core.open(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e),
        });
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        tracing::trace!("read(ino={}, offset={}, size={})", ino, offset, size);
        self.dispatch(move |core| match core.read(ino, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e),
        });
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        tracing::trace!("write(ino={}, offset={}, len={})", ino, offset, data.len());
        let data = data.to_vec();
        self.dispatch(move |core| match core.write(ino, fh, offset, &data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e),
        });
    }

    fn flush(&mut self, _req: &Request, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        self.dispatch(move |core| match core.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        });
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.core.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn fsync(&mut self, _req: &Request, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        self.dispatch(move |core| match core.fsync(ino) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        });
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        self.dispatch(move |core| match core.opendir(ino) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e),
        });
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        tracing::debug!("readdir(ino={}, offset={})", ino, offset);
        self.dispatch(move |core| match core.readdir(ino) {
            Ok(entries) => {
                let skip = offset.max(0) as usize;
                for (i, entry) in entries.into_iter().enumerate().skip(skip) {
                    if reply.add(entry.ino, (i + 1) as i64, entry.kind, &entry.name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => reply.error(e),
        });
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        match self.core.releasedir(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        tracing::debug!("create(parent={}, name={:?})", parent, name);
        let name = name.to_os_string();
        self.dispatch(
            move |core| match core.create(parent, &name, mode & !umask, flags) {
                Ok((attr, fh)) => reply.created(&core.ttl(), &attr, 0, fh, 0),
                Err(e) => reply.error(e),
            },
        );
    }

    fn access(&mut self, _req: &Request, ino: u64, _mask: i32, reply: ReplyEmpty) {
        self.dispatch(move |core| match core.access(ino) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        });
    }

    fn setxattr(
        &mut self,
        _req: &Request,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let name = name.to_os_string();
        let value = value.to_vec();
        self.dispatch(move |core| match core.setxattr(ino, &name, &value) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        });
    }

    fn getxattr(&mut self, _req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let name = name.to_os_string();
        self.dispatch(move |core| reply_xattr(reply, size, core.getxattr(ino, &name)));
    }

    fn listxattr(&mut self, _req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        self.dispatch(move |core| reply_xattr(reply, size, core.listxattr(ino)));
    }

    fn removexattr(&mut self, _req: &Request, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_os_string();
        self.dispatch(move |core| match core.removexattr(ino, &name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::layer::{HostBase, WritableLayer};
    use crate::overlay::types::LayerKind;
    use fuser::FUSE_ROOT_ID;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    fn core_over_base() -> (TempDir, DispatchCore) {
        let dir = tempdir().unwrap();
        let base_root = dir.path().join("base");
        fs::create_dir_all(base_root.join("docs")).unwrap();
        fs::write(base_root.join("docs/guide.md"), b"guide").unwrap();
        let upper =
            Arc::new(WritableLayer::open(LayerKind::Upper, dir.path().join("upper")).unwrap());
        let stack = Arc::new(LayerStack::new(
            "job-1",
            upper,
            None,
            HostBase::shared(base_root).unwrap(),
        ));
        let control = MountControl::new();
        control.activate();
        (dir, DispatchCore::new(stack, control, Duration::from_secs(1)))
    }

    #[test]
    fn test_lookup_read_and_write_through_core() {
        let (_dir, core) = core_over_base();

        let docs = core.lookup(FUSE_ROOT_ID, OsStr::new("docs")).unwrap();
        assert_eq!(docs.kind, FileType::Directory);
        let guide = core.lookup(docs.ino, OsStr::new("guide.md")).unwrap();
        assert_eq!(core.read(guide.ino, 0, 64).unwrap(), b"guide");

        let fh = core.open(guide.ino, libc::O_RDWR).unwrap();
        assert_eq!(core.write(guide.ino, fh, 0, b"GUIDE").unwrap(), 5);
        core.release(fh).unwrap();
        assert_eq!(core.read(guide.ino, 0, 64).unwrap(), b"GUIDE");
    }

    #[test]
    fn test_open_with_truncate_copies_nothing_up() {
        let (dir, core) = core_over_base();
        let docs = core.lookup(FUSE_ROOT_ID, OsStr::new("docs")).unwrap();
        let guide = core.lookup(docs.ino, OsStr::new("guide.md")).unwrap();

        let fh = core
            .open(guide.ino, libc::O_WRONLY | libc::O_TRUNC)
            .unwrap();
        core.release(fh).unwrap();

        assert_eq!(core.read(guide.ino, 0, 64).unwrap(), b"");
        assert_eq!(
            fs::read(dir.path().join("upper/tree/docs/guide.md")).unwrap(),
            b""
        );
        assert_eq!(fs::read(dir.path().join("base/docs/guide.md")).unwrap(), b"guide");
    }

    #[test]
    fn test_write_through_read_only_handle_is_rejected() {
        let (_dir, core) = core_over_base();
        let docs = core.lookup(FUSE_ROOT_ID, OsStr::new("docs")).unwrap();
        let guide = core.lookup(docs.ino, OsStr::new("guide.md")).unwrap();

        let fh = core.open(guide.ino, libc::O_RDONLY).unwrap();
        assert_eq!(core.write(guide.ino, fh, 0, b"x"), Err(libc::EBADF));
    }

    #[test]
    fn test_readdir_lists_dot_entries_first() {
        let (_dir, core) = core_over_base();
        let names: Vec<OsString> = core
            .readdir(FUSE_ROOT_ID)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(
            names,
            vec![
                OsString::from("."),
                OsString::from(".."),
                OsString::from("docs")
            ]
        );
    }

    #[test]
    fn test_unlink_hides_entry() {
        let (_dir, core) = core_over_base();
        let docs = core.lookup(FUSE_ROOT_ID, OsStr::new("docs")).unwrap();

        core.unlink(docs.ino, OsStr::new("guide.md")).unwrap();

        assert_eq!(
            core.lookup(docs.ino, OsStr::new("guide.md")),
            Err(libc::ENOENT)
        );
    }

    #[test]
    fn test_calls_rejected_with_estale_while_unmounting() {
        let (_dir, core) = core_over_base();
        core.control().begin_unmount();
        assert_eq!(
            core.lookup(FUSE_ROOT_ID, OsStr::new("docs")),
            Err(libc::ESTALE)
        );
        assert_eq!(core.getattr(FUSE_ROOT_ID), Err(libc::ESTALE));
    }

    #[test]
    fn test_drain_waits_for_inflight_calls() {
        let control = MountControl::new();
        control.activate();
        let call = control.enter().unwrap();
        control.begin_unmount();

        assert!(!control.drain(Duration::from_millis(20)));
        let waiter = {
            let control = Arc::clone(&control);
            std::thread::spawn(move || control.drain(Duration::from_secs(5)))
        };
        drop(call);
        assert!(waiter.join().unwrap());
        control.finish_unmount();
        assert_eq!(control.state(), MountState::Unmounted);
    }

    #[test]
    fn test_create_registers_writable_handle() {
        let (_dir, core) = core_over_base();
        let (attr, fh) = core
            .create(FUSE_ROOT_ID, OsStr::new("new.txt"), 0o644, libc::O_WRONLY)
            .unwrap();
        assert_eq!(core.write(attr.ino, fh, 0, b"abc").unwrap(), 3);
        assert_eq!(core.open_handles(), 1);
    }
}
