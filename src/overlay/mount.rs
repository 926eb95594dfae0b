//! Mount backends: the boundary to the kernel's mount handshake.
//!
//! The registry only needs "mount accepted / failed" and "unmount accepted /
//! busy" from a backend. `FuseBackend` talks to the kernel through fuser;
//! `DetachedBackend` keeps dispatchers in-process without a kernel mount.

use crate::error::{CanopyError, Result};
use crate::overlay::dispatcher::FuseDispatcher;
use fxhash::FxHashSet;
use parking_lot::Mutex;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of one unmount attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnmountOutcome {
    Unmounted,
    NotMounted,
    Busy(String),
}

impl UnmountOutcome {
    pub fn is_done(&self) -> bool {
        !matches!(self, UnmountOutcome::Busy(_))
    }
}

/// A live mount produced by a backend.
pub trait MountSession: Send {
    fn mount_path(&self) -> &Path;

    fn unmount(&mut self) -> UnmountOutcome;
}

pub trait MountBackend: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Expose `dispatcher` at `mount_path`. Never retried by the caller.
    fn mount(&self, mount_path: &Path, dispatcher: FuseDispatcher)
        -> Result<Box<dyn MountSession>>;

    /// Tear down a kernel mount left behind by an earlier process.
    fn unmount_stale(&self, mount_path: &Path) -> UnmountOutcome;
}

const MOUNT_TIMEOUT: Duration = Duration::from_millis(2000);
const MOUNT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Kernel FUSE mounts through fuser's background session.
#[derive(Debug, Default)]
pub struct FuseBackend;

impl FuseBackend {
    pub fn new() -> Self {
        FuseBackend
    }
}

struct FuseSession {
    mount_path: PathBuf,
    session: Option<fuser::BackgroundSession>,
}

impl MountSession for FuseSession {
    fn mount_path(&self) -> &Path {
        &self.mount_path
    }

    fn unmount(&mut self) -> UnmountOutcome {
        if self.session.is_none() {
            return UnmountOutcome::NotMounted;
        }
        let outcome = run_unmount(&self.mount_path);
        if outcome.is_done() {
            // The kernel side is gone; dropping the session joins nothing
            // and releases the /dev/fuse channel.
            self.session.take();
        }
        outcome
    }
}

impl Drop for FuseSession {
    fn drop(&mut self) {
        if self.session.is_some() {
            tracing::warn!(
                "Dropping live FUSE session at {}",
                self.mount_path.display()
            );
        }
    }
}

impl MountBackend for FuseBackend {
    fn name(&self) -> &'static str {
        "fuse"
    }

    fn mount(
        &self,
        mount_path: &Path,
        dispatcher: FuseDispatcher,
    ) -> Result<Box<dyn MountSession>> {
        let options = vec![
            fuser::MountOption::FSName("canopy".to_string()),
            fuser::MountOption::AutoUnmount,
            fuser::MountOption::DefaultPermissions,
        ];

        tracing::info!("Mounting FUSE filesystem at {}", mount_path.display());
        let session = fuser::spawn_mount2(dispatcher, mount_path, &options).map_err(|e| {
            CanopyError::Fuse(format!(
                "FUSE mount at {} failed: {}",
                mount_path.display(),
                e
            ))
        })?;

        // The mount syscall has returned; wait until the kernel routes
        // requests before declaring the mount accepted.
        let start = Instant::now();
        loop {
            if fs::read_dir(mount_path).is_ok() {
                tracing::debug!("FUSE mount verified accessible");
                break;
            }
            if start.elapsed() >= MOUNT_TIMEOUT {
                drop(session);
                return Err(CanopyError::Fuse(format!(
                    "FUSE mount timed out - {} not accessible after 2 seconds",
                    mount_path.display()
                )));
            }
            std::thread::sleep(MOUNT_POLL_INTERVAL);
        }

        Ok(Box::new(FuseSession {
            mount_path: mount_path.to_path_buf(),
            session: Some(session),
        }))
    }

    fn unmount_stale(&self, mount_path: &Path) -> UnmountOutcome {
        run_unmount(mount_path)
    }
}

fn unmount_commands() -> &'static [&'static [&'static str]] {
    if cfg!(target_os = "macos") {
        &[&["umount"]]
    } else {
        &[&["fusermount", "-u"], &["fusermount3", "-u"], &["umount"]]
    }
}

/// Run the platform unmount helper and classify its answer.
fn run_unmount(mount_path: &Path) -> UnmountOutcome {
    let mut last_error = String::from("no unmount helper available");
    for command in unmount_commands() {
        let (program, args) = match command.split_first() {
            Some(split) => split,
            None => continue,
        };
        let output = match Command::new(program).args(args).arg(mount_path).output() {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                last_error = format!("failed to run {}: {}", program, e);
                continue;
            }
        };
        if output.status.success() {
            tracing::info!("Unmounted {}", mount_path.display());
            return UnmountOutcome::Unmounted;
        }
        let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
        return classify_unmount_error(&stderr);
    }
    UnmountOutcome::Busy(last_error)
}

fn classify_unmount_error(stderr: &str) -> UnmountOutcome {
    if stderr.contains("not mounted")
        || stderr.contains("not found in")
        || stderr.contains("no such file")
        || stderr.contains("invalid argument")
    {
        UnmountOutcome::NotMounted
    } else if stderr.contains("busy") {
        UnmountOutcome::Busy(stderr.trim().to_string())
    } else {
        UnmountOutcome::Busy(format!("unmount refused: {}", stderr.trim()))
    }
}

#[derive(Debug, Default)]
struct DetachedState {
    mounted: Mutex<FxHashSet<PathBuf>>,
    busy_remaining: AtomicU32,
    refuse_mounts: AtomicBool,
}

/// In-process backend: dispatchers are kept alive without a kernel mount.
///
/// Used when embedding the engine and in tests. Busy unmounts and refused
/// mounts can be scripted to exercise the registry's failure paths.
#[derive(Debug, Clone, Default)]
pub struct DetachedBackend {
    state: Arc<DetachedState>,
}

impl DetachedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` unmount attempts report busy.
    pub fn set_busy(&self, count: u32) {
        self.state.busy_remaining.store(count, Ordering::SeqCst);
    }

    pub fn refuse_mounts(&self, refuse: bool) {
        self.state.refuse_mounts.store(refuse, Ordering::SeqCst);
    }

    pub fn is_mounted(&self, mount_path: &Path) -> bool {
        self.state.mounted.lock().contains(mount_path)
    }

    pub fn mounted_count(&self) -> usize {
        self.state.mounted.lock().len()
    }

    fn take_busy(&self) -> bool {
        self.state
            .busy_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

struct DetachedSession {
    mount_path: PathBuf,
    dispatcher: Option<FuseDispatcher>,
    backend: DetachedBackend,
}

impl MountSession for DetachedSession {
    fn mount_path(&self) -> &Path {
        &self.mount_path
    }

    fn unmount(&mut self) -> UnmountOutcome {
        if self.dispatcher.is_none() {
            return UnmountOutcome::NotMounted;
        }
        if self.backend.take_busy() {
            return UnmountOutcome::Busy("device or resource busy".to_string());
        }
        self.dispatcher.take();
        self.backend.state.mounted.lock().remove(&self.mount_path);
        UnmountOutcome::Unmounted
    }
}

impl MountBackend for DetachedBackend {
    fn name(&self) -> &'static str {
        "detached"
    }

    fn mount(
        &self,
        mount_path: &Path,
        dispatcher: FuseDispatcher,
    ) -> Result<Box<dyn MountSession>> {
        if self.state.refuse_mounts.load(Ordering::SeqCst) {
            return Err(CanopyError::Fuse(format!(
                "mount at {} refused",
                mount_path.display()
            )));
        }
        if !self.state.mounted.lock().insert(mount_path.to_path_buf()) {
            return Err(CanopyError::PathInUse(mount_path.to_path_buf()));
        }
        tracing::debug!("Detached mount at {}", mount_path.display());
        Ok(Box::new(DetachedSession {
            mount_path: mount_path.to_path_buf(),
            dispatcher: Some(dispatcher),
            backend: self.clone(),
        }))
    }

    fn unmount_stale(&self, mount_path: &Path) -> UnmountOutcome {
        if self.state.mounted.lock().remove(mount_path) {
            UnmountOutcome::Unmounted
        } else {
            UnmountOutcome::NotMounted
        }
    }
}
