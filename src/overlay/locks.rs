//! Per-path exclusion for writable layers.
//!
//! Each writable layer owns a `PathLocks` table. A changelist shared by
//! several jobs is a single layer object, so its table is shared too and the
//! exclusion spans every attached job.

use dashmap::DashMap;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockMode {
    Shared,
    Exclusive,
}

type LockMap = DashMap<PathBuf, Arc<RwLock<()>>>;

#[derive(Debug, Clone, Default)]
pub struct PathLocks {
    map: Arc<LockMap>,
}

enum HeldGuard {
    Shared(ArcRwLockReadGuard<RawRwLock, ()>),
    Exclusive(ArcRwLockWriteGuard<RawRwLock, ()>),
}

/// Holds one path lock; releasing it prunes the table entry when idle.
pub struct PathGuard {
    map: Arc<LockMap>,
    path: PathBuf,
    guard: Option<HeldGuard>,
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.map
            .remove_if(&self.path, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl PathLocks {
    fn entry(&self, path: &Path) -> Arc<RwLock<()>> {
        self.map
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    pub fn lock(&self, path: &Path, mode: LockMode) -> PathGuard {
        let lock = self.entry(path);
        let guard = match mode {
            LockMode::Shared => HeldGuard::Shared(lock.read_arc()),
            LockMode::Exclusive => HeldGuard::Exclusive(lock.write_arc()),
        };
        PathGuard {
            map: Arc::clone(&self.map),
            path: path.to_path_buf(),
            guard: Some(guard),
        }
    }

    /// Lock several paths in sorted order. A path requested in both modes is
    /// locked exclusively, once.
    pub fn lock_all(&self, requests: &[(PathBuf, LockMode)]) -> Vec<PathGuard> {
        let mut sorted: Vec<(PathBuf, LockMode)> = requests.to_vec();
        sorted.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
        sorted.dedup_by(|a, b| a.0 == b.0);

        sorted
            .iter()
            .map(|(path, mode)| self.lock(path, *mode))
            .collect()
    }

    /// Run `f` only if the caller's guard is the sole reference to the lock
    /// on `path`. The table shard stays locked while `f` runs, so no other
    /// operation can start waiting on `path` in the meantime.
    pub fn with_sole_holder(&self, path: &Path, f: impl FnOnce()) -> bool {
        match self.map.get(path) {
            // One reference in the table, one in the caller's guard.
            Some(lock) if Arc::strong_count(lock.value()) <= 2 => {
                f();
                true
            }
            Some(_) => false,
            None => {
                f();
                true
            }
        }
    }

    /// Number of paths with a live lock entry.
    pub fn active(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_entries_are_pruned_after_release() {
        let locks = PathLocks::default();
        {
            let _a = locks.lock(Path::new("a"), LockMode::Exclusive);
            let _b = locks.lock(Path::new("b"), LockMode::Shared);
            assert_eq!(locks.active(), 2);
        }
        assert_eq!(locks.active(), 0);
    }

    #[test]
    fn test_shared_locks_do_not_block_each_other() {
        let locks = PathLocks::default();
        let _first = locks.lock(Path::new("f"), LockMode::Shared);
        let _second = locks.lock(Path::new("f"), LockMode::Shared);
        assert_eq!(locks.active(), 1);
    }

    #[test]
    fn test_lock_all_dedups_and_prefers_exclusive() {
        let locks = PathLocks::default();
        let guards = locks.lock_all(&[
            (PathBuf::from("b"), LockMode::Shared),
            (PathBuf::from("a"), LockMode::Shared),
            (PathBuf::from("b"), LockMode::Exclusive),
        ]);
        assert_eq!(guards.len(), 2);
        assert!(matches!(guards[1].guard, Some(HeldGuard::Exclusive(_))));
    }

    #[test]
    fn test_sole_holder_sees_other_guards() {
        let locks = PathLocks::default();
        let mine = locks.lock(Path::new("dir"), LockMode::Shared);
        let mut ran = false;
        assert!(locks.with_sole_holder(Path::new("dir"), || ran = true));
        assert!(ran);

        let _other = locks.lock(Path::new("dir"), LockMode::Shared);
        assert!(!locks.with_sole_holder(Path::new("dir"), || panic!("ran while shared")));
        drop(mine);
    }

    #[test]
    fn test_exclusive_lock_serializes_writers() {
        let locks = PathLocks::default();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    let _guard = locks.lock(Path::new("same"), LockMode::Exclusive);
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(2));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active(), 0);
    }
}
