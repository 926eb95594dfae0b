use fxhash::FxHashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileHandle {
    pub ino: u64,
    /// Opened with write access; the entry was copied up at open time.
    pub writable: bool,
}

/// Open file and directory handles of one mount.
#[derive(Debug)]
pub(crate) struct HandleTable {
    handles: Mutex<FxHashMap<u64, FileHandle>>,
    next_fh: AtomicU64,
}

impl Default for HandleTable {
    fn default() -> Self {
        HandleTable {
            handles: Mutex::new(FxHashMap::default()),
            next_fh: AtomicU64::new(1),
        }
    }
}

impl HandleTable {
    pub fn open(&self, ino: u64, writable: bool) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().insert(fh, FileHandle { ino, writable });
        fh
    }

    pub fn get(&self, fh: u64) -> Option<FileHandle> {
        self.handles.lock().get(&fh).copied()
    }

    pub fn release(&self, fh: u64) -> Option<FileHandle> {
        self.handles.lock().remove(&fh)
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }
}
