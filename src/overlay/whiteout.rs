//! Whiteout handling for the layered filesystem.
//!
//! A "whiteout" marks a path as deleted relative to the layers below the
//! layer that records it. Rather than dropping sentinel files into the layer
//! tree, every writable layer keeps a whiteout index: a set of relative paths
//! held in memory and persisted as `whiteouts.json` next to the layer's
//! `tree/` directory.
//!
//! Two rules follow from the index model:
//! - a whiteout on `a` hides `a` and every path below `a` in lower layers;
//! - a whiteout and a real entry for the same path in the same layer mean the
//!   entry is opaque: it replaces the lower entries instead of merging with
//!   them.

use crate::overlay::fault::{FaultInjector, FaultOp};
use crate::overlay::types::sync_parent_dir;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// File name of the whiteout index inside a writable layer root.
pub const WHITEOUT_INDEX: &str = "whiteouts.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct WhiteoutIndexFile {
    whiteouts: Vec<PathBuf>,
}

/// The whiteout index of one writable layer.
#[derive(Debug)]
pub struct WhiteoutSet {
    index_path: PathBuf,
    entries: RwLock<BTreeSet<PathBuf>>,
    /// Serializes updates so the persisted file and the in-memory set move together.
    update_lock: Mutex<()>,
}

impl WhiteoutSet {
    /// Load the index at `index_path`. A missing file is an empty index.
    pub fn load(index_path: PathBuf) -> io::Result<Self> {
        let entries = match fs::read_to_string(&index_path) {
            Ok(content) => {
                let file: WhiteoutIndexFile = serde_json::from_str(&content).map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("parse {}: {}", index_path.display(), e),
                    )
                })?;
                file.whiteouts.into_iter().collect()
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => return Err(e),
        };

        Ok(WhiteoutSet {
            index_path,
            entries: RwLock::new(entries),
            update_lock: Mutex::new(()),
        })
    }

    /// True if a whiteout is recorded for exactly this path.
    pub fn contains(&self, rel: &Path) -> bool {
        self.entries.read().contains(rel)
    }

    /// True if a whiteout is recorded for this path or any of its ancestors.
    pub fn covers(&self, rel: &Path) -> bool {
        let entries = self.entries.read();
        if entries.is_empty() {
            return false;
        }
        rel.ancestors()
            .filter(|p| !p.as_os_str().is_empty())
            .any(|p| entries.contains(p))
    }

    /// Names directly inside `dir` that carry a whiteout.
    pub fn children(&self, dir: &Path) -> Vec<OsString> {
        self.entries
            .read()
            .iter()
            .filter(|p| p.parent() == Some(dir))
            .filter_map(|p| p.file_name().map(|n| n.to_os_string()))
            .collect()
    }

    /// True if some whiteout lies strictly below `rel`.
    pub fn has_below(&self, rel: &Path) -> bool {
        self.entries
            .read()
            .iter()
            .any(|p| p.starts_with(rel) && p.as_path() != rel)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Record a whiteout for `rel`. Whiteouts below `rel` become redundant and
    /// are dropped.
    pub fn insert(&self, rel: &Path, faults: &FaultInjector) -> io::Result<()> {
        self.update(faults, |set| {
            set.retain(|p| !p.starts_with(rel));
            set.insert(rel.to_path_buf());
        })
    }

    /// Drop the whiteout for exactly `rel`, if any.
    pub fn remove(&self, rel: &Path, faults: &FaultInjector) -> io::Result<()> {
        if !self.contains(rel) {
            return Ok(());
        }
        self.update(faults, |set| {
            set.remove(rel);
        })
    }

    /// Re-key every whiteout at or below `from` to live under `to`.
    pub fn move_prefix(&self, from: &Path, to: &Path, faults: &FaultInjector) -> io::Result<()> {
        if !self.has_below(from) {
            return Ok(());
        }
        self.update(faults, |set| {
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
        })
    }

    /// Apply `f` to a copy of the set, persist the copy, then publish it.
    /// On persistence failure the in-memory set is left untouched.
    pub(crate) fn update<F>(&self, faults: &FaultInjector, f: F) -> io::Result<()>
    where
        F: FnOnce(&mut BTreeSet<PathBuf>),
    {
        let _guard = self.update_lock.lock();
        let mut next = self.entries.read().clone();
        f(&mut next);

        faults.check(FaultOp::Whiteout)?;
        self.persist(&next)?;

        *self.entries.write() = next;
        Ok(())
    }

    fn persist(&self, set: &BTreeSet<PathBuf>) -> io::Result<()> {
        let file = WhiteoutIndexFile {
            whiteouts: set.iter().cloned().collect(),
        };
        let content = serde_json::to_vec_pretty(&file).map_err(io::Error::other)?;

        let tmp_path = self.index_path.with_extension("json.tmp");
        let result = (|| {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&content)?;
            tmp.sync_all()?;
            fs::rename(&tmp_path, &self.index_path)
        })();

        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        result?;
        sync_parent_dir(&self.index_path)
    }
}
