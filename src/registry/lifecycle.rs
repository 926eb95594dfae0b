//! The process-wide mount registry.
//!
//! `MountRegistry` owns every job's mount lifecycle. Mutations are serialized
//! by one mutex held across the state commit; `list()` reads an `Arc`
//! snapshot that is swapped after each commit and never waits on a mutation.

use crate::error::{CanopyError, Result};
use crate::overlay::{
    BaseRef, FuseDispatcher, LayerKind, LayerStack, MountBackend, MountControl, MountSession,
    MountState, UnmountOutcome, WritableLayer,
};
use crate::registry::store::StateStore;
use crate::registry::types::{
    ChangelistRef, LayerRoots, MountEntry, RegistrySettings, RegistryState,
};
use chrono::Utc;
use fxhash::FxHashMap;
use parking_lot::{Mutex, RwLock};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Weak};

struct LiveMount {
    stack: Arc<LayerStack>,
    control: Arc<MountControl>,
    session: Box<dyn MountSession>,
}

struct Inner {
    state: RegistryState,
    live: FxHashMap<String, LiveMount>,
    /// Every attached job shares one layer object per changelist name.
    changelists: FxHashMap<String, Weak<WritableLayer>>,
    bases: FxHashMap<String, BaseRef>,
}

pub struct MountRegistry {
    settings: RegistrySettings,
    backend: Arc<dyn MountBackend>,
    store: StateStore,
    inner: Mutex<Inner>,
    snapshot: RwLock<Arc<Vec<MountEntry>>>,
    runtime: Option<tokio::runtime::Runtime>,
}

/// `value` must be a single plain path component.
fn validate_component(value: &str, what: &str) -> Result<()> {
    let mut components = Path::new(value).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) if name == value => Ok(()),
        _ => Err(CanopyError::InvalidPath(format!(
            "{} '{}' must be a single path component",
            what, value
        ))),
    }
}

/// A mount point may be absent or an empty directory.
fn check_mount_point(mount_path: &Path) -> Result<()> {
    match fs::symlink_metadata(mount_path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
        Ok(meta) if !meta.is_dir() => Err(CanopyError::PathInUse(mount_path.to_path_buf())),
        Ok(_) => {
            if fs::read_dir(mount_path)?.next().is_some() {
                Err(CanopyError::PathInUse(mount_path.to_path_buf()))
            } else {
                Ok(())
            }
        }
    }
}

fn discard_dir(path: &Path) {
    match fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove {}: {}", path.display(), e),
    }
}

impl MountRegistry {
    /// Load the persisted state and take ownership of the state file.
    ///
    /// Recorded mounts are not served until `reattach` (or `mount` at the
    /// same path) is called for them.
    pub fn open(settings: RegistrySettings, backend: Arc<dyn MountBackend>) -> Result<Self> {
        for dir in [
            &settings.upper_root,
            &settings.changelist_root,
            &settings.mount_root,
        ] {
            fs::create_dir_all(dir)?;
        }

        let (store, state) = StateStore::open(&settings.state_file)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(settings.workers.max(1))
            .thread_name("canopy-fuse")
            .enable_all()
            .build()?;

        let pending = state
            .mounts
            .iter()
            .filter(|m| m.state != MountState::Unmounted)
            .count();
        if pending > 0 {
            tracing::info!(
                "{} recorded mount(s) from a previous run await reattach or removal",
                pending
            );
        }

        let snapshot = Arc::new(state.sorted());
        tracing::info!(
            "Mount registry ready ({} backend, state {})",
            backend.name(),
            store.path().display()
        );

        Ok(MountRegistry {
            settings,
            backend,
            store,
            inner: Mutex::new(Inner {
                state,
                live: FxHashMap::default(),
                changelists: FxHashMap::default(),
                bases: FxHashMap::default(),
            }),
            snapshot: RwLock::new(snapshot),
            runtime: Some(runtime),
        })
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    pub fn backend(&self) -> &Arc<dyn MountBackend> {
        &self.backend
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().state.generation
    }

    /// Persist a modified copy of the state, then adopt it in memory.
    fn commit<F>(&self, inner: &mut Inner, f: F) -> Result<()>
    where
        F: FnOnce(&mut RegistryState),
    {
        let mut next = inner.state.clone();
        f(&mut next);
        next.generation += 1;
        self.store.save(&next)?;
        *self.snapshot.write() = Arc::new(next.sorted());
        inner.state = next;
        Ok(())
    }

    /// Make `base` available to `reattach` under its locator.
    pub fn register_base(&self, base: BaseRef) {
        self.inner.lock().bases.insert(base.locator(), base);
    }

    fn attach_changelist(
        &self,
        inner: &mut Inner,
        changelist: &ChangelistRef,
    ) -> Result<Arc<WritableLayer>> {
        if let Some(layer) = inner
            .changelists
            .get(&changelist.name)
            .and_then(Weak::upgrade)
        {
            return Ok(layer);
        }
        let layer = Arc::new(WritableLayer::open(
            LayerKind::Changelist,
            changelist.root.clone(),
        )?);
        inner
            .changelists
            .insert(changelist.name.clone(), Arc::downgrade(&layer));
        tracing::debug!(
            "Opened changelist {} at {}",
            changelist.name,
            changelist.root.display()
        );
        Ok(layer)
    }

    /// Number of live stacks holding the named changelist.
    pub fn changelist_refs(&self, name: &str) -> usize {
        self.inner
            .lock()
            .changelists
            .get(name)
            .map(Weak::strong_count)
            .unwrap_or(0)
    }

    /// Build the stack and dispatcher for one job and mount it.
    fn start(
        &self,
        inner: &mut Inner,
        job_id: &str,
        mount_path: &Path,
        upper_root: &Path,
        changelist: Option<&ChangelistRef>,
        base: BaseRef,
    ) -> Result<LiveMount> {
        let upper = Arc::new(WritableLayer::open(
            LayerKind::Upper,
            upper_root.to_path_buf(),
        )?);
        let changelist = match changelist {
            Some(changelist) => Some(self.attach_changelist(inner, changelist)?),
            None => None,
        };
        let stack = Arc::new(LayerStack::new(job_id, upper, changelist, base));
        let control = MountControl::new();
        let dispatcher = FuseDispatcher::new(
            Arc::clone(&stack),
            Arc::clone(&control),
            self.settings.ttl,
            self.runtime.as_ref().map(|rt| rt.handle().clone()),
        );

        let created_dir = !mount_path.exists();
        fs::create_dir_all(mount_path)?;
        let session = match self.backend.mount(mount_path, dispatcher) {
            Ok(session) => session,
            Err(e) => {
                if created_dir {
                    let _ = fs::remove_dir(mount_path);
                }
                return Err(e);
            }
        };
        control.activate();
        Ok(LiveMount {
            stack,
            control,
            session,
        })
    }

    /// Record `entry` as active; a mount that cannot be recorded is torn down.
    fn publish(&self, inner: &mut Inner, entry: MountEntry, mut live: LiveMount) -> Result<MountEntry> {
        let recorded = entry.clone();
        if let Err(e) = self.commit(inner, move |state| state.upsert(recorded)) {
            live.control.begin_unmount();
            if let UnmountOutcome::Busy(reason) = live.session.unmount() {
                tracing::warn!(
                    "Unrecorded mount at {} left busy: {}",
                    entry.mount_path.display(),
                    reason
                );
            }
            live.control.finish_unmount();
            return Err(e);
        }
        inner.live.insert(entry.job_id.clone(), live);
        Ok(entry)
    }

    /// Mount a new job stack at `mount_path`.
    ///
    /// A job recorded `Unmounted` at the same path gets its old upper layer
    /// back. The mount is attempted once; failures surface immediately.
    pub fn mount(
        &self,
        job_id: &str,
        mount_path: &Path,
        base: BaseRef,
        changelist: Option<&str>,
    ) -> Result<MountEntry> {
        validate_component(job_id, "job id")?;
        if !mount_path.is_absolute() {
            return Err(CanopyError::InvalidPath(format!(
                "mount path {} must be absolute",
                mount_path.display()
            )));
        }
        let changelist = match changelist {
            Some(name) => {
                validate_component(name, "changelist name")?;
                Some(ChangelistRef {
                    name: name.to_string(),
                    root: self.settings.changelist_root.join(name),
                })
            }
            None => None,
        };

        let mut inner = self.inner.lock();

        let prior = inner.state.find(job_id).cloned();
        if let Some(prior) = &prior {
            if prior.is_live() || prior.mount_path != mount_path {
                return Err(CanopyError::DuplicateJob(job_id.to_string()));
            }
        }
        if let Some(other) = inner.state.by_mount_path(mount_path) {
            if other.job_id != job_id {
                return Err(CanopyError::PathInUse(mount_path.to_path_buf()));
            }
        }
        if prior.is_none() {
            check_mount_point(mount_path)?;
        }

        inner.bases.insert(base.locator(), Arc::clone(&base));

        let (upper_root, fresh_upper) = match &prior {
            Some(prior) => (prior.layers.upper.clone(), false),
            None => (
                self.settings
                    .upper_root
                    .join(uuid::Uuid::new_v4().to_string()),
                true,
            ),
        };

        let live = match self.start(
            &mut inner,
            job_id,
            mount_path,
            &upper_root,
            changelist.as_ref(),
            Arc::clone(&base),
        ) {
            Ok(live) => live,
            Err(e) => {
                tracing::warn!("Mount of job {} failed: {}", job_id, e);
                if fresh_upper {
                    discard_dir(&upper_root);
                }
                return Err(e);
            }
        };

        let entry = MountEntry {
            job_id: job_id.to_string(),
            mount_path: mount_path.to_path_buf(),
            layers: LayerRoots {
                upper: upper_root.clone(),
                changelist,
                base: base.locator(),
            },
            locked: prior.as_ref().map(|p| p.locked).unwrap_or(false),
            state: MountState::Active,
            created_at: prior.as_ref().map(|p| p.created_at).unwrap_or_else(Utc::now),
        };

        match self.publish(&mut inner, entry, live) {
            Ok(entry) => {
                tracing::info!(
                    "Mounted job {} at {}",
                    job_id,
                    entry.mount_path.display()
                );
                Ok(entry)
            }
            Err(e) => {
                if fresh_upper {
                    discard_dir(&upper_root);
                }
                Err(e)
            }
        }
    }

    /// Mount `job_id` at `<mount_root>/<job_id>`.
    pub fn mount_default(
        &self,
        job_id: &str,
        base: BaseRef,
        changelist: Option<&str>,
    ) -> Result<MountEntry> {
        validate_component(job_id, "job id")?;
        let mount_path = self.settings.mount_root.join(job_id);
        self.mount(job_id, &mount_path, base, changelist)
    }

    /// Serve a recorded job again, typically after a restart.
    pub fn reattach(&self, job_id: &str) -> Result<MountEntry> {
        let mut inner = self.inner.lock();
        let entry = inner
            .state
            .find(job_id)
            .cloned()
            .ok_or_else(|| CanopyError::NotFound(format!("job {}", job_id)))?;
        if inner.live.contains_key(job_id) {
            return Err(CanopyError::DuplicateJob(job_id.to_string()));
        }
        if entry.state == MountState::Unmounting {
            return Err(CanopyError::Stale(format!(
                "job {} is unmounting; remove it instead",
                job_id
            )));
        }
        let base = inner.bases.get(&entry.layers.base).cloned().ok_or_else(|| {
            CanopyError::NotFound(format!("base layer {} is not registered", entry.layers.base))
        })?;

        match self.backend.unmount_stale(&entry.mount_path) {
            UnmountOutcome::Busy(reason) => {
                return Err(CanopyError::UnmountFailed {
                    job_id: job_id.to_string(),
                    attempts: 1,
                    reason,
                });
            }
            UnmountOutcome::Unmounted => {
                tracing::info!("Cleared stale mount at {}", entry.mount_path.display());
            }
            UnmountOutcome::NotMounted => {}
        }

        let live = self.start(
            &mut inner,
            job_id,
            &entry.mount_path,
            &entry.layers.upper,
            entry.layers.changelist.as_ref(),
            base,
        )?;
        let mut updated = entry;
        updated.state = MountState::Active;
        let updated = self.publish(&mut inner, updated, live)?;
        tracing::info!("Reattached job {}", job_id);
        Ok(updated)
    }

    pub fn list(&self) -> Arc<Vec<MountEntry>> {
        Arc::clone(&self.snapshot.read())
    }

    pub fn get(&self, job_id: &str) -> Option<MountEntry> {
        self.list().iter().find(|m| m.job_id == job_id).cloned()
    }

    /// The live stack of an attached job, for in-process callers.
    pub fn stack(&self, job_id: &str) -> Result<Arc<LayerStack>> {
        let inner = self.inner.lock();
        match inner.live.get(job_id) {
            Some(live) if live.control.state().accepts_calls() => Ok(Arc::clone(&live.stack)),
            Some(_) => Err(CanopyError::Stale(job_id.to_string())),
            None if inner.state.find(job_id).is_some() => Err(CanopyError::Stale(format!(
                "job {} is not attached",
                job_id
            ))),
            None => Err(CanopyError::NotFound(format!("job {}", job_id))),
        }
    }

    /// Drain and unmount, retrying busy unmounts with backoff.
    ///
    /// On failure the live mount stays registered in its `Unmounting` state.
    fn unmount_with_retry(&self, inner: &mut Inner, entry: &MountEntry) -> Result<()> {
        let policy = self.settings.retry;
        let mut live = inner.live.remove(&entry.job_id);
        if let Some(live) = &live {
            live.control.begin_unmount();
        }

        let mut reason = String::from("unmount not attempted");
        for attempt in 1..=policy.max_attempts {
            let outcome = match live.as_mut() {
                Some(live) => {
                    if live.control.drain(policy.backoff(attempt)) {
                        live.session.unmount()
                    } else {
                        UnmountOutcome::Busy(format!(
                            "{} call(s) still in flight",
                            live.control.inflight()
                        ))
                    }
                }
                None => self.backend.unmount_stale(&entry.mount_path),
            };

            match outcome {
                UnmountOutcome::Unmounted | UnmountOutcome::NotMounted => {
                    if let Some(live) = &live {
                        live.control.finish_unmount();
                    }
                    tracing::debug!(
                        "Unmounted job {} after {} attempt(s)",
                        entry.job_id,
                        attempt
                    );
                    return Ok(());
                }
                UnmountOutcome::Busy(why) => {
                    tracing::warn!(
                        "Unmount of job {} busy (attempt {}/{}): {}",
                        entry.job_id,
                        attempt,
                        policy.max_attempts,
                        why
                    );
                    reason = why;
                    if attempt < policy.max_attempts {
                        std::thread::sleep(policy.backoff(attempt));
                    }
                }
            }
        }

        if let Some(live) = live {
            inner.live.insert(entry.job_id.clone(), live);
        }
        Err(CanopyError::UnmountFailed {
            job_id: entry.job_id.clone(),
            attempts: policy.max_attempts,
            reason,
        })
    }

    /// Unmount a job and delete its upper layer.
    ///
    /// Shared changelists and the base are never deleted here.
    pub fn remove(&self, job_id: &str) -> Result<MountEntry> {
        let mut inner = self.inner.lock();
        let entry = inner
            .state
            .find(job_id)
            .cloned()
            .ok_or_else(|| CanopyError::NotFound(format!("job {}", job_id)))?;
        if entry.locked {
            return Err(CanopyError::Locked(job_id.to_string()));
        }

        if entry.state != MountState::Unmounted {
            if entry.state != MountState::Unmounting {
                self.commit(&mut inner, |state| {
                    if let Some(e) = state.find_mut(job_id) {
                        e.state = MountState::Unmounting;
                    }
                })?;
            }
            self.unmount_with_retry(&mut inner, &entry)?;
        }

        if entry.layers.upper.starts_with(&self.settings.upper_root) {
            match fs::remove_dir_all(&entry.layers.upper) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        } else {
            tracing::warn!(
                "Upper layer {} is outside {}; leaving it in place",
                entry.layers.upper.display(),
                self.settings.upper_root.display()
            );
        }
        inner.changelists.retain(|_, layer| layer.strong_count() > 0);

        if let Err(e) = fs::remove_dir(&entry.mount_path) {
            tracing::debug!(
                "Mount directory {} not removed: {}",
                entry.mount_path.display(),
                e
            );
        }

        self.commit(&mut inner, |state| {
            state.remove(job_id);
        })?;
        tracing::info!("Removed job {}", job_id);

        let mut removed = entry;
        removed.state = MountState::Unmounted;
        Ok(removed)
    }

    fn set_locked(&self, job_id: &str, locked: bool) -> Result<MountEntry> {
        let mut inner = self.inner.lock();
        let current = inner
            .state
            .find(job_id)
            .map(|e| e.locked)
            .ok_or_else(|| CanopyError::NotFound(format!("job {}", job_id)))?;
        if current != locked {
            self.commit(&mut inner, |state| {
                if let Some(e) = state.find_mut(job_id) {
                    e.locked = locked;
                }
            })?;
            tracing::info!(
                "Job {} {}",
                job_id,
                if locked { "locked" } else { "unlocked" }
            );
        }
        inner
            .state
            .find(job_id)
            .cloned()
            .ok_or_else(|| CanopyError::NotFound(format!("job {}", job_id)))
    }

    pub fn lock(&self, job_id: &str) -> Result<MountEntry> {
        self.set_locked(job_id, true)
    }

    pub fn unlock(&self, job_id: &str) -> Result<MountEntry> {
        self.set_locked(job_id, false)
    }

    /// Unmount every live job, keeping the records as `Unmounted`.
    ///
    /// Jobs that fail to unmount stay `Unmounting`; the first error is returned.
    pub fn shutdown(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut jobs: Vec<String> = inner.live.keys().cloned().collect();
        jobs.sort();

        let mut first_error = None;
        for job_id in jobs {
            let entry = match inner.state.find(&job_id).cloned() {
                Some(entry) => entry,
                None => continue,
            };
            let mut result = self.unmount_with_retry(&mut inner, &entry);
            if result.is_ok() {
                result = self.commit(&mut inner, |state| {
                    if let Some(e) = state.find_mut(&job_id) {
                        e.state = MountState::Unmounted;
                    }
                });
            }
            if let Err(e) = result {
                tracing::warn!("Shutdown of job {} failed: {}", job_id, e);
                first_error.get_or_insert(e);
            }
        }
        inner.changelists.retain(|_, layer| layer.strong_count() > 0);

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!("Mount registry shut down");
                Ok(())
            }
        }
    }

    /// Job ids with a live mount in this process.
    pub fn attached(&self) -> Vec<String> {
        let mut jobs: Vec<String> = self.inner.lock().live.keys().cloned().collect();
        jobs.sort();
        jobs
    }

    pub fn state_file(&self) -> PathBuf {
        self.store.path().to_path_buf()
    }
}

impl Drop for MountRegistry {
    fn drop(&mut self) {
        let live = self.inner.get_mut().live.len();
        if live > 0 {
            tracing::warn!("Mount registry dropped with {} live mount(s)", live);
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_validation() {
        assert!(validate_component("job-1", "job id").is_ok());
        for bad in ["", ".", "..", "a/b", "/abs"] {
            assert!(
                matches!(
                    validate_component(bad, "job id"),
                    Err(CanopyError::InvalidPath(_))
                ),
                "{bad:?} accepted"
            );
        }
    }

    #[test]
    fn test_mount_point_checks() {
        let dir = tempfile::tempdir().unwrap();
        assert!(check_mount_point(&dir.path().join("absent")).is_ok());
        assert!(check_mount_point(dir.path()).is_ok());

        fs::write(dir.path().join("file"), b"x").unwrap();
        assert!(matches!(
            check_mount_point(dir.path()),
            Err(CanopyError::PathInUse(_))
        ));
        assert!(matches!(
            check_mount_point(&dir.path().join("file")),
            Err(CanopyError::PathInUse(_))
        ));
    }
}
