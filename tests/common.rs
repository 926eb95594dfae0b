use canopy::overlay::{BaseRef, DetachedBackend, HostBase, LayerKind, LayerStack, WritableLayer};
use canopy::registry::{MountRegistry, RegistrySettings, RetryPolicy};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Get the path to the canopy binary for testing.
#[allow(dead_code)]
pub fn get_canopy_path() -> PathBuf {
    assert_cmd::cargo::cargo_bin!("canopy").to_path_buf()
}

/// Write `files` (path, content) under `root`, creating parents.
#[allow(dead_code)]
pub fn write_tree(root: &Path, files: &[(&str, &str)]) {
    fs::create_dir_all(root).unwrap();
    for (path, content) in files {
        let host = root.join(path);
        if let Some(parent) = host.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(host, content).unwrap();
    }
}

/// Every file under `root` as (relative path, content), sorted.
#[allow(dead_code)]
pub fn read_tree(root: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    let mut files: Vec<(PathBuf, Vec<u8>)> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(root).unwrap().to_path_buf();
            (rel, fs::read(e.path()).unwrap())
        })
        .collect();
    files.sort();
    files
}

/// Test workspace with a populated host base directory.
/// Used by several test files - #[allow(dead_code)] because not all tests use all helpers.
#[allow(dead_code)]
pub struct Workspace {
    pub temp_dir: TempDir,
    pub base_root: PathBuf,
    pub base: BaseRef,
}

#[allow(dead_code)]
impl Workspace {
    pub fn new(files: &[(&str, &str)]) -> Self {
        let temp_dir = tempfile::tempdir().unwrap();
        let base_root = temp_dir.path().join("base");
        write_tree(&base_root, files);
        let base = HostBase::shared(base_root.clone()).unwrap();
        Workspace {
            temp_dir,
            base_root,
            base,
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// A standalone stack with its own upper, optionally sharing `changelist`.
    pub fn stack(&self, job_id: &str, changelist: Option<Arc<WritableLayer>>) -> LayerStack {
        let upper = Arc::new(
            WritableLayer::open(LayerKind::Upper, self.path().join("uppers").join(job_id))
                .unwrap(),
        );
        LayerStack::new(job_id, upper, changelist, Arc::clone(&self.base))
    }

    pub fn changelist(&self, name: &str) -> Arc<WritableLayer> {
        Arc::new(
            WritableLayer::open(
                LayerKind::Changelist,
                self.path().join("changelists").join(name),
            )
            .unwrap(),
        )
    }

    /// Registry settings rooted in the workspace, with fast unmount retries.
    pub fn settings(&self) -> RegistrySettings {
        let mut settings = RegistrySettings::under(&self.path().join("data"));
        settings.retry = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        };
        settings
    }

    pub fn registry(&self, backend: &DetachedBackend) -> MountRegistry {
        MountRegistry::open(self.settings(), Arc::new(backend.clone())).unwrap()
    }

    pub fn mount_path(&self, name: &str) -> PathBuf {
        self.path().join("mnt").join(name)
    }
}
