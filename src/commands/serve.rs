use canopy::config::load_config;
use canopy::error::{CanopyError, Result};
use canopy::overlay::{FuseBackend, HostBase, MountState};
use canopy::registry::{MountRegistry, RegistrySettings};
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Mount one job and keep serving it until Ctrl-C.
///
/// On interrupt an unlocked job is removed; a locked job is unmounted and
/// stays recorded so a later `serve` picks its upper layer back up.
pub async fn serve_job(
    job_id: &str,
    base: &Path,
    mount: Option<&Path>,
    changelist: Option<&str>,
) -> Result<i32> {
    let config = load_config()?;
    let settings = RegistrySettings::from_config(&config)?;
    let registry = MountRegistry::open(settings, Arc::new(FuseBackend::new()))?;

    let base = HostBase::shared(absolute(base)?).map_err(|e| {
        CanopyError::Config(format!(
            "Invalid base directory {}: {}",
            base.display(),
            e
        ))
    })?;
    registry.register_base(Arc::clone(&base));

    let mount = match mount {
        Some(path) => Some(absolute(path)?),
        None => None,
    };

    let recorded = registry.get(job_id);
    let entry = match (&recorded, &mount) {
        (Some(r), requested)
            if r.state == MountState::Active
                && requested.as_ref().map_or(true, |p| *p == r.mount_path) =>
        {
            registry.reattach(job_id)?
        }
        (_, Some(path)) => registry.mount(job_id, path, base, changelist)?,
        (Some(r), None) => registry.mount(job_id, &r.mount_path, base, changelist)?,
        (None, None) => registry.mount_default(job_id, base, changelist)?,
    };

    println!("{}", serde_json::to_string_pretty(&entry)?);
    eprintln!(
        "Serving job {} at {} (Ctrl-C to stop)",
        entry.job_id,
        entry.mount_path.display()
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| CanopyError::Config(format!("Failed to wait for Ctrl+C: {}", e)))?;

    let locked = registry.get(job_id).map(|e| e.locked).unwrap_or(false);
    if locked {
        registry.shutdown()?;
        eprintln!("Job {} is locked; unmounted and kept", job_id);
    } else {
        registry.remove(job_id)?;
        registry.shutdown()?;
        eprintln!("Job {} removed", job_id);
    }
    Ok(0)
}
