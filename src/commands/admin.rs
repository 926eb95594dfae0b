use canopy::config::load_config;
use canopy::error::Result;
use canopy::overlay::FuseBackend;
use canopy::registry::{MountEntry, MountRegistry, RegistrySettings};
use std::sync::Arc;

fn open_registry() -> Result<MountRegistry> {
    let config = load_config()?;
    let settings = RegistrySettings::from_config(&config)?;
    MountRegistry::open(settings, Arc::new(FuseBackend::new()))
}

fn print_entry(entry: &MountEntry) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(entry)?);
    Ok(())
}

pub fn remove_job(job_id: &str) -> Result<()> {
    let registry = open_registry()?;
    let entry = registry.remove(job_id)?;
    print_entry(&entry)
}

pub fn lock_job(job_id: &str) -> Result<()> {
    let registry = open_registry()?;
    let entry = registry.lock(job_id)?;
    print_entry(&entry)
}

pub fn unlock_job(job_id: &str) -> Result<()> {
    let registry = open_registry()?;
    let entry = registry.unlock(job_id)?;
    print_entry(&entry)
}
