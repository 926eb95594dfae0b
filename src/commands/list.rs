use canopy::config::load_config;
use canopy::error::Result;
use canopy::registry::{read_state, RegistrySettings};

/// Print the recorded mounts, oldest first.
///
/// Reads the state file directly, without taking the owner lock, so it works
/// while another process serves mounts.
pub fn list_mounts() -> Result<()> {
    let config = load_config()?;
    let settings = RegistrySettings::from_config(&config)?;
    let state = read_state(&settings.state_file)?;
    println!("{}", serde_json::to_string_pretty(&state.sorted())?);
    Ok(())
}
