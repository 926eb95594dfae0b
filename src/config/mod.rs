pub mod paths;
pub mod persistence;
pub mod schema;

pub use paths::*;
pub use persistence::*;
pub use schema::*;

fn default_upper_root() -> String {
    "uppers".to_string()
}

fn default_changelist_root() -> String {
    "changelists".to_string()
}

fn default_mount_root() -> String {
    "mounts".to_string()
}

fn default_state_file() -> String {
    "registry.json".to_string()
}

fn default_fuse_ttl_secs() -> u64 {
    1
}

fn default_fuse_workers() -> usize {
    4
}

fn default_unmount_max_attempts() -> u32 {
    5
}

fn default_unmount_initial_backoff_ms() -> u64 {
    50
}

fn default_unmount_max_backoff_ms() -> u64 {
    1000
}
