pub mod admin;
pub mod list;
pub mod serve;

pub use admin::{lock_job, remove_job, unlock_job};
pub use list::list_mounts;
pub use serve::serve_job;
