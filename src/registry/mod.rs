pub mod lifecycle;
pub mod store;
pub mod types;

pub use lifecycle::MountRegistry;
pub use store::{read_state, StateStore};
pub use types::{
    ChangelistRef, LayerRoots, MountEntry, RegistrySettings, RegistryState, RetryPolicy,
    STATE_VERSION,
};
