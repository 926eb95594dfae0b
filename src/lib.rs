pub mod config;
pub mod error;
pub mod overlay;
pub mod registry;

pub use config::expand_tilde;
pub use config::get_config_path;
pub use config::get_data_dir;
pub use config::load_config;
pub use config::load_config_from;
pub use config::save_config;
pub use config::Config;

pub use error::{CanopyError, Result};

pub use overlay::{
    BaseLayer, BaseRef, DetachedBackend, FuseBackend, HostBase, LayerStack, MountBackend,
    MountState, WritableLayer,
};

pub use registry::{MountEntry, MountRegistry, RegistrySettings};
