//! The layered filesystem: layers, resolution, copy-up, the per-job stack
//! and its FUSE adapter.

mod convert;
mod copy_up;
pub mod dispatcher;
pub mod fault;
mod file_handle;
pub mod inode_table;
pub mod layer;
pub mod locks;
pub mod mount;
pub mod path_index;
pub mod stack;
pub mod types;
pub mod whiteout;

pub use dispatcher::{DispatchCore, FuseDispatcher, MountControl, MountState};
pub use fault::{FaultErrno, FaultInjector, FaultOp, FaultRule};
pub use layer::{BaseLayer, BaseRef, HostBase, WritableLayer};
pub use mount::{DetachedBackend, FuseBackend, MountBackend, MountSession, UnmountOutcome};
pub use path_index::{LayerHit, PathIndex, Resolution};
pub use stack::LayerStack;
pub use types::{normalize_rel, DirEntryInfo, EntryKind, EntryStat, LayerKind, SetAttr};
pub use whiteout::WhiteoutSet;
