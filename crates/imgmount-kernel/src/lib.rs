//! imgmount kernel: the filesystem contract and the mount core.
//!
//! - [`vfs`]: the async filesystem contract, ephemeral backends, read-only view
//! - [`capability`]: capability negotiation into a mount configuration
//! - [`formats`]: filesystem/disk/archive detectors and partition tables
//! - [`backend`]: backend selection
//! - [`session`]: mount session state and the interrupt relay
//! - [`adapter`]: host mount adapters (FUSE, Dokan)
//! - [`orchestrator`]: select, open, negotiate, mount
//! - [`config`]: mount defaults from `config.ron`

pub mod adapter;
pub mod backend;
pub mod capability;
pub mod config;
pub mod error;
pub mod formats;
pub mod orchestrator;
pub mod session;
pub mod vfs;

pub use adapter::{HostMountAdapter, host_default};
pub use backend::{BackendChoices, BackendSelection};
pub use capability::{
    CapabilityFlags, CapabilityNotice, DispatchMode, MountConfiguration, MountHost, MountOption,
    negotiate,
};
pub use config::MountDefaults;
pub use error::{BackendSelectionError, MountAdapterError, MountError, OpenError};
pub use formats::FormatRegistry;
pub use orchestrator::{MountOrchestrator, MountPhase, MountReport, MountRequest};
pub use session::{InterruptAction, InterruptRelay, MountSession, SessionHandle, SessionState};
pub use vfs::{MemoryBackend, VfsError, VfsOps, VfsResult};
