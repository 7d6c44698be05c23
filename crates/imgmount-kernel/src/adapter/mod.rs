//! Host mount adapters.
//!
//! An adapter registers a filesystem with the operating system's user-space
//! mount mechanism and blocks until the volume is gone. FUSE serves POSIX
//! hosts; the Dokan adapter serves PC hosts through a [`dokan::VolumeDriver`].

use std::path::Path;
use tokio::runtime::Handle;

use crate::capability::MountHost;
use crate::config::MountDefaults;
use crate::error::MountAdapterError;
use crate::session::MountSession;

pub mod dokan;
#[cfg(unix)]
pub mod fuse;

pub use dokan::{DokanAdapter, DokanFlags, DokanMountOptions, UnavailableDriver, VolumeDriver};
#[cfg(unix)]
pub use fuse::FuseAdapter;

/// Registers a filesystem with the host and serves it until unmount.
pub trait HostMountAdapter: Send + Sync {
    fn host(&self) -> MountHost;

    /// Mount the session's filesystem at `target` and block until unmounted.
    ///
    /// The adapter drives the session state: `Mounted` once the volume is
    /// ready, `Unmounted` before returning.
    fn mount(&self, session: &MountSession, target: &Path) -> Result<(), MountAdapterError>;
}

/// The adapter for this host.
#[cfg(unix)]
pub fn host_default(runtime: Handle, defaults: MountDefaults) -> Box<dyn HostMountAdapter> {
    Box::new(FuseAdapter::new(runtime, defaults))
}

/// The adapter for this host.
///
/// No volume driver is bundled, so mounts on these hosts report
/// [`MountAdapterError::Unsupported`].
#[cfg(not(unix))]
pub fn host_default(runtime: Handle, defaults: MountDefaults) -> Box<dyn HostMountAdapter> {
    use std::sync::Arc;
    Box::new(DokanAdapter::new(runtime, defaults, Arc::new(UnavailableDriver)))
}
