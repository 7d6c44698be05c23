//! PC-host adapter for Dokan-style user-mode volume drivers.
//!
//! The driver's dispatch machinery stays behind [`VolumeDriver`]; this
//! module owns option translation and the cooperative Ctrl-C policy. While
//! the volume is mounted an interrupt becomes an unmount request for the
//! mount point instead of killing the process.
//!
//! No driver binding ships with this crate. Embedders pass their own
//! [`VolumeDriver`]; with [`UnavailableDriver`] every mount is refused as
//! unsupported before any session state changes.

use std::fmt;
use std::io;
use std::ops::BitOr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

use super::HostMountAdapter;
use crate::capability::{DispatchMode, MountConfiguration, MountHost, MountOption};
use crate::config::MountDefaults;
use crate::error::MountAdapterError;
use crate::session::{InterruptRelay, MountSession, SessionHandle};
use crate::vfs::VfsOps;

/// Driver mount flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DokanFlags(u32);

impl DokanFlags {
    pub const NONE: Self = Self(0);
    pub const ALT_STREAM: Self = Self(1 << 2);
    pub const WRITE_PROTECT: Self = Self(1 << 3);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for DokanFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Everything the volume driver needs to bring the volume up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DokanMountOptions {
    pub mount_point: PathBuf,
    pub flags: DokanFlags,
    pub single_thread: bool,
    pub thread_count: u16,
    pub volume_label: String,
    pub fs_name: String,
    pub timeout: Duration,
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Translate a mount configuration into driver options.
///
/// The label comes from the config file when set, else from the
/// filesystem, else the configured filesystem name.
pub fn mount_options(
    config: &MountConfiguration,
    defaults: &MountDefaults,
    fs_label: Option<String>,
    target: &Path,
) -> DokanMountOptions {
    let mut flags = DokanFlags::NONE;
    for option in config.options_for(MountHost::Dokan) {
        match option {
            MountOption::WriteProtect => flags = flags | DokanFlags::WRITE_PROTECT,
            MountOption::AlternateStreams => flags = flags | DokanFlags::ALT_STREAM,
            MountOption::ReadOnlyCache => {}
        }
    }
    let single_thread = config.dispatch_mode == DispatchMode::SingleThreaded;

    DokanMountOptions {
        mount_point: target.to_path_buf(),
        flags,
        single_thread,
        thread_count: if single_thread {
            1
        } else {
            defaults.dispatch_threads.max(1)
        },
        volume_label: defaults
            .volume_label
            .clone()
            .or(fs_label)
            .unwrap_or_else(|| defaults.fs_name.clone()),
        fs_name: defaults.fs_name.clone(),
        timeout: DEFAULT_TIMEOUT,
    }
}

/// Binding to the host's user-mode volume driver.
pub trait VolumeDriver: Send + Sync {
    /// Serve `fs` at `options.mount_point` until the volume is unmounted.
    ///
    /// Implementations call [`SessionHandle::mark_mounted`] once the volume
    /// is ready for requests and return after it is gone.
    fn run(
        &self,
        fs: Arc<dyn VfsOps>,
        options: &DokanMountOptions,
        session: &SessionHandle,
    ) -> Result<(), MountAdapterError>;

    /// Ask the driver to remove the volume at `mount_point`.
    fn unmount(&self, mount_point: &Path) -> io::Result<()>;

    /// Whether a driver is actually installed behind this binding.
    fn is_available(&self) -> bool {
        true
    }
}

/// Placeholder for hosts without a volume driver. Never mounts.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableDriver;

impl VolumeDriver for UnavailableDriver {
    fn run(
        &self,
        _fs: Arc<dyn VfsOps>,
        _options: &DokanMountOptions,
        _session: &SessionHandle,
    ) -> Result<(), MountAdapterError> {
        Err(MountAdapterError::Unsupported(MountHost::Dokan))
    }

    fn unmount(&self, _mount_point: &Path) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "no volume driver installed",
        ))
    }

    fn is_available(&self) -> bool {
        false
    }
}

pub struct DokanAdapter {
    runtime: Handle,
    defaults: MountDefaults,
    driver: Arc<dyn VolumeDriver>,
}

impl fmt::Debug for DokanAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DokanAdapter")
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl DokanAdapter {
    pub fn new(runtime: Handle, defaults: MountDefaults, driver: Arc<dyn VolumeDriver>) -> Self {
        Self {
            runtime,
            defaults,
            driver,
        }
    }
}

impl HostMountAdapter for DokanAdapter {
    fn host(&self) -> MountHost {
        MountHost::Dokan
    }

    fn mount(&self, session: &MountSession, target: &Path) -> Result<(), MountAdapterError> {
        if !self.driver.is_available() {
            tracing::warn!(target = %target.display(), "no volume driver installed");
            return Err(MountAdapterError::Unsupported(MountHost::Dokan));
        }
        let options = mount_options(
            session.configuration(),
            &self.defaults,
            session.filesystem().volume_label(),
            target,
        );
        tracing::info!(
            target = %target.display(),
            flags = options.flags.bits(),
            threads = options.thread_count,
            label = %options.volume_label,
            "mounting volume"
        );

        let handle = session.handle();
        let driver = self.driver.clone();
        let mount_point = options.mount_point.clone();
        handle.set_unmounter(move || driver.unmount(&mount_point));
        let relay = InterruptRelay::new(handle.clone()).spawn(&self.runtime);

        let result = self
            .driver
            .run(session.filesystem().clone(), &options, handle);

        handle.clear_unmounter();
        handle.mark_unmounted();
        relay.abort();
        match &result {
            Ok(()) => tracing::info!(target = %target.display(), "volume unmounted"),
            Err(e) => tracing::warn!(target = %target.display(), "volume driver failed: {e}"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityFlags, negotiate};
    use imgmount_device::Access;

    fn flags(can_write: bool, is_thread_safe: bool, has_named_streams: bool) -> CapabilityFlags {
        CapabilityFlags {
            can_write,
            is_thread_safe,
            has_named_streams,
        }
    }

    #[test]
    fn test_read_only_sets_write_protect() {
        let config = negotiate(flags(false, true, false), Access::ReadWrite);
        let options = mount_options(&config, &MountDefaults::default(), None, Path::new("M:\\"));

        assert!(options.flags.contains(DokanFlags::WRITE_PROTECT));
        assert!(!options.flags.contains(DokanFlags::ALT_STREAM));
        assert!(!options.single_thread);
        assert_eq!(options.thread_count, 4);
        assert_eq!(options.volume_label, "imgmount");
    }

    #[test]
    fn test_named_streams_and_single_thread() {
        let config = negotiate(flags(true, false, true), Access::ReadWrite);
        let options = mount_options(
            &config,
            &MountDefaults::default(),
            Some("DATA".to_string()),
            Path::new("M:\\"),
        );

        assert_eq!(options.flags, DokanFlags::ALT_STREAM);
        assert!(options.single_thread);
        assert_eq!(options.thread_count, 1);
        assert_eq!(options.volume_label, "DATA");
    }

    #[test]
    fn test_configured_label_wins() {
        let config = negotiate(flags(true, true, false), Access::ReadOnly);
        let defaults = MountDefaults {
            volume_label: Some("scratch".to_string()),
            ..MountDefaults::default()
        };
        let options = mount_options(&config, &defaults, Some("DATA".to_string()), Path::new("X:"));

        assert_eq!(options.volume_label, "scratch");
        assert!(options.flags.contains(DokanFlags::WRITE_PROTECT));
    }

    #[test]
    fn test_flag_bits_match_driver_values() {
        let config = negotiate(flags(false, true, true), Access::ReadOnly);
        let options = mount_options(&config, &MountDefaults::default(), None, Path::new("M:\\"));

        assert_eq!(options.flags.bits(), 0b1100);
        assert_eq!(DokanFlags::ALT_STREAM.bits(), 4);
        assert_eq!(DokanFlags::WRITE_PROTECT.bits(), 8);
    }

    #[test]
    fn test_unavailable_driver_reports_itself() {
        assert!(!UnavailableDriver.is_available());
        let err = UnavailableDriver.unmount(Path::new("M:\\")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
