//! Mount capability negotiation.
//!
//! [`negotiate`] turns a filesystem's [`CapabilityFlags`] and the user's
//! requested access into a [`MountConfiguration`]. It never fails: anything
//! the filesystem cannot honor is downgraded, logged, and recorded as a
//! [`CapabilityNotice`] on the result.
//!
//! Rules, in order:
//!
//! 1. Write requested on a filesystem that cannot write: read-only, with notice.
//! 2. Read-only access adds the explicit write-protect marker and the
//!    read-only cache option.
//! 3. A filesystem that is not thread-safe is always dispatched single-threaded.
//! 4. Named data streams add the alternate-stream option.
//!
//! Options are host-neutral; each host adapter picks the ones it understands
//! via [`MountConfiguration::options_for`].

use std::collections::BTreeSet;

use imgmount_device::Access;

/// What a filesystem instance supports. Read once per mount, never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CapabilityFlags {
    pub can_write: bool,
    pub is_thread_safe: bool,
    pub has_named_streams: bool,
}

impl CapabilityFlags {
    /// A read-only, thread-safe filesystem without named streams.
    pub const fn read_only() -> Self {
        Self {
            can_write: false,
            is_thread_safe: true,
            has_named_streams: false,
        }
    }
}

/// Whether host callbacks may run concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchMode {
    SingleThreaded,
    Concurrent,
}

/// The host mount mechanism an option applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MountHost {
    /// POSIX-style userspace mounts (FUSE).
    Fuse,
    /// PC-class host volume driver (Dokan).
    Dokan,
}

impl std::fmt::Display for MountHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MountHost::Fuse => f.write_str("fuse"),
            MountHost::Dokan => f.write_str("dokan"),
        }
    }
}

/// Host-neutral extra mount option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MountOption {
    /// Explicit write-protection marker on the volume.
    WriteProtect,
    /// Let the host cache file content aggressively; nothing changes underneath.
    ReadOnlyCache,
    /// Expose named alternate data streams.
    AlternateStreams,
}

impl MountOption {
    /// The hosts that understand this option.
    pub fn applies_to(self, host: MountHost) -> bool {
        match self {
            MountOption::WriteProtect | MountOption::AlternateStreams => host == MountHost::Dokan,
            MountOption::ReadOnlyCache => host == MountHost::Fuse,
        }
    }
}

/// Something the negotiation changed relative to the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityNotice {
    /// Write access was requested but the filesystem cannot write.
    WriteDowngraded,
    /// The filesystem is not thread-safe; dispatch is serialized.
    SingleThreadForced,
}

impl std::fmt::Display for CapabilityNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapabilityNotice::WriteDowngraded => {
                f.write_str("write access requested but the filesystem is read-only; mounting read-only")
            }
            CapabilityNotice::SingleThreadForced => {
                f.write_str("filesystem is not thread-safe; dispatching single-threaded")
            }
        }
    }
}

/// The validated mount configuration. Derived per mount attempt, never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountConfiguration {
    pub effective_access: Access,
    pub dispatch_mode: DispatchMode,
    pub extra_options: BTreeSet<MountOption>,
    pub notices: Vec<CapabilityNotice>,
}

impl MountConfiguration {
    pub fn is_read_only(&self) -> bool {
        !self.effective_access.is_writable()
    }

    pub fn has_option(&self, option: MountOption) -> bool {
        self.extra_options.contains(&option)
    }

    /// The extra options meaningful on `host`.
    pub fn options_for(&self, host: MountHost) -> impl Iterator<Item = MountOption> + '_ {
        self.extra_options
            .iter()
            .copied()
            .filter(move |option| option.applies_to(host))
    }
}

/// Compute the mount configuration for `flags` and the `requested` access.
pub fn negotiate(flags: CapabilityFlags, requested: Access) -> MountConfiguration {
    let mut notices = Vec::new();
    let mut extra_options = BTreeSet::new();

    let effective_access = if requested.is_writable() && !flags.can_write {
        tracing::warn!("write access requested but the filesystem does not support writing; mounting read-only");
        notices.push(CapabilityNotice::WriteDowngraded);
        Access::ReadOnly
    } else {
        requested
    };

    if !effective_access.is_writable() {
        extra_options.insert(MountOption::WriteProtect);
        extra_options.insert(MountOption::ReadOnlyCache);
    }

    let dispatch_mode = if flags.is_thread_safe {
        DispatchMode::Concurrent
    } else {
        tracing::info!("filesystem is not thread-safe, dispatching single-threaded");
        notices.push(CapabilityNotice::SingleThreadForced);
        DispatchMode::SingleThreaded
    };

    if flags.has_named_streams {
        extra_options.insert(MountOption::AlternateStreams);
    }

    let config = MountConfiguration {
        effective_access,
        dispatch_mode,
        extra_options,
        notices,
    };
    tracing::debug!(?flags, ?requested, ?config, "negotiated mount configuration");
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_flags() -> impl Iterator<Item = CapabilityFlags> {
        (0u8..8).map(|bits| CapabilityFlags {
            can_write: bits & 1 != 0,
            is_thread_safe: bits & 2 != 0,
            has_named_streams: bits & 4 != 0,
        })
    }

    #[test]
    fn test_write_downgrade_is_total() {
        for flags in all_flags().filter(|f| !f.can_write) {
            let config = negotiate(flags, Access::ReadWrite);
            assert_eq!(config.effective_access, Access::ReadOnly);
            assert!(config.notices.contains(&CapabilityNotice::WriteDowngraded));
            assert!(config.has_option(MountOption::WriteProtect));
        }
    }

    #[test]
    fn test_non_thread_safe_always_single_threaded() {
        for flags in all_flags().filter(|f| !f.is_thread_safe) {
            for requested in [Access::ReadOnly, Access::ReadWrite] {
                let config = negotiate(flags, requested);
                assert_eq!(config.dispatch_mode, DispatchMode::SingleThreaded);
            }
        }
    }

    #[test]
    fn test_writable_request_honored() {
        let flags = CapabilityFlags {
            can_write: true,
            is_thread_safe: true,
            has_named_streams: false,
        };
        let config = negotiate(flags, Access::ReadWrite);
        assert_eq!(config.effective_access, Access::ReadWrite);
        assert_eq!(config.dispatch_mode, DispatchMode::Concurrent);
        assert!(config.extra_options.is_empty());
        assert!(config.notices.is_empty());
    }

    #[test]
    fn test_read_only_request_on_writable_fs_is_silent() {
        let flags = CapabilityFlags {
            can_write: true,
            is_thread_safe: true,
            has_named_streams: false,
        };
        let config = negotiate(flags, Access::ReadOnly);
        assert!(config.is_read_only());
        assert!(config.notices.is_empty());
    }

    #[test]
    fn test_named_streams_only_on_dokan() {
        let flags = CapabilityFlags {
            can_write: true,
            is_thread_safe: true,
            has_named_streams: true,
        };
        let config = negotiate(flags, Access::ReadWrite);
        assert!(config.has_option(MountOption::AlternateStreams));
        assert_eq!(
            config.options_for(MountHost::Dokan).collect::<Vec<_>>(),
            vec![MountOption::AlternateStreams]
        );
        assert_eq!(config.options_for(MountHost::Fuse).count(), 0);
    }

    #[test]
    fn test_read_only_options_split_by_host() {
        let config = negotiate(CapabilityFlags::read_only(), Access::ReadOnly);
        assert_eq!(
            config.options_for(MountHost::Fuse).collect::<Vec<_>>(),
            vec![MountOption::ReadOnlyCache]
        );
        assert_eq!(
            config.options_for(MountHost::Dokan).collect::<Vec<_>>(),
            vec![MountOption::WriteProtect]
        );
    }

    #[test]
    fn test_negotiation_is_deterministic() {
        for flags in all_flags() {
            for requested in [Access::ReadOnly, Access::ReadWrite] {
                assert_eq!(negotiate(flags, requested), negotiate(flags, requested));
            }
        }
    }
}
