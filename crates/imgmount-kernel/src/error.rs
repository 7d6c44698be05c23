//! Orchestration error types.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use imgmount_device::DeviceError;

use crate::capability::MountHost;
use crate::config::ConfigError;
use crate::session::InvalidTransition;
use crate::vfs::VfsError;

/// Exit status when no usable filesystem was found.
pub const EXIT_NO_FILESYSTEM: i32 = 2;

/// Exit status for failures without a native error code.
pub const EXIT_FAILURE: i32 = 1;

/// The backend choice is unusable. Raised before any mount is attempted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BackendSelectionError {
    #[error("no backend selected: pass one of --image, --disk, --archive, --memory, --discard")]
    NoneSelected,

    #[error("only one backend may be selected, got {}", .0.join(", "))]
    MultipleSelected(Vec<&'static str>),

    #[error("{0} requires an index")]
    MissingIndex(&'static str),

    #[error("{flag} only applies to {requires}")]
    StrayIndex {
        flag: &'static str,
        requires: &'static str,
    },

    #[error("partition {requested} requested but the disk has {available}")]
    PartitionOutOfRange { requested: usize, available: usize },

    #[error("image {requested} requested but the archive holds {available}")]
    ImageOutOfRange { requested: usize, available: usize },
}

/// Opening the backend failed.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("filesystem driver failed")]
    Vfs(#[from] VfsError),

    #[error("{0} is not a recognized archive container")]
    UnrecognizedArchive(PathBuf),

    #[error("no usable filesystem found in {path}{}", volume_suffix(.volume))]
    NoFilesystem {
        path: PathBuf,
        volume: Option<usize>,
    },
}

fn volume_suffix(volume: &Option<usize>) -> String {
    volume
        .map(|v| format!(" (volume {v})"))
        .unwrap_or_default()
}

impl OpenError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// A host adapter failed to establish or keep the mount.
#[derive(Debug, Error)]
pub enum MountAdapterError {
    #[error("failed to mount at {target}")]
    Mount {
        target: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("volume driver error {code}: {message}")]
    Driver { code: i32, message: String },

    #[error("{0} mounts are not available on this host")]
    Unsupported(MountHost),

    #[error(transparent)]
    Session(#[from] InvalidTransition),
}

impl MountAdapterError {
    pub fn mount(target: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Mount {
            target: target.into(),
            source,
        }
    }

    /// The native error code, if the host reported one.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            MountAdapterError::Mount { source, .. } => source.raw_os_error(),
            MountAdapterError::Driver { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Top-level mount failure.
#[derive(Debug, Error)]
pub enum MountError {
    #[error("invalid backend selection")]
    Selection(#[from] BackendSelectionError),

    #[error("failed to open backend")]
    Open(#[from] OpenError),

    #[error("mount failed")]
    Adapter(#[from] MountAdapterError),

    #[error("failed to load configuration")]
    Config(#[from] ConfigError),

    #[error("failed to start the async runtime")]
    Runtime(#[source] io::Error),
}

impl MountError {
    /// Process exit status for this failure.
    ///
    /// The native error code when one is available, [`EXIT_NO_FILESYSTEM`]
    /// when nothing mountable was found, [`EXIT_FAILURE`] otherwise.
    pub fn exit_code(&self) -> i32 {
        if let Some(code) = self.os_code().filter(|c| *c > 0) {
            return code;
        }
        match self {
            MountError::Open(OpenError::NoFilesystem { .. }) => EXIT_NO_FILESYSTEM,
            _ => EXIT_FAILURE,
        }
    }

    fn os_code(&self) -> Option<i32> {
        match self {
            MountError::Open(OpenError::Device(e)) => e.os_code(),
            MountError::Open(OpenError::Io { source, .. }) => source.raw_os_error(),
            MountError::Open(OpenError::Vfs(VfsError::Io(e))) => e.raw_os_error(),
            MountError::Adapter(e) => e.os_code(),
            MountError::Config(ConfigError::Io { source, .. }) => source.raw_os_error(),
            MountError::Runtime(e) => e.raw_os_error(),
            _ => None,
        }
    }
}
