//! Mount defaults loaded from `~/.config/imgmount/config.ron`.
//!
//! Every field is optional. A missing file means defaults; a broken file at
//! the default location is logged and ignored. A file named explicitly on
//! the command line must load.
//!
//! ```ron
//! (
//!     fs_name: "imgmount",
//!     volume_label: Some("scratch"),
//!     allow_other: false,
//!     auto_unmount: true,
//!     sector_size: None,
//!     attr_ttl_secs: 1,
//!     dispatch_threads: 4,
//! )
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Defaults applied to every mount.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MountDefaults {
    /// Filesystem name reported to the host.
    pub fs_name: String,
    /// Volume label; falls back to the filesystem's own label.
    pub volume_label: Option<String>,
    /// Let other users access the mount.
    pub allow_other: bool,
    /// Unmount automatically when the process exits.
    pub auto_unmount: bool,
    /// Alignment override for raw block devices.
    pub sector_size: Option<u32>,
    /// How long the host may cache attributes.
    pub attr_ttl_secs: u64,
    /// Worker count for concurrent dispatch.
    pub dispatch_threads: u16,
}

impl Default for MountDefaults {
    fn default() -> Self {
        Self {
            fs_name: "imgmount".to_string(),
            volume_label: None,
            allow_other: false,
            auto_unmount: true,
            sector_size: None,
            attr_ttl_secs: 1,
            dispatch_threads: 4,
        }
    }
}

impl MountDefaults {
    pub fn attr_ttl(&self) -> Duration {
        Duration::from_secs(self.attr_ttl_secs)
    }
}

/// Error type for config loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Ron {
        path: PathBuf,
        source: ron::error::SpannedError,
    },
}

/// Default config path (`~/.config/imgmount/config.ron`).
pub fn config_file_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("imgmount").join("config.ron"))
}

/// Load and parse a config file.
pub fn load_from_file(path: &Path) -> Result<MountDefaults, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    ron::from_str(&text).map_err(|source| ConfigError::Ron {
        path: path.to_path_buf(),
        source,
    })
}

/// Load mount defaults.
///
/// `explicit` must load; the default location falls back to
/// `MountDefaults::default()` on any error.
pub fn load(explicit: Option<&Path>) -> Result<MountDefaults, ConfigError> {
    if let Some(path) = explicit {
        let defaults = load_from_file(path)?;
        tracing::info!(path = %path.display(), "loaded config");
        return Ok(defaults);
    }

    let Some(path) = config_file_path() else {
        tracing::info!("no config directory available, using default mount settings");
        return Ok(MountDefaults::default());
    };

    if !path.exists() {
        tracing::info!(path = %path.display(), "config file not found, using defaults");
        return Ok(MountDefaults::default());
    }

    match load_from_file(&path) {
        Ok(defaults) => {
            tracing::info!(path = %path.display(), "loaded config");
            Ok(defaults)
        }
        Err(e) => {
            tracing::warn!("{e}");
            tracing::warn!("falling back to default mount settings");
            Ok(MountDefaults::default())
        }
    }
}
