//! Backend selection.
//!
//! Exactly one backend per mount. The raw choices mirror the command line;
//! [`BackendSelection::from_choices`] validates them before anything is
//! opened.

use std::path::PathBuf;

use crate::error::BackendSelectionError;
use crate::vfs::EphemeralKind;

/// Backend flags as given by the user, unvalidated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendChoices {
    pub image: Option<PathBuf>,
    pub disk: Option<PathBuf>,
    pub partition: Option<usize>,
    pub archive: Option<PathBuf>,
    pub index: Option<usize>,
    pub memory: bool,
    pub discard: bool,
}

/// A validated backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendSelection {
    /// A filesystem image file or raw block device.
    FilesystemImage { path: PathBuf },
    /// A disk image or device holding a partition table.
    DiskImage { path: PathBuf, partition: usize },
    /// One image inside a multi-image archive container.
    ArchiveImage { path: PathBuf, index: usize },
    /// An in-memory tree with no backing storage.
    Ephemeral(EphemeralKind),
}

impl BackendSelection {
    pub fn from_choices(choices: BackendChoices) -> Result<Self, BackendSelectionError> {
        let mut selected = Vec::new();
        if choices.image.is_some() {
            selected.push("--image");
        }
        if choices.disk.is_some() {
            selected.push("--disk");
        }
        if choices.archive.is_some() {
            selected.push("--archive");
        }
        if choices.memory {
            selected.push("--memory");
        }
        if choices.discard {
            selected.push("--discard");
        }

        match selected.len() {
            0 => return Err(BackendSelectionError::NoneSelected),
            1 => {}
            _ => return Err(BackendSelectionError::MultipleSelected(selected)),
        }

        if choices.partition.is_some() && choices.disk.is_none() {
            return Err(BackendSelectionError::StrayIndex {
                flag: "--partition",
                requires: "--disk",
            });
        }
        if choices.index.is_some() && choices.archive.is_none() {
            return Err(BackendSelectionError::StrayIndex {
                flag: "--index",
                requires: "--archive",
            });
        }

        if let Some(path) = choices.image {
            return Ok(Self::FilesystemImage { path });
        }
        if let Some(path) = choices.disk {
            let partition = choices
                .partition
                .ok_or(BackendSelectionError::MissingIndex("--disk"))?;
            return Ok(Self::DiskImage { path, partition });
        }
        if let Some(path) = choices.archive {
            let index = choices
                .index
                .ok_or(BackendSelectionError::MissingIndex("--archive"))?;
            return Ok(Self::ArchiveImage { path, index });
        }
        if choices.memory {
            Ok(Self::Ephemeral(EphemeralKind::Retaining))
        } else {
            Ok(Self::Ephemeral(EphemeralKind::Discarding))
        }
    }

    /// Short description for logs.
    pub fn describe(&self) -> String {
        match self {
            Self::FilesystemImage { path } => format!("image {}", path.display()),
            Self::DiskImage { path, partition } => {
                format!("disk {} partition {partition}", path.display())
            }
            Self::ArchiveImage { path, index } => {
                format!("archive {} image {index}", path.display())
            }
            Self::Ephemeral(EphemeralKind::Retaining) => "in-memory filesystem".to_string(),
            Self::Ephemeral(EphemeralKind::Discarding) => "discarding filesystem".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_selected() {
        assert_eq!(
            BackendSelection::from_choices(BackendChoices::default()),
            Err(BackendSelectionError::NoneSelected)
        );
    }

    #[test]
    fn test_multiple_selected_names_every_flag() {
        let choices = BackendChoices {
            image: Some("a.img".into()),
            memory: true,
            discard: true,
            ..Default::default()
        };
        assert_eq!(
            BackendSelection::from_choices(choices),
            Err(BackendSelectionError::MultipleSelected(vec![
                "--image",
                "--memory",
                "--discard"
            ]))
        );
    }

    #[test]
    fn test_disk_requires_partition() {
        let choices = BackendChoices {
            disk: Some("disk.img".into()),
            ..Default::default()
        };
        assert_eq!(
            BackendSelection::from_choices(choices),
            Err(BackendSelectionError::MissingIndex("--disk"))
        );
    }

    #[test]
    fn test_archive_requires_index() {
        let choices = BackendChoices {
            archive: Some("set.wim".into()),
            ..Default::default()
        };
        assert_eq!(
            BackendSelection::from_choices(choices),
            Err(BackendSelectionError::MissingIndex("--archive"))
        );
    }

    #[test]
    fn test_stray_partition() {
        let choices = BackendChoices {
            image: Some("fs.img".into()),
            partition: Some(1),
            ..Default::default()
        };
        assert_eq!(
            BackendSelection::from_choices(choices),
            Err(BackendSelectionError::StrayIndex {
                flag: "--partition",
                requires: "--disk",
            })
        );
    }

    #[test]
    fn test_valid_selections() {
        let disk = BackendChoices {
            disk: Some("disk.img".into()),
            partition: Some(5),
            ..Default::default()
        };
        assert_eq!(
            BackendSelection::from_choices(disk),
            Ok(BackendSelection::DiskImage {
                path: "disk.img".into(),
                partition: 5,
            })
        );

        let discard = BackendChoices {
            discard: true,
            ..Default::default()
        };
        assert_eq!(
            BackendSelection::from_choices(discard),
            Ok(BackendSelection::Ephemeral(EphemeralKind::Discarding))
        );
    }
}
