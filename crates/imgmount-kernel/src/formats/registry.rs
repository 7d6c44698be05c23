//! Explicit registry of filesystem, disk and archive formats.
//!
//! Built once at startup and passed by reference to everything that needs
//! to detect or open an image. There is no global registration.

use std::io::{self, Seek, SeekFrom};
use std::sync::Arc;

use imgmount_device::{Access, BoxedStream, DeviceError, ImageStream};

use crate::vfs::{VfsOps, VfsResult};

/// Parses one on-disk filesystem format.
pub trait FilesystemFactory: Send + Sync {
    fn name(&self) -> &str;

    /// Whether `stream` holds this filesystem. The stream is rewound first.
    fn detect(&self, stream: &mut dyn ImageStream) -> io::Result<bool>;

    fn open(&self, stream: BoxedStream, access: Access) -> VfsResult<Arc<dyn VfsOps>>;
}

/// Unwraps a disk-image container into a flat disk stream.
pub trait DiskFormat: Send + Sync {
    fn name(&self) -> &str;

    fn detect(&self, stream: &mut dyn ImageStream) -> io::Result<bool>;

    fn open(&self, stream: BoxedStream) -> Result<BoxedStream, DeviceError>;
}

/// A container holding several filesystem images.
pub trait ArchiveFormat: Send + Sync {
    fn name(&self) -> &str;

    fn detect(&self, stream: &mut dyn ImageStream) -> io::Result<bool>;

    /// Number of images in the container.
    fn image_count(&self, stream: &mut dyn ImageStream) -> io::Result<usize>;

    /// Open image `index` (0-based) as a filesystem.
    fn open_image(
        &self,
        stream: BoxedStream,
        index: usize,
        access: Access,
    ) -> VfsResult<Arc<dyn VfsOps>>;
}

/// A flat image is its own disk. Always matches.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawDisk;

impl DiskFormat for RawDisk {
    fn name(&self) -> &str {
        "raw"
    }

    fn detect(&self, _stream: &mut dyn ImageStream) -> io::Result<bool> {
        Ok(true)
    }

    fn open(&self, stream: BoxedStream) -> Result<BoxedStream, DeviceError> {
        Ok(stream)
    }
}

/// Known formats, probed in registration order.
pub struct FormatRegistry {
    filesystems: Vec<Box<dyn FilesystemFactory>>,
    disks: Vec<Box<dyn DiskFormat>>,
    archives: Vec<Box<dyn ArchiveFormat>>,
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FormatRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormatRegistry")
            .field("filesystems", &self.filesystem_names())
            .field("disks", &self.disks.iter().map(|d| d.name()).collect::<Vec<_>>())
            .field("archives", &self.archives.iter().map(|a| a.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl FormatRegistry {
    /// A registry with no filesystem parsers and the flat disk format.
    pub fn new() -> Self {
        Self {
            filesystems: Vec::new(),
            disks: Vec::new(),
            archives: Vec::new(),
        }
    }

    pub fn register_filesystem(&mut self, factory: impl FilesystemFactory + 'static) -> &mut Self {
        self.filesystems.push(Box::new(factory));
        self
    }

    /// Register a disk container format. Probed before the flat fallback.
    pub fn register_disk(&mut self, format: impl DiskFormat + 'static) -> &mut Self {
        self.disks.push(Box::new(format));
        self
    }

    pub fn register_archive(&mut self, format: impl ArchiveFormat + 'static) -> &mut Self {
        self.archives.push(Box::new(format));
        self
    }

    pub fn filesystem_names(&self) -> Vec<&str> {
        self.filesystems.iter().map(|f| f.name()).collect()
    }

    /// The first filesystem format that recognizes `stream`.
    pub fn detect_filesystem(
        &self,
        stream: &mut dyn ImageStream,
    ) -> io::Result<Option<&dyn FilesystemFactory>> {
        for factory in &self.filesystems {
            if probe(stream, |s| factory.detect(s))? {
                tracing::debug!(format = factory.name(), "detected filesystem");
                return Ok(Some(factory.as_ref()));
            }
        }
        Ok(None)
    }

    /// Detect and open a filesystem, or `None` if nothing recognizes it.
    pub fn open_filesystem(
        &self,
        mut stream: BoxedStream,
        access: Access,
    ) -> io::Result<Option<VfsResult<Arc<dyn VfsOps>>>> {
        let Some(factory) = self.detect_filesystem(stream.as_mut())? else {
            return Ok(None);
        };
        stream.seek(SeekFrom::Start(0))?;
        Ok(Some(factory.open(stream, access)))
    }

    /// Unwrap a disk container; flat images pass through unchanged.
    pub fn open_disk(&self, mut stream: BoxedStream) -> Result<BoxedStream, DeviceError> {
        for format in &self.disks {
            if probe(stream.as_mut(), |s| format.detect(s))? {
                tracing::debug!(format = format.name(), "detected disk container");
                stream.seek(SeekFrom::Start(0))?;
                return format.open(stream);
            }
        }
        RawDisk.open(stream)
    }

    pub fn detect_archive(
        &self,
        stream: &mut dyn ImageStream,
    ) -> io::Result<Option<&dyn ArchiveFormat>> {
        for format in &self.archives {
            if probe(stream, |s| format.detect(s))? {
                tracing::debug!(format = format.name(), "detected archive container");
                return Ok(Some(format.as_ref()));
            }
        }
        Ok(None)
    }
}

/// Run a detector from the start of the stream and rewind afterwards.
fn probe<F>(stream: &mut dyn ImageStream, detect: F) -> io::Result<bool>
where
    F: FnOnce(&mut dyn ImageStream) -> io::Result<bool>,
{
    stream.seek(SeekFrom::Start(0))?;
    let found = detect(stream)?;
    stream.seek(SeekFrom::Start(0))?;
    Ok(found)
}
