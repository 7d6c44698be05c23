//! Raw block devices and positioned I/O.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::DeviceError;
use crate::geometry::GeometryProbe;

/// Requested or effective access to a device or mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Access {
    #[default]
    ReadOnly,
    ReadWrite,
}

impl Access {
    /// Whether this access mode includes writing.
    pub fn is_writable(self) -> bool {
        matches!(self, Access::ReadWrite)
    }
}

/// An opened raw device. Length and sector size are fixed at open time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    pub path: PathBuf,
    pub access: Access,
    pub length: u64,
    pub sector_size: u32,
}

/// Positioned I/O against a byte-addressed device.
///
/// `read_at` fills `buf` completely unless end-of-device is reached first,
/// and returns the number of bytes read. `write_at` writes all of `buf`.
pub trait BlockIo: Send {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

impl BlockIo for File {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Write::flush(self)
    }
}

/// A raw block device handle together with its probed geometry.
#[derive(Debug)]
pub struct RawDevice {
    file: File,
    info: BlockDevice,
}

impl RawDevice {
    /// Open `path` and probe its geometry once.
    pub fn open(path: &Path, access: Access, probe: &GeometryProbe) -> Result<Self, DeviceError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(access.is_writable())
            .open(path)?;
        let geometry = probe.probe(&mut file)?;

        let info = BlockDevice {
            path: path.to_path_buf(),
            access,
            length: geometry.length,
            sector_size: geometry.sector_size,
        };
        tracing::info!(
            path = %info.path.display(),
            length = info.length,
            sector_size = info.sector_size,
            access = ?info.access,
            "opened raw device"
        );
        Ok(Self { file, info })
    }

    /// Wrap an already-open handle with known geometry.
    pub fn from_parts(file: File, info: BlockDevice) -> Self {
        Self { file, info }
    }

    pub fn info(&self) -> &BlockDevice {
        &self.info
    }
}

impl BlockIo for RawDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        if !self.info.access.is_writable() {
            return Err(DeviceError::ReadOnly.into());
        }
        self.file.write_at(offset, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        BlockIo::flush(&mut self.file)
    }
}

/// Whether `path` names a raw block device rather than an image file.
#[cfg(unix)]
pub fn is_raw_device(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;

    std::fs::metadata(path)
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false)
}

/// Whether `path` names a raw block device rather than an image file.
#[cfg(windows)]
pub fn is_raw_device(path: &Path) -> bool {
    path.to_str()
        .map(|p| p.starts_with(r"\\.\") || p.starts_with(r"\\?\GLOBALROOT\Device\"))
        .unwrap_or(false)
}

#[cfg(not(any(unix, windows)))]
pub fn is_raw_device(_path: &Path) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_read_at_stops_at_eof() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"0123456789").unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(BlockIo::read_at(&mut file, 6, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"6789");
    }

    #[test]
    fn test_read_only_device_rejects_writes() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[0u8; 1024]).unwrap();
        let mut device = RawDevice::from_parts(
            file,
            BlockDevice {
                path: PathBuf::from("test"),
                access: Access::ReadOnly,
                length: 1024,
                sector_size: 512,
            },
        );

        let err = device.write_at(0, &[1u8; 512]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_regular_file_is_not_raw_device() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(!is_raw_device(file.path()));
    }
}
