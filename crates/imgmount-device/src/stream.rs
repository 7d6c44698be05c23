//! Byte streams handed to filesystem parsers.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::aligned::{AlignedStream, seek_target};
use crate::error::DeviceError;
use crate::geometry::GeometryProbe;
use crate::raw::{Access, RawDevice, is_raw_device};

/// A seekable image stream with a known total length.
pub trait ImageStream: Read + Write + Seek + Send {
    /// Total length in bytes.
    fn length(&self) -> u64;

    /// Whether writes are accepted.
    fn can_write(&self) -> bool;

    /// Change the stream length.
    fn set_length(&mut self, length: u64) -> Result<(), DeviceError>;
}

pub type BoxedStream = Box<dyn ImageStream>;

impl<S: ImageStream + ?Sized> ImageStream for Box<S> {
    fn length(&self) -> u64 {
        (**self).length()
    }

    fn can_write(&self) -> bool {
        (**self).can_write()
    }

    fn set_length(&mut self, length: u64) -> Result<(), DeviceError> {
        (**self).set_length(length)
    }
}

impl ImageStream for AlignedStream<RawDevice> {
    fn length(&self) -> u64 {
        AlignedStream::length(self)
    }

    fn can_write(&self) -> bool {
        self.is_writable()
    }

    fn set_length(&mut self, length: u64) -> Result<(), DeviceError> {
        AlignedStream::set_length(self, length)
    }
}

/// A regular image file.
#[derive(Debug)]
pub struct ImageFile {
    file: File,
    access: Access,
}

impl ImageFile {
    pub fn open(path: &Path, access: Access) -> Result<Self, DeviceError> {
        let file = OpenOptions::new()
            .read(true)
            .write(access.is_writable())
            .open(path)?;
        Ok(Self { file, access })
    }

    pub fn from_file(file: File, access: Access) -> Self {
        Self { file, access }
    }
}

impl Read for ImageFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for ImageFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.access.is_writable() {
            return Err(DeviceError::ReadOnly.into());
        }
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for ImageFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl ImageStream for ImageFile {
    fn length(&self) -> u64 {
        self.file.metadata().map(|m| m.len()).unwrap_or(0)
    }

    fn can_write(&self) -> bool {
        self.access.is_writable()
    }

    fn set_length(&mut self, length: u64) -> Result<(), DeviceError> {
        if !self.access.is_writable() {
            return Err(DeviceError::ReadOnly);
        }
        self.file.set_len(length)?;
        Ok(())
    }
}

/// A fixed window `[start, start + length)` of another stream.
///
/// Used for partitions inside a disk image. Reads stop at the window end,
/// writes past it are rejected.
pub struct SubStream {
    inner: BoxedStream,
    start: u64,
    length: u64,
    position: u64,
}

impl SubStream {
    pub fn new(inner: BoxedStream, start: u64, length: u64) -> Result<Self, DeviceError> {
        let outer = inner.length();
        if start.checked_add(length).is_none_or(|end| end > outer) {
            return Err(DeviceError::OutOfBounds {
                offset: start,
                len: length as usize,
                length: outer,
            });
        }
        Ok(Self {
            inner,
            start,
            length,
            position: 0,
        })
    }
}

impl std::fmt::Debug for SubStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubStream")
            .field("start", &self.start)
            .field("length", &self.length)
            .field("position", &self.position)
            .finish()
    }
}

impl Read for SubStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.length {
            return Ok(0);
        }
        let remaining = (self.length - self.position).min(buf.len() as u64) as usize;
        self.inner.seek(SeekFrom::Start(self.start + self.position))?;
        let n = self.inner.read(&mut buf[..remaining])?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for SubStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let end = self.position.saturating_add(buf.len() as u64);
        if end > self.length {
            return Err(DeviceError::OutOfBounds {
                offset: self.position,
                len: buf.len(),
                length: self.length,
            }
            .into());
        }
        self.inner.seek(SeekFrom::Start(self.start + self.position))?;
        self.inner.write_all(buf)?;
        self.position = end;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Seek for SubStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.position = seek_target(self.position, self.length, pos)?;
        Ok(self.position)
    }
}

impl ImageStream for SubStream {
    fn length(&self) -> u64 {
        self.length
    }

    fn can_write(&self) -> bool {
        self.inner.can_write()
    }

    fn set_length(&mut self, _length: u64) -> Result<(), DeviceError> {
        Err(DeviceError::unsupported("resizing a partition window"))
    }
}

/// Open `path` as an image stream.
///
/// Raw block devices go through [`AlignedStream`] using the probed sector
/// size (or `sector_size` when given); anything else is opened directly.
pub fn open_stream(
    path: &Path,
    access: Access,
    probe: &GeometryProbe,
    sector_size: Option<u32>,
) -> Result<BoxedStream, DeviceError> {
    if is_raw_device(path) {
        let device = RawDevice::open(path, access, probe)?;
        return Ok(Box::new(AlignedStream::from_device(device, sector_size)?));
    }

    tracing::debug!(path = %path.display(), ?access, "opening image file");
    Ok(Box::new(ImageFile::open(path, access)?))
}
