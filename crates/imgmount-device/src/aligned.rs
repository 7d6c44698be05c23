//! Sector-aligned stream over a raw device.
//!
//! Callers may read and write at any offset and length. Every physical
//! transfer issued to the inner device starts and ends on an alignment
//! boundary: reads fetch the covering window once and copy the requested
//! range out, unaligned writes read-modify-write the covering window.
//!
//! End of device: reads are clamped to the device length. A write that
//! reaches past the device length fails with [`DeviceError::OutOfBounds`];
//! an unaligned write whose covering window would reach past the device
//! length (a final partial sector) fails with [`DeviceError::UnalignedTail`].
//! Neither case is silently truncated.

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::error::DeviceError;
use crate::raw::{BlockIo, RawDevice};

/// Arbitrary-offset stream over a device that only accepts aligned I/O.
#[derive(Debug)]
pub struct AlignedStream<D> {
    inner: D,
    alignment: u64,
    length: u64,
    position: u64,
    writable: bool,
}

impl<D: BlockIo> AlignedStream<D> {
    pub fn new(inner: D, alignment: u32, length: u64, writable: bool) -> Result<Self, DeviceError> {
        if alignment == 0 {
            return Err(DeviceError::InvalidAlignment(alignment));
        }
        Ok(Self {
            inner,
            alignment: alignment as u64,
            length,
            position: 0,
            writable,
        })
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Raw devices have a host-defined length.
    pub fn set_length(&mut self, _length: u64) -> Result<(), DeviceError> {
        Err(DeviceError::unsupported("resizing a raw device stream"))
    }

    fn window(&self, offset: u64, end: u64) -> (u64, u64) {
        let start = offset / self.alignment * self.alignment;
        let end = end.div_ceil(self.alignment) * self.alignment;
        (start, end)
    }

    fn is_aligned(&self, offset: u64, len: u64) -> bool {
        offset % self.alignment == 0 && len % self.alignment == 0
    }

    /// Read up to `buf.len()` bytes at `offset`, clamped to the device end.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, DeviceError> {
        if buf.is_empty() || offset >= self.length {
            return Ok(0);
        }
        let end = offset.saturating_add(buf.len() as u64).min(self.length);
        let (window_start, window_end) = self.window(offset, end);

        let mut window = vec![0u8; (window_end - window_start) as usize];
        let filled = self.inner.read_at(window_start, &mut window)?;

        let skip = (offset - window_start) as usize;
        let available = filled.saturating_sub(skip);
        let count = available.min((end - offset) as usize);
        buf[..count].copy_from_slice(&window[skip..skip + count]);
        Ok(count)
    }

    /// Write all of `buf` at `offset`.
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), DeviceError> {
        if !self.writable {
            return Err(DeviceError::ReadOnly);
        }
        if buf.is_empty() {
            return Ok(());
        }
        let len = buf.len() as u64;
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= self.length)
            .ok_or(DeviceError::OutOfBounds {
                offset,
                len: buf.len(),
                length: self.length,
            })?;

        if self.is_aligned(offset, len) {
            self.inner.write_at(offset, buf)?;
            return Ok(());
        }

        let (window_start, window_end) = self.window(offset, end);
        if window_end > self.length {
            return Err(DeviceError::UnalignedTail {
                offset,
                len: buf.len(),
                window_end,
                length: self.length,
            });
        }

        let mut window = vec![0u8; (window_end - window_start) as usize];
        let filled = self.inner.read_at(window_start, &mut window)?;
        if filled < window.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short read of aligned window at {window_start}: {filled} bytes"),
            )
            .into());
        }

        let skip = (offset - window_start) as usize;
        window[skip..skip + buf.len()].copy_from_slice(buf);
        self.inner.write_at(window_start, &window)?;
        Ok(())
    }
}

impl AlignedStream<RawDevice> {
    /// Wrap a raw device using its probed sector size, or `alignment` if given.
    pub fn from_device(device: RawDevice, alignment: Option<u32>) -> Result<Self, DeviceError> {
        let info = device.info();
        let alignment = alignment.unwrap_or(info.sector_size);
        let length = info.length;
        let writable = info.access.is_writable();
        Self::new(device, alignment, length, writable)
    }
}

impl<D: BlockIo> Read for AlignedStream<D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at(self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl<D: BlockIo> Write for AlignedStream<D> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_at(self.position, buf)?;
        self.position += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<D: BlockIo> Seek for AlignedStream<D> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.position = seek_target(self.position, self.length, pos)?;
        Ok(self.position)
    }
}

/// Resolve a seek request against a stream of fixed `length`.
pub(crate) fn seek_target(position: u64, length: u64, pos: SeekFrom) -> io::Result<u64> {
    let (base, delta) = match pos {
        SeekFrom::Start(offset) => return Ok(offset),
        SeekFrom::End(delta) => (length, delta),
        SeekFrom::Current(delta) => (position, delta),
    };
    base.checked_add_signed(delta).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "invalid seek to a negative or overflowing position",
        )
    })
}
