//! Block device geometry probing.
//!
//! A device's byte length and its sector size are two independent
//! properties, queried with two independent native calls on every platform
//! that has any native call at all. The platform method is chosen once
//! ([`GeometryProbe::for_host`]) and bound as a plain function value; a
//! failure of either native call is final for that probe.
//!
//! Platforms without a native call fall back to seeking: the length is the
//! end-of-stream offset and the sector size defaults to
//! [`DEFAULT_SECTOR_SIZE`], both with a warning.

use std::fs::File;
use std::io::{Seek, SeekFrom};

use crate::error::DeviceError;

/// Sector size assumed when the platform cannot report one.
pub const DEFAULT_SECTOR_SIZE: u32 = 512;

/// Byte length and sector size of an opened device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Total length in bytes.
    pub length: u64,
    /// Physical sector size in bytes.
    pub sector_size: u32,
}

/// How a [`GeometryProbe`] queries the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMethod {
    /// `IOCTL_DISK_GET_LENGTH_INFO` + `IOCTL_DISK_GET_DRIVE_GEOMETRY`.
    WindowsIoctl,
    /// `DIOCGMEDIASIZE` + `DIOCGSECTORSIZE`.
    BsdIoctl,
    /// `DKIOCGETBLOCKCOUNT` + `DKIOCGETBLOCKSIZE`.
    DarwinIoctl,
    /// `BLKGETSIZE64` + `BLKSSZGET`.
    LinuxIoctl,
    /// Seek to the end, default sector size.
    SeekFallback,
}

/// A bound geometry query.
pub type ProbeFn = fn(&mut File) -> Result<Geometry, DeviceError>;

/// Geometry query selected once for the running host.
#[derive(Debug, Clone, Copy)]
pub struct GeometryProbe {
    method: ProbeMethod,
    probe: ProbeFn,
}

impl GeometryProbe {
    /// Select the native method for the platform this binary was built for.
    pub fn for_host() -> Self {
        #[cfg(windows)]
        {
            Self::bind(ProbeMethod::WindowsIoctl, windows::probe)
        }
        #[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
        {
            Self::bind(ProbeMethod::BsdIoctl, bsd::probe)
        }
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        {
            Self::bind(ProbeMethod::DarwinIoctl, darwin::probe)
        }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            Self::bind(ProbeMethod::LinuxIoctl, linux::probe)
        }
        #[cfg(not(any(
            windows,
            target_os = "freebsd",
            target_os = "dragonfly",
            target_os = "macos",
            target_os = "ios",
            target_os = "linux",
            target_os = "android"
        )))]
        {
            Self::seek_fallback()
        }
    }

    /// The seek-based probe, usable on any seekable handle.
    pub fn seek_fallback() -> Self {
        Self::bind(ProbeMethod::SeekFallback, seek_probe)
    }

    /// Bind an arbitrary probe function.
    pub fn bind(method: ProbeMethod, probe: ProbeFn) -> Self {
        Self { method, probe }
    }

    /// The method this probe uses.
    pub fn method(&self) -> ProbeMethod {
        self.method
    }

    /// Query the geometry of an open device handle.
    pub fn probe(&self, file: &mut File) -> Result<Geometry, DeviceError> {
        let geometry = (self.probe)(file)?;
        tracing::debug!(
            method = ?self.method,
            length = geometry.length,
            sector_size = geometry.sector_size,
            "probed device geometry"
        );
        Ok(geometry)
    }
}

fn seek_probe(file: &mut File) -> Result<Geometry, DeviceError> {
    probe_by_seeking(file)
}

/// Determine geometry without a native call.
///
/// The stream is left at the position it had on entry. Taking `&mut`
/// keeps the seek round-trip free of interleaved I/O.
pub fn probe_by_seeking<S: Seek>(stream: &mut S) -> Result<Geometry, DeviceError> {
    tracing::warn!("no native geometry query on this platform, measuring length by seeking");
    let original = stream.stream_position()?;
    let length = stream.seek(SeekFrom::End(0))?;
    stream.seek(SeekFrom::Start(original))?;

    tracing::warn!(
        sector_size = DEFAULT_SECTOR_SIZE,
        "sector size unknown, assuming default"
    );
    Ok(Geometry {
        length,
        sector_size: DEFAULT_SECTOR_SIZE,
    })
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux {
    use std::fs::File;
    use std::io;
    use std::os::fd::AsRawFd;

    use super::Geometry;
    use crate::error::DeviceError;

    use libc::{BLKSSZGET, Ioctl};

    /// `_IOR(0x12, 114, size_t)`; libc exports no constant for it.
    pub(super) const BLKGETSIZE64: Ioctl = libc::_IOR::<libc::size_t>(0x12, 114);

    pub(super) fn probe(file: &mut File) -> Result<Geometry, DeviceError> {
        let fd = file.as_raw_fd();

        let mut length: u64 = 0;
        // SAFETY: BLKGETSIZE64 writes one u64 through the pointer.
        let rc = unsafe { libc::ioctl(fd, BLKGETSIZE64, &mut length as *mut u64) };
        if rc < 0 {
            return Err(DeviceError::query("BLKGETSIZE64", io::Error::last_os_error()));
        }

        let mut sector_size: libc::c_int = 0;
        // SAFETY: BLKSSZGET writes one int through the pointer.
        let rc = unsafe { libc::ioctl(fd, BLKSSZGET, &mut sector_size as *mut libc::c_int) };
        if rc < 0 {
            return Err(DeviceError::query("BLKSSZGET", io::Error::last_os_error()));
        }

        Ok(Geometry {
            length,
            sector_size: sector_size as u32,
        })
    }
}

#[cfg(any(
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "macos",
    target_os = "ios"
))]
const fn bsd_ior(group: u8, num: u8, size: usize) -> u64 {
    0x4000_0000 | (((size as u64) & 0x1fff) << 16) | ((group as u64) << 8) | num as u64
}

#[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
mod bsd {
    use std::fs::File;
    use std::io;
    use std::os::fd::AsRawFd;

    use super::{Geometry, bsd_ior};
    use crate::error::DeviceError;

    const DIOCGSECTORSIZE: u64 = bsd_ior(b'd', 128, std::mem::size_of::<libc::c_uint>());
    const DIOCGMEDIASIZE: u64 = bsd_ior(b'd', 129, std::mem::size_of::<libc::off_t>());

    pub(super) fn probe(file: &mut File) -> Result<Geometry, DeviceError> {
        let fd = file.as_raw_fd();

        let mut length: libc::off_t = 0;
        // SAFETY: DIOCGMEDIASIZE writes one off_t through the pointer.
        let rc = unsafe { libc::ioctl(fd, DIOCGMEDIASIZE as _, &mut length as *mut libc::off_t) };
        if rc < 0 {
            return Err(DeviceError::query("DIOCGMEDIASIZE", io::Error::last_os_error()));
        }

        let mut sector_size: libc::c_uint = 0;
        // SAFETY: DIOCGSECTORSIZE writes one u_int through the pointer.
        let rc =
            unsafe { libc::ioctl(fd, DIOCGSECTORSIZE as _, &mut sector_size as *mut libc::c_uint) };
        if rc < 0 {
            return Err(DeviceError::query("DIOCGSECTORSIZE", io::Error::last_os_error()));
        }

        Ok(Geometry {
            length: length as u64,
            sector_size,
        })
    }
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
mod darwin {
    use std::fs::File;
    use std::io;
    use std::os::fd::AsRawFd;

    use super::{Geometry, bsd_ior};
    use crate::error::DeviceError;

    const DKIOCGETBLOCKSIZE: u64 = bsd_ior(b'd', 24, std::mem::size_of::<u32>());
    const DKIOCGETBLOCKCOUNT: u64 = bsd_ior(b'd', 25, std::mem::size_of::<u64>());

    pub(super) fn probe(file: &mut File) -> Result<Geometry, DeviceError> {
        let fd = file.as_raw_fd();

        let mut block_size: u32 = 0;
        // SAFETY: DKIOCGETBLOCKSIZE writes one u32 through the pointer.
        let rc = unsafe { libc::ioctl(fd, DKIOCGETBLOCKSIZE as _, &mut block_size as *mut u32) };
        if rc < 0 {
            return Err(DeviceError::query("DKIOCGETBLOCKSIZE", io::Error::last_os_error()));
        }

        let mut block_count: u64 = 0;
        // SAFETY: DKIOCGETBLOCKCOUNT writes one u64 through the pointer.
        let rc = unsafe { libc::ioctl(fd, DKIOCGETBLOCKCOUNT as _, &mut block_count as *mut u64) };
        if rc < 0 {
            return Err(DeviceError::query("DKIOCGETBLOCKCOUNT", io::Error::last_os_error()));
        }

        Ok(Geometry {
            length: block_count * block_size as u64,
            sector_size: block_size,
        })
    }
}

#[cfg(windows)]
mod windows {
    use std::fs::File;
    use std::io;
    use std::mem::{MaybeUninit, size_of};
    use std::os::windows::io::AsRawHandle;
    use std::ptr;

    use windows_sys::Win32::System::IO::DeviceIoControl;
    use windows_sys::Win32::System::Ioctl::{
        DISK_GEOMETRY, GET_LENGTH_INFORMATION, IOCTL_DISK_GET_DRIVE_GEOMETRY,
        IOCTL_DISK_GET_LENGTH_INFO,
    };

    use super::Geometry;
    use crate::error::DeviceError;

    /// Issue one output-only control command.
    ///
    /// `T` must be a plain-old-data record that is valid when zeroed.
    fn control<T: Copy>(file: &File, code: u32, operation: &'static str) -> Result<T, DeviceError> {
        let mut out = MaybeUninit::<T>::zeroed();
        let mut returned: u32 = 0;
        // SAFETY: the output buffer is exactly size_of::<T>() bytes and the
        // call is synchronous (no OVERLAPPED).
        let ok = unsafe {
            DeviceIoControl(
                file.as_raw_handle() as _,
                code,
                ptr::null(),
                0,
                out.as_mut_ptr().cast(),
                size_of::<T>() as u32,
                &mut returned,
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(DeviceError::query(operation, io::Error::last_os_error()));
        }
        // SAFETY: zero-initialized POD, filled in by the driver.
        Ok(unsafe { out.assume_init() })
    }

    pub(super) fn probe(file: &mut File) -> Result<Geometry, DeviceError> {
        let length: GET_LENGTH_INFORMATION =
            control(file, IOCTL_DISK_GET_LENGTH_INFO, "IOCTL_DISK_GET_LENGTH_INFO")?;
        let geometry: DISK_GEOMETRY =
            control(file, IOCTL_DISK_GET_DRIVE_GEOMETRY, "IOCTL_DISK_GET_DRIVE_GEOMETRY")?;

        Ok(Geometry {
            length: length.Length as u64,
            sector_size: geometry.BytesPerSector,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    #[test]
    fn test_seek_probe_measures_length() {
        let mut stream = Cursor::new(vec![0u8; 10_000]);
        let geometry = probe_by_seeking(&mut stream).unwrap();
        assert_eq!(geometry.length, 10_000);
        assert_eq!(geometry.sector_size, 512);
        assert_eq!(stream.position(), 0);
    }

    #[test]
    fn test_seek_probe_restores_position() {
        let mut stream = Cursor::new(vec![0u8; 4096]);
        stream.set_position(1000);
        let geometry = probe_by_seeking(&mut stream).unwrap();
        assert_eq!(geometry.length, 4096);
        assert_eq!(stream.position(), 1000);
    }

    #[test]
    fn test_seek_fallback_probe_on_file() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[7u8; 10_000]).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let probe = GeometryProbe::seek_fallback();
        assert_eq!(probe.method(), ProbeMethod::SeekFallback);

        let geometry = probe.probe(&mut file).unwrap();
        assert_eq!(
            geometry,
            Geometry {
                length: 10_000,
                sector_size: 512
            }
        );
        assert_eq!(file.stream_position().unwrap(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_native_probe_on_regular_file_fails_without_fallback() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[0u8; 1024]).unwrap();

        let probe = GeometryProbe::for_host();
        assert_eq!(probe.method(), ProbeMethod::LinuxIoctl);

        let err = probe.probe(&mut file).unwrap_err();
        assert!(matches!(err, DeviceError::Query { operation: "BLKGETSIZE64", .. }));
        assert!(err.os_code().is_some());
    }

    #[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
    #[test]
    fn test_block_ioctl_requests_match_kernel_values() {
        assert_eq!(linux::BLKGETSIZE64 as u32, 0x8008_1272);
        assert_eq!(libc::BLKSSZGET as u32, 0x1268);
    }
}
