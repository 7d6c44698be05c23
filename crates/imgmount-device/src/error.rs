//! Device error types.

use std::io;
use thiserror::Error;

/// Errors raised by the raw storage layer.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// A native geometry query failed.
    #[error("{operation} failed (os error {code})")]
    Query {
        /// Name of the native call that failed.
        operation: &'static str,
        /// Raw OS error code.
        code: i32,
    },

    /// The operation is never supported on this stream.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// An unaligned write whose aligned window would run past the device end.
    #[error(
        "write of {len} bytes at {offset} needs an aligned window ending at {window_end}, \
         past the device end at {length}"
    )]
    UnalignedTail {
        /// Logical offset of the write.
        offset: u64,
        /// Logical length of the write.
        len: usize,
        /// End of the aligned window covering the write.
        window_end: u64,
        /// Device length.
        length: u64,
    },

    /// Access outside the fixed device bounds.
    #[error("access of {len} bytes at {offset} is outside a device of {length} bytes")]
    OutOfBounds {
        /// Logical offset of the access.
        offset: u64,
        /// Logical length of the access.
        len: usize,
        /// Device length.
        length: u64,
    },

    /// The device was opened read-only.
    #[error("device is read-only")]
    ReadOnly,

    /// Alignment of zero bytes.
    #[error("invalid alignment: {0}")]
    InvalidAlignment(u32),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DeviceError {
    /// Build a `Query` error from the failing native call and its OS error.
    pub fn query(operation: &'static str, err: io::Error) -> Self {
        Self::Query {
            operation,
            code: err.raw_os_error().unwrap_or(-1),
        }
    }

    /// Create an Unsupported error.
    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::Unsupported(what.into())
    }

    /// The native OS error code behind this error, if any.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            DeviceError::Query { code, .. } if *code >= 0 => Some(*code),
            DeviceError::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

/// Convert DeviceError to std::io::Error so it can cross `Read`/`Write`/`Seek`.
///
/// Query errors become raw OS errors so the code survives the trip.
impl From<DeviceError> for io::Error {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::Query { code, .. } if code >= 0 => io::Error::from_raw_os_error(code),
            DeviceError::Io(e) => e,
            DeviceError::Unsupported(_) => io::Error::new(io::ErrorKind::Unsupported, e),
            DeviceError::ReadOnly => io::Error::new(io::ErrorKind::PermissionDenied, e),
            DeviceError::InvalidAlignment(_) => io::Error::new(io::ErrorKind::InvalidInput, e),
            other => io::Error::other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_keeps_os_code() {
        let err = DeviceError::query("BLKGETSIZE64", io::Error::from_raw_os_error(25));
        assert_eq!(err.os_code(), Some(25));

        let io_err: io::Error = err.into();
        assert_eq!(io_err.raw_os_error(), Some(25));
    }

    #[test]
    fn test_unsupported_maps_to_kind() {
        let io_err: io::Error = DeviceError::unsupported("resize").into();
        assert_eq!(io_err.kind(), io::ErrorKind::Unsupported);
        assert!(io_err.raw_os_error().is_none());
    }
}
