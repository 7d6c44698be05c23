//! Raw storage layer for imgmount.
//!
//! - [`geometry`]: native device length / sector size queries, chosen once per host
//! - [`raw`]: raw device handles and positioned I/O
//! - [`aligned`]: arbitrary-offset I/O over sector-constrained devices
//! - [`stream`]: the seekable byte streams handed to filesystem parsers

pub mod aligned;
pub mod error;
pub mod geometry;
pub mod raw;
pub mod stream;

pub use aligned::AlignedStream;
pub use error::DeviceError;
pub use geometry::{DEFAULT_SECTOR_SIZE, Geometry, GeometryProbe, ProbeMethod, probe_by_seeking};
pub use raw::{Access, BlockDevice, BlockIo, RawDevice, is_raw_device};
pub use stream::{BoxedStream, ImageFile, ImageStream, SubStream, open_stream};
