//! Image formats: the detector registry and partition tables.

mod partition;
mod registry;

pub use partition::{LBA_SIZE, Partition, PartitionKind, PartitionScheme, PartitionTable};
pub use registry::{ArchiveFormat, DiskFormat, FilesystemFactory, FormatRegistry, RawDisk};
