//! Filesystem contract shared by parsed images and in-memory backends.
//!
//! - [`VfsOps`] - Core trait for filesystem operations
//! - [`MemoryBackend`] - Ephemeral filesystems (retaining and discarding)
//! - [`ReadOnlyView`] - Rejects all mutation on read-only mounts
//!
//! Operations are path-based with explicit offset/size; host adapters
//! handle inode ↔ path mapping.

pub mod backends;
mod error;
mod ops;
mod read_only;
mod types;

pub use backends::{ByteSink, EntryFactory, EphemeralKind, MemoryBackend, MemoryFileEntry};
pub use error::{VfsError, VfsResult};
pub use ops::VfsOps;
pub use read_only::ReadOnlyView;
pub use types::{DirEntry, FileAttr, FileType, SetAttr, StatFs};
