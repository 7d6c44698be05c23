//! Filesystem backends that need no image.

mod memory;

pub use memory::{
    ByteSink, DiscardingFactory, EntryFactory, EphemeralKind, MemoryBackend, MemoryFileEntry,
    RetainingFactory,
};
