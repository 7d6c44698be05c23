//! Ephemeral in-memory filesystems.
//!
//! Two variants share one implementation and differ only in the
//! [`EntryFactory`] that produces new file entries:
//!
//! - retaining: file content lives in a growable buffer for the life of the mount
//! - discarding: writes are accepted and thrown away, files stay empty
//!
//! The entry table is shared by every dispatch thread of the host adapter.
//! Each mutation, including file creation and the implicit creation of
//! missing parent directories, runs inside one write-lock section.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use crate::capability::CapabilityFlags;
use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::ops::VfsOps;
use crate::vfs::types::{DirEntry, FileAttr, FileType, SetAttr, StatFs};

/// Largest file a retaining buffer will grow to.
pub const MAX_FILE_SIZE: u64 = 4 << 30;

/// Content store behind a memory file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ByteSink {
    /// Growable buffer holding everything written.
    Buffer(Vec<u8>),
    /// Accepts and discards all writes.
    Discard,
}

/// Why a sink refused to grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GrowError {
    /// Past [`MAX_FILE_SIZE`] or the address space.
    TooLarge,
    /// The allocator said no.
    OutOfMemory,
}

impl ByteSink {
    pub fn len(&self) -> u64 {
        match self {
            ByteSink::Buffer(data) => data.len() as u64,
            ByteSink::Discard => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self, offset: u64, size: u32) -> Vec<u8> {
        match self {
            ByteSink::Buffer(data) => {
                let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
                let end = start.saturating_add(size as usize).min(data.len());
                data[start..end].to_vec()
            }
            ByteSink::Discard => Vec::new(),
        }
    }

    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<u32, GrowError> {
        let end = offset
            .checked_add(bytes.len() as u64)
            .ok_or(GrowError::TooLarge)?;
        if let ByteSink::Buffer(data) = self {
            Self::grow(data, end)?;
            // Both fit in usize: grow checked `end` against MAX_FILE_SIZE.
            let (start, end) = (offset as usize, end as usize);
            data[start..end].copy_from_slice(bytes);
        }
        Ok(bytes.len() as u32)
    }

    fn resize(&mut self, size: u64) -> Result<(), GrowError> {
        if let ByteSink::Buffer(data) = self {
            if size <= data.len() as u64 {
                data.truncate(size as usize);
            } else {
                Self::grow(data, size)?;
            }
        }
        Ok(())
    }

    /// Zero-extend `data` to at least `len` bytes.
    fn grow(data: &mut Vec<u8>, len: u64) -> Result<(), GrowError> {
        if len <= data.len() as u64 {
            return Ok(());
        }
        if len > MAX_FILE_SIZE {
            return Err(GrowError::TooLarge);
        }
        let len = usize::try_from(len).map_err(|_| GrowError::TooLarge)?;
        data.try_reserve(len - data.len())
            .map_err(|_| GrowError::OutOfMemory)?;
        data.resize(len, 0);
        Ok(())
    }
}

/// A file in an ephemeral filesystem.
#[derive(Debug, Clone)]
pub struct MemoryFileEntry {
    pub path: PathBuf,
    pub content: ByteSink,
    pub created_at: SystemTime,
    pub modified_at: SystemTime,
    pub accessed_at: SystemTime,
    /// Unix permission bits.
    pub perm: u32,
}

impl MemoryFileEntry {
    /// A fresh entry with current timestamps.
    pub fn new(path: impl Into<PathBuf>, content: ByteSink, perm: u32) -> Self {
        let now = SystemTime::now();
        Self {
            path: path.into(),
            content,
            created_at: now,
            modified_at: now,
            accessed_at: now,
            perm,
        }
    }

    /// Write through to the sink, refusing growth past [`MAX_FILE_SIZE`].
    pub fn write(&mut self, offset: u64, bytes: &[u8]) -> VfsResult<u32> {
        let written = self
            .content
            .write(offset, bytes)
            .map_err(|e| self.grow_error(e))?;
        self.modified_at = SystemTime::now();
        Ok(written)
    }

    /// Truncate or zero-extend the content.
    pub fn resize(&mut self, size: u64) -> VfsResult<()> {
        self.content
            .resize(size)
            .map_err(|e| self.grow_error(e))?;
        self.modified_at = SystemTime::now();
        Ok(())
    }

    fn grow_error(&self, error: GrowError) -> VfsError {
        let path = self.path.display().to_string();
        tracing::warn!(path = %path, ?error, "refused to grow memory file");
        match error {
            GrowError::TooLarge => VfsError::file_too_large(path),
            GrowError::OutOfMemory => VfsError::no_space(path),
        }
    }

    pub fn attr(&self) -> FileAttr {
        FileAttr {
            size: self.content.len(),
            kind: FileType::File,
            perm: self.perm,
            mtime: self.modified_at,
            atime: self.accessed_at,
            crtime: self.created_at,
            nlink: 1,
        }
    }
}

/// Builds the entry registered when a file is created.
///
/// Called synchronously while the entry table is locked.
pub trait EntryFactory: Send + Sync + std::fmt::Debug {
    fn create_file(&self, path: &Path, perm: u32) -> MemoryFileEntry;
}

/// Entries backed by a growable buffer.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetainingFactory;

impl EntryFactory for RetainingFactory {
    fn create_file(&self, path: &Path, perm: u32) -> MemoryFileEntry {
        MemoryFileEntry::new(path, ByteSink::Buffer(Vec::new()), perm)
    }
}

/// Entries that swallow every write.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardingFactory;

impl EntryFactory for DiscardingFactory {
    fn create_file(&self, path: &Path, perm: u32) -> MemoryFileEntry {
        MemoryFileEntry::new(path, ByteSink::Discard, perm)
    }
}

/// Which ephemeral variant to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EphemeralKind {
    Retaining,
    Discarding,
}

#[derive(Debug, Clone)]
enum Entry {
    File(MemoryFileEntry),
    Directory { attr: FileAttr },
}

impl Entry {
    fn attr(&self) -> FileAttr {
        match self {
            Entry::File(file) => file.attr(),
            Entry::Directory { attr } => attr.clone(),
        }
    }

    fn kind(&self) -> FileType {
        match self {
            Entry::File(_) => FileType::File,
            Entry::Directory { .. } => FileType::Directory,
        }
    }
}

/// In-memory filesystem.
///
/// All data is lost when dropped.
#[derive(Debug)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<PathBuf, Entry>>,
    factory: Box<dyn EntryFactory>,
    label: &'static str,
}

impl MemoryBackend {
    /// Build an empty filesystem whose files come from `factory`.
    pub fn with_factory(factory: Box<dyn EntryFactory>, label: &'static str) -> Self {
        let mut entries = HashMap::new();
        // Root directory always exists
        entries.insert(
            PathBuf::new(),
            Entry::Directory {
                attr: FileAttr::directory(0o755),
            },
        );
        Self {
            entries: RwLock::new(entries),
            factory,
            label,
        }
    }

    /// Files keep their content for the life of the mount.
    pub fn retaining() -> Self {
        Self::with_factory(Box::new(RetainingFactory), "memory")
    }

    /// Files accept writes and stay empty.
    pub fn discarding() -> Self {
        Self::with_factory(Box::new(DiscardingFactory), "discard")
    }

    pub fn ephemeral(kind: EphemeralKind) -> Self {
        match kind {
            EphemeralKind::Retaining => Self::retaining(),
            EphemeralKind::Discarding => Self::discarding(),
        }
    }

    /// Normalize a path: drop the root, resolve `.` and `..`.
    fn normalize(path: &Path) -> PathBuf {
        let mut result = PathBuf::new();
        for component in path.components() {
            match component {
                Component::ParentDir => {
                    result.pop();
                }
                Component::Normal(s) => result.push(s),
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            }
        }
        result
    }

    /// Create missing parent directories. Caller holds the write lock.
    fn ensure_parents(entries: &mut HashMap<PathBuf, Entry>, path: &Path) -> VfsResult<()> {
        let mut current = PathBuf::new();
        for component in path.parent().into_iter().flat_map(|p| p.components()) {
            if let Component::Normal(s) = component {
                current.push(s);
                let entry = entries.entry(current.clone()).or_insert(Entry::Directory {
                    attr: FileAttr::directory(0o755),
                });
                if let Entry::File(_) = entry {
                    return Err(VfsError::not_a_directory(Self::path_str(&current)));
                }
            }
        }
        Ok(())
    }

    fn path_str(path: &Path) -> String {
        path.display().to_string()
    }

    fn file_mut<'a>(
        entries: &'a mut HashMap<PathBuf, Entry>,
        path: &Path,
    ) -> VfsResult<&'a mut MemoryFileEntry> {
        match entries.get_mut(path) {
            Some(Entry::File(file)) => Ok(file),
            Some(Entry::Directory { .. }) => Err(VfsError::is_a_directory(Self::path_str(path))),
            None => Err(VfsError::not_found(Self::path_str(path))),
        }
    }
}

#[async_trait]
impl VfsOps for MemoryBackend {
    async fn getattr(&self, path: &Path) -> VfsResult<FileAttr> {
        let normalized = Self::normalize(path);
        self.entries
            .read()
            .get(&normalized)
            .map(Entry::attr)
            .ok_or_else(|| VfsError::not_found(Self::path_str(&normalized)))
    }

    async fn readdir(&self, path: &Path) -> VfsResult<Vec<DirEntry>> {
        let normalized = Self::normalize(path);
        let entries = self.entries.read();

        match entries.get(&normalized) {
            Some(Entry::Directory { .. }) => {}
            Some(_) => return Err(VfsError::not_a_directory(Self::path_str(&normalized))),
            None => return Err(VfsError::not_found(Self::path_str(&normalized))),
        }

        let mut result: Vec<DirEntry> = entries
            .iter()
            .filter(|(entry_path, _)| entry_path.parent() == Some(normalized.as_path()))
            .filter_map(|(entry_path, entry)| {
                let name = entry_path.file_name()?;
                Some(DirEntry::new(name.to_string_lossy(), entry.kind()))
            })
            .collect();

        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    async fn read(&self, path: &Path, offset: u64, size: u32) -> VfsResult<Vec<u8>> {
        let normalized = Self::normalize(path);
        let mut entries = self.entries.write();
        let file = Self::file_mut(&mut entries, &normalized)?;
        file.accessed_at = SystemTime::now();
        Ok(file.content.read(offset, size))
    }

    async fn write(&self, path: &Path, offset: u64, data: &[u8]) -> VfsResult<u32> {
        let normalized = Self::normalize(path);
        let mut entries = self.entries.write();
        let file = Self::file_mut(&mut entries, &normalized)?;
        file.write(offset, data)
    }

    async fn create(&self, path: &Path, mode: u32) -> VfsResult<FileAttr> {
        let normalized = Self::normalize(path);
        if normalized.as_os_str().is_empty() {
            return Err(VfsError::already_exists("/"));
        }

        let mut entries = self.entries.write();
        if entries.contains_key(&normalized) {
            return Err(VfsError::already_exists(Self::path_str(&normalized)));
        }
        Self::ensure_parents(&mut entries, &normalized)?;

        let file = self.factory.create_file(&normalized, mode & 0o7777);
        let attr = file.attr();
        tracing::debug!(path = %normalized.display(), backend = self.label, "created file");
        entries.insert(normalized, Entry::File(file));
        Ok(attr)
    }

    async fn mkdir(&self, path: &Path, mode: u32) -> VfsResult<FileAttr> {
        let normalized = Self::normalize(path);
        let mut entries = self.entries.write();

        if let Some(existing) = entries.get(&normalized) {
            return match existing {
                Entry::Directory { attr } => Ok(attr.clone()),
                Entry::File(_) => Err(VfsError::already_exists(Self::path_str(&normalized))),
            };
        }
        Self::ensure_parents(&mut entries, &normalized)?;

        let attr = FileAttr::directory(mode & 0o7777);
        entries.insert(normalized, Entry::Directory { attr: attr.clone() });
        Ok(attr)
    }

    async fn unlink(&self, path: &Path) -> VfsResult<()> {
        let normalized = Self::normalize(path);
        let mut entries = self.entries.write();

        match entries.get(&normalized) {
            Some(Entry::Directory { .. }) => {
                Err(VfsError::is_a_directory(Self::path_str(&normalized)))
            }
            Some(Entry::File(_)) => {
                entries.remove(&normalized);
                Ok(())
            }
            None => Err(VfsError::not_found(Self::path_str(&normalized))),
        }
    }

    async fn rmdir(&self, path: &Path) -> VfsResult<()> {
        let normalized = Self::normalize(path);
        if normalized.as_os_str().is_empty() {
            return Err(VfsError::permission_denied("cannot remove root"));
        }

        let mut entries = self.entries.write();
        match entries.get(&normalized) {
            Some(Entry::Directory { .. }) => {}
            Some(_) => return Err(VfsError::not_a_directory(Self::path_str(&normalized))),
            None => return Err(VfsError::not_found(Self::path_str(&normalized))),
        }

        if entries.keys().any(|k| k.parent() == Some(normalized.as_path())) {
            return Err(VfsError::directory_not_empty(Self::path_str(&normalized)));
        }

        entries.remove(&normalized);
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> VfsResult<()> {
        let from = Self::normalize(from);
        let to = Self::normalize(to);
        if from.as_os_str().is_empty() || (to.starts_with(&from) && to != from) {
            return Err(VfsError::invalid_path(Self::path_str(&to)));
        }

        let mut entries = self.entries.write();
        if !entries.contains_key(&from) {
            return Err(VfsError::not_found(Self::path_str(&from)));
        }
        if from == to {
            return Ok(());
        }
        let target_is_dir = matches!(entries.get(&to), Some(Entry::Directory { .. }));
        if target_is_dir && entries.keys().any(|k| k.parent() == Some(to.as_path())) {
            return Err(VfsError::directory_not_empty(Self::path_str(&to)));
        }
        Self::ensure_parents(&mut entries, &to)?;

        let moved: Vec<PathBuf> = entries
            .keys()
            .filter(|k| k.starts_with(&from))
            .cloned()
            .collect();
        for old in moved {
            let Some(mut entry) = entries.remove(&old) else {
                continue;
            };
            let new_path = match old.strip_prefix(&from) {
                Ok(rest) if rest.as_os_str().is_empty() => to.clone(),
                Ok(rest) => to.join(rest),
                Err(_) => old.clone(),
            };
            if let Entry::File(file) = &mut entry {
                file.path = new_path.clone();
            }
            entries.insert(new_path, entry);
        }
        Ok(())
    }

    async fn truncate(&self, path: &Path, size: u64) -> VfsResult<()> {
        let normalized = Self::normalize(path);
        let mut entries = self.entries.write();
        let file = Self::file_mut(&mut entries, &normalized)?;
        file.resize(size)
    }

    async fn setattr(&self, path: &Path, set: SetAttr) -> VfsResult<FileAttr> {
        let normalized = Self::normalize(path);
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(&normalized)
            .ok_or_else(|| VfsError::not_found(Self::path_str(&normalized)))?;

        match entry {
            Entry::File(file) => {
                if let Some(size) = set.size {
                    file.resize(size)?;
                }
                if let Some(mtime) = set.mtime {
                    file.modified_at = mtime;
                }
                if let Some(atime) = set.atime {
                    file.accessed_at = atime;
                }
                if let Some(perm) = set.perm {
                    file.perm = perm & 0o7777;
                }
            }
            Entry::Directory { attr } => {
                if set.size.is_some() {
                    return Err(VfsError::is_a_directory(Self::path_str(&normalized)));
                }
                if let Some(mtime) = set.mtime {
                    attr.mtime = mtime;
                }
                if let Some(atime) = set.atime {
                    attr.atime = atime;
                }
                if let Some(perm) = set.perm {
                    attr.perm = perm & 0o7777;
                }
            }
        }
        Ok(entry.attr())
    }

    fn capabilities(&self) -> CapabilityFlags {
        CapabilityFlags {
            can_write: true,
            is_thread_safe: true,
            has_named_streams: false,
        }
    }

    async fn statfs(&self) -> VfsResult<StatFs> {
        let entries = self.entries.read();
        let used: u64 = entries
            .values()
            .map(|e| match e {
                Entry::File(f) => f.content.len(),
                Entry::Directory { .. } => 0,
            })
            .sum();

        let mut stat = StatFs::default();
        let used_blocks = used.div_ceil(stat.bsize as u64);
        stat.bfree = stat.blocks.saturating_sub(used_blocks);
        stat.bavail = stat.bfree;
        stat.ffree = stat.files.saturating_sub(entries.len() as u64);
        Ok(stat)
    }

    fn volume_label(&self) -> Option<String> {
        Some(self.label.to_string())
    }
}
