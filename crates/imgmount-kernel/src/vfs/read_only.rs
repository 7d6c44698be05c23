//! Read-only view over any filesystem.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use super::error::{VfsError, VfsResult};
use super::ops::VfsOps;
use super::types::{DirEntry, FileAttr, SetAttr, StatFs};
use crate::capability::CapabilityFlags;

/// Passes reads through and rejects every mutation with [`VfsError::ReadOnly`].
///
/// Applied to every mount whose effective access is read-only, so the
/// guarantee holds even on hosts that ignore write-protection options.
pub struct ReadOnlyView {
    inner: Arc<dyn VfsOps>,
}

impl ReadOnlyView {
    pub fn new(inner: Arc<dyn VfsOps>) -> Self {
        Self { inner }
    }
}

impl std::fmt::Debug for ReadOnlyView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadOnlyView").finish_non_exhaustive()
    }
}

#[async_trait]
impl VfsOps for ReadOnlyView {
    async fn getattr(&self, path: &Path) -> VfsResult<FileAttr> {
        let mut attr = self.inner.getattr(path).await?;
        attr.perm &= !0o222;
        Ok(attr)
    }

    async fn readdir(&self, path: &Path) -> VfsResult<Vec<DirEntry>> {
        self.inner.readdir(path).await
    }

    async fn read(&self, path: &Path, offset: u64, size: u32) -> VfsResult<Vec<u8>> {
        self.inner.read(path, offset, size).await
    }

    async fn write(&self, _path: &Path, _offset: u64, _data: &[u8]) -> VfsResult<u32> {
        Err(VfsError::ReadOnly)
    }

    async fn create(&self, _path: &Path, _mode: u32) -> VfsResult<FileAttr> {
        Err(VfsError::ReadOnly)
    }

    async fn mkdir(&self, _path: &Path, _mode: u32) -> VfsResult<FileAttr> {
        Err(VfsError::ReadOnly)
    }

    async fn unlink(&self, _path: &Path) -> VfsResult<()> {
        Err(VfsError::ReadOnly)
    }

    async fn rmdir(&self, _path: &Path) -> VfsResult<()> {
        Err(VfsError::ReadOnly)
    }

    async fn rename(&self, _from: &Path, _to: &Path) -> VfsResult<()> {
        Err(VfsError::ReadOnly)
    }

    async fn truncate(&self, _path: &Path, _size: u64) -> VfsResult<()> {
        Err(VfsError::ReadOnly)
    }

    async fn setattr(&self, path: &Path, attr: SetAttr) -> VfsResult<FileAttr> {
        // Hosts touch timestamps on plain reads; accept those as no-ops.
        if attr.only_times() {
            return self.getattr(path).await;
        }
        Err(VfsError::ReadOnly)
    }

    fn capabilities(&self) -> CapabilityFlags {
        CapabilityFlags {
            can_write: false,
            ..self.inner.capabilities()
        }
    }

    async fn statfs(&self) -> VfsResult<StatFs> {
        self.inner.statfs().await
    }

    fn volume_label(&self) -> Option<String> {
        self.inner.volume_label()
    }
}
