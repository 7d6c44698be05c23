//! Mount orchestration.
//!
//! One mount attempt walks
//! `Selecting → Opening → Negotiating → Mounting → Mounted → Unmounting → Unmounted`,
//! or ends in `Failed` from any earlier phase. The orchestrator selects and
//! opens the backend, negotiates capabilities, then hands the filesystem to
//! a host adapter and blocks until that returns. The last three phases are
//! driven by the adapter through the session handle.

use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use imgmount_device::{Access, BoxedStream, GeometryProbe, SubStream, open_stream};

use crate::adapter::HostMountAdapter;
use crate::backend::{BackendChoices, BackendSelection};
use crate::capability::{MountConfiguration, negotiate};
use crate::error::{BackendSelectionError, MountError, OpenError};
use crate::formats::{FormatRegistry, PartitionTable};
use crate::session::{MountSession, SessionState};
use crate::vfs::{MemoryBackend, ReadOnlyView, VfsOps};

/// Where a mount attempt is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountPhase {
    Selecting,
    Opening,
    Negotiating,
    Mounting,
    Mounted,
    Unmounting,
    Unmounted,
    Failed,
}

/// One mount, as requested by the user.
#[derive(Debug, Clone)]
pub struct MountRequest {
    pub backend: BackendChoices,
    pub access: Access,
    pub target: PathBuf,
    /// Alignment override for raw block devices.
    pub sector_size: Option<u32>,
}

/// Outcome of a clean mount and unmount.
#[derive(Debug, Clone)]
pub struct MountReport {
    pub configuration: MountConfiguration,
    pub phases: Vec<MountPhase>,
}

pub struct MountOrchestrator<'a> {
    registry: &'a FormatRegistry,
    adapter: &'a dyn HostMountAdapter,
    probe: GeometryProbe,
    phases: Vec<MountPhase>,
}

impl std::fmt::Debug for MountOrchestrator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountOrchestrator")
            .field("host", &self.adapter.host())
            .field("probe", &self.probe.method())
            .field("phases", &self.phases)
            .finish_non_exhaustive()
    }
}

impl<'a> MountOrchestrator<'a> {
    pub fn new(registry: &'a FormatRegistry, adapter: &'a dyn HostMountAdapter) -> Self {
        Self {
            registry,
            adapter,
            probe: GeometryProbe::for_host(),
            phases: Vec::new(),
        }
    }

    /// Use `probe` for raw device geometry instead of the host's native query.
    pub fn with_probe(mut self, probe: GeometryProbe) -> Self {
        self.probe = probe;
        self
    }

    /// Phases of the last attempt, oldest first.
    pub fn phases(&self) -> &[MountPhase] {
        &self.phases
    }

    /// Run one mount attempt to completion. Blocks while mounted.
    pub fn run(&mut self, request: MountRequest) -> Result<MountReport, MountError> {
        self.phases.clear();
        let result = self.drive(request);
        if let Err(e) = &result {
            self.enter(MountPhase::Failed);
            tracing::debug!(exit_code = e.exit_code(), "mount attempt failed");
        }
        result
    }

    fn enter(&mut self, phase: MountPhase) {
        tracing::debug!(?phase, "mount phase");
        self.phases.push(phase);
    }

    fn drive(&mut self, request: MountRequest) -> Result<MountReport, MountError> {
        self.enter(MountPhase::Selecting);
        let selection = BackendSelection::from_choices(request.backend)?;
        tracing::info!(backend = %selection.describe(), "selected backend");

        self.enter(MountPhase::Opening);
        let filesystem = self.open(&selection, request.access, request.sector_size)?;

        self.enter(MountPhase::Negotiating);
        let configuration = negotiate(filesystem.capabilities(), request.access);
        let filesystem: Arc<dyn VfsOps> = if configuration.is_read_only() {
            Arc::new(ReadOnlyView::new(filesystem))
        } else {
            filesystem
        };

        self.enter(MountPhase::Mounting);
        tracing::info!(
            host = %self.adapter.host(),
            target = %request.target.display(),
            access = ?configuration.effective_access,
            dispatch = ?configuration.dispatch_mode,
            "mounting"
        );
        let session = MountSession::new(filesystem, configuration.clone());
        let result = self.adapter.mount(&session, &request.target);
        session.handle().mark_unmounted();

        for state in session.handle().history() {
            match state {
                SessionState::Mounted => self.enter(MountPhase::Mounted),
                SessionState::Unmounting => self.enter(MountPhase::Unmounting),
                SessionState::Unmounted if result.is_ok() => self.enter(MountPhase::Unmounted),
                SessionState::Starting | SessionState::Unmounted => {}
            }
        }
        result?;

        tracing::info!(target = %request.target.display(), "unmounted cleanly");
        Ok(MountReport {
            configuration,
            phases: self.phases.clone(),
        })
    }

    fn open(
        &self,
        selection: &BackendSelection,
        access: Access,
        sector_size: Option<u32>,
    ) -> Result<Arc<dyn VfsOps>, MountError> {
        match selection {
            BackendSelection::Ephemeral(kind) => Ok(Arc::new(MemoryBackend::ephemeral(*kind))),

            BackendSelection::FilesystemImage { path } => {
                let stream = open_stream(path, access, &self.probe, sector_size)
                    .map_err(OpenError::from)?;
                Ok(self.open_volume(stream, access, path, None)?)
            }

            BackendSelection::DiskImage { path, partition } => {
                let stream = open_stream(path, access, &self.probe, sector_size)
                    .map_err(OpenError::from)?;
                let mut disk = self.registry.open_disk(stream).map_err(OpenError::from)?;
                let table =
                    PartitionTable::read(disk.as_mut()).map_err(|e| OpenError::io(path, e))?;
                let Some(volume) = table.get(*partition).cloned() else {
                    return Err(BackendSelectionError::PartitionOutOfRange {
                        requested: *partition,
                        available: table.len(),
                    }
                    .into());
                };
                tracing::info!(
                    scheme = ?table.scheme,
                    index = volume.index,
                    start = volume.start,
                    length = volume.length,
                    name = volume.name.as_deref().unwrap_or(""),
                    "selected partition"
                );
                let stream = SubStream::new(disk, volume.start, volume.length)
                    .map_err(OpenError::from)?;
                Ok(self.open_volume(Box::new(stream), access, path, Some(*partition))?)
            }

            BackendSelection::ArchiveImage { path, index } => {
                let mut stream = open_stream(path, access, &self.probe, sector_size)
                    .map_err(OpenError::from)?;
                let format = self
                    .registry
                    .detect_archive(stream.as_mut())
                    .map_err(|e| OpenError::io(path, e))?
                    .ok_or_else(|| OpenError::UnrecognizedArchive(path.clone()))?;
                let count = format
                    .image_count(stream.as_mut())
                    .map_err(|e| OpenError::io(path, e))?;
                if *index >= count {
                    return Err(BackendSelectionError::ImageOutOfRange {
                        requested: *index,
                        available: count,
                    }
                    .into());
                }
                stream
                    .seek(SeekFrom::Start(0))
                    .map_err(|e| OpenError::io(path, e))?;
                tracing::info!(format = format.name(), index, count, "opening archive image");
                Ok(format
                    .open_image(stream, *index, access)
                    .map_err(OpenError::from)?)
            }
        }
    }

    fn open_volume(
        &self,
        stream: BoxedStream,
        access: Access,
        path: &Path,
        volume: Option<usize>,
    ) -> Result<Arc<dyn VfsOps>, OpenError> {
        match self
            .registry
            .open_filesystem(stream, access)
            .map_err(|e| OpenError::io(path, e))?
        {
            Some(filesystem) => Ok(filesystem?),
            None => Err(OpenError::NoFilesystem {
                path: path.to_path_buf(),
                volume,
            }),
        }
    }
}
