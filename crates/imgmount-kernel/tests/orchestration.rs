//! End-to-end mount orchestration against a recording host adapter.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::NamedTempFile;

use imgmount_device::{Access, BoxedStream, ImageStream};
use imgmount_kernel::capability::{CapabilityNotice, DispatchMode, MountOption};
use imgmount_kernel::formats::{ArchiveFormat, FilesystemFactory};
use imgmount_kernel::vfs::ReadOnlyView;
use imgmount_kernel::{
    BackendChoices, BackendSelectionError, FormatRegistry, HostMountAdapter, MemoryBackend,
    MountAdapterError, MountConfiguration, MountError, MountHost, MountOrchestrator, MountPhase,
    MountRequest, MountSession, OpenError, VfsError, VfsOps, VfsResult,
};

const SECTOR: usize = 512;

/// Recognizes volumes starting with `TESTFS`; byte 6 set to `R` opens read-only.
struct TestFs {
    seen: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl FilesystemFactory for TestFs {
    fn name(&self) -> &str {
        "testfs"
    }

    fn detect(&self, stream: &mut dyn ImageStream) -> io::Result<bool> {
        let mut magic = [0u8; 6];
        match stream.read_exact(&mut magic) {
            Ok(()) => Ok(&magic == b"TESTFS"),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn open(&self, mut stream: BoxedStream, _access: Access) -> VfsResult<Arc<dyn VfsOps>> {
        let mut header = vec![0u8; 16];
        stream.read_exact(&mut header)?;
        let read_only = header[6] == b'R';
        self.seen.lock().push(header);

        let memory: Arc<dyn VfsOps> = Arc::new(MemoryBackend::retaining());
        if read_only {
            Ok(Arc::new(ReadOnlyView::new(memory)))
        } else {
            Ok(memory)
        }
    }
}

/// `ARCH` followed by an image count byte; every image is an empty memory tree.
struct TestArchive;

impl ArchiveFormat for TestArchive {
    fn name(&self) -> &str {
        "testarch"
    }

    fn detect(&self, stream: &mut dyn ImageStream) -> io::Result<bool> {
        let mut magic = [0u8; 4];
        Ok(stream.read_exact(&mut magic).is_ok() && &magic == b"ARCH")
    }

    fn image_count(&self, stream: &mut dyn ImageStream) -> io::Result<usize> {
        let mut header = [0u8; 5];
        stream.read_exact(&mut header)?;
        Ok(header[4] as usize)
    }

    fn open_image(
        &self,
        _stream: BoxedStream,
        _index: usize,
        _access: Access,
    ) -> VfsResult<Arc<dyn VfsOps>> {
        Ok(Arc::new(MemoryBackend::retaining()))
    }
}

/// Records every mount and runs `probe` against the mounted filesystem.
struct RecordingAdapter {
    runtime: tokio::runtime::Runtime,
    mounts: Mutex<Vec<(MountConfiguration, PathBuf)>>,
    probe: Box<dyn Fn(&tokio::runtime::Runtime, Arc<dyn VfsOps>) + Send + Sync>,
}

impl RecordingAdapter {
    fn new() -> Self {
        Self::probing(|_, _| {})
    }

    fn probing(
        probe: impl Fn(&tokio::runtime::Runtime, Arc<dyn VfsOps>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            runtime: tokio::runtime::Runtime::new().unwrap(),
            mounts: Mutex::new(Vec::new()),
            probe: Box::new(probe),
        }
    }

    fn mount_count(&self) -> usize {
        self.mounts.lock().len()
    }

    fn last_configuration(&self) -> MountConfiguration {
        self.mounts.lock().last().unwrap().0.clone()
    }
}

impl HostMountAdapter for RecordingAdapter {
    fn host(&self) -> MountHost {
        MountHost::Fuse
    }

    fn mount(&self, session: &MountSession, target: &Path) -> Result<(), MountAdapterError> {
        self.mounts
            .lock()
            .push((session.configuration().clone(), target.to_path_buf()));
        session.handle().mark_mounted()?;
        (self.probe)(&self.runtime, session.filesystem().clone());
        Ok(())
    }
}

fn registry(seen: &Arc<Mutex<Vec<Vec<u8>>>>) -> FormatRegistry {
    let mut registry = FormatRegistry::new();
    registry
        .register_filesystem(TestFs { seen: seen.clone() })
        .register_archive(TestArchive);
    registry
}

fn image_file(bytes: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
    file
}

fn request(backend: BackendChoices, access: Access) -> MountRequest {
    MountRequest {
        backend,
        access,
        target: PathBuf::from("/mnt/image"),
        sector_size: None,
    }
}

/// MBR disk with `(type, first_lba, sectors)` primaries.
fn mbr_disk(sectors: usize, entries: &[(u8, u32, u32)]) -> Vec<u8> {
    let mut disk = vec![0u8; sectors * SECTOR];
    for (i, (kind, first, count)) in entries.iter().enumerate() {
        let e = 0x1BE + i * 16;
        disk[e + 4] = *kind;
        disk[e + 8..e + 12].copy_from_slice(&first.to_le_bytes());
        disk[e + 12..e + 16].copy_from_slice(&count.to_le_bytes());
    }
    disk[510] = 0x55;
    disk[511] = 0xAA;
    disk
}

/// GPT disk with `(first_lba, last_lba, name)` entries in consecutive slots.
fn gpt_disk(sectors: usize, entries: &[(u64, u64, &str)]) -> Vec<u8> {
    let mut disk = mbr_disk(sectors, &[(0xEE, 1, (sectors - 1) as u32)]);
    let h = SECTOR;
    disk[h..h + 8].copy_from_slice(b"EFI PART");
    disk[h + 72..h + 80].copy_from_slice(&2u64.to_le_bytes());
    disk[h + 80..h + 84].copy_from_slice(&(entries.len() as u32).to_le_bytes());
    disk[h + 84..h + 88].copy_from_slice(&128u32.to_le_bytes());
    for (slot, (first, last, name)) in entries.iter().enumerate() {
        let e = 2 * SECTOR + slot * 128;
        disk[e..e + 16].copy_from_slice(&[0x11; 16]);
        disk[e + 32..e + 40].copy_from_slice(&first.to_le_bytes());
        disk[e + 40..e + 48].copy_from_slice(&last.to_le_bytes());
        for (i, unit) in name.encode_utf16().enumerate() {
            disk[e + 56 + i * 2..e + 58 + i * 2].copy_from_slice(&unit.to_le_bytes());
        }
    }
    disk
}

fn place(disk: &mut [u8], lba: usize, bytes: &[u8]) {
    disk[lba * SECTOR..lba * SECTOR + bytes.len()].copy_from_slice(bytes);
}

#[test]
fn partition_out_of_range_never_mounts() {
    let seen = Arc::default();
    let registry = registry(&seen);
    let adapter = RecordingAdapter::new();
    let disk = image_file(&mbr_disk(64, &[(0x83, 8, 8), (0x83, 16, 8), (0x07, 24, 8)]));

    let backend = BackendChoices {
        disk: Some(disk.path().to_path_buf()),
        partition: Some(5),
        ..Default::default()
    };
    let mut orchestrator = MountOrchestrator::new(&registry, &adapter);
    let err = orchestrator
        .run(request(backend, Access::ReadOnly))
        .unwrap_err();

    assert!(matches!(
        err,
        MountError::Selection(BackendSelectionError::PartitionOutOfRange {
            requested: 5,
            available: 3,
        })
    ));
    assert_ne!(err.exit_code(), 0);
    assert_eq!(adapter.mount_count(), 0);
    assert_eq!(orchestrator.phases().last(), Some(&MountPhase::Failed));
}

#[test]
fn gpt_partition_is_opened_through_its_window() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let registry = registry(&seen);
    let adapter = RecordingAdapter::new();

    let mut bytes = gpt_disk(128, &[(34, 63, "boot"), (64, 127, "data")]);
    place(&mut bytes, 34, b"not a filesystem");
    place(&mut bytes, 64, b"TESTFS-partition");
    let disk = image_file(&bytes);

    let backend = BackendChoices {
        disk: Some(disk.path().to_path_buf()),
        partition: Some(1),
        ..Default::default()
    };
    let mut orchestrator = MountOrchestrator::new(&registry, &adapter);
    let report = orchestrator
        .run(request(backend, Access::ReadWrite))
        .unwrap();

    assert_eq!(seen.lock().as_slice(), &[b"TESTFS-partition".to_vec()]);
    assert_eq!(report.configuration.effective_access, Access::ReadWrite);
    assert_eq!(report.configuration.dispatch_mode, DispatchMode::Concurrent);
    assert_eq!(adapter.mount_count(), 1);
    assert_eq!(
        report.phases,
        vec![
            MountPhase::Selecting,
            MountPhase::Opening,
            MountPhase::Negotiating,
            MountPhase::Mounting,
            MountPhase::Mounted,
            MountPhase::Unmounted,
        ]
    );
}

#[test]
fn partition_without_filesystem_exits_two() {
    let seen = Arc::default();
    let registry = registry(&seen);
    let adapter = RecordingAdapter::new();
    let disk = image_file(&gpt_disk(128, &[(34, 127, "empty")]));

    let backend = BackendChoices {
        disk: Some(disk.path().to_path_buf()),
        partition: Some(0),
        ..Default::default()
    };
    let err = MountOrchestrator::new(&registry, &adapter)
        .run(request(backend, Access::ReadOnly))
        .unwrap_err();

    assert!(matches!(
        err,
        MountError::Open(OpenError::NoFilesystem {
            volume: Some(0),
            ..
        })
    ));
    assert_eq!(err.exit_code(), 2);
    assert_eq!(adapter.mount_count(), 0);
}

#[test]
fn write_request_on_read_only_filesystem_is_downgraded() {
    let seen = Arc::default();
    let registry = registry(&seen);
    let adapter = RecordingAdapter::probing(|runtime, fs| {
        let err = runtime
            .block_on(fs.create(Path::new("new.txt"), 0o644))
            .unwrap_err();
        assert!(matches!(err, VfsError::ReadOnly));
    });

    let mut bytes = vec![0u8; 4096];
    bytes[..7].copy_from_slice(b"TESTFSR");
    let image = image_file(&bytes);

    let backend = BackendChoices {
        image: Some(image.path().to_path_buf()),
        ..Default::default()
    };
    let report = MountOrchestrator::new(&registry, &adapter)
        .run(request(backend, Access::ReadWrite))
        .unwrap();

    let config = adapter.last_configuration();
    assert_eq!(config, report.configuration);
    assert_eq!(config.effective_access, Access::ReadOnly);
    assert_eq!(config.notices, vec![CapabilityNotice::WriteDowngraded]);
    assert!(config.has_option(MountOption::WriteProtect));
    assert!(config.has_option(MountOption::ReadOnlyCache));
}

#[test]
fn read_only_request_wraps_writable_filesystem() {
    let seen = Arc::default();
    let registry = registry(&seen);
    let adapter = RecordingAdapter::probing(|runtime, fs| {
        assert!(!fs.capabilities().can_write);
        let err = runtime
            .block_on(fs.mkdir(Path::new("dir"), 0o755))
            .unwrap_err();
        assert!(matches!(err, VfsError::ReadOnly));
    });

    let mut bytes = vec![0u8; 4096];
    bytes[..6].copy_from_slice(b"TESTFS");
    let image = image_file(&bytes);

    let backend = BackendChoices {
        image: Some(image.path().to_path_buf()),
        ..Default::default()
    };
    let report = MountOrchestrator::new(&registry, &adapter)
        .run(request(backend, Access::ReadOnly))
        .unwrap();

    assert!(report.configuration.notices.is_empty());
    assert!(report.configuration.is_read_only());
}

#[test]
fn archive_index_is_validated() {
    let seen = Arc::default();
    let registry = registry(&seen);
    let adapter = RecordingAdapter::new();
    let archive = image_file(b"ARCH\x02rest-of-archive");

    let out_of_range = BackendChoices {
        archive: Some(archive.path().to_path_buf()),
        index: Some(2),
        ..Default::default()
    };
    let err = MountOrchestrator::new(&registry, &adapter)
        .run(request(out_of_range, Access::ReadOnly))
        .unwrap_err();
    assert!(matches!(
        err,
        MountError::Selection(BackendSelectionError::ImageOutOfRange {
            requested: 2,
            available: 2,
        })
    ));
    assert_eq!(adapter.mount_count(), 0);

    let in_range = BackendChoices {
        archive: Some(archive.path().to_path_buf()),
        index: Some(1),
        ..Default::default()
    };
    MountOrchestrator::new(&registry, &adapter)
        .run(request(in_range, Access::ReadOnly))
        .unwrap();
    assert_eq!(adapter.mount_count(), 1);
}

#[test]
fn unrecognized_archive_is_reported() {
    let seen = Arc::default();
    let registry = registry(&seen);
    let adapter = RecordingAdapter::new();
    let archive = image_file(b"ZIPZIPZIP");

    let backend = BackendChoices {
        archive: Some(archive.path().to_path_buf()),
        index: Some(0),
        ..Default::default()
    };
    let err = MountOrchestrator::new(&registry, &adapter)
        .run(request(backend, Access::ReadOnly))
        .unwrap_err();

    assert!(matches!(
        err,
        MountError::Open(OpenError::UnrecognizedArchive(_))
    ));
    assert_eq!(err.exit_code(), 1);
}

#[test]
fn memory_mount_keeps_written_content() {
    let registry = FormatRegistry::new();
    let adapter = RecordingAdapter::probing(|runtime, fs| {
        runtime.block_on(async {
            fs.create(Path::new("a.txt"), 0o644).await.unwrap();
            fs.write(Path::new("a.txt"), 0, b"hi").await.unwrap();
            assert_eq!(fs.getattr(Path::new("a.txt")).await.unwrap().size, 2);
            assert_eq!(fs.read_all(Path::new("a.txt")).await.unwrap(), b"hi");
        });
    });

    let backend = BackendChoices {
        memory: true,
        ..Default::default()
    };
    let report = MountOrchestrator::new(&registry, &adapter)
        .run(request(backend, Access::ReadWrite))
        .unwrap();
    assert_eq!(report.configuration.effective_access, Access::ReadWrite);
}

#[test]
fn discard_mount_accepts_and_drops_writes() {
    let registry = FormatRegistry::new();
    let adapter = RecordingAdapter::probing(|runtime, fs| {
        runtime.block_on(async {
            fs.create(Path::new("a.txt"), 0o644).await.unwrap();
            assert_eq!(fs.write(Path::new("a.txt"), 0, b"hi").await.unwrap(), 2);
            assert_eq!(fs.getattr(Path::new("a.txt")).await.unwrap().size, 0);
        });
    });

    let backend = BackendChoices {
        discard: true,
        ..Default::default()
    };
    MountOrchestrator::new(&registry, &adapter)
        .run(request(backend, Access::ReadWrite))
        .unwrap();
    assert_eq!(adapter.mount_count(), 1);
}

#[test]
fn adapter_failure_carries_native_code() {
    struct Refusing;

    impl HostMountAdapter for Refusing {
        fn host(&self) -> MountHost {
            MountHost::Fuse
        }

        fn mount(&self, _session: &MountSession, target: &Path) -> Result<(), MountAdapterError> {
            Err(MountAdapterError::mount(
                target,
                io::Error::from_raw_os_error(16),
            ))
        }
    }

    let registry = FormatRegistry::new();
    let mut orchestrator = MountOrchestrator::new(&registry, &Refusing);
    let backend = BackendChoices {
        memory: true,
        ..Default::default()
    };
    let err = orchestrator
        .run(request(backend, Access::ReadWrite))
        .unwrap_err();

    assert!(matches!(err, MountError::Adapter(_)));
    assert_eq!(err.exit_code(), 16);
    assert_eq!(
        orchestrator.phases(),
        &[
            MountPhase::Selecting,
            MountPhase::Opening,
            MountPhase::Negotiating,
            MountPhase::Mounting,
            MountPhase::Failed,
        ]
    );
}
