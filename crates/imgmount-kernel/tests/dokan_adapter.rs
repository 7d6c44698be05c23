//! The PC-host adapter driven through a fake volume driver.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use imgmount_device::Access;
use imgmount_kernel::adapter::{
    DokanAdapter, DokanFlags, DokanMountOptions, UnavailableDriver, VolumeDriver,
};
use imgmount_kernel::{
    BackendChoices, FormatRegistry, InterruptAction, InterruptRelay, MountAdapterError,
    MountDefaults, MountError, MountHost, MountOrchestrator, MountPhase, MountRequest,
    SessionHandle, SessionState, VfsOps,
};

/// Mounts, receives two interrupts, and stops once asked to unmount.
#[derive(Default)]
struct InterruptedDriver {
    options: Mutex<Option<DokanMountOptions>>,
    unmounts: Mutex<Vec<PathBuf>>,
    actions: Mutex<Vec<InterruptAction>>,
}

impl VolumeDriver for InterruptedDriver {
    fn run(
        &self,
        _fs: Arc<dyn VfsOps>,
        options: &DokanMountOptions,
        session: &SessionHandle,
    ) -> Result<(), MountAdapterError> {
        *self.options.lock() = Some(options.clone());
        session.mark_mounted()?;

        let relay = InterruptRelay::new(session.clone());
        let mut actions = self.actions.lock();
        actions.push(relay.on_interrupt());
        actions.push(relay.on_interrupt());
        Ok(())
    }

    fn unmount(&self, mount_point: &Path) -> io::Result<()> {
        self.unmounts.lock().push(mount_point.to_path_buf());
        Ok(())
    }
}

fn memory_request(access: Access) -> MountRequest {
    MountRequest {
        backend: BackendChoices {
            memory: true,
            ..Default::default()
        },
        access,
        target: PathBuf::from("M:\\"),
        sector_size: None,
    }
}

#[test]
fn interrupt_while_mounted_requests_unmount() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let driver = Arc::new(InterruptedDriver::default());
    let adapter = DokanAdapter::new(
        runtime.handle().clone(),
        MountDefaults::default(),
        driver.clone(),
    );
    let registry = FormatRegistry::new();

    let report = MountOrchestrator::new(&registry, &adapter)
        .run(memory_request(Access::ReadWrite))
        .unwrap();

    assert_eq!(
        driver.actions.lock().as_slice(),
        &[InterruptAction::Suppressed, InterruptAction::Suppressed]
    );
    assert_eq!(
        driver.unmounts.lock().as_slice(),
        &[PathBuf::from("M:\\"), PathBuf::from("M:\\")]
    );
    assert_eq!(
        &report.phases[4..],
        &[
            MountPhase::Mounted,
            MountPhase::Unmounting,
            MountPhase::Unmounted,
        ]
    );

    let options = driver.options.lock().clone().unwrap();
    assert_eq!(options.flags, DokanFlags::NONE);
    assert!(!options.single_thread);
    assert_eq!(options.volume_label, "memory");
}

#[test]
fn read_only_mount_is_write_protected() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let driver = Arc::new(InterruptedDriver::default());
    let adapter = DokanAdapter::new(
        runtime.handle().clone(),
        MountDefaults::default(),
        driver.clone(),
    );
    let registry = FormatRegistry::new();

    MountOrchestrator::new(&registry, &adapter)
        .run(memory_request(Access::ReadOnly))
        .unwrap();

    let options = driver.options.lock().clone().unwrap();
    assert!(options.flags.contains(DokanFlags::WRITE_PROTECT));
}

#[test]
fn interrupt_after_unmount_terminates() {
    let session = SessionHandle::new();
    session.mark_mounted().unwrap();
    session.mark_unmounted();

    assert_eq!(session.state(), SessionState::Unmounted);
    assert_eq!(
        InterruptRelay::new(session).on_interrupt(),
        InterruptAction::Terminate
    );
}

#[test]
fn missing_driver_is_unsupported() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let adapter = DokanAdapter::new(
        runtime.handle().clone(),
        MountDefaults::default(),
        Arc::new(UnavailableDriver),
    );
    let registry = FormatRegistry::new();
    let mut orchestrator = MountOrchestrator::new(&registry, &adapter);

    let err = orchestrator
        .run(memory_request(Access::ReadWrite))
        .unwrap_err();

    assert!(matches!(
        err,
        MountError::Adapter(MountAdapterError::Unsupported(MountHost::Dokan))
    ));
    assert_eq!(err.exit_code(), 1);
    assert_eq!(orchestrator.phases().last(), Some(&MountPhase::Failed));
    assert!(!orchestrator.phases().contains(&MountPhase::Mounted));
}
