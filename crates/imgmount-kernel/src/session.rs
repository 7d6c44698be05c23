//! Mount session lifecycle and cooperative interrupt handling.
//!
//! A [`MountSession`] is created when a filesystem is handed to a host
//! adapter. Its state moves `Starting → Mounted → Unmounting → Unmounted`
//! (or straight to `Unmounted` when mounting fails or the host tears the
//! mount down). Dropping the session releases the filesystem and the
//! stream chain beneath it.

use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::watch;

use crate::capability::MountConfiguration;
use crate::vfs::VfsOps;

/// Lifecycle state of a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Starting,
    Mounted,
    Unmounting,
    Unmounted,
}

impl SessionState {
    fn can_move_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Starting, Mounted)
                | (Starting, Unmounted)
                | (Mounted, Unmounting)
                | (Mounted, Unmounted)
                | (Unmounting, Unmounted)
        )
    }
}

/// A state change that the lifecycle does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid session transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

type Unmounter = Box<dyn Fn() -> io::Result<()> + Send + Sync>;

struct SessionInner {
    state: watch::Sender<SessionState>,
    history: Mutex<Vec<SessionState>>,
    unmounter: Mutex<Option<Unmounter>>,
    unmount_requests: AtomicU32,
}

/// Shared view of a mount's lifecycle.
///
/// Cloned into host adapters (which drive it) and the interrupt relay
/// (which observes it and asks for unmount).
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("state", &self.state())
            .field("unmount_requests", &self.unmount_requests())
            .finish()
    }
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionHandle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SessionState::Starting);
        Self {
            inner: Arc::new(SessionInner {
                state,
                history: Mutex::new(vec![SessionState::Starting]),
                unmounter: Mutex::new(None),
                unmount_requests: AtomicU32::new(0),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Every state this session has been in, oldest first.
    pub fn history(&self) -> Vec<SessionState> {
        self.inner.history.lock().clone()
    }

    /// Move to `next`, validating the transition.
    pub fn transition(&self, next: SessionState) -> Result<(), InvalidTransition> {
        let mut history = self.inner.history.lock();
        let current = self.state();
        if !current.can_move_to(next) {
            return Err(InvalidTransition {
                from: current,
                to: next,
            });
        }
        history.push(next);
        self.inner.state.send_replace(next);
        tracing::debug!(from = ?current, to = ?next, "mount session transition");
        Ok(())
    }

    /// The volume is live and ready for requests.
    pub fn mark_mounted(&self) -> Result<(), InvalidTransition> {
        self.transition(SessionState::Mounted)
    }

    /// The mount loop has returned; no-op if already unmounted.
    pub fn mark_unmounted(&self) {
        if self.state() != SessionState::Unmounted {
            // Every non-terminal state may move to Unmounted.
            let _ = self.transition(SessionState::Unmounted);
        }
    }

    /// Register how to ask the host to unmount this session.
    pub fn set_unmounter<F>(&self, unmount: F)
    where
        F: Fn() -> io::Result<()> + Send + Sync + 'static,
    {
        *self.inner.unmounter.lock() = Some(Box::new(unmount));
    }

    pub fn clear_unmounter(&self) {
        self.inner.unmounter.lock().take();
    }

    /// Ask the host to unmount. Does not wait for it to happen.
    pub fn request_unmount(&self) -> io::Result<()> {
        self.inner.unmount_requests.fetch_add(1, Ordering::SeqCst);
        match self.inner.unmounter.lock().as_ref() {
            Some(unmount) => unmount(),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no unmount handler registered",
            )),
        }
    }

    pub fn unmount_requests(&self) -> u32 {
        self.inner.unmount_requests.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }
}

/// A filesystem handed to a host adapter, with its negotiated configuration.
pub struct MountSession {
    filesystem: Arc<dyn VfsOps>,
    configuration: MountConfiguration,
    handle: SessionHandle,
}

impl MountSession {
    pub fn new(filesystem: Arc<dyn VfsOps>, configuration: MountConfiguration) -> Self {
        Self {
            filesystem,
            configuration,
            handle: SessionHandle::new(),
        }
    }

    pub fn filesystem(&self) -> &Arc<dyn VfsOps> {
        &self.filesystem
    }

    pub fn configuration(&self) -> &MountConfiguration {
        &self.configuration
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn state(&self) -> SessionState {
        self.handle.state()
    }
}

impl std::fmt::Debug for MountSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountSession")
            .field("configuration", &self.configuration)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// What to do with an interactive interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    /// Termination suppressed; an unmount was requested instead.
    Suppressed,
    /// No active mount; let the process terminate.
    Terminate,
}

/// Turns Ctrl-C into a cooperative unmount while a volume is mounted.
#[derive(Debug, Clone)]
pub struct InterruptRelay {
    session: SessionHandle,
}

impl InterruptRelay {
    pub fn new(session: SessionHandle) -> Self {
        Self { session }
    }

    /// Handle one interrupt.
    ///
    /// While the volume is mounted (or already unmounting) the interrupt is
    /// swallowed and the unmount request is issued again. Otherwise the
    /// caller should terminate.
    pub fn on_interrupt(&self) -> InterruptAction {
        match self.session.state() {
            SessionState::Mounted => {
                if let Err(e) = self.session.transition(SessionState::Unmounting) {
                    tracing::debug!("{e}");
                }
                self.issue_unmount();
                InterruptAction::Suppressed
            }
            SessionState::Unmounting => {
                self.issue_unmount();
                InterruptAction::Suppressed
            }
            SessionState::Starting | SessionState::Unmounted => InterruptAction::Terminate,
        }
    }

    fn issue_unmount(&self) {
        tracing::info!("interrupt received, unmounting");
        if let Err(e) = self.session.request_unmount() {
            tracing::warn!("unmount request failed: {e}");
        }
    }

    /// Listen for Ctrl-C on `runtime` until the session is unmounted.
    ///
    /// An interrupt with no active mount exits the process with status 130.
    pub fn spawn(self, runtime: &tokio::runtime::Handle) -> tokio::task::JoinHandle<()> {
        let mut states = self.session.subscribe();
        runtime.spawn(async move {
            loop {
                tokio::select! {
                    signal = tokio::signal::ctrl_c() => {
                        if let Err(e) = signal {
                            tracing::warn!("cannot listen for interrupts: {e}");
                            return;
                        }
                        if self.on_interrupt() == InterruptAction::Terminate {
                            tracing::info!("interrupted before the volume was mounted");
                            std::process::exit(130);
                        }
                    }
                    changed = states.changed() => {
                        if changed.is_err() || *states.borrow() == SessionState::Unmounted {
                            return;
                        }
                    }
                }
            }
        })
    }
}
