//! POSIX host adapter on FUSE.
//!
//! The kernel's FUSE session loop owns the mount: this adapter supplies
//! options, maps inodes to paths, and blocks in the loop until the mount
//! goes away. Filesystem calls are async; with
//! [`DispatchMode::SingleThreaded`] each one completes on the session
//! thread before the next is read, with [`DispatchMode::Concurrent`] each
//! one is spawned onto the runtime and replies when done.

use fuser::{
    FileType as FuseFileType, Filesystem, KernelConfig, MountOption as FuseOption, ReplyAttr,
    ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs,
    ReplyWrite, Request, TimeOrNow,
};
use libc::c_int;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::runtime::Handle;

use super::HostMountAdapter;
use crate::capability::{DispatchMode, MountConfiguration, MountHost, MountOption};
use crate::config::MountDefaults;
use crate::error::MountAdapterError;
use crate::session::{MountSession, SessionHandle};
use crate::vfs::{FileAttr, FileType, SetAttr, VfsError, VfsOps};

const ROOT_INO: u64 = 1;
/// Inode reported in listings for entries the kernel has not looked up.
const UNKNOWN_INO: u64 = 0xffff_ffff;
const BLOCK_SIZE: u32 = 4096;

/// Mounts filesystems through FUSE.
#[derive(Debug, Clone)]
pub struct FuseAdapter {
    runtime: Handle,
    defaults: MountDefaults,
}

impl FuseAdapter {
    pub fn new(runtime: Handle, defaults: MountDefaults) -> Self {
        Self { runtime, defaults }
    }
}

/// Translate a mount configuration into FUSE mount options.
pub fn mount_options(config: &MountConfiguration, defaults: &MountDefaults) -> Vec<FuseOption> {
    let mut options = vec![
        if config.is_read_only() {
            FuseOption::RO
        } else {
            FuseOption::RW
        },
        FuseOption::FSName(defaults.fs_name.clone()),
        FuseOption::DefaultPermissions,
    ];
    if let Some(label) = &defaults.volume_label {
        options.push(FuseOption::Subtype(label.clone()));
    }
    for option in config.options_for(MountHost::Fuse) {
        if option == MountOption::ReadOnlyCache {
            options.push(FuseOption::CUSTOM("kernel_cache".to_string()));
        }
    }
    if defaults.allow_other {
        options.push(FuseOption::AllowOther);
    }
    if defaults.auto_unmount {
        options.push(FuseOption::AutoUnmount);
    }
    options
}

impl HostMountAdapter for FuseAdapter {
    fn host(&self) -> MountHost {
        MountHost::Fuse
    }

    fn mount(&self, session: &MountSession, target: &Path) -> Result<(), MountAdapterError> {
        let config = session.configuration();
        let options = mount_options(config, &self.defaults);
        tracing::info!(target = %target.display(), ?options, "mounting via FUSE");

        let fs = FuseFilesystem {
            fs: session.filesystem().clone(),
            inodes: Arc::new(Mutex::new(InodeTable::new())),
            dispatch: Dispatcher {
                runtime: self.runtime.clone(),
                mode: config.dispatch_mode,
            },
            ttl: self.defaults.attr_ttl(),
            session: session.handle().clone(),
            owner: Owner::current(),
        };

        let mut fuse = fuser::Session::new(fs, target, &options)
            .map_err(|e| MountAdapterError::mount(target, e))?;
        let unmounter = Mutex::new(fuse.unmount_callable());
        session
            .handle()
            .set_unmounter(move || unmounter.lock().unmount());

        let result = fuse.run();

        session.handle().clear_unmounter();
        session.handle().mark_unmounted();
        tracing::info!(target = %target.display(), "FUSE session ended");
        result.map_err(|e| MountAdapterError::mount(target, e))
    }
}

/// Bidirectional inode ↔ path map. Root is inode 1 at the empty path.
///
/// Every inode handed to the kernel in an entry reply carries a lookup
/// count; the mapping lives until the kernel forgets it or the path is
/// removed. Directory listings never allocate.
#[derive(Debug)]
struct InodeTable {
    paths: HashMap<u64, PathBuf>,
    inodes: HashMap<PathBuf, u64>,
    lookups: HashMap<u64, u64>,
    next: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut table = Self {
            paths: HashMap::new(),
            inodes: HashMap::new(),
            lookups: HashMap::new(),
            next: ROOT_INO + 1,
        };
        table.paths.insert(ROOT_INO, PathBuf::new());
        table.inodes.insert(PathBuf::new(), ROOT_INO);
        table
    }

    fn path(&self, ino: u64) -> Option<PathBuf> {
        self.paths.get(&ino).cloned()
    }

    fn child(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.paths.get(&parent).map(|p| p.join(name))
    }

    fn existing(&self, path: &Path) -> Option<u64> {
        self.inodes.get(path).copied()
    }

    /// Inode for `path`, counted as one kernel lookup.
    fn remember(&mut self, path: &Path) -> u64 {
        let ino = match self.inodes.get(path) {
            Some(ino) => *ino,
            None => {
                let ino = self.next;
                self.next += 1;
                self.paths.insert(ino, path.to_path_buf());
                self.inodes.insert(path.to_path_buf(), ino);
                ino
            }
        };
        if ino != ROOT_INO {
            *self.lookups.entry(ino).or_default() += 1;
        }
        ino
    }

    /// Drop `nlookup` kernel references; evict the inode at zero.
    fn forget(&mut self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let Some(count) = self.lookups.get_mut(&ino) else {
            return;
        };
        *count = count.saturating_sub(nlookup);
        if *count > 0 {
            return;
        }
        self.lookups.remove(&ino);
        if let Some(path) = self.paths.remove(&ino) {
            if self.inodes.get(&path) == Some(&ino) {
                self.inodes.remove(&path);
            }
        }
    }

    fn remove(&mut self, path: &Path) {
        if let Some(ino) = self.inodes.remove(path) {
            self.paths.remove(&ino);
            self.lookups.remove(&ino);
        }
    }

    /// Re-key `from` and everything below it to live under `to`.
    fn rename(&mut self, from: &Path, to: &Path) {
        self.remove(to);
        let moved: Vec<(PathBuf, u64)> = self
            .inodes
            .iter()
            .filter(|(path, _)| path.starts_with(from))
            .map(|(path, ino)| (path.clone(), *ino))
            .collect();
        for (old, ino) in moved {
            let Ok(rest) = old.strip_prefix(from) else {
                continue;
            };
            let new_path = if rest.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(rest)
            };
            self.inodes.remove(&old);
            self.inodes.insert(new_path.clone(), ino);
            self.paths.insert(ino, new_path);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Owner {
    uid: u32,
    gid: u32,
}

impl Owner {
    fn current() -> Self {
        // SAFETY: getuid/getgid cannot fail.
        unsafe {
            Self {
                uid: libc::getuid(),
                gid: libc::getgid(),
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Dispatcher {
    runtime: Handle,
    mode: DispatchMode,
}

impl Dispatcher {
    fn run<F>(&self, op: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.mode {
            DispatchMode::SingleThreaded => self.runtime.block_on(op),
            DispatchMode::Concurrent => {
                self.runtime.spawn(op);
            }
        }
    }
}

struct FuseFilesystem {
    fs: Arc<dyn VfsOps>,
    inodes: Arc<Mutex<InodeTable>>,
    dispatch: Dispatcher,
    ttl: Duration,
    session: SessionHandle,
    owner: Owner,
}

fn to_fuse_attr(ino: u64, attr: &FileAttr, owner: Owner) -> fuser::FileAttr {
    fuser::FileAttr {
        ino,
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.mtime,
        crtime: attr.crtime,
        kind: to_fuse_kind(attr.kind),
        perm: (attr.perm & 0o7777) as u16,
        nlink: attr.nlink,
        uid: owner.uid,
        gid: owner.gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

fn to_fuse_kind(kind: FileType) -> FuseFileType {
    match kind {
        FileType::File => FuseFileType::RegularFile,
        FileType::Directory => FuseFileType::Directory,
    }
}

fn system_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

impl FuseFilesystem {
    fn path(&self, ino: u64) -> Option<PathBuf> {
        self.inodes.lock().path(ino)
    }

    fn child(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.inodes.lock().child(parent, name)
    }

    /// Reply with a new entry for `path` after `op` produced its attributes.
    fn entry_reply<F>(&self, path: PathBuf, op: F, reply: ReplyEntry)
    where
        F: Future<Output = Result<FileAttr, VfsError>> + Send + 'static,
    {
        let inodes = self.inodes.clone();
        let ttl = self.ttl;
        let owner = self.owner;
        self.dispatch.run(async move {
            match op.await {
                Ok(attr) => {
                    let ino = inodes.lock().remember(&path);
                    reply.entry(&ttl, &to_fuse_attr(ino, &attr, owner), 0);
                }
                Err(e) => reply.error(e.errno()),
            }
        });
    }
}

impl Filesystem for FuseFilesystem {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        if let Err(e) = self.session.mark_mounted() {
            tracing::warn!("{e}");
        }
        tracing::info!("FUSE volume ready");
        Ok(())
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.child(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let fs = self.fs.clone();
        let target = path.clone();
        self.entry_reply(path, async move { fs.getattr(&target).await }, reply);
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.lock().forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let fs = self.fs.clone();
        let (ttl, owner) = (self.ttl, self.owner);
        self.dispatch.run(async move {
            match fs.getattr(&path).await {
                Ok(attr) => reply.attr(&ttl, &to_fuse_attr(ino, &attr, owner)),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let set = SetAttr {
            size,
            mtime: mtime.map(system_time),
            atime: atime.map(system_time),
            perm: mode.map(|m| m & 0o7777),
        };
        let fs = self.fs.clone();
        let (ttl, owner) = (self.ttl, self.owner);
        self.dispatch.run(async move {
            match fs.setattr(&path, set).await {
                Ok(attr) => reply.attr(&ttl, &to_fuse_attr(ino, &attr, owner)),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let fs = self.fs.clone();
        let target = path.clone();
        self.entry_reply(
            path,
            async move { fs.mkdir(&target, mode & !umask).await },
            reply,
        );
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let fs = self.fs.clone();
        let inodes = self.inodes.clone();
        self.dispatch.run(async move {
            match fs.unlink(&path).await {
                Ok(()) => {
                    inodes.lock().remove(&path);
                    reply.ok();
                }
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let fs = self.fs.clone();
        let inodes = self.inodes.clone();
        self.dispatch.run(async move {
            match fs.rmdir(&path).await {
                Ok(()) => {
                    inodes.lock().remove(&path);
                    reply.ok();
                }
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(from), Some(to)) = (self.child(parent, name), self.child(newparent, newname))
        else {
            reply.error(libc::ENOENT);
            return;
        };
        let fs = self.fs.clone();
        let inodes = self.inodes.clone();
        self.dispatch.run(async move {
            match fs.rename(&from, &to).await {
                Ok(()) => {
                    inodes.lock().rename(&from, &to);
                    reply.ok();
                }
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        if self.path(ino).is_none() {
            reply.error(libc::ENOENT);
            return;
        }
        reply.opened(0, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(path) = self.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        let fs = self.fs.clone();
        self.dispatch.run(async move {
            match fs.read(&path, offset, size).await {
                Ok(data) => reply.data(&data),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(path) = self.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        let fs = self.fs.clone();
        let data = data.to_vec();
        self.dispatch.run(async move {
            match fs.write(&path, offset, &data).await {
                Ok(written) => reply.written(written),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let fs = self.fs.clone();
        let inodes = self.inodes.clone();
        self.dispatch.run(async move {
            let children = match fs.readdir(&path).await {
                Ok(children) => children,
                Err(e) => {
                    reply.error(e.errno());
                    return;
                }
            };

            let listing: Vec<(u64, FuseFileType, String)> = {
                let inodes = inodes.lock();
                let parent_ino = match path.parent() {
                    Some(parent) => inodes.existing(parent).unwrap_or(UNKNOWN_INO),
                    None => ROOT_INO,
                };
                let mut listing = vec![
                    (ino, FuseFileType::Directory, ".".to_string()),
                    (parent_ino, FuseFileType::Directory, "..".to_string()),
                ];
                listing.extend(children.into_iter().map(|entry| {
                    let child_ino = inodes
                        .existing(&path.join(&entry.name))
                        .unwrap_or(UNKNOWN_INO);
                    (child_ino, to_fuse_kind(entry.kind), entry.name)
                }));
                listing
            };

            let skip = usize::try_from(offset).unwrap_or(0);
            for (i, (child_ino, kind, name)) in listing.into_iter().enumerate().skip(skip) {
                if reply.add(child_ino, (i + 1) as i64, kind, name) {
                    break;
                }
            }
            reply.ok();
        });
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let fs = self.fs.clone();
        self.dispatch.run(async move {
            match fs.statfs().await {
                Ok(s) => reply.statfs(
                    s.blocks, s.bfree, s.bavail, s.files, s.ffree, s.bsize, s.namelen, s.frsize,
                ),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(path) = self.child(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let fs = self.fs.clone();
        let inodes = self.inodes.clone();
        let (ttl, owner) = (self.ttl, self.owner);
        self.dispatch.run(async move {
            match fs.create(&path, mode & !umask).await {
                Ok(attr) => {
                    let ino = inodes.lock().remember(&path);
                    reply.created(&ttl, &to_fuse_attr(ino, &attr, owner), 0, 0, 0);
                }
                Err(e) => reply.error(e.errno()),
            }
        });
    }
}
