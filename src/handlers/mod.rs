//! Syscall handler registry
//!
//! Maps a syscall number to the functions that build and finish its event:
//!
//! - `entry` runs at syscall-enter and fills the payload from the arguments
//! - `exit` runs at syscall-exit, after `retval` is set, and enriches it
//! - `should_send` decides whether the finished event goes out; a handler
//!   without one is bookkeeping only
//!
//! Families live in submodules and register themselves into one table.
//! `ioctl` has no table entry; the trace loop inspects it through
//! [`erpc::span_registration`].

pub mod erpc;
pub mod fim;
pub mod net;
pub mod process;

use crate::memory::{MemoryError, Tracee};
use crate::process_table::Process;
use crate::proto::{FileInfo, FileStats, SyscallMsg};
use crate::syscalls;
use crate::tracer::SyscallRegs;
use crate::users::UserDb;
use fnv::FnvHashMap;
use std::os::unix::fs::MetadataExt;
use thiserror::Error;

/// `dirfd` meaning "relative to the cwd"
pub const AT_FDCWD: i32 = -100;

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("unsupported socket family {0}")]
    UnsupportedFamily(u16),

    #[error("malformed {0}")]
    Malformed(&'static str),
}

pub type EntryFn = fn(&HandlerContext<'_>, &mut SyscallMsg) -> Result<(), HandlerError>;
pub type ExitFn = fn(&HandlerContext<'_>, &mut SyscallMsg) -> Result<(), HandlerError>;
pub type ShouldSendFn = fn(&SyscallMsg) -> bool;

#[derive(Clone, Copy, Default)]
pub struct Handler {
    pub entry: Option<EntryFn>,
    pub exit: Option<ExitFn>,
    pub should_send: Option<ShouldSendFn>,
}

impl Handler {
    pub fn new(entry: EntryFn) -> Self {
        Self {
            entry: Some(entry),
            exit: None,
            should_send: Some(is_accepted_retval),
        }
    }

    /// Exit-only handler that never sends
    pub fn bookkeeping(exit: ExitFn) -> Self {
        Self {
            entry: None,
            exit: Some(exit),
            should_send: None,
        }
    }

    pub fn on_exit(mut self, exit: ExitFn) -> Self {
        self.exit = Some(exit);
        self
    }

    pub fn send_when(mut self, should_send: ShouldSendFn) -> Self {
        self.should_send = Some(should_send);
        self
    }
}

#[derive(Default)]
pub struct Registry {
    handlers: FnvHashMap<i64, Handler>,
}

impl Registry {
    pub fn insert(&mut self, nr: i64, handler: Handler) {
        self.handlers.insert(nr, handler);
    }

    pub fn get(&self, nr: i64) -> Option<&Handler> {
        self.handlers.get(&nr)
    }

    /// Names of every syscall that must stop the tracee
    pub fn syscall_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self
            .handlers
            .keys()
            .chain(syscalls::ALWAYS_INTERCEPTED.iter())
            .map(|&nr| syscalls::syscall_name(nr))
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

/// Build the full registry, plus the syscall names a seccomp filter must trap
pub fn register() -> (Registry, Vec<&'static str>) {
    let mut registry = Registry::default();
    fim::register(&mut registry);
    process::register(&mut registry);
    net::register(&mut registry);
    let names = registry.syscall_names();
    (registry, names)
}

/// Default send policy: success, or a permission denial
pub fn is_accepted_retval(msg: &SyscallMsg) -> bool {
    msg.retval >= 0 || msg.retval == -(libc::EACCES as i64) || msg.retval == -(libc::EPERM as i64)
}

pub fn should_send_always(_msg: &SyscallMsg) -> bool {
    true
}

/// Everything a handler may look at for one syscall stop
pub struct HandlerContext<'a> {
    pub pid: i32,
    pub process: &'a Process,
    pub tracee: &'a dyn Tracee,
    pub regs: &'a SyscallRegs,
    pub users: &'a UserDb,
    pub stats_disabled: bool,
}

impl<'a> HandlerContext<'a> {
    pub fn arg(&self, index: usize) -> u64 {
        self.regs.arg(index)
    }

    /// Argument as a C `int` (fds, dirfds, ids)
    pub fn arg_i32(&self, index: usize) -> i32 {
        self.regs.arg(index) as i32
    }

    pub fn read_string(&self, addr: u64) -> Result<String, HandlerError> {
        Ok(self.tracee.read_string(self.pid, addr)?)
    }

    pub fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>, HandlerError> {
        Ok(self.tracee.read_exact(self.pid, addr, len)?)
    }

    /// Working directory, fetched from the tracee the first time
    pub fn cwd(&self) -> Result<String, HandlerError> {
        let cached = self.process.resources.borrow().cwd.clone();
        if !cached.is_empty() {
            return Ok(cached);
        }
        let cwd = self.tracee.cwd(self.pid)?;
        self.process.resources.borrow_mut().cwd = cwd.clone();
        Ok(cwd)
    }

    /// Path behind `fd`, from the fd table or the tracee
    pub fn fd_path(&self, fd: i32) -> Result<String, HandlerError> {
        if let Some(path) = self.process.resources.borrow().fd.get(&fd) {
            return Ok(path.clone());
        }
        Ok(self.tracee.fd_path(self.pid, fd)?)
    }

    /// Resolve `path` against `dirfd` the way the kernel does for `*at` calls
    pub fn resolve(&self, dirfd: i32, path: &str) -> Result<String, HandlerError> {
        if path.starts_with('/') {
            return Ok(path.to_string());
        }
        let base = if dirfd == AT_FDCWD {
            self.cwd()?
        } else {
            self.fd_path(dirfd)?
        };
        Ok(join(&base, path))
    }

    /// Read the path at argument `path_index`, resolved against `dirfd`
    pub fn path_arg(&self, dirfd: i32, path_index: usize) -> Result<FileInfo, HandlerError> {
        let path = self.read_string(self.arg(path_index))?;
        Ok(FileInfo::new(self.resolve(dirfd, &path)?))
    }

    /// Stamp file metadata, unless stats collection is disabled
    pub fn fill_stats(&self, file: &mut FileInfo) {
        if self.stats_disabled {
            return;
        }
        file.stats = file_stats(&file.path, self.users);
    }

    pub fn user_name(&self, uid: u32) -> Option<String> {
        if self.stats_disabled {
            return None;
        }
        self.users.user_name(uid)
    }

    pub fn group_name(&self, gid: u32) -> Option<String> {
        if self.stats_disabled {
            return None;
        }
        self.users.group_name(gid)
    }
}

/// Join a relative path onto a base directory
pub fn join(base: &str, path: &str) -> String {
    if path.is_empty() {
        return base.to_string();
    }
    if base.ends_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

/// Metadata of `path` as seen by the tracer; `None` when it cannot be read
pub fn file_stats(path: &str, users: &UserDb) -> Option<FileStats> {
    let meta = std::fs::metadata(path).ok()?;
    Some(FileStats {
        mode: meta.mode(),
        inode: meta.ino(),
        uid: meta.uid(),
        gid: meta.gid(),
        user: users.user_name(meta.uid()),
        group: users.group_name(meta.gid()),
        mtime: to_ns(meta.mtime(), meta.mtime_nsec()),
        ctime: to_ns(meta.ctime(), meta.ctime_nsec()),
    })
}

fn to_ns(secs: i64, nsecs: i64) -> u64 {
    (secs.max(0) as u64) * 1_000_000_000 + nsecs.max(0) as u64
}
