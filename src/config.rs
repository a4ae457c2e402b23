//! Tracer configuration

use crate::procfs::ProcFs;
use crate::transport::{
    TransportConfig, DEFAULT_CONNECT_ATTEMPTS, DEFAULT_QUEUE_CAPACITY, DEFAULT_RETRY_DELAY,
};
pub use crate::users::UserDbPaths;
use nix::unistd::{getgid, getuid};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Default proc scan period
pub const DEFAULT_SCAN_PROC_EVERY: Duration = Duration::from_millis(500);

/// Credentials the wrapped command runs with, and that are reported for the
/// traced roots. Unset ids fall back to the tracer's own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Creds {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl Creds {
    /// `(uid, gid)` with the tracer's real ids filling the gaps
    pub fn resolve(&self) -> (u32, u32) {
        (
            self.uid.unwrap_or_else(|| getuid().as_raw()),
            self.gid.unwrap_or_else(|| getgid().as_raw()),
        )
    }
}

/// Installs a seccomp filter trapping the given syscalls to the tracer.
///
/// Called in the child between `PTRACE_TRACEME` and `execve`.
pub type SeccompInstaller = Arc<dyn Fn(&[&'static str]) -> io::Result<()> + Send + Sync>;

/// Called once tracing is set up
pub type AttachedCallback = Box<dyn FnOnce() + Send>;

pub struct TracerOptions {
    pub creds: Creds,
    /// Debug-dump every outgoing message
    pub verbose: bool,
    /// Dial the collector in the background instead of before tracing
    pub async_connect: bool,
    /// Skip file stats and id-to-name resolution
    pub stats_disabled: bool,
    pub proc_scan_disabled: bool,
    pub scan_proc_every: Duration,
    pub seccomp_disabled: bool,
    pub seccomp_installer: Option<SeccompInstaller>,
    pub attached_cb: Option<AttachedCallback>,
    pub user_db: UserDbPaths,
    pub procfs: ProcFs,
    pub connect_attempts: u32,
    pub retry_delay: Duration,
    pub queue_capacity: usize,
}

impl Default for TracerOptions {
    fn default() -> Self {
        Self {
            creds: Creds::default(),
            verbose: false,
            async_connect: false,
            stats_disabled: false,
            proc_scan_disabled: false,
            scan_proc_every: DEFAULT_SCAN_PROC_EVERY,
            seccomp_disabled: false,
            seccomp_installer: None,
            attached_cb: None,
            user_db: UserDbPaths::from_env(),
            procfs: ProcFs::default(),
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl fmt::Debug for TracerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracerOptions")
            .field("creds", &self.creds)
            .field("verbose", &self.verbose)
            .field("async_connect", &self.async_connect)
            .field("stats_disabled", &self.stats_disabled)
            .field("proc_scan_disabled", &self.proc_scan_disabled)
            .field("scan_proc_every", &self.scan_proc_every)
            .field("seccomp_disabled", &self.seccomp_disabled)
            .field("seccomp_installer", &self.seccomp_installer.is_some())
            .field("attached_cb", &self.attached_cb.is_some())
            .field("user_db", &self.user_db)
            .field("procfs", &self.procfs)
            .field("connect_attempts", &self.connect_attempts)
            .field("retry_delay", &self.retry_delay)
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

impl TracerOptions {
    pub fn with_creds(mut self, creds: Creds) -> Self {
        self.creds = creds;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_async_connect(mut self, async_connect: bool) -> Self {
        self.async_connect = async_connect;
        self
    }

    pub fn with_stats_disabled(mut self, disabled: bool) -> Self {
        self.stats_disabled = disabled;
        self
    }

    pub fn with_proc_scan(mut self, disabled: bool, every: Duration) -> Self {
        self.proc_scan_disabled = disabled;
        self.scan_proc_every = every;
        self
    }

    pub fn with_seccomp_disabled(mut self, disabled: bool) -> Self {
        self.seccomp_disabled = disabled;
        self
    }

    pub fn with_seccomp_installer(mut self, installer: SeccompInstaller) -> Self {
        self.seccomp_installer = Some(installer);
        self
    }

    pub fn with_attached_cb(mut self, cb: impl FnOnce() + Send + 'static) -> Self {
        self.attached_cb = Some(Box::new(cb));
        self
    }

    pub fn with_user_db(mut self, user_db: UserDbPaths) -> Self {
        self.user_db = user_db;
        self
    }

    pub fn with_procfs(mut self, procfs: ProcFs) -> Self {
        self.procfs = procfs;
        self
    }

    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.connect_attempts = attempts;
        self.retry_delay = delay;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Seccomp is used only when enabled and an installer is provided
    pub fn seccomp(&self) -> Option<&SeccompInstaller> {
        if self.seccomp_disabled {
            return None;
        }
        self.seccomp_installer.as_ref()
    }

    pub fn transport_config(&self, addr: &str) -> TransportConfig {
        TransportConfig {
            addr: addr.to_string(),
            queue_capacity: self.queue_capacity,
            connect_attempts: self.connect_attempts,
            retry_delay: self.retry_delay,
            async_connect: self.async_connect,
            verbose: self.verbose,
        }
    }
}
