//! Periodic procfs snapshots
//!
//! Processes that started before tracing (or that the tracer cannot see
//! exec'ing) are reported once as synthesized exec events built from procfs.

use crate::handlers::file_stats;
use crate::procfs::ProcFs;
use crate::proto::{Credentials, ExecMsg, FileInfo, Message, SyscallMsg, SyscallPayload};
use crate::shutdown::{self, Cancellation};
use crate::transport::Outbox;
use crate::users::UserDb;
use fnv::{FnvHashMap, FnvHashSet};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Delay before the first scan, so traced events go out first
pub const INITIAL_SCAN_DELAY: Duration = Duration::from_secs(2);

/// Settings shared by every snapshot
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub procfs: ProcFs,
    pub users: Arc<UserDb>,
    pub stats_disabled: bool,
    pub container_id: String,
}

impl Snapshot {
    fn credentials(&self, uids: [u32; 4], gids: [u32; 4]) -> Credentials {
        let mut creds = Credentials {
            uid: uids[0],
            euid: uids[1],
            gid: gids[0],
            egid: gids[1],
            ..Default::default()
        };
        if !self.stats_disabled {
            creds.user = self.users.user_name(creds.uid);
            creds.euser = self.users.user_name(creds.euid);
            creds.group = self.users.group_name(creds.gid);
            creds.egroup = self.users.group_name(creds.egid);
        }
        creds
    }

    /// Exec event describing `pid` as procfs sees it now
    pub fn describe(&self, pid: i32) -> io::Result<Message> {
        let exe = self.procfs.exe(pid)?.to_string_lossy().into_owned();
        let args = self.procfs.cmdline(pid)?;
        let stat = self.procfs.stat(pid)?;
        let status = self.procfs.status(pid)?;
        let timestamp = self.procfs.start_time_ns(pid)?;

        let mut file = FileInfo::new(exe);
        if !self.stats_disabled {
            file.stats = file_stats(&file.path, &self.users);
        }

        Ok(Message::Syscall(SyscallMsg {
            pid: status.tgid as u32,
            timestamp,
            container_id: self.container_id.clone(),
            span_context: None,
            retval: 0,
            payload: SyscallPayload::Exec(ExecMsg {
                file,
                args,
                args_truncated: false,
                envs: Vec::new(),
                envs_truncated: false,
                credentials: Some(self.credentials(status.uids, status.gids)),
                ppid: Some(stat.ppid as u32),
                from_procfs: true,
            }),
        }))
    }
}

pub struct ProcScanner {
    snapshot: Snapshot,
    outbox: Outbox,
    every: Duration,
    initial_delay: Duration,
    own_pid: i32,
    /// Pids already reported, with the start time of the process reported
    seen: FnvHashMap<i32, u64>,
}

impl ProcScanner {
    pub fn new(snapshot: Snapshot, outbox: Outbox, every: Duration) -> Self {
        Self {
            snapshot,
            outbox,
            every,
            initial_delay: INITIAL_SCAN_DELAY,
            own_pid: std::process::id() as i32,
            seen: FnvHashMap::default(),
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// One pass over the proc root. Returns how many processes were reported.
    pub fn scan(&mut self) -> io::Result<usize> {
        let pids = self.snapshot.procfs.pids()?;

        let live: FnvHashSet<i32> = pids.iter().copied().collect();
        self.seen.retain(|pid, _| live.contains(pid));

        let mut reported = 0;
        for pid in pids {
            if pid == self.own_pid {
                continue;
            }
            // a reused pid shows up with a different start time
            let start_ticks = match self.snapshot.procfs.stat(pid) {
                Ok(stat) => stat.start_ticks,
                Err(e) => {
                    debug!(pid, error = %e, "skipping process");
                    continue;
                }
            };
            if self.seen.get(&pid) == Some(&start_ticks) {
                continue;
            }
            match self.snapshot.describe(pid) {
                Ok(msg) => {
                    self.outbox.send(&msg);
                    self.seen.insert(pid, start_ticks);
                    reported += 1;
                }
                // raced with an exit, or a kernel thread without exe
                Err(e) => debug!(pid, error = %e, "skipping process"),
            }
        }
        Ok(reported)
    }

    pub fn run(mut self, cancel: Cancellation) {
        if let Err(e) = shutdown::block_signals() {
            warn!(error = %e, "failed to block signals in proc scanner");
        }
        if cancel.sleep(self.initial_delay) {
            return;
        }
        loop {
            if let Err(e) = self.scan() {
                warn!(error = %e, "proc scan failed");
            }
            if cancel.sleep(self.every) {
                return;
            }
        }
    }

    pub fn spawn(self, cancel: Cancellation) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("ptsentry-procscan".to_string())
            .spawn(move || self.run(cancel))
    }
}
