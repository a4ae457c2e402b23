//! Per-syscall state machine
//!
//! A [`Session`] consumes [`TraceEvent`]s from the tracer, runs the registered
//! handlers, keeps the process table in step with the traced tree and hands
//! finished events to the outbox.

use crate::config::Creds;
use crate::handlers::erpc::{fill_span_context, span_registration};
use crate::handlers::{HandlerContext, Registry};
use crate::memory::Tracee;
use crate::process_table::{Process, ProcessTable};
use crate::proto::{
    Credentials, ExitCause, ExitMsg, ForkMsg, Message, SyscallMsg, SyscallPayload,
};
use crate::syscalls::{self, syscall_name, slot_key};
use crate::tracer::{ExitStatus, SyscallRegs, TraceEvent};
use crate::transport::Outbox;
use crate::users::UserDb;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

/// Low byte of clone flags: the signal sent to the parent on child exit
const CSIGNAL: u64 = 0xff;

/// `struct clone_args` up to and including `exit_signal`
const CLONE_ARGS_LEN: usize = 40;
const CLONE_ARGS_EXIT_SIGNAL: usize = 32;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub container_id: String,
    pub creds: Creds,
    pub stats_disabled: bool,
    pub users: Arc<UserDb>,
}

pub struct Session<T: Tracee> {
    tracee: T,
    registry: Registry,
    table: ProcessTable,
    /// Originally traced pids
    roots: Vec<i32>,
    settings: SessionSettings,
    outbox: Outbox,
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

impl<T: Tracee> Session<T> {
    pub fn new(tracee: T, registry: Registry, roots: &[i32], settings: SessionSettings, outbox: Outbox) -> Self {
        let mut session = Self {
            tracee,
            registry,
            table: ProcessTable::new(),
            roots: roots.to_vec(),
            settings,
            outbox,
        };
        for &pid in roots {
            session.ensure_process(pid);
        }
        session
    }

    pub fn table(&self) -> &ProcessTable {
        &self.table
    }

    pub fn handle(&mut self, event: TraceEvent) {
        match event {
            TraceEvent::Enter { pid, regs } => self.on_enter(pid, &regs),
            TraceEvent::Exit { pid, regs } => self.on_exit(pid, &regs),
            TraceEvent::Spawned { pid, parent, regs } => self.on_spawned(pid, parent, &regs),
            TraceEvent::Terminated { pid, status } => self.on_terminated(pid, status),
        }
    }

    /// Look `pid` up, registering it on first sight. A pid whose thread
    /// group is already known joins that group.
    fn ensure_process(&mut self, pid: i32) {
        if self.table.contains(pid) {
            return;
        }
        let tgid = self.tracee.tgid(pid).unwrap_or(pid);
        if tgid != pid && self.table.set_as_thread_of(pid, tgid).is_some() {
            return;
        }
        self.table.add(pid, Process::new(pid, tgid));
    }

    fn emit(&self, tgid: i32, mut msg: SyscallMsg) {
        msg.pid = tgid as u32;
        msg.timestamp = now_ns();
        msg.container_id = self.settings.container_id.clone();
        trace!(pid = tgid, kind = msg.payload.kind(), retval = msg.retval, "event");
        self.outbox.send(&Message::Syscall(msg));
    }

    fn context<'a>(&'a self, pid: i32, process: &'a Process, regs: &'a SyscallRegs) -> HandlerContext<'a> {
        HandlerContext {
            pid,
            process,
            tracee: &self.tracee,
            regs,
            users: &self.settings.users,
            stats_disabled: self.settings.stats_disabled,
        }
    }

    /// Credentials reported for an exec by one of the roots
    fn root_credentials(&self) -> Credentials {
        let (uid, gid) = self.settings.creds.resolve();
        let mut creds = Credentials {
            uid,
            euid: uid,
            gid,
            egid: gid,
            ..Default::default()
        };
        if !self.settings.stats_disabled {
            creds.user = self.settings.users.user_name(uid);
            creds.euser = creds.user.clone();
            creds.group = self.settings.users.group_name(gid);
            creds.egroup = creds.group.clone();
        }
        creds
    }

    fn on_enter(&mut self, pid: i32, regs: &SyscallRegs) {
        let nr = regs.nr;
        let handler = self.registry.get(nr).copied();
        if handler.is_none() && !syscalls::is_always_intercepted(nr) {
            return;
        }
        self.ensure_process(pid);
        let Some(process) = self.table.get(pid) else {
            return;
        };
        let tgid = process.tgid;
        let is_root = self.roots.contains(&process.pid);

        let mut msg = Some(SyscallMsg::default());
        if let Some(entry) = handler.and_then(|h| h.entry) {
            let ctx = self.context(pid, process, regs);
            if let Some(m) = msg.as_mut() {
                if let Err(e) = entry(&ctx, m) {
                    debug!(pid, nr, syscall = syscall_name(nr), error = %e, "entry handler failed");
                    msg = None;
                }
            }
        }

        if let Some(m) = msg.as_mut() {
            if let Some(span) = self.table.get_span(tgid) {
                m.span_context = fill_span_context(&self.tracee, pid, &span);
                if let Some(ctx) = &m.span_context {
                    trace!(pid, span = %ctx, "span context");
                }
            }
        }

        match nr {
            syscalls::EXECVE | syscalls::EXECVEAT => {
                if is_root {
                    if let Some(SyscallPayload::Exec(exec)) = msg.as_mut().map(|m| &mut m.payload) {
                        exec.credentials = Some(self.root_credentials());
                    }
                }
                self.table.begin_exec(pid);
            }
            syscalls::IOCTL => match span_registration(&self.tracee, pid, regs) {
                Ok(Some(span)) => {
                    debug!(pid, tgid, max_threads = span.max_threads, "span TLS registered");
                    self.table.set_span(tgid, span);
                }
                Ok(None) => {}
                Err(e) => debug!(pid, error = %e, "unreadable ioctl request"),
            },
            _ => {}
        }

        if let (Some(msg), Some(process)) = (msg, self.table.get_mut(pid)) {
            process.stash(slot_key(nr), msg);
        }
    }

    fn on_exit(&mut self, pid: i32, regs: &SyscallRegs) {
        let nr = regs.nr;
        let stashed = self.table.get_mut(pid).and_then(|p| p.take(slot_key(nr)));

        if let (Some(mut msg), Some(handler)) = (stashed, self.registry.get(nr).copied()) {
            msg.retval = regs.ret;
            if let Some(process) = self.table.get(pid) {
                let tgid = process.tgid;
                let mut finished = true;
                if let Some(exit) = handler.exit {
                    let ctx = self.context(pid, process, regs);
                    if let Err(e) = exit(&ctx, &mut msg) {
                        debug!(pid, nr, syscall = syscall_name(nr), error = %e, "exit handler failed");
                        finished = false;
                    }
                }
                let send = handler.should_send.is_some_and(|should_send| should_send(&msg));
                if finished && send && msg.payload.is_known() {
                    self.emit(tgid, msg);
                }
            }
        }

        if nr == syscalls::EXECVE || nr == syscalls::EXECVEAT {
            if let Some(key) = self.table.complete_exec(pid, regs.ret) {
                if let Some(tgid) = self.table.get(key).map(|p| p.tgid) {
                    self.table.unset_span(tgid);
                }
            }
        }
    }

    /// Whether the clone-family call in `regs` created a thread
    fn creates_thread(&self, parent: i32, regs: &SyscallRegs) -> bool {
        match regs.nr {
            syscalls::CLONE => regs.arg(0) & CSIGNAL != libc::SIGCHLD as u64,
            syscalls::CLONE3 => match self.tracee.read_exact(parent, regs.arg(0), CLONE_ARGS_LEN) {
                Ok(args) => {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&args[CLONE_ARGS_EXIT_SIGNAL..CLONE_ARGS_LEN]);
                    u64::from_ne_bytes(raw) != libc::SIGCHLD as u64
                }
                Err(e) => {
                    debug!(pid = parent, error = %e, "unreadable clone_args, assuming a process");
                    false
                }
            },
            _ => false,
        }
    }

    fn on_spawned(&mut self, pid: i32, parent: i32, regs: &SyscallRegs) {
        self.ensure_process(parent);

        if self.creates_thread(parent, regs) {
            if let Some(tgid) = self.table.set_as_thread_of(pid, parent) {
                debug!(pid, tgid, "new thread");
            }
            return;
        }

        match self.table.fork_from(pid, parent) {
            Some(ppid) => {
                debug!(pid, ppid, "new process");
                let msg = SyscallMsg {
                    payload: SyscallPayload::Fork(ForkMsg { ppid: ppid as u32 }),
                    ..Default::default()
                };
                self.emit(pid, msg);
            }
            None => debug!(pid, parent, "child of an unknown parent"),
        }
    }

    fn on_terminated(&mut self, pid: i32, status: ExitStatus) {
        let is_process = self
            .table
            .get(pid)
            .is_some_and(|p| p.pid == pid && p.is_leader());

        if is_process {
            let (cause, code) = match status {
                ExitStatus::Exited(code) => (ExitCause::Exited, code as u32),
                ExitStatus::Signaled {
                    signal,
                    core_dumped: true,
                } => (ExitCause::CoreDumped, signal as u32),
                ExitStatus::Signaled { signal, .. } => (ExitCause::Signaled, signal as u32),
            };
            let msg = SyscallMsg {
                payload: SyscallPayload::Exit(ExitMsg { cause, code }),
                ..Default::default()
            };
            self.emit(pid, msg);
        }

        self.table.remove(pid);
    }
}
