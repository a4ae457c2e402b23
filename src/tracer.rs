//! System call tracing using ptrace
//!
//! [`Tracer`] owns the ptrace side of a session: it starts or attaches the
//! roots, follows every fork/vfork/clone automatically, and turns wait
//! statuses into [`TraceEvent`]s through a pull loop ([`Tracer::next_event`]).
//!
//! Two stepping modes are supported. Without seccomp every tracee is resumed
//! with `PTRACE_SYSCALL` and each syscall stops twice. With a seccomp filter
//! installed in the wrapped child, tracees run with `PTRACE_CONT` and only
//! filtered syscalls stop, as a `PTRACE_EVENT_SECCOMP` entry followed by a
//! `PTRACE_SYSCALL` step to their exit.
//!
//! Registers are read as x86_64.

use crate::config::Creds;
use crate::shutdown::{self, Cancellation};
use anyhow::{bail, Context, Result};
use fnv::{FnvHashMap, FnvHashSet};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{raise, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, setgid, setuid, ForkResult, Gid, Pid, Uid};
use std::io;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;
use tracing::{debug, info, warn};

/// Exit code of a wrapped child that could not be set up or exec'd
const SPAWN_FAILURE_CODE: i32 = 127;

/// Syscall number, arguments and return value at a syscall stop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyscallRegs {
    pub nr: i64,
    pub args: [u64; 6],
    pub ret: i64,
}

impl SyscallRegs {
    pub fn from_user_regs(regs: &libc::user_regs_struct) -> Self {
        // On x86_64: syscall number in orig_rax, arguments in rdi, rsi, rdx,
        // r10, r8, r9, return value in rax
        Self {
            nr: regs.orig_rax as i64,
            args: [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9],
            ret: regs.rax as i64,
        }
    }

    pub fn arg(&self, index: usize) -> u64 {
        self.args.get(index).copied().unwrap_or(0)
    }
}

/// How a tracee ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled { signal: i32, core_dumped: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    Enter {
        pid: i32,
        regs: SyscallRegs,
    },
    Exit {
        pid: i32,
        regs: SyscallRegs,
    },
    /// A new child of the clone family, with the parent's registers at the
    /// creating syscall
    Spawned {
        pid: i32,
        parent: i32,
        regs: SyscallRegs,
    },
    Terminated {
        pid: i32,
        status: ExitStatus,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resume {
    Syscall,
    Cont,
}

pub struct Tracer {
    /// Originally traced pids
    pids: Vec<i32>,
    seccomp: bool,
    /// Known tracees and whether each is inside a syscall
    in_syscall: FnvHashMap<i32, bool>,
    /// Children announced by a fork event whose initial stop is still due
    expected: FnvHashSet<i32>,
    /// Children that stopped before their parent's fork event was seen
    parked: FnvHashSet<i32>,
    /// Tracees to resume before the next wait
    pending: Vec<(i32, Resume, Option<Signal>)>,
    cancel: Cancellation,
}

/// Options for a traced root. Attached processes are not killed when the
/// tracer exits; the kernel detaches them instead.
fn options(seccomp: bool, exit_kill: bool) -> ptrace::Options {
    let mut options = ptrace::Options::PTRACE_O_TRACESYSGOOD
        | ptrace::Options::PTRACE_O_TRACEFORK
        | ptrace::Options::PTRACE_O_TRACEVFORK
        | ptrace::Options::PTRACE_O_TRACECLONE
        | ptrace::Options::PTRACE_O_TRACEEXEC;
    if seccomp {
        options |= ptrace::Options::PTRACE_O_TRACESECCOMP;
    }
    if exit_kill {
        options |= ptrace::Options::PTRACE_O_EXITKILL;
    }
    options
}

/// Translate a terminal wait status
pub fn exit_status(status: &WaitStatus) -> Option<(i32, ExitStatus)> {
    match *status {
        WaitStatus::Exited(pid, code) => Some((pid.as_raw(), ExitStatus::Exited(code))),
        WaitStatus::Signaled(pid, signal, core_dumped) => Some((
            pid.as_raw(),
            ExitStatus::Signaled {
                signal: signal as i32,
                core_dumped,
            },
        )),
        _ => None,
    }
}

fn child_main(entry: &Path, argv: &[String], envp: &[String], creds: &Creds, seccomp: Option<&dyn Fn() -> io::Result<()>>) -> ! {
    if let Some(gid) = creds.gid {
        if let Err(e) = setgid(Gid::from_raw(gid)) {
            eprintln!("Failed to set gid {}: {}", gid, e);
            std::process::exit(SPAWN_FAILURE_CODE);
        }
    }
    if let Some(uid) = creds.uid {
        if let Err(e) = setuid(Uid::from_raw(uid)) {
            eprintln!("Failed to set uid {}: {}", uid, e);
            std::process::exit(SPAWN_FAILURE_CODE);
        }
    }

    if let Err(e) = ptrace::traceme() {
        eprintln!("Failed to PTRACE_TRACEME: {}", e);
        std::process::exit(SPAWN_FAILURE_CODE);
    }
    // Let the parent set options before anything worth tracing happens
    if let Err(e) = raise(Signal::SIGSTOP) {
        eprintln!("Failed to stop for tracer: {}", e);
        std::process::exit(SPAWN_FAILURE_CODE);
    }

    if let Some(install) = seccomp {
        if let Err(e) = install() {
            eprintln!("Failed to install seccomp filter: {}", e);
            std::process::exit(SPAWN_FAILURE_CODE);
        }
    }

    let mut command = Command::new(entry);
    if let Some((arg0, args)) = argv.split_first() {
        command.arg0(arg0).args(args);
    }
    command
        .env_clear()
        .envs(envp.iter().filter_map(|kv| kv.split_once('=')));

    let err = command.exec();
    eprintln!("Failed to exec {}: {}", entry.display(), err);
    std::process::exit(SPAWN_FAILURE_CODE);
}

impl Tracer {
    fn new(pids: Vec<i32>, seccomp: bool, cancel: Cancellation) -> Self {
        let initial = if seccomp { Resume::Cont } else { Resume::Syscall };
        Self {
            in_syscall: pids.iter().map(|&pid| (pid, false)).collect(),
            pending: pids.iter().map(|&pid| (pid, initial, None)).collect(),
            pids,
            seccomp,
            expected: FnvHashSet::default(),
            parked: FnvHashSet::default(),
            cancel,
        }
    }

    /// Fork and trace `entry`.
    ///
    /// The child stops itself before installing the optional seccomp filter
    /// and exec'ing, so the entrypoint's own `execve` is observed.
    pub fn spawn(
        entry: &Path,
        argv: &[String],
        envp: &[String],
        creds: &Creds,
        seccomp: Option<&dyn Fn() -> io::Result<()>>,
        cancel: Cancellation,
    ) -> Result<Self> {
        let seccomp_mode = seccomp.is_some();
        // SAFETY: the child only sets up tracing and execs
        match unsafe { fork() }.context("Failed to fork")? {
            ForkResult::Child => child_main(entry, argv, envp, creds, seccomp),
            ForkResult::Parent { child } => {
                match waitpid(child, Some(WaitPidFlag::__WALL)).context("Failed to wait for child")? {
                    WaitStatus::Stopped(_, Signal::SIGSTOP) => {}
                    other => bail!("Child {} did not stop for tracing: {:?}", child, other),
                }
                ptrace::setoptions(child, options(seccomp_mode, true)).context("Failed to set ptrace options")?;

                info!(pid = child.as_raw(), seccomp = seccomp_mode, "tracing {}", entry.display());
                Ok(Self::new(vec![child.as_raw()], seccomp_mode, cancel))
            }
        }
    }

    /// Attach to running processes by PID
    pub fn attach(pids: &[i32], cancel: Cancellation) -> Result<Self> {
        if pids.is_empty() {
            bail!("No PID to attach to");
        }

        for &raw in pids {
            let pid = Pid::from_raw(raw);
            ptrace::attach(pid).with_context(|| format!("Failed to attach to PID {}", pid))?;
            loop {
                match waitpid(pid, Some(WaitPidFlag::__WALL)).context("Failed to wait for attach signal")? {
                    WaitStatus::Stopped(_, Signal::SIGSTOP) => break,
                    WaitStatus::Stopped(_, signal) => {
                        // not ours; deliver it and keep waiting for the attach stop
                        ptrace::cont(pid, signal).context("Failed to resume during attach")?;
                    }
                    WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                        bail!("PID {} exited while attaching", pid)
                    }
                    _ => {}
                }
            }
            ptrace::setoptions(pid, options(false, false)).context("Failed to set ptrace options")?;
            info!(pid = raw, "attached");
        }

        Ok(Self::new(pids.to_vec(), false, cancel))
    }

    pub fn pids(&self) -> &[i32] {
        &self.pids
    }

    fn next_mode(&self, pid: i32) -> Resume {
        if !self.seccomp || self.in_syscall.get(&pid).copied().unwrap_or(false) {
            Resume::Syscall
        } else {
            Resume::Cont
        }
    }

    fn schedule(&mut self, pid: i32, signal: Option<Signal>) {
        let mode = self.next_mode(pid);
        self.pending.push((pid, mode, signal));
    }

    fn resume_pending(&mut self) -> Result<()> {
        for (raw, mode, signal) in std::mem::take(&mut self.pending) {
            let pid = Pid::from_raw(raw);
            let res = match mode {
                Resume::Syscall => ptrace::syscall(pid, signal),
                Resume::Cont => ptrace::cont(pid, signal),
            };
            match res {
                Ok(()) => {}
                // Killed while stopped; its exit status is still to come
                Err(Errno::ESRCH) => debug!(pid = raw, "tracee vanished before resume"),
                Err(e) => return Err(e).with_context(|| format!("Failed to resume {}", pid)),
            }
        }
        Ok(())
    }

    fn poll_signal(&self) {
        if let Some(signal) = shutdown::take_signal() {
            info!(%signal, "shutdown requested");
            self.cancel.cancel();
        }
    }

    fn regs(&self, pid: Pid) -> Result<Option<SyscallRegs>> {
        match ptrace::getregs(pid) {
            Ok(regs) => Ok(Some(SyscallRegs::from_user_regs(&regs))),
            Err(Errno::ESRCH) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to get registers of {}", pid)),
        }
    }

    /// Resume the previously reported tracees and wait for the next event.
    ///
    /// Returns `Ok(None)` once every tracee is gone or the session is cancelled.
    pub fn next_event(&mut self) -> Result<Option<TraceEvent>> {
        loop {
            self.poll_signal();
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            self.resume_pending()?;

            let status = match waitpid(None::<Pid>, Some(WaitPidFlag::__WALL)) {
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return Ok(None),
                Err(e) => return Err(e).context("Failed to waitpid"),
            };

            if let Some(event) = self.translate(status)? {
                return Ok(Some(event));
            }
        }
    }

    fn translate(&mut self, status: WaitStatus) -> Result<Option<TraceEvent>> {
        if let Some((pid, exit)) = exit_status(&status) {
            self.in_syscall.remove(&pid);
            self.expected.remove(&pid);
            self.parked.remove(&pid);
            return Ok(Some(TraceEvent::Terminated { pid, status: exit }));
        }

        match status {
            WaitStatus::PtraceSyscall(pid) => self.on_syscall_stop(pid),
            WaitStatus::PtraceEvent(pid, _, event) => self.on_ptrace_event(pid, event),
            WaitStatus::Stopped(pid, signal) => {
                let raw = pid.as_raw();
                if self.expected.remove(&raw) {
                    // initial stop of an announced child
                    self.schedule(raw, None);
                } else if !self.in_syscall.contains_key(&raw) {
                    debug!(pid = raw, "child stopped before its fork event, parking");
                    self.parked.insert(raw);
                } else {
                    self.schedule(raw, Some(signal));
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn on_syscall_stop(&mut self, pid: Pid) -> Result<Option<TraceEvent>> {
        let raw = pid.as_raw();
        let Some(regs) = self.regs(pid)? else {
            return Ok(None);
        };

        // With seccomp, entries arrive as seccomp events; a syscall stop is
        // always the exit of one of them.
        let entering = !self.seccomp && !self.in_syscall.get(&raw).copied().unwrap_or(false);
        self.in_syscall.insert(raw, entering);
        self.schedule(raw, None);

        Ok(Some(if entering {
            TraceEvent::Enter { pid: raw, regs }
        } else {
            TraceEvent::Exit { pid: raw, regs }
        }))
    }

    /// After an exec by `former`, the thread group continues as `pid`
    fn move_exec_state(&mut self, pid: i32, former: i32) {
        if former == pid {
            return;
        }
        // a non-leader exec'd and took over the leader's pid
        debug!(pid, former, "exec by non-leader thread");
        if let Some(state) = self.in_syscall.remove(&former) {
            self.in_syscall.insert(pid, state);
        }
    }

    fn on_ptrace_event(&mut self, pid: Pid, event: i32) -> Result<Option<TraceEvent>> {
        let raw = pid.as_raw();

        if event == ptrace::Event::PTRACE_EVENT_FORK as i32
            || event == ptrace::Event::PTRACE_EVENT_VFORK as i32
            || event == ptrace::Event::PTRACE_EVENT_CLONE as i32
        {
            let child = match ptrace::getevent(pid) {
                Ok(child) => child as i32,
                Err(Errno::ESRCH) => return Ok(None),
                Err(e) => return Err(e).with_context(|| format!("Failed to get event of {}", pid)),
            };
            let regs = self.regs(pid)?;
            self.schedule(raw, None);

            self.in_syscall.insert(child, false);
            if self.parked.remove(&child) {
                self.schedule(child, None);
            } else {
                self.expected.insert(child);
            }

            return Ok(regs.map(|regs| TraceEvent::Spawned {
                pid: child,
                parent: raw,
                regs,
            }));
        }

        if event == ptrace::Event::PTRACE_EVENT_EXEC as i32 {
            let former = match ptrace::getevent(pid) {
                Ok(former) => former as i32,
                Err(Errno::ESRCH) => return Ok(None),
                Err(e) => return Err(e).with_context(|| format!("Failed to get event of {}", pid)),
            };
            self.move_exec_state(raw, former);
            self.schedule(raw, None);
            return Ok(None);
        }

        if event == ptrace::Event::PTRACE_EVENT_SECCOMP as i32 {
            let Some(regs) = self.regs(pid)? else {
                return Ok(None);
            };
            self.in_syscall.insert(raw, true);
            self.schedule(raw, None);
            return Ok(Some(TraceEvent::Enter { pid: raw, regs }));
        }

        warn!(pid = raw, event, "unexpected ptrace event");
        self.schedule(raw, None);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_mapping() {
        // SAFETY: plain-old-data register set
        let mut regs: libc::user_regs_struct = unsafe { std::mem::zeroed() };
        regs.orig_rax = 257;
        regs.rdi = 1;
        regs.rsi = 2;
        regs.rdx = 3;
        regs.r10 = 4;
        regs.r8 = 5;
        regs.r9 = 6;
        regs.rax = (-13i64) as u64;

        let mapped = SyscallRegs::from_user_regs(&regs);
        assert_eq!(mapped.nr, 257);
        assert_eq!(mapped.args, [1, 2, 3, 4, 5, 6]);
        assert_eq!(mapped.ret, -13);
        assert_eq!(mapped.arg(3), 4);
        assert_eq!(mapped.arg(9), 0);
    }

    #[test]
    fn test_exit_status_translation() {
        let pid = Pid::from_raw(42);
        assert_eq!(
            exit_status(&WaitStatus::Exited(pid, 3)),
            Some((42, ExitStatus::Exited(3)))
        );
        assert_eq!(
            exit_status(&WaitStatus::Signaled(pid, Signal::SIGSEGV, true)),
            Some((
                42,
                ExitStatus::Signaled {
                    signal: libc::SIGSEGV,
                    core_dumped: true
                }
            ))
        );
        assert_eq!(exit_status(&WaitStatus::PtraceSyscall(pid)), None);
    }

    #[test]
    fn test_options_by_mode() {
        assert!(!options(false, true).contains(ptrace::Options::PTRACE_O_TRACESECCOMP));
        assert!(options(true, true).contains(ptrace::Options::PTRACE_O_TRACESECCOMP));
        assert!(options(false, true).contains(ptrace::Options::PTRACE_O_TRACECLONE));
        assert!(options(false, true).contains(ptrace::Options::PTRACE_O_EXITKILL));
        assert!(!options(false, false).contains(ptrace::Options::PTRACE_O_EXITKILL));
    }

    #[test]
    fn test_initial_resume_mode() {
        let tracer = Tracer::new(vec![7], true, Cancellation::new());
        assert_eq!(tracer.pending, vec![(7, Resume::Cont, None)]);
        let tracer = Tracer::new(vec![7], false, Cancellation::new());
        assert_eq!(tracer.pending, vec![(7, Resume::Syscall, None)]);
    }

    #[test]
    fn test_child_parked_until_fork_event() {
        let mut tracer = Tracer::new(vec![1], false, Cancellation::new());
        tracer.pending.clear();

        // child stops before the parent's fork event
        let event = tracer
            .translate(WaitStatus::Stopped(Pid::from_raw(2), Signal::SIGSTOP))
            .unwrap();
        assert_eq!(event, None);
        assert!(tracer.parked.contains(&2));
        assert!(tracer.pending.is_empty());
    }

    #[test]
    fn test_announced_child_initial_stop_is_swallowed() {
        let mut tracer = Tracer::new(vec![1], false, Cancellation::new());
        tracer.pending.clear();
        tracer.in_syscall.insert(2, false);
        tracer.expected.insert(2);

        tracer
            .translate(WaitStatus::Stopped(Pid::from_raw(2), Signal::SIGSTOP))
            .unwrap();
        assert_eq!(tracer.pending, vec![(2, Resume::Syscall, None)]);

        // later stops are signal deliveries and get re-injected
        tracer.pending.clear();
        tracer
            .translate(WaitStatus::Stopped(Pid::from_raw(2), Signal::SIGUSR1))
            .unwrap();
        assert_eq!(tracer.pending, vec![(2, Resume::Syscall, Some(Signal::SIGUSR1))]);
    }

    #[test]
    fn test_exec_by_thread_moves_syscall_state_to_leader() {
        let mut tracer = Tracer::new(vec![10], false, Cancellation::new());
        tracer.pending.clear();
        // thread 11 of group 10 entered execve; the leader is gone
        tracer.in_syscall.insert(11, true);
        tracer.in_syscall.remove(&10);

        tracer.move_exec_state(10, 11);
        assert_eq!(tracer.in_syscall.get(&10), Some(&true));
        assert!(!tracer.in_syscall.contains_key(&11));

        // the exit stop now arrives under the leader's pid
        tracer.move_exec_state(10, 10);
        assert_eq!(tracer.in_syscall.get(&10), Some(&true));
    }

    #[test]
    fn test_termination_forgets_tracee() {
        let mut tracer = Tracer::new(vec![1], false, Cancellation::new());
        let event = tracer
            .translate(WaitStatus::Exited(Pid::from_raw(1), 0))
            .unwrap();
        assert_eq!(
            event,
            Some(TraceEvent::Terminated {
                pid: 1,
                status: ExitStatus::Exited(0)
            })
        );
        assert!(tracer.in_syscall.is_empty());
    }

    #[test]
    fn test_seccomp_mode_resumes_exit_with_cont() {
        let mut tracer = Tracer::new(vec![1], true, Cancellation::new());
        tracer.pending.clear();
        tracer.in_syscall.insert(1, true);
        assert_eq!(tracer.next_mode(1), Resume::Syscall);
        tracer.in_syscall.insert(1, false);
        assert_eq!(tracer.next_mode(1), Resume::Cont);
    }

    #[test]
    fn test_next_event_returns_none_when_cancelled() {
        let cancel = Cancellation::new();
        let mut tracer = Tracer::new(vec![], false, cancel.clone());
        cancel.cancel();
        assert_eq!(tracer.next_event().unwrap(), None);
    }
}
