//! Per-process state of the traced tree
//!
//! Keyed by kernel thread id. A thread of a process shares the process's fd
//! table and cwd; a forked child starts from a copy of them.
//!
//! # Exec identity
//!
//! When a non-leader thread `T` of thread group `G` calls `execve`, the kernel
//! reports the syscall entry under `T` and, if the exec succeeds, the exit under
//! `G`. Between the two the process is in [`Identity::Execing`] and reachable by
//! both ids: `G` is an alias for `T`, and the old leader entry at `G` is set
//! aside. Completion re-keys the process under `G`; failure drops the alias and
//! puts the old leader back.

use crate::proto::SyscallMsg;
use fnv::FnvHashMap;
use std::cell::RefCell;
use std::rc::Rc;

/// fd table and working directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resources {
    pub fd: FnvHashMap<i32, String>,
    /// Empty until first needed, then filled from the tracee
    pub cwd: String,
}

pub type SharedResources = Rc<RefCell<Resources>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    Settled,
    /// An exec entered under `entry_pid` has not exited yet
    Execing { entry_pid: i32 },
}

/// Span TLS registration of a thread group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanTls {
    pub format: u64,
    pub max_threads: u64,
    pub base: u64,
}

#[derive(Debug)]
pub struct Process {
    pub pid: i32,
    pub tgid: i32,
    pub identity: Identity,
    pub resources: SharedResources,
    in_flight: FnvHashMap<i64, SyscallMsg>,
}

impl Process {
    pub fn new(pid: i32, tgid: i32) -> Self {
        Self::with_resources(pid, tgid, Rc::default())
    }

    pub fn with_resources(pid: i32, tgid: i32, resources: SharedResources) -> Self {
        Self {
            pid,
            tgid,
            identity: Identity::Settled,
            resources,
            in_flight: FnvHashMap::default(),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.pid == self.tgid
    }

    /// Park an entry message until its exit
    pub fn stash(&mut self, slot: i64, msg: SyscallMsg) {
        self.in_flight.insert(slot, msg);
    }

    pub fn take(&mut self, slot: i64) -> Option<SyscallMsg> {
        self.in_flight.remove(&slot)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

#[derive(Debug, Default)]
pub struct ProcessTable {
    processes: FnvHashMap<i32, Process>,
    /// tgid -> entry pid of an in-flight exec
    aliases: FnvHashMap<i32, i32>,
    /// Old leader entries set aside while an exec is in flight, by tgid
    displaced: FnvHashMap<i32, Process>,
    spans: FnvHashMap<i32, SpanTls>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(&self, pid: i32) -> i32 {
        self.aliases.get(&pid).copied().unwrap_or(pid)
    }

    pub fn add(&mut self, pid: i32, process: Process) {
        self.processes.insert(pid, process);
    }

    pub fn get(&self, pid: i32) -> Option<&Process> {
        self.processes.get(&self.key(pid))
    }

    pub fn get_mut(&mut self, pid: i32) -> Option<&mut Process> {
        let key = self.key(pid);
        self.processes.get_mut(&key)
    }

    pub fn contains(&self, pid: i32) -> bool {
        self.get(pid).is_some()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Drop `pid` from the table.
    ///
    /// A pid that is currently an exec alias only retires the old leader set
    /// aside for it. A process that dies mid-exec gives its tgid back to the
    /// old leader.
    pub fn remove(&mut self, pid: i32) -> Option<Process> {
        if self.aliases.contains_key(&pid) {
            return self.displaced.remove(&pid);
        }

        let process = self.processes.remove(&pid)?;
        if let Identity::Execing { .. } = process.identity {
            self.abort_exec(process.tgid);
        }
        if process.is_leader() {
            self.spans.remove(&pid);
        }
        Some(process)
    }

    /// Record `pid` as a thread of the process `parent_pid` belongs to.
    ///
    /// Returns the tgid, or `None` when the parent is unknown.
    pub fn set_as_thread_of(&mut self, pid: i32, parent_pid: i32) -> Option<i32> {
        let parent = self.get(parent_pid)?;
        let tgid = parent.tgid;
        let thread = Process::with_resources(pid, tgid, Rc::clone(&parent.resources));
        self.add(pid, thread);
        Some(tgid)
    }

    /// Record `pid` as a new process forked from `parent_pid`.
    ///
    /// The child gets a copy of the parent's resources. Returns the parent's
    /// tgid, or `None` when the parent is unknown (the child then starts empty).
    pub fn fork_from(&mut self, pid: i32, parent_pid: i32) -> Option<i32> {
        let inherited = self.get(parent_pid).map(|parent| {
            let copy = parent.resources.borrow().clone();
            (parent.tgid, Rc::new(RefCell::new(copy)))
        });
        let Some((ppid, resources)) = inherited else {
            self.add(pid, Process::new(pid, pid));
            return None;
        };

        self.add(pid, Process::with_resources(pid, pid, resources));
        Some(ppid)
    }

    /// Start an exec by `pid`. A non-leader makes its tgid an alias for itself.
    pub fn begin_exec(&mut self, pid: i32) {
        let Some(process) = self.processes.get_mut(&pid) else {
            return;
        };
        process.identity = Identity::Execing { entry_pid: pid };
        if process.is_leader() {
            return;
        }

        let tgid = process.tgid;
        if let Some(leader) = self.processes.remove(&tgid) {
            self.displaced.insert(tgid, leader);
        }
        self.aliases.insert(tgid, pid);
    }

    /// Finish the exec seen exiting under `pid`.
    ///
    /// On success the process is re-keyed under its tgid. On failure the
    /// identity stays and the alias is dropped. Returns the key the process
    /// lives under afterwards.
    pub fn complete_exec(&mut self, pid: i32, retval: i64) -> Option<i32> {
        let key = self.key(pid);
        let process = self.processes.get_mut(&key)?;
        let Identity::Execing { entry_pid } = process.identity else {
            return Some(key);
        };
        process.identity = Identity::Settled;
        let tgid = process.tgid;
        if entry_pid == tgid {
            return Some(key);
        }

        if retval < 0 {
            self.abort_exec(tgid);
            return Some(entry_pid);
        }

        self.aliases.remove(&tgid);
        self.displaced.remove(&tgid);
        let mut process = self.processes.remove(&entry_pid)?;
        process.pid = tgid;
        self.processes.insert(tgid, process);
        Some(tgid)
    }

    fn abort_exec(&mut self, tgid: i32) {
        if self.aliases.remove(&tgid).is_some() {
            if let Some(leader) = self.displaced.remove(&tgid) {
                self.processes.insert(tgid, leader);
            }
        }
    }

    pub fn set_span(&mut self, tgid: i32, span: SpanTls) {
        self.spans.insert(tgid, span);
    }

    pub fn get_span(&self, tgid: i32) -> Option<SpanTls> {
        self.spans.get(&tgid).copied()
    }

    pub fn unset_span(&mut self, tgid: i32) {
        self.spans.remove(&tgid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const G: i32 = 100;
    const T: i32 = 101;

    fn group() -> ProcessTable {
        let mut table = ProcessTable::new();
        table.add(G, Process::new(G, G));
        assert_eq!(table.set_as_thread_of(T, G), Some(G));
        table
    }

    #[test]
    fn test_thread_shares_resources() {
        let table = group();
        table
            .get(G)
            .unwrap()
            .resources
            .borrow_mut()
            .fd
            .insert(3, "/tmp/x".to_string());
        let thread = table.get(T).unwrap();
        assert_eq!(thread.tgid, G);
        assert!(!thread.is_leader());
        assert_eq!(thread.resources.borrow().fd.get(&3).unwrap(), "/tmp/x");
    }

    #[test]
    fn test_fork_copies_resources() {
        let mut table = group();
        table.get(G).unwrap().resources.borrow_mut().cwd = "/srv".to_string();
        assert_eq!(table.fork_from(200, T), Some(G));

        let child = table.get(200).unwrap();
        assert!(child.is_leader());
        assert_eq!(child.resources.borrow().cwd, "/srv");
        child.resources.borrow_mut().cwd = "/tmp".to_string();
        assert_eq!(table.get(G).unwrap().resources.borrow().cwd, "/srv");
    }

    #[test]
    fn test_fork_from_unknown_parent() {
        let mut table = ProcessTable::new();
        assert_eq!(table.fork_from(5, 4), None);
        assert!(table.contains(5));
    }

    #[test]
    fn test_exec_by_thread_rekeys_under_tgid() {
        let mut table = group();
        table.begin_exec(T);
        assert_eq!(
            table.get(G).unwrap().identity,
            Identity::Execing { entry_pid: T }
        );
        assert_eq!(table.get(G).unwrap().pid, T);
        assert_eq!(table.get(T).unwrap().pid, T);

        assert_eq!(table.complete_exec(G, 0), Some(G));
        let process = table.get(G).unwrap();
        assert_eq!(process.pid, G);
        assert_eq!(process.identity, Identity::Settled);
        assert!(!table.contains(T));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_failed_exec_by_thread_keeps_identity() {
        let mut table = group();
        table.begin_exec(T);
        assert_eq!(table.complete_exec(T, -2), Some(T));

        let thread = table.get(T).unwrap();
        assert_eq!(thread.pid, T);
        assert_eq!(thread.identity, Identity::Settled);
        let leader = table.get(G).unwrap();
        assert_eq!(leader.pid, G);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_exec_by_leader() {
        let mut table = group();
        table.begin_exec(G);
        assert_eq!(table.get(T).unwrap().pid, T);
        assert_eq!(table.complete_exec(G, 0), Some(G));
        assert_eq!(table.get(G).unwrap().identity, Identity::Settled);
    }

    #[test]
    fn test_removing_alias_retires_only_old_leader() {
        let mut table = group();
        table.begin_exec(T);
        let old = table.remove(G).unwrap();
        assert_eq!(old.pid, G);
        assert_eq!(table.get(G).unwrap().pid, T);
    }

    #[test]
    fn test_death_mid_exec_restores_leader() {
        let mut table = group();
        table.begin_exec(T);
        table.remove(T).unwrap();
        assert_eq!(table.get(G).unwrap().pid, G);
        assert!(!table.contains(T));
    }

    #[test]
    fn test_in_flight_slots() {
        let mut process = Process::new(1, 1);
        process.stash(2, SyscallMsg::default());
        assert_eq!(process.in_flight(), 1);
        assert!(process.take(2).is_some());
        assert!(process.take(2).is_none());
    }

    #[test]
    fn test_spans() {
        let mut table = group();
        assert_eq!(table.get_span(G), None);
        let span = SpanTls {
            format: 0,
            max_threads: 8,
            base: 0x1000,
        };
        table.set_span(G, span);
        assert_eq!(table.get_span(G), Some(span));
        table.unset_span(G);
        assert_eq!(table.get_span(G), None);

        table.set_span(G, span);
        table.remove(G);
        assert_eq!(table.get_span(G), None);
    }
}
