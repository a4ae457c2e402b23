//! Minimal `/proc` reader
//!
//! The root is configurable so the proc scanner and the container helpers can
//! run against a fixture tree in tests.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Clock ticks per second used by `/proc/<pid>/stat` start times
pub const USER_HZ: u64 = 100;

const DEFAULT_ROOT: &str = "/proc";

/// Fields of `/proc/<pid>/stat` the tracer cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    pub ppid: i32,
    /// Start time in clock ticks after boot
    pub start_ticks: u64,
}

/// Fields of `/proc/<pid>/status` the tracer cares about
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcStatus {
    pub tgid: i32,
    /// real, effective, saved, filesystem
    pub uids: [u32; 4],
    /// real, effective, saved, filesystem
    pub gids: [u32; 4],
}

#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT)
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, pid: i32, file: &str) -> PathBuf {
        self.root.join(pid.to_string()).join(file)
    }

    /// Numeric entries of the proc root
    pub fn pids(&self) -> io::Result<Vec<i32>> {
        let mut pids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<i32>().ok()) {
                pids.push(pid);
            }
        }
        pids.sort_unstable();
        Ok(pids)
    }

    pub fn stat(&self, pid: i32) -> io::Result<ProcStat> {
        parse_stat(&fs::read_to_string(self.path(pid, "stat"))?)
    }

    pub fn status(&self, pid: i32) -> io::Result<ProcStatus> {
        parse_status(&fs::read_to_string(self.path(pid, "status"))?)
    }

    /// argv as recorded by the kernel
    pub fn cmdline(&self, pid: i32) -> io::Result<Vec<String>> {
        let raw = fs::read(self.path(pid, "cmdline"))?;
        Ok(raw
            .split(|&b| b == 0)
            .filter(|arg| !arg.is_empty())
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect())
    }

    pub fn exe(&self, pid: i32) -> io::Result<PathBuf> {
        fs::read_link(self.path(pid, "exe"))
    }

    pub fn cwd(&self, pid: i32) -> io::Result<PathBuf> {
        fs::read_link(self.path(pid, "cwd"))
    }

    /// Target of `/proc/<pid>/fd/<fd>`
    pub fn fd(&self, pid: i32, fd: i32) -> io::Result<PathBuf> {
        fs::read_link(self.path(pid, "fd").join(fd.to_string()))
    }

    /// Contents of a file under `<root>/self`
    pub fn read_self(&self, file: &str) -> io::Result<String> {
        fs::read_to_string(self.root.join("self").join(file))
    }

    /// Boot time in seconds since the epoch (`btime` in `<root>/stat`)
    pub fn boot_time(&self) -> io::Result<u64> {
        let stat = fs::read_to_string(self.root.join("stat"))?;
        stat.lines()
            .find_map(|line| line.strip_prefix("btime "))
            .and_then(|value| value.trim().parse().ok())
            .ok_or_else(|| invalid("no btime in stat"))
    }

    /// Process start time in ns since the epoch
    pub fn start_time_ns(&self, pid: i32) -> io::Result<u64> {
        let boot = self.boot_time()?;
        let ticks = self.stat(pid)?.start_ticks;
        Ok(boot * 1_000_000_000 + ticks * (1_000_000_000 / USER_HZ))
    }
}

/// Parse `/proc/<pid>/stat`.
///
/// The command name may contain spaces and parentheses, so fields are counted
/// from the last `)`.
pub fn parse_stat(content: &str) -> io::Result<ProcStat> {
    let close = content
        .rfind(')')
        .ok_or_else(|| invalid("malformed stat line"))?;
    let fields: Vec<&str> = content[close + 1..].split_whitespace().collect();

    // fields[0] is the state (field 3 of the full line)
    let ppid = fields
        .get(1)
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| invalid("missing ppid"))?;
    let start_ticks = fields
        .get(19)
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| invalid("missing starttime"))?;

    Ok(ProcStat { ppid, start_ticks })
}

fn parse_ids(value: &str) -> io::Result<[u32; 4]> {
    let mut ids = [0u32; 4];
    let mut count = 0;
    for (slot, field) in ids.iter_mut().zip(value.split_whitespace()) {
        *slot = field.parse().map_err(|_| invalid("bad id"))?;
        count += 1;
    }
    if count != 4 {
        return Err(invalid("expected four ids"));
    }
    Ok(ids)
}

pub fn parse_status(content: &str) -> io::Result<ProcStatus> {
    let mut status = ProcStatus::default();
    let mut seen = (false, false, false);

    for line in content.lines() {
        if let Some(value) = line.strip_prefix("Tgid:") {
            status.tgid = value.trim().parse().map_err(|_| invalid("bad tgid"))?;
            seen.0 = true;
        } else if let Some(value) = line.strip_prefix("Uid:") {
            status.uids = parse_ids(value)?;
            seen.1 = true;
        } else if let Some(value) = line.strip_prefix("Gid:") {
            status.gids = parse_ids(value)?;
            seen.2 = true;
        }
    }

    if seen != (true, true, true) {
        return Err(invalid("incomplete status"));
    }
    Ok(status)
}
