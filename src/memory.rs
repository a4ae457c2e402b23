//! Reading tracee memory and per-process facts
//!
//! Handlers never touch ptrace directly. They go through the [`Tracee`] trait,
//! which the live tracer implements with `process_vm_readv` and procfs, and
//! which unit tests implement with an in-memory fake.

use crate::procfs::ProcFs;
use nix::errno::Errno;
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::unistd::Pid;
use std::io::{self, IoSliceMut};
use thiserror::Error;

/// Longest string read from the tracee (PATH_MAX)
pub const MAX_STRING_LEN: usize = 4096;

/// Most entries read from an argv/envp style array
pub const MAX_ARRAY_LEN: usize = 512;

const PAGE_SIZE: u64 = 4096;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("failed to read {len} bytes at {addr:#x} from pid {pid}: {source}")]
    Read {
        pid: i32,
        addr: u64,
        len: usize,
        #[source]
        source: Errno,
    },

    #[error("short read at {addr:#x} from pid {pid}: {got} of {len} bytes")]
    Short {
        pid: i32,
        addr: u64,
        len: usize,
        got: usize,
    },

    #[error("null pointer argument")]
    NullPointer,

    #[error("failed to read {what} of pid {pid}: {source}")]
    Proc {
        pid: i32,
        what: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Access to a traced process
pub trait Tracee {
    /// Read up to `len` bytes at `addr`; may return fewer at a mapping boundary
    fn read_bytes(&self, pid: i32, addr: u64, len: usize) -> Result<Vec<u8>, MemoryError>;

    /// Thread-group id of `pid`
    fn tgid(&self, pid: i32) -> Result<i32, MemoryError>;

    /// Current working directory of `pid`
    fn cwd(&self, pid: i32) -> Result<String, MemoryError>;

    /// Path behind an fd the tracer has not seen being opened
    fn fd_path(&self, pid: i32, fd: i32) -> Result<String, MemoryError>;

    /// Read exactly `len` bytes
    fn read_exact(&self, pid: i32, addr: u64, len: usize) -> Result<Vec<u8>, MemoryError> {
        if addr == 0 {
            return Err(MemoryError::NullPointer);
        }
        let buf = self.read_bytes(pid, addr, len)?;
        if buf.len() < len {
            return Err(MemoryError::Short {
                pid,
                addr,
                len,
                got: buf.len(),
            });
        }
        Ok(buf)
    }

    fn read_u64(&self, pid: i32, addr: u64) -> Result<u64, MemoryError> {
        let buf = self.read_exact(pid, addr, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[..8]);
        Ok(u64::from_ne_bytes(raw))
    }

    /// Read a NUL-terminated string.
    ///
    /// Reads never cross a page boundary in a single call, so a string that
    /// ends right before an unmapped page is still readable.
    fn read_string(&self, pid: i32, addr: u64) -> Result<String, MemoryError> {
        if addr == 0 {
            return Err(MemoryError::NullPointer);
        }

        let mut out = Vec::new();
        let mut cursor = addr;
        while out.len() < MAX_STRING_LEN {
            let to_page_end = (PAGE_SIZE - cursor % PAGE_SIZE) as usize;
            let want = to_page_end.min(MAX_STRING_LEN - out.len());
            let chunk = self.read_bytes(pid, cursor, want)?;
            if let Some(nul) = chunk.iter().position(|&b| b == 0) {
                out.extend_from_slice(&chunk[..nul]);
                return Ok(String::from_utf8_lossy(&out).into_owned());
            }
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
            cursor += chunk.len() as u64;
        }

        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Read a NULL-terminated array of string pointers (argv, envp).
    ///
    /// Returns the strings and whether the array was cut at [`MAX_ARRAY_LEN`].
    fn read_string_array(&self, pid: i32, addr: u64) -> Result<(Vec<String>, bool), MemoryError> {
        let mut out = Vec::new();
        if addr == 0 {
            return Ok((out, false));
        }

        for i in 0..MAX_ARRAY_LEN as u64 {
            let ptr = self.read_u64(pid, addr + i * 8)?;
            if ptr == 0 {
                return Ok((out, false));
            }
            out.push(self.read_string(pid, ptr)?);
        }

        let next = self.read_u64(pid, addr + MAX_ARRAY_LEN as u64 * 8)?;
        Ok((out, next != 0))
    }
}

/// The real tracee: memory through `process_vm_readv`, facts through procfs
#[derive(Debug, Clone, Default)]
pub struct LiveTracee {
    procfs: ProcFs,
}

impl LiveTracee {
    pub fn new(procfs: ProcFs) -> Self {
        Self { procfs }
    }
}

impl Tracee for LiveTracee {
    fn read_bytes(&self, pid: i32, addr: u64, len: usize) -> Result<Vec<u8>, MemoryError> {
        let mut buf = vec![0u8; len];
        let mut local_iov = [IoSliceMut::new(&mut buf)];
        let remote_iov = [RemoteIoVec {
            base: addr as usize,
            len,
        }];

        let read = process_vm_readv(Pid::from_raw(pid), &mut local_iov, &remote_iov).map_err(
            |source| MemoryError::Read {
                pid,
                addr,
                len,
                source,
            },
        )?;
        buf.truncate(read);
        Ok(buf)
    }

    fn tgid(&self, pid: i32) -> Result<i32, MemoryError> {
        self.procfs
            .status(pid)
            .map(|status| status.tgid)
            .map_err(|source| MemoryError::Proc {
                pid,
                what: "status",
                source,
            })
    }

    fn cwd(&self, pid: i32) -> Result<String, MemoryError> {
        self.procfs
            .cwd(pid)
            .map(|path| path.to_string_lossy().into_owned())
            .map_err(|source| MemoryError::Proc {
                pid,
                what: "cwd",
                source,
            })
    }

    fn fd_path(&self, pid: i32, fd: i32) -> Result<String, MemoryError> {
        self.procfs
            .fd(pid, fd)
            .map(|path| path.to_string_lossy().into_owned())
            .map_err(|source| MemoryError::Proc {
                pid,
                what: "fd",
                source,
            })
    }
}
