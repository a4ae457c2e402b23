//! ptsentry - ptrace-based security event tracer
//!
//! Traces a process tree (attached by pid, or spawned from a command),
//! decodes security-relevant syscalls into typed events and streams them to a
//! remote collector over a length-prefixed MessagePack protocol.

pub mod cli;
pub mod config;
pub mod container;
pub mod handlers;
pub mod memory;
pub mod proc_scan;
pub mod process_table;
pub mod procfs;
pub mod proto;
pub mod run;
pub mod session;
pub mod shutdown;
pub mod syscalls;
pub mod tracer;
pub mod transport;
pub mod users;
