//! x86_64 syscall numbers used by the handler registry
//!
//! Only the syscalls the tracer dispatches on are listed. Anything else
//! resolves to "unknown" and is ignored by the trace loop.

macro_rules! syscall_table {
    ($($konst:ident = $nr:literal => $name:literal),* $(,)?) => {
        $(pub const $konst: i64 = $nr;)*

        /// Resolve a syscall number to its name, or "unknown"
        pub fn syscall_name(nr: i64) -> &'static str {
            match nr {
                $($nr => $name,)*
                _ => "unknown",
            }
        }
    };
}

syscall_table! {
    OPEN = 2 => "open",
    CLOSE = 3 => "close",
    IOCTL = 16 => "ioctl",
    DUP = 32 => "dup",
    DUP2 = 33 => "dup2",
    CONNECT = 42 => "connect",
    BIND = 49 => "bind",
    CLONE = 56 => "clone",
    FORK = 57 => "fork",
    VFORK = 58 => "vfork",
    EXECVE = 59 => "execve",
    EXIT = 60 => "exit",
    FCNTL = 72 => "fcntl",
    TRUNCATE = 76 => "truncate",
    FTRUNCATE = 77 => "ftruncate",
    CHDIR = 80 => "chdir",
    FCHDIR = 81 => "fchdir",
    RENAME = 82 => "rename",
    MKDIR = 83 => "mkdir",
    RMDIR = 84 => "rmdir",
    CREAT = 85 => "creat",
    LINK = 86 => "link",
    UNLINK = 87 => "unlink",
    SYMLINK = 88 => "symlink",
    CHMOD = 90 => "chmod",
    FCHMOD = 91 => "fchmod",
    CHOWN = 92 => "chown",
    FCHOWN = 93 => "fchown",
    LCHOWN = 94 => "lchown",
    SETUID = 105 => "setuid",
    SETGID = 106 => "setgid",
    SETREUID = 113 => "setreuid",
    SETREGID = 114 => "setregid",
    SETRESUID = 117 => "setresuid",
    SETRESGID = 119 => "setresgid",
    SETFSUID = 122 => "setfsuid",
    SETFSGID = 123 => "setfsgid",
    CAPSET = 126 => "capset",
    UTIME = 132 => "utime",
    INIT_MODULE = 175 => "init_module",
    DELETE_MODULE = 176 => "delete_module",
    EXIT_GROUP = 231 => "exit_group",
    UTIMES = 235 => "utimes",
    OPENAT = 257 => "openat",
    MKDIRAT = 258 => "mkdirat",
    FCHOWNAT = 260 => "fchownat",
    FUTIMESAT = 261 => "futimesat",
    UNLINKAT = 263 => "unlinkat",
    RENAMEAT = 264 => "renameat",
    LINKAT = 265 => "linkat",
    SYMLINKAT = 266 => "symlinkat",
    FCHMODAT = 268 => "fchmodat",
    UTIMENSAT = 280 => "utimensat",
    DUP3 = 292 => "dup3",
    FINIT_MODULE = 313 => "finit_module",
    RENAMEAT2 = 316 => "renameat2",
    EXECVEAT = 322 => "execveat",
    CLONE3 = 435 => "clone3",
    OPENAT2 = 437 => "openat2",
}

/// Syscalls that are dispatched even without a registry entry because they
/// mutate the process table (identity, lineage, span registration, exit).
pub const ALWAYS_INTERCEPTED: [i64; 8] = [EXECVE, EXECVEAT, IOCTL, CLONE, CLONE3, FORK, VFORK, EXIT];

pub fn is_always_intercepted(nr: i64) -> bool {
    ALWAYS_INTERCEPTED.contains(&nr)
}

/// In-flight slot key for a syscall number.
///
/// `execveat` can complete as `execve`, so both share the `execve` slot.
pub fn slot_key(nr: i64) -> i64 {
    if nr == EXECVEAT {
        EXECVE
    } else {
        nr
    }
}
