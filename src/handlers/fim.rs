//! File integrity handlers: opens, namespace changes, attribute changes and
//! fd bookkeeping

use super::{Handler, HandlerContext, HandlerError, Registry, AT_FDCWD};
use crate::proto::{
    ChmodMsg, ChownMsg, FileInfo, LinkMsg, MkdirMsg, OpenMsg, RenameMsg, RmdirMsg, SyscallMsg,
    SyscallPayload, UnlinkMsg, UtimesMsg,
};
use crate::syscalls::*;

const AT_REMOVEDIR: u64 = 0x200;

pub(crate) fn register(registry: &mut Registry) {
    registry.insert(OPEN, Handler::new(open_entry).on_exit(open_exit));
    registry.insert(OPENAT, Handler::new(openat_entry).on_exit(open_exit));
    registry.insert(OPENAT2, Handler::new(openat2_entry).on_exit(open_exit));
    registry.insert(CREAT, Handler::new(creat_entry).on_exit(open_exit));
    registry.insert(TRUNCATE, Handler::new(truncate_entry).on_exit(stats_exit));
    registry.insert(FTRUNCATE, Handler::new(ftruncate_entry).on_exit(stats_exit));

    registry.insert(UNLINK, Handler::new(unlink_entry));
    registry.insert(UNLINKAT, Handler::new(unlinkat_entry));
    registry.insert(RMDIR, Handler::new(rmdir_entry));
    registry.insert(RENAME, Handler::new(rename_entry).on_exit(stats_exit));
    registry.insert(RENAMEAT, Handler::new(renameat_entry).on_exit(stats_exit));
    registry.insert(RENAMEAT2, Handler::new(renameat_entry).on_exit(stats_exit));
    registry.insert(MKDIR, Handler::new(mkdir_entry).on_exit(stats_exit));
    registry.insert(MKDIRAT, Handler::new(mkdirat_entry).on_exit(stats_exit));
    registry.insert(LINK, Handler::new(link_entry).on_exit(stats_exit));
    registry.insert(LINKAT, Handler::new(linkat_entry).on_exit(stats_exit));
    registry.insert(SYMLINK, Handler::new(symlink_entry).on_exit(stats_exit));
    registry.insert(SYMLINKAT, Handler::new(symlinkat_entry).on_exit(stats_exit));

    registry.insert(CHMOD, Handler::new(chmod_entry).on_exit(stats_exit));
    registry.insert(FCHMOD, Handler::new(fchmod_entry).on_exit(stats_exit));
    registry.insert(FCHMODAT, Handler::new(fchmodat_entry).on_exit(stats_exit));
    registry.insert(CHOWN, Handler::new(chown_entry).on_exit(stats_exit));
    registry.insert(LCHOWN, Handler::new(chown_entry).on_exit(stats_exit));
    registry.insert(FCHOWN, Handler::new(fchown_entry).on_exit(stats_exit));
    registry.insert(FCHOWNAT, Handler::new(fchownat_entry).on_exit(stats_exit));
    registry.insert(UTIME, Handler::new(utimes_entry).on_exit(stats_exit));
    registry.insert(UTIMES, Handler::new(utimes_entry).on_exit(stats_exit));
    registry.insert(FUTIMESAT, Handler::new(futimesat_entry).on_exit(stats_exit));
    registry.insert(UTIMENSAT, Handler::new(utimensat_entry).on_exit(stats_exit));

    registry.insert(CLOSE, Handler::bookkeeping(close_exit));
    registry.insert(DUP, Handler::bookkeeping(dup_exit));
    registry.insert(DUP2, Handler::bookkeeping(dup_exit));
    registry.insert(DUP3, Handler::bookkeeping(dup_exit));
    registry.insert(FCNTL, Handler::bookkeeping(fcntl_exit));
}

fn open_msg(file: FileInfo, flags: u64, mode: u64) -> SyscallPayload {
    SyscallPayload::Open(OpenMsg {
        file,
        flags: flags as u32,
        mode: mode as u32,
    })
}

fn open_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let file = ctx.path_arg(AT_FDCWD, 0)?;
    msg.payload = open_msg(file, ctx.arg(1), ctx.arg(2));
    Ok(())
}

fn openat_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let file = ctx.path_arg(ctx.arg_i32(0), 1)?;
    msg.payload = open_msg(file, ctx.arg(2), ctx.arg(3));
    Ok(())
}

fn openat2_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let file = ctx.path_arg(ctx.arg_i32(0), 1)?;
    // struct open_how { u64 flags; u64 mode; u64 resolve; }
    let how = ctx.read_bytes(ctx.arg(2), 16)?;
    let flags = u64::from_ne_bytes(how[0..8].try_into().map_err(|_| HandlerError::Malformed("open_how"))?);
    let mode = u64::from_ne_bytes(how[8..16].try_into().map_err(|_| HandlerError::Malformed("open_how"))?);
    msg.payload = open_msg(file, flags, mode);
    Ok(())
}

fn creat_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let file = ctx.path_arg(AT_FDCWD, 0)?;
    let flags = (libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC) as u64;
    msg.payload = open_msg(file, flags, ctx.arg(1));
    Ok(())
}

fn truncate_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let file = ctx.path_arg(AT_FDCWD, 0)?;
    msg.payload = open_msg(file, libc::O_TRUNC as u64, 0);
    Ok(())
}

fn ftruncate_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let file = FileInfo::new(ctx.fd_path(ctx.arg_i32(0))?);
    msg.payload = open_msg(file, libc::O_TRUNC as u64, 0);
    Ok(())
}

/// Record the new fd, then stamp stats
fn open_exit(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    if msg.retval >= 0 {
        if let SyscallPayload::Open(open) = &msg.payload {
            ctx.process
                .resources
                .borrow_mut()
                .fd
                .insert(msg.retval as i32, open.file.path.clone());
        }
    }
    stats_exit(ctx, msg)
}

/// On success, refresh file stats of every path the payload carries
pub(crate) fn stats_exit(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    if msg.retval < 0 {
        return Ok(());
    }
    match &mut msg.payload {
        SyscallPayload::Open(m) => ctx.fill_stats(&mut m.file),
        SyscallPayload::Exec(m) => ctx.fill_stats(&mut m.file),
        SyscallPayload::Chdir(m) => ctx.fill_stats(&mut m.dir),
        SyscallPayload::Rename(m) => ctx.fill_stats(&mut m.new),
        SyscallPayload::Mkdir(m) => ctx.fill_stats(&mut m.dir),
        SyscallPayload::Link(m) => {
            if !m.symbolic {
                ctx.fill_stats(&mut m.target);
            }
            ctx.fill_stats(&mut m.link);
        }
        SyscallPayload::Chmod(m) => ctx.fill_stats(&mut m.file),
        SyscallPayload::Chown(m) => ctx.fill_stats(&mut m.file),
        SyscallPayload::Utimes(m) => ctx.fill_stats(&mut m.file),
        SyscallPayload::LoadModule(m) => {
            if let Some(file) = m.file.as_mut() {
                ctx.fill_stats(file);
            }
        }
        _ => {}
    }
    Ok(())
}

fn unlink_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let file = ctx.path_arg(AT_FDCWD, 0)?;
    msg.payload = SyscallPayload::Unlink(UnlinkMsg { file });
    Ok(())
}

fn unlinkat_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let file = ctx.path_arg(ctx.arg_i32(0), 1)?;
    msg.payload = if ctx.arg(2) & AT_REMOVEDIR != 0 {
        SyscallPayload::Rmdir(RmdirMsg { dir: file })
    } else {
        SyscallPayload::Unlink(UnlinkMsg { file })
    };
    Ok(())
}

fn rmdir_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let dir = ctx.path_arg(AT_FDCWD, 0)?;
    msg.payload = SyscallPayload::Rmdir(RmdirMsg { dir });
    Ok(())
}

fn rename_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let old = ctx.path_arg(AT_FDCWD, 0)?;
    let new = ctx.path_arg(AT_FDCWD, 1)?;
    msg.payload = SyscallPayload::Rename(RenameMsg { old, new });
    Ok(())
}

/// renameat and renameat2 share their first four arguments
fn renameat_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let old = ctx.path_arg(ctx.arg_i32(0), 1)?;
    let new = ctx.path_arg(ctx.arg_i32(2), 3)?;
    msg.payload = SyscallPayload::Rename(RenameMsg { old, new });
    Ok(())
}

fn mkdir_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let dir = ctx.path_arg(AT_FDCWD, 0)?;
    msg.payload = SyscallPayload::Mkdir(MkdirMsg {
        dir,
        mode: ctx.arg(1) as u32,
    });
    Ok(())
}

fn mkdirat_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let dir = ctx.path_arg(ctx.arg_i32(0), 1)?;
    msg.payload = SyscallPayload::Mkdir(MkdirMsg {
        dir,
        mode: ctx.arg(2) as u32,
    });
    Ok(())
}

fn link_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let target = ctx.path_arg(AT_FDCWD, 0)?;
    let link = ctx.path_arg(AT_FDCWD, 1)?;
    msg.payload = SyscallPayload::Link(LinkMsg {
        target,
        link,
        symbolic: false,
    });
    Ok(())
}

fn linkat_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let target = ctx.path_arg(ctx.arg_i32(0), 1)?;
    let link = ctx.path_arg(ctx.arg_i32(2), 3)?;
    msg.payload = SyscallPayload::Link(LinkMsg {
        target,
        link,
        symbolic: false,
    });
    Ok(())
}

// A symlink target is stored verbatim, never resolved.
fn symlink_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let target = FileInfo::new(ctx.read_string(ctx.arg(0))?);
    let link = ctx.path_arg(AT_FDCWD, 1)?;
    msg.payload = SyscallPayload::Link(LinkMsg {
        target,
        link,
        symbolic: true,
    });
    Ok(())
}

fn symlinkat_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let target = FileInfo::new(ctx.read_string(ctx.arg(0))?);
    let link = ctx.path_arg(ctx.arg_i32(1), 2)?;
    msg.payload = SyscallPayload::Link(LinkMsg {
        target,
        link,
        symbolic: true,
    });
    Ok(())
}

fn chmod_msg(file: FileInfo, mode: u64) -> SyscallPayload {
    SyscallPayload::Chmod(ChmodMsg {
        file,
        mode: mode as u32,
    })
}

fn chmod_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let file = ctx.path_arg(AT_FDCWD, 0)?;
    msg.payload = chmod_msg(file, ctx.arg(1));
    Ok(())
}

fn fchmod_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let file = FileInfo::new(ctx.fd_path(ctx.arg_i32(0))?);
    msg.payload = chmod_msg(file, ctx.arg(1));
    Ok(())
}

fn fchmodat_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let file = ctx.path_arg(ctx.arg_i32(0), 1)?;
    msg.payload = chmod_msg(file, ctx.arg(2));
    Ok(())
}

fn chown_msg(ctx: &HandlerContext<'_>, file: FileInfo, uid: u64, gid: u64) -> SyscallPayload {
    // -1 leaves the id unchanged
    let uid = uid as i32 as i64;
    let gid = gid as i32 as i64;
    SyscallPayload::Chown(ChownMsg {
        file,
        uid,
        gid,
        user: u32::try_from(uid).ok().and_then(|uid| ctx.user_name(uid)),
        group: u32::try_from(gid).ok().and_then(|gid| ctx.group_name(gid)),
    })
}

/// chown and lchown
fn chown_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let file = ctx.path_arg(AT_FDCWD, 0)?;
    msg.payload = chown_msg(ctx, file, ctx.arg(1), ctx.arg(2));
    Ok(())
}

fn fchown_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let file = FileInfo::new(ctx.fd_path(ctx.arg_i32(0))?);
    msg.payload = chown_msg(ctx, file, ctx.arg(1), ctx.arg(2));
    Ok(())
}

fn fchownat_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let file = ctx.path_arg(ctx.arg_i32(0), 1)?;
    msg.payload = chown_msg(ctx, file, ctx.arg(2), ctx.arg(3));
    Ok(())
}

/// utime and utimes
fn utimes_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let file = ctx.path_arg(AT_FDCWD, 0)?;
    msg.payload = SyscallPayload::Utimes(UtimesMsg { file });
    Ok(())
}

fn futimesat_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let file = ctx.path_arg(ctx.arg_i32(0), 1)?;
    msg.payload = SyscallPayload::Utimes(UtimesMsg { file });
    Ok(())
}

// A NULL path makes utimensat operate on dirfd itself.
fn utimensat_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let dirfd = ctx.arg_i32(0);
    let file = if ctx.arg(1) == 0 {
        FileInfo::new(ctx.fd_path(dirfd)?)
    } else {
        ctx.path_arg(dirfd, 1)?
    };
    msg.payload = SyscallPayload::Utimes(UtimesMsg { file });
    Ok(())
}

fn close_exit(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    if msg.retval == 0 {
        ctx.process.resources.borrow_mut().fd.remove(&ctx.arg_i32(0));
    }
    Ok(())
}

/// dup, dup2 and dup3: the new fd (the return value) aliases the old one
fn dup_exit(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    if msg.retval < 0 {
        return Ok(());
    }
    let mut resources = ctx.process.resources.borrow_mut();
    match resources.fd.get(&ctx.arg_i32(0)).cloned() {
        Some(path) => {
            resources.fd.insert(msg.retval as i32, path);
        }
        None => {
            resources.fd.remove(&(msg.retval as i32));
        }
    }
    Ok(())
}

fn fcntl_exit(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let cmd = ctx.arg_i32(1);
    if cmd == libc::F_DUPFD || cmd == libc::F_DUPFD_CLOEXEC {
        return dup_exit(ctx, msg);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::{regs, run};
    use crate::handlers::register;
    use crate::memory::fake::FakeTracee;
    use crate::process_table::Process;

    fn setup() -> (FakeTracee, Process) {
        let tracee = FakeTracee::new();
        tracee.set_cwd(10, "/home/alice");
        (tracee, Process::new(10, 10))
    }

    #[test]
    fn test_openat_relative_records_fd() {
        let (tracee, process) = setup();
        tracee.map_str(0x1000, "notes.txt");
        let (registry, _) = register();
        let handler = registry.get(OPENAT).unwrap();
        let args = [AT_FDCWD as i64 as u64, 0x1000, libc::O_RDONLY as u64, 0];

        let msg = run(handler, &tracee, &process, regs(OPENAT, &args), 3).unwrap();
        match &msg.payload {
            SyscallPayload::Open(open) => {
                assert_eq!(open.file.path, "/home/alice/notes.txt");
                assert_eq!(open.flags, libc::O_RDONLY as u32);
                assert!(open.file.stats.is_none());
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(
            process.resources.borrow().fd.get(&3).unwrap(),
            "/home/alice/notes.txt"
        );
    }

    #[test]
    fn test_failed_open_records_nothing() {
        let (tracee, process) = setup();
        tracee.map_str(0x1000, "/missing");
        let (registry, _) = register();
        let handler = registry.get(OPEN).unwrap();

        let msg = run(handler, &tracee, &process, regs(OPEN, &[0x1000, 0, 0]), -2).unwrap();
        assert!(msg.payload.is_known());
        assert!(process.resources.borrow().fd.is_empty());
        assert!(!(handler.should_send.unwrap())(&msg));
    }

    #[test]
    fn test_openat2_reads_open_how() {
        let (tracee, process) = setup();
        tracee.map_str(0x1000, "/etc/shadow");
        let mut how = Vec::new();
        how.extend_from_slice(&(libc::O_WRONLY as u64).to_ne_bytes());
        how.extend_from_slice(&0o600u64.to_ne_bytes());
        how.extend_from_slice(&0u64.to_ne_bytes());
        tracee.map(0x2000, &how);
        let (registry, _) = register();

        let args = [AT_FDCWD as i64 as u64, 0x1000, 0x2000, 24];
        let msg = run(registry.get(OPENAT2).unwrap(), &tracee, &process, regs(OPENAT2, &args), 4).unwrap();
        let SyscallPayload::Open(open) = msg.payload else {
            panic!("expected open");
        };
        assert_eq!(open.flags, libc::O_WRONLY as u32);
        assert_eq!(open.mode, 0o600);
    }

    #[test]
    fn test_unlinkat_removedir_is_rmdir() {
        let (tracee, process) = setup();
        tracee.map_str(0x1000, "build");
        let (registry, _) = register();
        let handler = registry.get(UNLINKAT).unwrap();

        let args = [AT_FDCWD as i64 as u64, 0x1000, AT_REMOVEDIR];
        let msg = run(handler, &tracee, &process, regs(UNLINKAT, &args), 0).unwrap();
        assert!(matches!(msg.payload, SyscallPayload::Rmdir(ref m) if m.dir.path == "/home/alice/build"));

        let args = [AT_FDCWD as i64 as u64, 0x1000, 0];
        let msg = run(handler, &tracee, &process, regs(UNLINKAT, &args), 0).unwrap();
        assert!(matches!(msg.payload, SyscallPayload::Unlink(_)));
    }

    #[test]
    fn test_renameat_against_dirfd() {
        let (tracee, process) = setup();
        process.resources.borrow_mut().fd.insert(7, "/var/lib".to_string());
        tracee.map_str(0x1000, "a");
        tracee.map_str(0x1100, "/tmp/b");
        let (registry, _) = register();

        let args = [7, 0x1000, AT_FDCWD as i64 as u64, 0x1100];
        let msg = run(registry.get(RENAMEAT).unwrap(), &tracee, &process, regs(RENAMEAT, &args), 0).unwrap();
        let SyscallPayload::Rename(rename) = msg.payload else {
            panic!("expected rename");
        };
        assert_eq!(rename.old.path, "/var/lib/a");
        assert_eq!(rename.new.path, "/tmp/b");
    }

    #[test]
    fn test_symlink_target_is_verbatim() {
        let (tracee, process) = setup();
        tracee.map_str(0x1000, "../target");
        tracee.map_str(0x1100, "link");
        let (registry, _) = register();

        let msg = run(registry.get(SYMLINK).unwrap(), &tracee, &process, regs(SYMLINK, &[0x1000, 0x1100]), 0).unwrap();
        let SyscallPayload::Link(link) = msg.payload else {
            panic!("expected link");
        };
        assert!(link.symbolic);
        assert_eq!(link.target.path, "../target");
        assert_eq!(link.link.path, "/home/alice/link");
    }

    #[test]
    fn test_chown_keeps_unchanged_marker() {
        let (tracee, process) = setup();
        tracee.map_str(0x1000, "/srv/data");
        let (registry, _) = register();

        let args = [0x1000, u32::MAX as u64, 50];
        let msg = run(registry.get(CHOWN).unwrap(), &tracee, &process, regs(CHOWN, &args), 0).unwrap();
        let SyscallPayload::Chown(chown) = msg.payload else {
            panic!("expected chown");
        };
        assert_eq!(chown.uid, -1);
        assert_eq!(chown.gid, 50);
        assert_eq!(chown.user, None);
    }

    #[test]
    fn test_utimensat_null_path_uses_dirfd() {
        let (tracee, process) = setup();
        process.resources.borrow_mut().fd.insert(4, "/srv/file".to_string());
        let (registry, _) = register();

        let msg = run(registry.get(UTIMENSAT).unwrap(), &tracee, &process, regs(UTIMENSAT, &[4, 0, 0, 0]), 0).unwrap();
        assert!(matches!(msg.payload, SyscallPayload::Utimes(ref m) if m.file.path == "/srv/file"));
    }

    #[test]
    fn test_fd_bookkeeping() {
        let (tracee, process) = setup();
        process.resources.borrow_mut().fd.insert(3, "/a".to_string());
        let (registry, _) = register();

        run(registry.get(DUP).unwrap(), &tracee, &process, regs(DUP, &[3]), 5).unwrap();
        assert_eq!(process.resources.borrow().fd.get(&5).unwrap(), "/a");

        let args = [3, libc::F_DUPFD_CLOEXEC as u64, 10];
        run(registry.get(FCNTL).unwrap(), &tracee, &process, regs(FCNTL, &args), 10).unwrap();
        assert_eq!(process.resources.borrow().fd.get(&10).unwrap(), "/a");

        run(registry.get(CLOSE).unwrap(), &tracee, &process, regs(CLOSE, &[3]), 0).unwrap();
        assert!(!process.resources.borrow().fd.contains_key(&3));
        assert!(process.resources.borrow().fd.contains_key(&5));
    }

    #[test]
    fn test_unreadable_path_fails_entry() {
        let (tracee, process) = setup();
        let (registry, _) = register();
        let err = run(registry.get(UNLINK).unwrap(), &tracee, &process, regs(UNLINK, &[0xdead]), 0);
        assert!(err.is_err());
    }
}
