//! Process handlers: exec, cwd, credentials, capabilities and kernel modules

use super::fim::stats_exit;
use super::{Handler, HandlerContext, HandlerError, Registry, AT_FDCWD};
use crate::proto::{
    CapsetMsg, ChdirMsg, ExecMsg, FileInfo, LoadModuleMsg, SetGidMsg, SetUidMsg, SyscallMsg,
    SyscallPayload, UnloadModuleMsg,
};
use crate::syscalls::*;

const AT_EMPTY_PATH: u64 = 0x1000;

/// Two `__user_cap_data_struct { effective, permitted, inheritable }`
const CAP_DATA_LEN: usize = 24;

pub(crate) fn register(registry: &mut Registry) {
    registry.insert(EXECVE, Handler::new(execve_entry).on_exit(stats_exit));
    registry.insert(EXECVEAT, Handler::new(execveat_entry).on_exit(stats_exit));
    registry.insert(CHDIR, Handler::new(chdir_entry).on_exit(chdir_exit));
    registry.insert(FCHDIR, Handler::new(fchdir_entry).on_exit(chdir_exit));

    registry.insert(SETUID, Handler::new(setuid_entry));
    registry.insert(SETREUID, Handler::new(setreuid_entry));
    registry.insert(SETRESUID, Handler::new(setresuid_entry));
    registry.insert(SETFSUID, Handler::new(setfsuid_entry));
    registry.insert(SETGID, Handler::new(setgid_entry));
    registry.insert(SETREGID, Handler::new(setregid_entry));
    registry.insert(SETRESGID, Handler::new(setresgid_entry));
    registry.insert(SETFSGID, Handler::new(setfsgid_entry));
    registry.insert(CAPSET, Handler::new(capset_entry));

    registry.insert(INIT_MODULE, Handler::new(init_module_entry));
    registry.insert(FINIT_MODULE, Handler::new(finit_module_entry).on_exit(stats_exit));
    registry.insert(DELETE_MODULE, Handler::new(delete_module_entry));
}

fn exec_msg(ctx: &HandlerContext<'_>, file: FileInfo, argv: u64, envp: u64) -> Result<SyscallPayload, HandlerError> {
    let (args, args_truncated) = ctx.tracee.read_string_array(ctx.pid, argv)?;
    let (envs, envs_truncated) = ctx.tracee.read_string_array(ctx.pid, envp)?;
    Ok(SyscallPayload::Exec(ExecMsg {
        file,
        args,
        args_truncated,
        envs,
        envs_truncated,
        credentials: None,
        ppid: None,
        from_procfs: false,
    }))
}

fn execve_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let file = ctx.path_arg(AT_FDCWD, 0)?;
    msg.payload = exec_msg(ctx, file, ctx.arg(1), ctx.arg(2))?;
    Ok(())
}

fn execveat_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let dirfd = ctx.arg_i32(0);
    let path = ctx.read_string(ctx.arg(1))?;
    let file = if path.is_empty() && ctx.arg(4) & AT_EMPTY_PATH != 0 {
        FileInfo::new(ctx.fd_path(dirfd)?)
    } else {
        FileInfo::new(ctx.resolve(dirfd, &path)?)
    };
    msg.payload = exec_msg(ctx, file, ctx.arg(2), ctx.arg(3))?;
    Ok(())
}

fn chdir_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let dir = ctx.path_arg(AT_FDCWD, 0)?;
    msg.payload = SyscallPayload::Chdir(ChdirMsg { dir });
    Ok(())
}

fn fchdir_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let dir = FileInfo::new(ctx.fd_path(ctx.arg_i32(0))?);
    msg.payload = SyscallPayload::Chdir(ChdirMsg { dir });
    Ok(())
}

fn chdir_exit(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    if msg.retval == 0 {
        if let SyscallPayload::Chdir(chdir) = &msg.payload {
            ctx.process.resources.borrow_mut().cwd = chdir.dir.path.clone();
        }
    }
    stats_exit(ctx, msg)
}

/// `-1` (as a 32-bit id) means "unchanged"
fn id_arg(ctx: &HandlerContext<'_>, index: usize) -> Option<u32> {
    let id = ctx.arg(index) as u32;
    (id != u32::MAX).then_some(id)
}

fn setuid_msg(ctx: &HandlerContext<'_>, uid: Option<u32>, euid: Option<u32>, fsuid: Option<u32>) -> SyscallPayload {
    let name = |id: Option<u32>| id.and_then(|id| ctx.user_name(id));
    SyscallPayload::SetUid(SetUidMsg {
        uid,
        euid,
        fsuid,
        user: name(uid),
        euser: name(euid),
        fsuser: name(fsuid),
    })
}

fn setgid_msg(ctx: &HandlerContext<'_>, gid: Option<u32>, egid: Option<u32>, fsgid: Option<u32>) -> SyscallPayload {
    let name = |id: Option<u32>| id.and_then(|id| ctx.group_name(id));
    SyscallPayload::SetGid(SetGidMsg {
        gid,
        egid,
        fsgid,
        group: name(gid),
        egroup: name(egid),
        fsgroup: name(fsgid),
    })
}

fn setuid_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let uid = id_arg(ctx, 0);
    msg.payload = setuid_msg(ctx, uid, uid, uid);
    Ok(())
}

fn setreuid_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    msg.payload = setuid_msg(ctx, id_arg(ctx, 0), id_arg(ctx, 1), None);
    Ok(())
}

fn setresuid_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    msg.payload = setuid_msg(ctx, id_arg(ctx, 0), id_arg(ctx, 1), None);
    Ok(())
}

fn setfsuid_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    msg.payload = setuid_msg(ctx, None, None, id_arg(ctx, 0));
    Ok(())
}

fn setgid_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let gid = id_arg(ctx, 0);
    msg.payload = setgid_msg(ctx, gid, gid, gid);
    Ok(())
}

fn setregid_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    msg.payload = setgid_msg(ctx, id_arg(ctx, 0), id_arg(ctx, 1), None);
    Ok(())
}

fn setresgid_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    msg.payload = setgid_msg(ctx, id_arg(ctx, 0), id_arg(ctx, 1), None);
    Ok(())
}

fn setfsgid_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    msg.payload = setgid_msg(ctx, None, None, id_arg(ctx, 0));
    Ok(())
}

fn capset_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let data = ctx.read_bytes(ctx.arg(1), CAP_DATA_LEN)?;
    let word = |offset: usize| -> Result<u64, HandlerError> {
        let raw: [u8; 4] = data[offset..offset + 4]
            .try_into()
            .map_err(|_| HandlerError::Malformed("cap data"))?;
        Ok(u32::from_ne_bytes(raw) as u64)
    };
    // low 32 capabilities in the first struct, high 32 in the second
    msg.payload = SyscallPayload::Capset(CapsetMsg {
        effective: word(0)? | word(12)? << 32,
        permitted: word(4)? | word(16)? << 32,
    });
    Ok(())
}

fn init_module_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let args = ctx.read_string(ctx.arg(2)).unwrap_or_default();
    msg.payload = SyscallPayload::LoadModule(LoadModuleMsg {
        file: None,
        name: String::new(),
        args,
        loaded_from_memory: true,
    });
    Ok(())
}

/// Module name from its object file: basename without the `.ko*` suffix
pub fn module_name(path: &str) -> String {
    let base = path.rsplit('/').next().unwrap_or(path);
    match base.find(".ko") {
        Some(idx) => base[..idx].to_string(),
        None => base.to_string(),
    }
}

fn finit_module_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let path = ctx.fd_path(ctx.arg_i32(0))?;
    let args = ctx.read_string(ctx.arg(1)).unwrap_or_default();
    msg.payload = SyscallPayload::LoadModule(LoadModuleMsg {
        name: module_name(&path),
        file: Some(FileInfo::new(path)),
        args,
        loaded_from_memory: false,
    });
    Ok(())
}

fn delete_module_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let name = ctx.read_string(ctx.arg(0))?;
    msg.payload = SyscallPayload::UnloadModule(UnloadModuleMsg { name });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::register;
    use crate::handlers::testing::{regs, run};
    use crate::memory::fake::FakeTracee;
    use crate::memory::MAX_ARRAY_LEN;
    use crate::process_table::Process;

    fn setup() -> (FakeTracee, Process) {
        let tracee = FakeTracee::new();
        tracee.set_cwd(20, "/opt/app");
        (tracee, Process::new(20, 20))
    }

    #[test]
    fn test_execve_reads_argv_and_envp() {
        let (tracee, process) = setup();
        tracee.map_str(0x1000, "./run.sh");
        tracee.map_str(0x1100, "run.sh");
        tracee.map_str(0x1200, "--fast");
        tracee.map_str(0x1300, "HOME=/root");
        tracee.map_ptrs(0x2000, &[0x1100, 0x1200]);
        tracee.map_ptrs(0x3000, &[0x1300]);
        let (registry, _) = register();

        let msg = run(registry.get(EXECVE).unwrap(), &tracee, &process, regs(EXECVE, &[0x1000, 0x2000, 0x3000]), 0).unwrap();
        let SyscallPayload::Exec(exec) = msg.payload else {
            panic!("expected exec");
        };
        assert_eq!(exec.file.path, "/opt/app/./run.sh");
        assert_eq!(exec.args, vec!["run.sh", "--fast"]);
        assert_eq!(exec.envs, vec!["HOME=/root"]);
        assert!(!exec.args_truncated && !exec.envs_truncated);
        assert!(!exec.from_procfs);
    }

    #[test]
    fn test_execve_truncates_huge_argv() {
        let (tracee, process) = setup();
        tracee.map_str(0x1000, "/bin/echo");
        tracee.map_ptrs(0x10000, &vec![0x1000; MAX_ARRAY_LEN + 1]);
        let (registry, _) = register();

        let msg = run(registry.get(EXECVE).unwrap(), &tracee, &process, regs(EXECVE, &[0x1000, 0x10000, 0]), 0).unwrap();
        let SyscallPayload::Exec(exec) = msg.payload else {
            panic!("expected exec");
        };
        assert!(exec.args_truncated);
        assert!(exec.envs.is_empty());
    }

    #[test]
    fn test_execveat_empty_path_uses_fd() {
        let (tracee, process) = setup();
        process.resources.borrow_mut().fd.insert(9, "/usr/bin/memfd".to_string());
        tracee.map_str(0x1000, "");
        let (registry, _) = register();

        let args = [9, 0x1000, 0, 0, AT_EMPTY_PATH];
        let msg = run(registry.get(EXECVEAT).unwrap(), &tracee, &process, regs(EXECVEAT, &args), 0).unwrap();
        assert!(matches!(msg.payload, SyscallPayload::Exec(ref e) if e.file.path == "/usr/bin/memfd"));
    }

    #[test]
    fn test_chdir_updates_cwd_on_success_only() {
        let (tracee, process) = setup();
        tracee.map_str(0x1000, "sub");
        let (registry, _) = register();
        let handler = registry.get(CHDIR).unwrap();

        run(handler, &tracee, &process, regs(CHDIR, &[0x1000]), -2).unwrap();
        assert_eq!(process.resources.borrow().cwd, "/opt/app");

        run(handler, &tracee, &process, regs(CHDIR, &[0x1000]), 0).unwrap();
        assert_eq!(process.resources.borrow().cwd, "/opt/app/sub");
    }

    #[test]
    fn test_setresuid_unchanged_ids() {
        let (tracee, process) = setup();
        let (registry, _) = register();
        let args = [u32::MAX as u64, 0, u32::MAX as u64];

        let msg = run(registry.get(SETRESUID).unwrap(), &tracee, &process, regs(SETRESUID, &args), 0).unwrap();
        let SyscallPayload::SetUid(setuid) = msg.payload else {
            panic!("expected setuid");
        };
        assert_eq!(setuid.uid, None);
        assert_eq!(setuid.euid, Some(0));
    }

    #[test]
    fn test_setgid_sets_all() {
        let (tracee, process) = setup();
        let (registry, _) = register();

        let msg = run(registry.get(SETGID).unwrap(), &tracee, &process, regs(SETGID, &[42]), 0).unwrap();
        let SyscallPayload::SetGid(setgid) = msg.payload else {
            panic!("expected setgid");
        };
        assert_eq!((setgid.gid, setgid.egid, setgid.fsgid), (Some(42), Some(42), Some(42)));
    }

    #[test]
    fn test_capset_combines_both_words() {
        let (tracee, process) = setup();
        let mut data = Vec::new();
        for word in [0x1u32, 0x2, 0, 0x10, 0x20, 0] {
            data.extend_from_slice(&word.to_ne_bytes());
        }
        tracee.map(0x4000, &data);
        let (registry, _) = register();

        let msg = run(registry.get(CAPSET).unwrap(), &tracee, &process, regs(CAPSET, &[0x3000, 0x4000]), 0).unwrap();
        let SyscallPayload::Capset(capset) = msg.payload else {
            panic!("expected capset");
        };
        assert_eq!(capset.effective, 0x1 | 0x10 << 32);
        assert_eq!(capset.permitted, 0x2 | 0x20 << 32);
    }

    #[test]
    fn test_finit_module() {
        let (tracee, process) = setup();
        process
            .resources
            .borrow_mut()
            .fd
            .insert(3, "/lib/modules/6.1/kernel/net/foo.ko.xz".to_string());
        tracee.map_str(0x1000, "debug=1");
        let (registry, _) = register();

        let msg = run(registry.get(FINIT_MODULE).unwrap(), &tracee, &process, regs(FINIT_MODULE, &[3, 0x1000, 0]), 0).unwrap();
        let SyscallPayload::LoadModule(load) = msg.payload else {
            panic!("expected load module");
        };
        assert_eq!(load.name, "foo");
        assert_eq!(load.args, "debug=1");
        assert!(!load.loaded_from_memory);
    }

    #[test]
    fn test_module_name() {
        assert_eq!(module_name("/x/y/bar.ko"), "bar");
        assert_eq!(module_name("bar"), "bar");
    }
}
