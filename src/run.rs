//! Tracing entry points: attach to running pids, or wrap a command
//!
//! Both set up a [`Tracer`], a [`Transport`] to the collector and a
//! [`Session`], then drive the trace loop on the calling thread until the
//! traced tree is gone or a shutdown signal arrives.

use crate::config::TracerOptions;
use crate::container;
use crate::handlers::{self, Registry};
use crate::memory::LiveTracee;
use crate::proc_scan::{ProcScanner, Snapshot};
use crate::proto::{HelloMsg, Message, Mode};
use crate::session::{Session, SessionSettings};
use crate::shutdown::{self, Cancellation};
use crate::tracer::Tracer;
use crate::transport::Transport;
use crate::users::UserDb;
use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long queued events may take to reach the collector at the end
const FLUSH_GRACE: Duration = Duration::from_secs(1);

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn lookup_path(name: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

/// Resolve the command to run: through `PATH` when it has no slash, made
/// absolute, and required to be a regular executable file
pub fn check_entry_point(name: &str) -> Result<PathBuf> {
    if name.is_empty() {
        bail!("An executable is required");
    }

    let path = if name.contains('/') {
        PathBuf::from(name)
    } else {
        lookup_path(name).ok_or_else(|| anyhow!("{} not found in PATH", name))?
    };
    let path = if path.is_absolute() {
        path
    } else {
        env::current_dir()
            .context("Failed to get current directory")?
            .join(path)
    };

    let meta = fs::metadata(&path).with_context(|| format!("Cannot access {}", path.display()))?;
    if !meta.is_file() {
        bail!("{} is not a regular file", path.display());
    }
    if meta.permissions().mode() & 0o111 == 0 {
        bail!("{} is not executable", path.display());
    }
    Ok(path)
}

/// Attach to running processes and stream their events
pub fn attach(pids: &[i32], probe_addr: Option<&str>, mut options: TracerOptions) -> Result<()> {
    // seccomp needs the filter installed by the tracee itself
    options.seccomp_disabled = true;

    let _signals = shutdown::install_signal_handlers().context("Failed to install signal handlers")?;
    let cancel = Cancellation::new();

    info!(?pids, "attaching");
    let tracer = Tracer::attach(pids, cancel.clone())?;
    let (registry, _) = handlers::register();

    run_session(tracer, registry, Mode::Attached, Vec::new(), probe_addr, options, cancel)
}

/// Run `argv` under the tracer and stream its events
pub fn wrap(argv: &[String], envp: &[String], probe_addr: Option<&str>, options: TracerOptions) -> Result<()> {
    let Some(name) = argv.first() else {
        bail!("An executable is required");
    };
    let entry = check_entry_point(name)?;

    let (registry, names) = handlers::register();
    let seccomp = options.seccomp().cloned();
    info!(
        entry = %entry.display(),
        mode = if seccomp.is_some() { "seccomp" } else { "standard" },
        "wrapping"
    );

    let _signals = shutdown::install_signal_handlers().context("Failed to install signal handlers")?;
    let cancel = Cancellation::new();

    // fork before any thread of ours exists
    let install = seccomp.map(|installer| move || installer(names.as_slice()));
    let tracer = Tracer::spawn(
        &entry,
        argv,
        envp,
        &options.creds,
        install.as_ref().map(|f| f as &dyn Fn() -> io::Result<()>),
        cancel.clone(),
    )?;

    run_session(tracer, registry, Mode::Wrapped, argv.to_vec(), probe_addr, options, cancel)
}

fn run_session(
    mut tracer: Tracer,
    registry: Registry,
    mode: Mode,
    entrypoint_args: Vec<String>,
    probe_addr: Option<&str>,
    mut options: TracerOptions,
    cancel: Cancellation,
) -> Result<()> {
    let procfs = options.procfs.clone();
    let container_context = container::container_context(&procfs);
    let container_id = container_context.id.clone();
    let hello = Message::Hello(HelloMsg {
        mode,
        ns_id: container::namespace_id(&procfs),
        container_context,
        entrypoint_args,
    });

    let transport = match probe_addr {
        Some(addr) => Transport::start(&options.transport_config(addr), &hello)?,
        None => Transport::disabled(&hello, options.verbose),
    };
    let outbox = transport.outbox();

    let users = Arc::new(UserDb::new(options.user_db.clone()));
    let snapshot = Snapshot {
        procfs: procfs.clone(),
        users: Arc::clone(&users),
        stats_disabled: options.stats_disabled,
        container_id: container_id.clone(),
    };
    let settings = SessionSettings {
        container_id,
        creds: options.creds,
        stats_disabled: options.stats_disabled,
        users,
    };
    let mut session = Session::new(LiveTracee::new(procfs), registry, tracer.pids(), settings, outbox.clone());

    if mode == Mode::Attached {
        for &pid in tracer.pids() {
            let msg = snapshot
                .describe(pid)
                .with_context(|| format!("Failed to capture PID {} from procfs", pid))?;
            outbox.send(&msg);
        }
    }

    let scanner = if options.proc_scan_disabled {
        None
    } else {
        let scanner = ProcScanner::new(snapshot, outbox.clone(), options.scan_proc_every);
        Some(scanner.spawn(cancel.clone()).context("Failed to start proc scanner")?)
    };
    drop(outbox);

    if let Some(cb) = options.attached_cb.take() {
        cb();
    }

    let result = trace_loop(&mut tracer, &mut session);
    if let Err(e) = &result {
        error!("trace loop failed: {:#}", e);
    }

    cancel.cancel();
    if let Some(handle) = scanner {
        if handle.join().is_err() {
            warn!("proc scanner panicked");
        }
    }
    drop(session);
    if !transport.shutdown(FLUSH_GRACE) {
        warn!("some events may not have reached the collector");
    }

    result
}

fn trace_loop(tracer: &mut Tracer, session: &mut Session<LiveTracee>) -> Result<()> {
    while let Some(event) = tracer.next_event()? {
        session.handle(event);
    }
    if session.table().is_empty() {
        debug!("trace loop finished");
    } else {
        debug!(remaining = session.table().len(), "trace loop stopped with live tracees");
    }
    Ok(())
}
