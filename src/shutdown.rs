//! Cancellation and termination-signal capture
//!
//! SIGINT, SIGTERM and SIGQUIT are caught with a handler installed without
//! `SA_RESTART`, so a trace thread blocked in `waitpid` wakes up with `EINTR`
//! and can observe the request. Background threads block these signals so the
//! trace thread is the one interrupted.

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const SHUTDOWN_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGQUIT];

const SLEEP_SLICE: Duration = Duration::from_millis(50);

static RECEIVED: AtomicI32 = AtomicI32::new(0);

extern "C" fn record_signal(signal: libc::c_int) {
    RECEIVED.store(signal, Ordering::SeqCst);
}

/// Shared stop flag for the trace loop, the proc scanner and the writer
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    cancelled: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` or until cancelled. Returns `true` if cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

/// Restores the previous dispositions when dropped
pub struct SignalGuard {
    previous: Vec<(Signal, SigAction)>,
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        for (signal, action) in self.previous.drain(..) {
            // SAFETY: restoring a disposition previously returned by sigaction
            unsafe {
                let _ = sigaction(signal, &action);
            }
        }
    }
}

/// Catch the shutdown signals for the lifetime of the returned guard
pub fn install_signal_handlers() -> nix::Result<SignalGuard> {
    let action = SigAction::new(
        SigHandler::Handler(record_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );

    let mut guard = SignalGuard {
        previous: Vec::with_capacity(SHUTDOWN_SIGNALS.len()),
    };
    for signal in SHUTDOWN_SIGNALS {
        // SAFETY: the handler only stores into an atomic
        let previous = unsafe { sigaction(signal, &action)? };
        guard.previous.push((signal, previous));
    }
    Ok(guard)
}

/// The shutdown signal received since the last call, if any
pub fn take_signal() -> Option<Signal> {
    match RECEIVED.swap(0, Ordering::SeqCst) {
        0 => None,
        raw => Signal::try_from(raw).ok(),
    }
}

/// Block the shutdown signals on the calling thread
pub fn block_signals() -> nix::Result<()> {
    let mut set = SigSet::empty();
    for signal in SHUTDOWN_SIGNALS {
        set.add(signal);
    }
    set.thread_block()
}
