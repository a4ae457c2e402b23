//! Control channel over `ioctl`
//!
//! An instrumented application talks to the tracer by issuing an `ioctl` with
//! a magic request number. The argument points at a request buffer whose first
//! byte is the operation. The only operation handled here registers a span TLS
//! area:
//!
//! ```text
//! ┌────┬────────────┬─────────────────┬───────────┐
//! │ op │ format: u64│ max_threads: u64│ base: u64 │
//! └────┴────────────┴─────────────────┴───────────┘
//! ```
//!
//! The area holds `max_threads` slots of `{span_id, trace_id_lo, trace_id_hi}`,
//! and a thread's slot is `tid % max_threads`.

use crate::memory::{MemoryError, Tracee};
use crate::process_table::SpanTls;
use crate::proto::SpanContext;
use crate::tracer::SyscallRegs;

/// ioctl request number of the control channel
pub const ERPC_REQUEST: u32 = 0xdead_c001;

/// Operation byte of a span TLS registration
pub const REGISTER_SPAN_TLS_OP: u8 = 6;

const REGISTER_SPAN_TLS_LEN: usize = 25;
const SPAN_SLOT_LEN: u64 = 24;

/// Decode a span TLS registration from an `ioctl` entry, if it is one
pub fn span_registration(tracee: &dyn Tracee, pid: i32, regs: &SyscallRegs) -> Result<Option<SpanTls>, MemoryError> {
    if regs.arg(1) as u32 != ERPC_REQUEST {
        return Ok(None);
    }

    let req = tracee.read_exact(pid, regs.arg(2), 1)?;
    if req[0] != REGISTER_SPAN_TLS_OP {
        return Ok(None);
    }

    let req = tracee.read_exact(pid, regs.arg(2), REGISTER_SPAN_TLS_LEN)?;
    let field = |offset: usize| {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&req[offset..offset + 8]);
        u64::from_ne_bytes(raw)
    };
    Ok(Some(SpanTls {
        format: field(1),
        max_threads: field(9),
        base: field(17),
    }))
}

/// Read the current span of thread `tid` from its group's TLS area.
///
/// An unset slot (all zeroes) or an unreadable one yields `None`.
pub fn fill_span_context(tracee: &dyn Tracee, tid: i32, span: &SpanTls) -> Option<SpanContext> {
    if span.max_threads == 0 {
        return None;
    }

    let offset = (tid as u64 % span.max_threads) * SPAN_SLOT_LEN;
    let slot = tracee
        .read_exact(tid, span.base.checked_add(offset)?, SPAN_SLOT_LEN as usize)
        .ok()?;
    let word = |index: usize| {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&slot[index * 8..index * 8 + 8]);
        u64::from_ne_bytes(raw)
    };

    let context = SpanContext {
        span_id: word(0),
        trace_id_lo: word(1),
        trace_id_hi: word(2),
    };
    (context != SpanContext::default()).then_some(context)
}
