//! SQE Allocator / Submitter (C2): SPEC_FULL.md §4.2.
//!
//! The teacher's `SubmissionQueue::push` (`tokio-rs/io-uring` `src/squeue.rs`) returns a
//! `PushError` when the ring-buffer is full rather than blocking or auto-draining; `Submitter`
//! (`src/submit.rs`) separately wraps the `io_uring_enter` syscall. This module is the glue the
//! spec asks for between the two: callers never see a full queue, because [`push_sqe`]
//! transparently submits the pending batch and retries exactly once.

use io_uring::{squeue, IoUring};
use tracing::{trace, warn};

use crate::ring::RingContext;

/// `get_sqe()` + "prepare" from SPEC_FULL.md §4.2, collapsed into one call since this crate's
/// entries are built value-first (the `opcode::*::build()` pattern from the teacher) rather than
/// filled in place.
///
/// Auto-submits and retries once if the in-memory SQ is full; a second failure is the "second
/// SQ-full after retry" programmer error from SPEC_FULL.md §7, and is treated as such (`panic!`)
/// rather than silently dropped, since it can only happen if the SQ capacity is smaller than the
/// number of operations a single tick tries to arm.
pub fn push_sqe(ctx: &mut RingContext, entry: squeue::Entry) -> std::io::Result<()> {
    unsafe {
        if ctx.ring_mut().submission().push(&entry).is_ok() {
            return Ok(());
        }
    }
    trace!("submission queue full, auto-submitting before retry");
    submit(ctx)?;
    unsafe {
        ctx.ring_mut()
            .submission()
            .push(&entry)
            .expect("submission queue still full immediately after a drain submit");
    }
    Ok(())
}

/// `submit()` from SPEC_FULL.md §4.2: 0 without a syscall if nothing is pending, 0 (not an
/// error) if the kernel reports busy, otherwise the submitted count or a propagated error.
pub fn submit(ctx: &mut RingContext) -> std::io::Result<usize> {
    if ctx.ring_mut().submission().is_empty() {
        return Ok(0);
    }
    match ctx.ring().submit() {
        Ok(n) => Ok(n),
        Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
            warn!("io_uring submit reported busy; caller will drain CQ and retry");
            Ok(0)
        }
        Err(e) => Err(e),
    }
}

/// Whether a freshly prepared SQE should be marked async-offload, given how many SQEs are
/// already queued for submission (SPEC_FULL.md §4.2, §4.3.1, §4.4, §4.5).
#[inline]
pub fn should_offload(pending: usize, sync_limit: usize) -> bool {
    pending > sync_limit
}

/// Apply the async-offload hint to a freshly built entry.
pub fn with_offload_policy(entry: squeue::Entry, pending: usize, sync_limit: usize) -> squeue::Entry {
    if should_offload(pending, sync_limit) {
        entry.flags(squeue::Flags::ASYNC)
    } else {
        entry
    }
}

/// Current number of SQEs queued but not yet submitted to the kernel.
pub fn pending_len(ctx: &mut RingContext) -> usize {
    ctx.ring_mut().submission().len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offload_only_past_sync_limit() {
        assert!(!should_offload(40, 40));
        assert!(!should_offload(10, 40));
        assert!(should_offload(41, 40));
    }
}
