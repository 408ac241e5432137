//! Readiness Poller (C3): SPEC_FULL.md §4.3.
//!
//! Implements the arm/wait/drain/terminate cycle. The deadline itself is a `Timeout` SQE tagged
//! with [`crate::tag::TIMEOUT_SENTINEL`], submitted alongside everything else, rather than the
//! wait syscall's own `ts` ext-arg — one bounded-wait mechanism instead of feature-detecting two.
//! The signal mask is different: when the loop has a profiling signal configured
//! (`RingContext::profiling_signal`), the wait step uses the teacher's
//! `Submitter::submit_with_args` (`src/submit.rs`) to pass a `libc::sigset_t` as the kernel-atomic
//! `sigmask` ext-arg, *and* pairs it with an explicit process-wide `pthread_sigmask` block/unblock
//! around the same call, so that a signal delivered between the liveness check and the blocking
//! syscall can't be missed even if the wait primitive early-returns before installing its own mask
//! (SPEC_FULL.md §4.3.2's "double discipline"). With no profiling signal configured, the wait is
//! plain `submit_and_wait` and no signal masking happens at all.

use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;
use std::time::Instant;

use io_uring::{opcode, types};
use tracing::{trace, warn};

use crate::ring::RingContext;
use crate::submitter::{self, push_sqe};
use crate::tag::{Tag, TIMEOUT_SENTINEL};
use crate::watcher::{Interest, WatcherTable};

/// Outcome of [`wait`]. SPEC_FULL.md §9's Open Question on EAGAIN/ETIME spelling is resolved by
/// folding both into `TimedOut`: callers never need to distinguish "kernel says try again" from
/// "our own timeout elapsed", only whether the wait produced new completions to drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    TimedOut,
}

/// A decoded, dispatch-ready completion. The poller recognizes `Watcher` tags itself (that's
/// its job); `UdpSend`/`UdpRecv` tags are handed back raw for C4/C5 to interpret, since only
/// those engines know the requeue-on-EAGAIN and self-rearm rules for their own result codes.
pub enum Completion {
    Ready {
        fd: RawFd,
        events: Interest,
        rearm: bool,
        watcher_index: usize,
    },
    UdpSend {
        handle: usize,
        pending: usize,
        result: i32,
    },
    UdpRecv {
        index: usize,
        result: i32,
    },
}

/// Push a `PollAdd` SQE for every watcher slot registered or rearmed since the last tick
/// (SPEC_FULL.md §4.3.1).
pub fn arm(ctx: &mut RingContext, watchers: &mut WatcherTable) -> std::io::Result<()> {
    for index in watchers.take_pending() {
        let fd = match watchers.get(index) {
            Some(w) => w.fd,
            None => continue, // removed before it could be armed
        };
        let pevents = watchers.get(index).unwrap().pevents;
        let entry = opcode::PollAdd::new(types::Fd(fd), pevents.to_poll_mask())
            .build()
            .user_data(Tag::watcher(index).encode());
        let pending = submitter::pending_len(ctx);
        let entry = submitter::with_offload_policy(entry, pending, ctx.sync_limit());
        push_sqe(ctx, entry)?;
        watchers.mark_armed(index);
    }
    Ok(())
}

/// Block until at least one completion is ready or `deadline` (`None` = wait indefinitely)
/// elapses, retrying transparently on `EINTR` and recomputing the remaining wait from `deadline`
/// on every retry rather than restarting the full timeout (SPEC_FULL.md §4.3.2's drift
/// correction). A `deadline` already in the past performs one non-blocking poll of the CQ
/// (`timeout_ms == 0` at the public API).
pub fn wait(ctx: &mut RingContext, deadline: Option<Instant>) -> std::io::Result<WaitOutcome> {
    if !ctx.ring_mut().completion().is_empty() {
        return Ok(WaitOutcome::Ready);
    }

    if let Some(deadline) = deadline {
        if Instant::now() >= deadline {
            submitter::submit(ctx)?;
            return Ok(WaitOutcome::TimedOut);
        }
    }

    let mut timeout_sqe_pushed = false;

    loop {
        if let Some(deadline) = deadline {
            if !timeout_sqe_pushed {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let ts = types::Timespec::new()
                    .sec(remaining.as_secs())
                    .nsec(remaining.subsec_nanos());
                let entry = opcode::Timeout::new(&ts as *const _)
                    .build()
                    .user_data(TIMEOUT_SENTINEL);
                push_sqe(ctx, entry)?;
                timeout_sqe_pushed = true;
            }
        }

        submitter::submit(ctx)?;

        let enter_result = match ctx.profiling_signal() {
            Some(sig) => {
                let (sigmask, old) = block_signal(sig)?;
                let args = types::SubmitArgs::new().sigmask(&sigmask);
                let result = ctx.ring().submitter().submit_with_args(1, &args);
                unblock_signals(old)?;
                result
            }
            None => ctx.ring().submit_and_wait(1),
        };

        match enter_result {
            Ok(_) => return Ok(WaitOutcome::Ready),
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => {
                trace!("io_uring wait interrupted by signal, retrying");
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        return Ok(WaitOutcome::TimedOut);
                    }
                }
                continue;
            }
            Err(e)
                if e.raw_os_error() == Some(libc::ETIME) || e.raw_os_error() == Some(libc::EAGAIN) =>
            {
                return Ok(WaitOutcome::TimedOut);
            }
            Err(e) => {
                warn!(error = %e, "io_uring wait failed");
                return Err(e);
            }
        }
    }
}

/// Block exactly the loop's configured profiling signal process-wide, returning both the sigset
/// (for the wait syscall's own kernel-atomic sigmask argument) and the prior mask (to restore
/// afterward). SPEC_FULL.md §4.3.2 requires both this `pthread_sigmask` guard *and* the ext-arg
/// sigmask passed to `submit_with_args` — the wait primitive can return early without ever having
/// installed its own mask, so the process-wide block is what actually closes the "signal arrives
/// between the liveness check and the blocking syscall" race; the ext-arg sigmask only narrows
/// what's unblocked while the kernel is parked waiting. Scoped to the one configured signal,
/// not `sigfillset`, so this never interferes with unrelated signal delivery elsewhere in the
/// embedding process.
fn block_signal(sig: libc::c_int) -> std::io::Result<(libc::sigset_t, libc::sigset_t)> {
    unsafe {
        let mut set: libc::sigset_t = MaybeUninit::zeroed().assume_init();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, sig);
        let mut old: libc::sigset_t = MaybeUninit::zeroed().assume_init();
        if libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut old) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok((set, old))
    }
}

fn unblock_signals(old: libc::sigset_t) -> std::io::Result<()> {
    unsafe {
        if libc::pthread_sigmask(libc::SIG_SETMASK, &old, std::ptr::null_mut()) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Drain every completed CQE, decode its tag, and return dispatch-ready [`Completion`]s with
/// signal-fd watcher readiness sorted to the back of the batch (SPEC_FULL.md §4.3.3).
pub fn drain(ctx: &mut RingContext, watchers: &mut WatcherTable, signal_fds: &[RawFd]) -> Vec<Completion> {
    let mut ready = Vec::new();
    let mut signal_ready = Vec::new();

    let mut cq = ctx.ring_mut().completion();
    cq.sync();
    for cqe in &mut cq {
        let user_data = cqe.user_data();
        match Tag::decode(user_data) {
            Tag::Zero => continue, // fire-and-forget (poll-remove) or our own timeout sentinel
            Tag::Watcher(index) => {
                let result = cqe.result();
                if let Some((fd, rearm)) = watchers.complete(index, result.max(0) as u32) {
                    // SPEC_FULL.md §4.3.3: "mask events by pevents | error | hangup" — a
                    // watcher never sees readiness bits outside what it asked for, plus error
                    // and hangup, which the kernel reports unsolicited.
                    let pevents = watchers.get(index).map(|w| w.pevents).unwrap_or(Interest::empty());
                    let raw = watchers.get(index).and_then(|w| w.events).unwrap_or(Interest::empty());
                    let events = raw & (pevents | Interest::ERROR | Interest::HANGUP);
                    let item = Completion::Ready { fd, events, rearm, watcher_index: index };
                    if signal_fds.contains(&fd) {
                        signal_ready.push(item);
                    } else {
                        ready.push(item);
                    }
                }
                // else: stale, watcher already removed (SPEC_FULL.md §4.6) — dropped silently
            }
            Tag::UdpSend { handle, pending } => {
                ready.push(Completion::UdpSend { handle, pending, result: cqe.result() })
            }
            Tag::UdpRecv(index) => ready.push(Completion::UdpRecv { index, result: cqe.result() }),
        }
    }

    ready.extend(signal_ready);
    ready
}

/// Tear down every still-armed watcher by posting a zero-tagged `PollRemove` for each
/// (SPEC_FULL.md §4.3.4), then clear the table. Called once, at loop shutdown.
pub fn terminate(ctx: &mut RingContext, watchers: &mut WatcherTable) -> std::io::Result<()> {
    for index in watchers.indices() {
        if watchers.is_armed(index) {
            let entry = opcode::PollRemove::new(Tag::watcher(index).encode())
                .build()
                .user_data(Tag::Zero.encode());
            push_sqe(ctx, entry)?;
        }
    }
    submitter::submit(ctx)?;
    *watchers = WatcherTable::new();
    Ok(())
}
