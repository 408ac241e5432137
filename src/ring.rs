//! Ring Context (C1): owns the kernel ring handle and the async-offload tuning knob.
//!
//! Grounded on the teacher's own `IoUring`/`Builder` split (`tokio-rs/io-uring` `src/lib.rs`):
//! a `Builder` carries setup flags, `Builder::build(entries)` performs `io_uring_setup` and the
//! mmaps, and the resulting `IoUring` owns the SQ/CQ memory for as long as it lives. This wrapper
//! adds nothing to that lifecycle beyond the `sync_limit` knob and the single-accessor rule from
//! SPEC_FULL.md §4.1 ("the context must be consulted through a single accessor so the rest of
//! the code need not know its storage").

use io_uring::IoUring;
use tracing::debug;

use crate::error::RingInitError;

/// Default submission-queue depth (SPEC_FULL.md §3, §6 "Tuning").
pub const DEFAULT_SQ_ENTRIES: u32 = 4096;

/// Default async-offload threshold (SPEC_FULL.md §3, §6 "Tuning").
pub const DEFAULT_SYNC_LIMIT: usize = 40;

/// Owns the kernel ring for the lifetime of the enclosing event loop.
///
/// Invariant (SPEC_FULL.md §3): valid for the entire loop lifetime; no operation may outlive it.
/// Enforced here simply by the borrow checker — every component that touches the ring borrows
/// `RingContext` rather than cloning a raw fd.
pub struct RingContext {
    ring: IoUring,
    sync_limit: usize,
    /// The signal the wait phase should block for the duration of the wait syscall
    /// (SPEC_FULL.md §4.3.2's signal discipline). `None` means the wait is plain
    /// `submit_and_wait` with no signal masking at all.
    profiling_signal: Option<libc::c_int>,
}

impl RingContext {
    /// `init(loop) -> ok | out_of_memory | kernel_error` (SPEC_FULL.md §4.1).
    pub fn init(sq_entries: u32, sync_limit: usize) -> Result<RingContext, RingInitError> {
        let ring = IoUring::new(sq_entries)?;
        debug!(sq_entries, sync_limit, "io_uring ring context initialized");
        Ok(RingContext { ring, sync_limit, profiling_signal: None })
    }

    /// Single accessor for the ring handle (SPEC_FULL.md §4.1): the rest of the crate goes
    /// through this rather than holding its own copy of the fd or mmaps.
    #[inline]
    pub fn ring(&self) -> &IoUring {
        &self.ring
    }

    #[inline]
    pub fn ring_mut(&mut self) -> &mut IoUring {
        &mut self.ring
    }

    #[inline]
    pub fn sync_limit(&self) -> usize {
        self.sync_limit
    }

    pub fn set_sync_limit(&mut self, sync_limit: usize) {
        self.sync_limit = sync_limit;
    }

    #[inline]
    pub fn profiling_signal(&self) -> Option<libc::c_int> {
        self.profiling_signal
    }

    /// Configure the signal the wait phase should block around each wait syscall
    /// (SPEC_FULL.md §4.3.2). Pass `None` to disable the signal discipline entirely.
    pub fn set_profiling_signal(&mut self, sig: Option<libc::c_int>) {
        self.profiling_signal = sig;
    }
}

// `destroy(loop)` (SPEC_FULL.md §4.1) is `Drop`: `IoUring`'s own `Drop` unmaps the rings and
// closes the fd, so there is nothing left to release here. The "no public operation may be
// invoked between destroy and a subsequent init" rule is enforced by ownership: once a
// `RingContext` is dropped, there is no handle left through which to call anything.
