//! Watcher table: the registry the Readiness Poller (C3) arms against and drains into
//! (SPEC_FULL.md §3, §4.3).
//!
//! Grounded on the teacher's `examples/tcp_echo.rs`, which keys its in-flight operations with a
//! `slab::Slab<Token>` rather than embedding a pointer in `user_data`; this module generalizes
//! that pattern from "one slab per echo connection" to "one slab per registered fd interest" and
//! is the concrete storage behind [`crate::tag::Tag::Watcher`].

use bitflags::bitflags;
use slab::Slab;
use std::collections::VecDeque;
use std::os::unix::io::RawFd;

bitflags! {
    /// `pevents` from SPEC_FULL.md §3/§4.3: the readiness conditions a caller wants to be woken
    /// for. Named after the poll(2) field this ultimately compiles down to.
    pub struct Interest: u32 {
        const READABLE = 0b0001;
        const WRITABLE = 0b0010;
        const ERROR    = 0b0100;
        const HANGUP   = 0b1000;
    }
}

impl Interest {
    /// Translate to the `libc::POLL*` bits `opcode::PollAdd` expects. `io-uring = "0.6"` declares
    /// `PollAdd::new(fd, flags: u32)`, not the narrower width its own vendored notes suggest, so
    /// this returns `u32` to pass straight through with no cast at the call site.
    pub fn to_poll_mask(self) -> u32 {
        let mut mask = 0u32;
        if self.contains(Interest::READABLE) {
            mask |= libc::POLLIN as u32;
        }
        if self.contains(Interest::WRITABLE) {
            mask |= libc::POLLOUT as u32;
        }
        if self.contains(Interest::ERROR) {
            mask |= libc::POLLERR as u32;
        }
        if self.contains(Interest::HANGUP) {
            mask |= libc::POLLHUP as u32;
        }
        mask
    }

    /// Translate a completed `poll_mask` result (CQE `result` for `PollAdd`) back to `Interest`.
    pub fn from_poll_result(result: u32) -> Interest {
        let mut interest = Interest::empty();
        if result & (libc::POLLIN as u32) != 0 {
            interest |= Interest::READABLE;
        }
        if result & (libc::POLLOUT as u32) != 0 {
            interest |= Interest::WRITABLE;
        }
        if result & (libc::POLLERR as u32) != 0 {
            interest |= Interest::ERROR;
        }
        if result & (libc::POLLHUP as u32) != 0 {
            interest |= Interest::HANGUP;
        }
        interest
    }
}

/// A single registered interest in a file descriptor's readiness (SPEC_FULL.md §4.3).
pub struct Watcher {
    pub fd: RawFd,
    pub pevents: Interest,
    /// One-shot watchers are removed from the table as soon as they fire once; non-one-shot
    /// watchers are rearmed by the poller on every drain (§4.3.3).
    pub oneshot: bool,
    /// Readiness bits observed on the most recent completion, cleared once the caller consumes
    /// them. `None` until the first completion arrives.
    pub events: Option<Interest>,
    /// `PollAdd` has not yet completed or been armed for this tick.
    armed: bool,
}

impl Watcher {
    fn new(fd: RawFd, pevents: Interest, oneshot: bool) -> Watcher {
        Watcher {
            fd,
            pevents,
            oneshot,
            events: None,
            armed: false,
        }
    }
}

/// Slab-indexed table of watchers plus the queue of newly registered (or rearm-pending) slots
/// that still need a `PollAdd` SQE pushed for them (SPEC_FULL.md §4.3.1's "arm" phase).
#[derive(Default)]
pub struct WatcherTable {
    slab: Slab<Watcher>,
    pending: VecDeque<usize>,
}

impl WatcherTable {
    pub fn new() -> WatcherTable {
        WatcherTable {
            slab: Slab::new(),
            pending: VecDeque::new(),
        }
    }

    /// Register a new watcher and queue it for arming on the next poller tick. Returns the slab
    /// index, which is also what gets packed into the SQE's `user_data` via `Tag::watcher`.
    pub fn register(&mut self, fd: RawFd, pevents: Interest, oneshot: bool) -> usize {
        let index = self.slab.insert(Watcher::new(fd, pevents, oneshot));
        self.pending.push_back(index);
        index
    }

    /// Remove a watcher outright (SPEC_FULL.md §4.6, FD Invalidation): any CQE that later arrives
    /// tagged with this index decodes to a stale, already-discarded slot.
    pub fn remove(&mut self, index: usize) -> Option<Watcher> {
        if self.slab.contains(index) {
            Some(self.slab.remove(index))
        } else {
            None
        }
    }

    pub fn get(&self, index: usize) -> Option<&Watcher> {
        self.slab.get(index)
    }

    pub fn contains(&self, index: usize) -> bool {
        self.slab.contains(index)
    }

    /// Drain the set of slots waiting to be armed this tick.
    pub fn take_pending(&mut self) -> Vec<usize> {
        self.pending.drain(..).collect()
    }

    /// Requeue a non-one-shot watcher for rearming after its completion has been delivered.
    pub fn requeue(&mut self, index: usize) {
        if self.slab.contains(index) {
            self.pending.push_back(index);
        }
    }

    pub fn mark_armed(&mut self, index: usize) {
        if let Some(w) = self.slab.get_mut(index) {
            w.armed = true;
        }
    }

    pub fn is_armed(&self, index: usize) -> bool {
        self.slab.get(index).map_or(false, |w| w.armed)
    }

    /// Record a completion's readiness bits, returning the watcher's fd and whether it should be
    /// rearmed (non-one-shot) or dropped from the table (one-shot) by the caller.
    pub fn complete(&mut self, index: usize, result: u32) -> Option<(RawFd, bool)> {
        let watcher = self.slab.get_mut(index)?;
        watcher.events = Some(Interest::from_poll_result(result));
        watcher.armed = false;
        let fd = watcher.fd;
        let should_rearm = !watcher.oneshot;
        Some((fd, should_rearm))
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    /// Indices of every occupied slot. `Slab` reuses freed slots but does not keep them
    /// contiguous with `len()`, so anything that must visit "every live watcher" (termination,
    /// invalidation) has to walk this rather than `0..len()`.
    pub fn indices(&self) -> Vec<usize> {
        self.slab.iter().map(|(index, _)| index).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_queues_for_arming() {
        let mut table = WatcherTable::new();
        let idx = table.register(3, Interest::READABLE, true);
        assert_eq!(table.take_pending(), vec![idx]);
        assert!(table.take_pending().is_empty());
    }

    #[test]
    fn oneshot_completion_signals_no_rearm() {
        let mut table = WatcherTable::new();
        let idx = table.register(3, Interest::READABLE, true);
        table.take_pending();
        table.mark_armed(idx);
        let (fd, rearm) = table.complete(idx, libc::POLLIN as u32).unwrap();
        assert_eq!(fd, 3);
        assert!(!rearm);
    }

    #[test]
    fn persistent_completion_signals_rearm() {
        let mut table = WatcherTable::new();
        let idx = table.register(3, Interest::READABLE, false);
        table.take_pending();
        let (_, rearm) = table.complete(idx, libc::POLLIN as u32).unwrap();
        assert!(rearm);
        table.requeue(idx);
        assert_eq!(table.take_pending(), vec![idx]);
    }

    #[test]
    fn removed_slot_is_gone() {
        let mut table = WatcherTable::new();
        let idx = table.register(3, Interest::READABLE, true);
        table.remove(idx);
        assert!(!table.contains(idx));
        assert!(table.complete(idx, libc::POLLIN as u32).is_none());
    }

    #[test]
    fn poll_mask_roundtrip() {
        let interest = Interest::READABLE | Interest::ERROR;
        let mask = interest.to_poll_mask();
        assert_eq!(Interest::from_poll_result(mask), interest);
    }
}
