//! `PlatformLoop`: glues C1-C5 and FD invalidation into the four operations the embedding
//! cross-platform event loop calls (SPEC_FULL.md §2, §6): `platform_loop_init`,
//! `platform_loop_delete`, `platform_invalidate_fd`, and `io_poll` (plus `io_check_fd`, which
//! doesn't need a live loop).

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::collab::{Allocator, HeapAllocator, IdleTimeTracker, IoFeed, LoopClock, SystemClock};
use crate::error::{FdCheckError, RingInitError};
use crate::invalidate::invalidate_fd;
use crate::poller::{self, Completion, WaitOutcome};
use crate::ring::{RingContext, DEFAULT_SQ_ENTRIES, DEFAULT_SYNC_LIMIT};
use crate::udp::{ReceivedDatagram, UdpTable};
use crate::udp_recv;
use crate::udp_send;
use crate::watcher::{Interest, WatcherTable};

/// `io_check_fd(fd) -> ok | invalid | other` (SPEC_FULL.md §6): cheap liveness probe that doesn't
/// require a live loop, using `fcntl(F_GETFD)` the way a caller would sanity-check an fd before
/// handing it to `platform_invalidate_fd` or a fresh watcher registration.
pub fn io_check_fd(fd: RawFd) -> Result<(), FdCheckError> {
    let ret = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if ret == -1 {
        Err(std::io::Error::last_os_error().into())
    } else {
        Ok(())
    }
}

/// Owns the ring, the watcher table, and the UDP handle table for one event loop's lifetime
/// (SPEC_FULL.md §2, §5: single-threaded, cooperative — no method here is safe to call from more
/// than one thread at a time).
pub struct PlatformLoop<F, I, A = HeapAllocator, C = SystemClock> {
    ring: RingContext,
    watchers: WatcherTable,
    udp: UdpTable,
    signal_fds: Vec<RawFd>,
    feed: F,
    idle: I,
    allocator: A,
    clock: C,
}

impl<F: IoFeed, I: IdleTimeTracker> PlatformLoop<F, I, HeapAllocator, SystemClock> {
    /// `platform_loop_init(loop)` (SPEC_FULL.md §4.1, §6): builds the ring context with the
    /// default tuning from SPEC_FULL.md §3, an empty watcher/UDP table, the default heap-backed
    /// receive-buffer allocator, and the system clock. Use [`PlatformLoop::init_with`] to supply a
    /// pooling allocator or an embedder-owned clock instead.
    pub fn init(feed: F, idle: I) -> Result<Self, RingInitError> {
        Self::init_with(
            DEFAULT_SQ_ENTRIES,
            DEFAULT_SYNC_LIMIT,
            feed,
            idle,
            HeapAllocator::default(),
            SystemClock::default(),
        )
    }
}

impl<F: IoFeed, I: IdleTimeTracker, A: Allocator, C: LoopClock> PlatformLoop<F, I, A, C> {
    pub fn init_with(
        sq_entries: u32,
        sync_limit: usize,
        feed: F,
        idle: I,
        allocator: A,
        clock: C,
    ) -> Result<Self, RingInitError> {
        let ring = RingContext::init(sq_entries, sync_limit)?;
        Ok(PlatformLoop {
            ring,
            watchers: WatcherTable::new(),
            udp: UdpTable::new(),
            signal_fds: Vec::new(),
            feed,
            idle,
            allocator,
            clock,
        })
    }

    /// Mark `fd` as a signal-delivery source (e.g. a `signalfd`) so its readiness is dispatched
    /// last within a drain batch (SPEC_FULL.md §4.3.3).
    pub fn mark_signal_fd(&mut self, fd: RawFd) {
        self.signal_fds.push(fd);
    }

    /// Configure the profiling signal the wait phase should block around each wait syscall
    /// (SPEC_FULL.md §4.3.2). Pass `None` (the default) to disable the signal discipline.
    pub fn set_profiling_signal(&mut self, sig: Option<libc::c_int>) {
        self.ring.set_profiling_signal(sig);
    }

    pub fn register_watcher(&mut self, fd: RawFd, pevents: Interest, oneshot: bool) -> usize {
        self.watchers.register(fd, pevents, oneshot)
    }

    pub fn open_udp_handle(&mut self, fd: RawFd) -> usize {
        self.udp.insert(fd)
    }

    pub fn udp_send(&mut self, handle_index: usize, dest: impl Into<crate::udp::Destination>, data: Vec<u8>) {
        if let Some(handle) = self.udp.get_mut(handle_index) {
            handle.enqueue_send(dest, data);
        }
    }

    /// `udp_recvmsg(handle)` (SPEC_FULL.md §4.5, §6): arm a receive if one isn't already pending.
    /// If the allocator is exhausted (SPEC_FULL.md §4.5 step 2), the synthesized `ENOBUFS`
    /// completion is delivered through [`IoFeed::on_udp_received`] immediately, the same channel
    /// a real completion would use, rather than as an `Err` from this call.
    pub fn udp_start_receiving(&mut self, handle_index: usize) -> std::io::Result<()> {
        if let Some(handle) = self.udp.get_mut(handle_index) {
            if let Some(result) =
                udp_recv::recvmsg_start(&mut self.ring, handle, handle_index, &mut self.allocator)?
            {
                self.feed.on_udp_received(handle_index, result);
            }
        }
        Ok(())
    }

    /// `platform_invalidate_fd(loop, fd)` (SPEC_FULL.md §4.6, §6).
    pub fn invalidate_fd(&mut self, fd: RawFd) -> std::io::Result<()> {
        invalidate_fd(&mut self.ring, &mut self.watchers, &mut self.udp, fd)
    }

    /// `io_poll(loop, timeout_ms)` (SPEC_FULL.md §4.3, §6): `timeout_ms` is `-1` (block
    /// indefinitely), `0` (non-blocking), or a positive millisecond bound. Repeats the
    /// arm/wait/drain cycle per §4.3.4's termination rules — returning as soon as any completion
    /// fired, immediately if `timeout_ms == 0` regardless of outcome, or once the deadline has
    /// elapsed — and returns the number of callbacks invoked.
    pub fn io_poll(&mut self, timeout_ms: i64) -> std::io::Result<usize> {
        for index in self.udp.indices() {
            self.pump_udp_sends(index)?;
        }

        let deadline = match timeout_ms {
            -1 => None,
            ms if ms >= 0 => Some(Instant::now() + Duration::from_millis(ms as u64)),
            _ => return Err(std::io::Error::from_raw_os_error(libc::EINVAL)),
        };

        loop {
            poller::arm(&mut self.ring, &mut self.watchers)?;
            // SPEC_FULL.md §4.3.1: "After submission, refresh the loop's monotonic clock (the
            // submit syscall may be long)." `arm` just submitted; sampling the injected clock
            // here is that refresh — an embedder's `LoopClock` can use the read as the trigger to
            // update its own cached `ev_now` rather than this crate doing so on its behalf.
            let _ = self.clock.now();

            let started = Instant::now();
            let outcome = poller::wait(&mut self.ring, deadline)?;
            self.idle.record_idle(started.elapsed());

            if outcome == WaitOutcome::TimedOut {
                return Ok(0);
            }

            let completions = poller::drain(&mut self.ring, &mut self.watchers, &self.signal_fds);
            let nevents = completions.len();
            for completion in completions {
                self.dispatch(completion)?;
            }

            if nevents > 0 || timeout_ms == 0 {
                return Ok(nevents);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(0);
                }
            }
        }
    }

    fn pump_udp_sends(&mut self, handle_index: usize) -> std::io::Result<()> {
        if let Some(handle) = self.udp.get_mut(handle_index) {
            udp_send::sendmsg_pump(&mut self.ring, handle_index, handle)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, completion: Completion) -> std::io::Result<()> {
        match completion {
            Completion::Ready { fd, events, rearm, watcher_index } => {
                self.feed.on_readiness(fd, events);
                if rearm {
                    self.watchers.requeue(watcher_index);
                }
            }
            Completion::UdpSend { handle, pending, result } => {
                if let Some(udp_handle) = self.udp.get_mut(handle) {
                    udp_send::sendmsg_done(udp_handle, pending, result);
                }
                self.feed.on_udp_sent(handle);
                self.pump_udp_sends(handle)?;
            }
            Completion::UdpRecv { index, result } => {
                let outcome: Option<(Option<std::io::Result<ReceivedDatagram>>, bool)> =
                    self.udp.get_mut(index).map(|handle| udp_recv::recvmsg_done(handle, result));
                if let Some((datagram, should_rearm)) = outcome {
                    if let Some(datagram) = datagram {
                        self.feed.on_udp_received(index, datagram);
                    }
                    if should_rearm {
                        self.udp_start_receiving(index)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// `platform_loop_delete(loop)` (SPEC_FULL.md §4.1, §4.3.4, §6): tear down every armed
    /// watcher before the ring itself is dropped.
    pub fn delete(mut self) -> std::io::Result<()> {
        poller::terminate(&mut self.ring, &mut self.watchers)?;
        debug!("platform loop deleted");
        Ok(())
    }
}
