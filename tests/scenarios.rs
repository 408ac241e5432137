//! End-to-end scenario tests from SPEC_FULL.md §8 (S1, S2, S3's echo half, S5, S6), placed under
//! `tests/` the way the teacher places its own ring-level behavioral tests (`REVIEW_DIFF.patch`
//! `tests/poll.rs`, `tests/tcp.rs`) rather than inline `#[cfg(test)]`, since each one drives a
//! real kernel ring rather than a single function. S3's truncation half, S4, and the drain-order
//! unit underlying S6 are instead exercised as plain unit tests next to the code they cover,
//! since they don't need a real ring to demonstrate (see `src/udp_recv.rs`, `src/udp_send.rs`).

#![cfg(target_os = "linux")]

mod common;

use std::net::UdpSocket;
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use uring_reactor::{Interest, NullIdleTracker, PlatformLoop};

use common::{make_pipe, loopback_addr, Event, RecordingFeed};

fn new_loop() -> (PlatformLoop<RecordingFeed, NullIdleTracker>, RecordingFeed) {
    let feed = RecordingFeed::new();
    let observer = feed.clone();
    let loop_ = PlatformLoop::init(feed, NullIdleTracker::default())
        .expect("ring init should succeed in test environment");
    (loop_, observer)
}

/// S1 — readiness one-shot: a watcher fires exactly once per write and rearms itself.
#[test]
fn s1_readiness_fires_once_per_write_and_rearms() {
    let (mut loop_, observer) = new_loop();
    let (read_fd, write_fd) = make_pipe();
    loop_.register_watcher(read_fd, Interest::READABLE, false);

    let n = unsafe { libc::write(write_fd, b"x".as_ptr() as *const _, 1) };
    assert_eq!(n, 1);

    let nevents = loop_.io_poll(-1).unwrap();
    assert_eq!(nevents, 1);

    let mut byte = [0u8; 1];
    unsafe { libc::read(read_fd, byte.as_mut_ptr() as *mut _, 1) };

    let n = unsafe { libc::write(write_fd, b"y".as_ptr() as *const _, 1) };
    assert_eq!(n, 1);
    let nevents = loop_.io_poll(-1).unwrap();
    assert_eq!(nevents, 1);

    let readiness_count = observer
        .events()
        .iter()
        .filter(|e| matches!(e, Event::Readiness(fd, _) if *fd == read_fd))
        .count();
    assert_eq!(readiness_count, 2);

    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
}

/// S2 — timeout drift: a bounded wait with nothing ready returns in [timeout, timeout + slack].
#[test]
fn s2_timeout_returns_within_bound() {
    let (mut loop_, _observer) = new_loop();
    let started = Instant::now();
    let nevents = loop_.io_poll(100).unwrap();
    let elapsed = started.elapsed();
    assert_eq!(nevents, 0);
    assert!(elapsed >= Duration::from_millis(100), "returned too early: {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(200), "returned too late: {elapsed:?}");
}

/// S3 (echo half) — a 13-byte datagram is delivered whole, unpartial, with the peer populated.
#[test]
fn s3_udp_echo_exact_size() {
    let (mut loop_, observer) = new_loop();
    let local = UdpSocket::bind(loopback_addr(0)).unwrap();
    let local_addr = local.local_addr().unwrap();
    let peer = UdpSocket::bind(loopback_addr(0)).unwrap();

    let handle = loop_.open_udp_handle(local.as_raw_fd());
    loop_.udp_start_receiving(handle).unwrap();

    peer.send_to(&[7u8; 13], local_addr).unwrap();

    loop_.io_poll(-1).unwrap();

    let events = observer.events();
    assert_eq!(events.len(), 1);
    match &events[0] {
        Event::UdpReceived(idx, ok, partial, len) => {
            assert_eq!(*idx, handle);
            assert!(*ok);
            assert!(!*partial);
            assert_eq!(*len, 13);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

/// S4 — send requeue, two handles: a send completion must be attributed to the handle that sent
/// it, not whichever handle happens to share the completed request's pending-slab index. Opening
/// the second handle before the first sends anything guarantees their `UdpTable` indices and
/// pending-send indices diverge, so a tag that only carried one of the two would route this send
/// to the wrong handle (or to none at all).
#[test]
fn s4_send_completion_attributed_to_correct_handle_among_several() {
    let (mut loop_, observer) = new_loop();
    let first_local = UdpSocket::bind(loopback_addr(0)).unwrap();
    let second_local = UdpSocket::bind(loopback_addr(0)).unwrap();
    let peer = UdpSocket::bind(loopback_addr(0)).unwrap();
    let peer_addr = peer.local_addr().unwrap();

    let first_handle = loop_.open_udp_handle(first_local.as_raw_fd());
    let second_handle = loop_.open_udp_handle(second_local.as_raw_fd());

    // Only the second handle sends, so if the completion were (mis)routed by a pending-slab
    // index that happens to collide with `first_handle`'s table slot, it would land there
    // instead.
    loop_.udp_send(second_handle, peer_addr, vec![9u8; 5]);

    loop_.io_poll(-1).unwrap();

    let events = observer.events();
    let sent: Vec<_> = events.iter().filter(|e| matches!(e, Event::UdpSent(_))).collect();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0], &Event::UdpSent(second_handle));
    assert_ne!(first_handle, second_handle);
}

/// S5 — fd invalidation race: closing an fd and invalidating it before any completion suppresses
/// the callback entirely.
#[test]
fn s5_invalidated_fd_produces_no_callback() {
    let (mut loop_, _observer) = new_loop();
    let (read_fd, write_fd) = make_pipe();
    loop_.register_watcher(read_fd, Interest::READABLE, false);

    unsafe { libc::close(read_fd) };
    loop_.invalidate_fd(read_fd).unwrap();

    let nevents = loop_.io_poll(0).unwrap();
    assert_eq!(nevents, 0);

    unsafe { libc::close(write_fd) };
}

/// S6 — signal watcher ordering: a regular watcher's callback precedes the signal-multiplexer
/// watcher's within the same drain, even though both completions arrived together.
#[test]
fn s6_signal_watcher_dispatched_last() {
    let (mut loop_, observer) = new_loop();
    let (regular_read, regular_write) = make_pipe();
    let (signal_read, signal_write) = make_pipe();

    loop_.register_watcher(regular_read, Interest::READABLE, false);
    loop_.register_watcher(signal_read, Interest::READABLE, false);
    loop_.mark_signal_fd(signal_read);

    unsafe {
        libc::write(regular_write, b"a".as_ptr() as *const _, 1);
        libc::write(signal_write, b"b".as_ptr() as *const _, 1);
    }

    let nevents = loop_.io_poll(-1).unwrap();
    assert_eq!(nevents, 2);

    let events = observer.events();
    let regular_pos = events
        .iter()
        .position(|e| matches!(e, Event::Readiness(fd, _) if *fd == regular_read))
        .expect("regular watcher should have fired");
    let signal_pos = events
        .iter()
        .position(|e| matches!(e, Event::Readiness(fd, _) if *fd == signal_read))
        .expect("signal watcher should have fired");
    assert!(regular_pos < signal_pos, "signal watcher must dispatch last");

    unsafe {
        libc::close(regular_read);
        libc::close(regular_write);
        libc::close(signal_read);
        libc::close(signal_write);
    }
}
