//! Shared test helpers, mirroring the shape of the teacher's own `tests/common/mod.rs`
//! (`REVIEW_DIFF.patch` `tests/common/mod.rs`): small fd-producing utilities plus a recording
//! [`uring_reactor::IoFeed`] implementation the scenario tests assert against.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use uring_reactor::{Interest, ReceivedDatagram};

/// `pipe(2)` wrapped for tests: returns `(read_fd, write_fd)`.
pub fn make_pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(ret, 0, "pipe(2) failed: {}", std::io::Error::last_os_error());
    (fds[0], fds[1])
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Readiness(RawFd, Interest),
    UdpSent(usize),
    UdpReceived(usize, bool /* ok */, bool /* partial */, usize /* len */),
}

/// Records every callback in arrival order, shared with the test body via `Rc<RefCell<_>>` since
/// `PlatformLoop` owns the feed by value.
#[derive(Default, Clone)]
pub struct RecordingFeed {
    pub events: Rc<RefCell<Vec<Event>>>,
}

impl RecordingFeed {
    pub fn new() -> RecordingFeed {
        RecordingFeed::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }
}

impl uring_reactor::IoFeed for RecordingFeed {
    fn on_readiness(&mut self, fd: RawFd, events: Interest) {
        self.events.borrow_mut().push(Event::Readiness(fd, events));
    }

    fn on_udp_sent(&mut self, handle_index: usize) {
        self.events.borrow_mut().push(Event::UdpSent(handle_index));
    }

    fn on_udp_received(&mut self, handle_index: usize, result: std::io::Result<ReceivedDatagram>) {
        let (ok, partial, len) = match &result {
            Ok(d) => (true, d.partial, d.data.len()),
            Err(_) => (false, false, 0),
        };
        self.events
            .borrow_mut()
            .push(Event::UdpReceived(handle_index, ok, partial, len));
    }
}

pub fn loopback_addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}
