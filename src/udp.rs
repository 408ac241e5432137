//! UDP request/handle bookkeeping shared by the Send Engine (C4) and Receive Engine (C5)
//! (SPEC_FULL.md §3, §4.4, §4.5).
//!
//! `sendmsg`/`recvmsg` read their `msghdr`/`iovec`/address buffers asynchronously, so whatever
//! backs them has to outlive the SQE until its CQE arrives — the same constraint the teacher's
//! `examples/tcp_echo.rs` solves by keeping each connection's read/write buffers alive in its
//! token map for as long as an operation is outstanding. [`UdpHandle`] plays that role here: the
//! boxed `msghdr` for an in-flight send lives in `write_pending_queue`, and the boxed receive
//! buffer lives on the handle itself for as long as `READ_PENDING` is set.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use slab::Slab;

/// Receive buffer cap (SPEC_FULL.md §4.5): one UDP datagram is always read in full or not at all,
/// and 64 KiB is the largest a UDP payload can ever be.
pub const RECV_BUFFER_CAP: usize = 64 * 1024;

/// A send's destination (SPEC_FULL.md §3: "destination address (or unspecified, meaning use the
/// socket's connected peer)"; §4.4: "set destination address size by family (IPv4, IPv6, or
/// UNIX-domain — any other family is a fatal programmer error), or set the address pointer to
/// null when family is unspecified"). Closing the family enum over exactly these four cases turns
/// the spec's "any other family is a fatal programmer error" into something the type system rules
/// out rather than something `sendmsg_pump` has to assert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Ip(SocketAddr),
    Unix(PathBuf),
    /// Use the socket's connected peer; `msg_name` is left null.
    Unspecified,
}

impl From<SocketAddr> for Destination {
    fn from(addr: SocketAddr) -> Destination {
        Destination::Ip(addr)
    }
}

/// A queued outbound datagram, not yet handed to the kernel.
pub struct SendRequest {
    pub dest: Destination,
    pub data: Vec<u8>,
}

/// Outcome of a completed send, handed to the caller via `write_completed_queue`.
pub enum SendOutcome {
    Sent(usize),
    Err(std::io::Error),
}

pub struct CompletedSend {
    pub dest: Destination,
    pub outcome: SendOutcome,
}

/// An in-flight `sendmsg`: owns everything the kernel needs to keep dereferencing until the CQE
/// lands (SPEC_FULL.md §4.4).
pub(crate) struct PendingSend {
    pub dest: Destination,
    pub data: Vec<u8>,
    pub msghdr: Box<libc::msghdr>,
    pub iov: Box<libc::iovec>,
    pub addr: Box<libc::sockaddr_storage>,
}

/// Outcome of a completed receive.
pub struct ReceivedDatagram {
    pub from: SocketAddr,
    pub data: Vec<u8>,
    /// The kernel set `MSG_TRUNC`: more of the datagram existed than fit in the 64 KiB buffer
    /// (SPEC_FULL.md §4.5's `PARTIAL` flag). UDP datagrams already can't exceed that size, so in
    /// practice this only fires if the cap itself is ever lowered below a peer's payload.
    pub partial: bool,
}

/// One UDP socket's worth of send/receive state (SPEC_FULL.md §3).
pub struct UdpHandle {
    pub fd: RawFd,
    /// Queued, not yet attempted (SPEC_FULL.md §4.4).
    pub(crate) write_queue: VecDeque<SendRequest>,
    /// Submitted to the kernel, awaiting a CQE; keyed by the slab index packed into the SQE's
    /// `user_data` via `Tag::udp_send`.
    pub(crate) write_pending_queue: Slab<PendingSend>,
    /// Completed sends the caller hasn't picked up yet.
    pub write_completed_queue: VecDeque<CompletedSend>,
    /// `READ_PENDING` (SPEC_FULL.md §4.5): a `recvmsg` is currently armed for this handle. Gates
    /// `recvmsg_start` so at most one receive is ever in flight per socket.
    pub(crate) read_pending: bool,
    pub(crate) recv_buf: Option<Box<[u8]>>,
    pub(crate) recv_msghdr: Option<Box<libc::msghdr>>,
    pub(crate) recv_iov: Option<Box<libc::iovec>>,
    pub(crate) recv_addr: Option<Box<libc::sockaddr_storage>>,
}

impl UdpHandle {
    pub fn new(fd: RawFd) -> UdpHandle {
        UdpHandle {
            fd,
            write_queue: VecDeque::new(),
            write_pending_queue: Slab::new(),
            write_completed_queue: VecDeque::new(),
            read_pending: false,
            recv_buf: None,
            recv_msghdr: None,
            recv_iov: None,
            recv_addr: None,
        }
    }

    /// Queue a datagram for sending; `sendmsg_pump` drains this on the next tick.
    pub fn enqueue_send(&mut self, dest: impl Into<Destination>, data: Vec<u8>) {
        self.write_queue.push_back(SendRequest { dest: dest.into(), data });
    }

    pub fn is_read_pending(&self) -> bool {
        self.read_pending
    }
}

/// Slab-indexed table of UDP handles, packed into the SQE's `user_data` via `Tag::udp_recv`
/// (the send side is keyed per-handle, via each handle's own `write_pending_queue`).
#[derive(Default)]
pub struct UdpTable {
    slab: Slab<UdpHandle>,
}

impl UdpTable {
    pub fn new() -> UdpTable {
        UdpTable { slab: Slab::new() }
    }

    pub fn insert(&mut self, fd: RawFd) -> usize {
        self.slab.insert(UdpHandle::new(fd))
    }

    pub fn remove(&mut self, index: usize) -> Option<UdpHandle> {
        if self.slab.contains(index) {
            Some(self.slab.remove(index))
        } else {
            None
        }
    }

    pub fn get(&self, index: usize) -> Option<&UdpHandle> {
        self.slab.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut UdpHandle> {
        self.slab.get_mut(index)
    }

    pub fn contains(&self, index: usize) -> bool {
        self.slab.contains(index)
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    /// Indices of every occupied slot, for the same reason [`crate::watcher::WatcherTable::indices`]
    /// exists: `Slab` reuses freed slots out of order, so `0..len()` can both miss live handles
    /// past the reused gap and probe vacant slots within it.
    pub fn indices(&self) -> Vec<usize> {
        self.slab.iter().map(|(index, _)| index).collect()
    }
}
