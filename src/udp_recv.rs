//! UDP Receive Engine (C5): SPEC_FULL.md §4.5.
//!
//! One `recvmsg` in flight per handle at a time, gated by `READ_PENDING`; a completion rearms the
//! next receive itself (self-rearm) unless the handle has been torn down in the meantime.

use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use io_uring::{opcode, types};
use tracing::trace;

use crate::collab::Allocator;
use crate::ring::RingContext;
use crate::submitter::{self, push_sqe};
use crate::tag::Tag;
use crate::udp::{ReceivedDatagram, UdpHandle, RECV_BUFFER_CAP};

/// Arm a `recvmsg` for this handle if one isn't already pending (SPEC_FULL.md §4.5's
/// `READ_PENDING` gate). No-op, not an error, if a receive is already in flight.
///
/// The receive buffer comes from the caller-supplied [`Allocator`] (SPEC_FULL.md §4.5 step 2,
/// §6's "allocation callback provider on each UDP handle") rather than being hardcoded here. A
/// null or zero-length buffer is not an I/O error — it means the embedder's pool is exhausted —
/// so it is reported through the same `recvmsg_done`-shaped `(datagram, rearm)` channel as a real
/// completion, tagged `ENOBUFS`, instead of as a `Result` from this function.
pub fn recvmsg_start(
    ctx: &mut RingContext,
    handle: &mut UdpHandle,
    index: usize,
    allocator: &mut dyn Allocator,
) -> std::io::Result<Option<std::io::Result<ReceivedDatagram>>> {
    if handle.read_pending {
        return Ok(None);
    }

    let mut buf = allocator.allocate(RECV_BUFFER_CAP);
    if buf.is_empty() {
        trace!(fd = handle.fd, "allocator returned no buffer, synthesizing ENOBUFS");
        return Ok(Some(Err(std::io::Error::from_raw_os_error(libc::ENOBUFS))));
    }

    let mut addr: Box<libc::sockaddr_storage> =
        Box::new(unsafe { MaybeUninit::zeroed().assume_init() });

    let mut iov = Box::new(libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    });

    let mut msghdr: Box<libc::msghdr> = Box::new(unsafe { MaybeUninit::zeroed().assume_init() });
    msghdr.msg_name = addr.as_mut() as *mut _ as *mut libc::c_void;
    msghdr.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msghdr.msg_iov = iov.as_mut() as *mut libc::iovec;
    msghdr.msg_iovlen = 1;

    let entry = opcode::RecvMsg::new(types::Fd(handle.fd), msghdr.as_ref() as *const libc::msghdr as *mut _)
        .build()
        .user_data(Tag::udp_recv(index).encode());

    let queue_depth = submitter::pending_len(ctx);
    let entry = submitter::with_offload_policy(entry, queue_depth, ctx.sync_limit());
    push_sqe(ctx, entry)?;

    handle.read_pending = true;
    handle.recv_buf = Some(buf);
    handle.recv_msghdr = Some(msghdr);
    handle.recv_iov = Some(iov);
    handle.recv_addr = Some(addr);
    trace!(fd = handle.fd, "recvmsg armed");
    Ok(None)
}

fn sockaddr_to_socketaddr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as i32 {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_ne_bytes(sin.sin_addr.s_addr.to_ne_bytes()));
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Resolve a `recvmsg` CQE. Rewrites `EBADF` to `ECANCELED` (SPEC_FULL.md §4.5): a receive that
/// gets cancelled because its fd was invalidated out from under it (§4.6) should read as a clean
/// cancellation to the caller, not as "you gave me a bad file descriptor". Returns the datagram
/// (or error) and whether the caller should immediately rearm the next receive.
pub fn recvmsg_done(
    handle: &mut UdpHandle,
    result: i32,
) -> (Option<std::io::Result<ReceivedDatagram>>, bool) {
    let buf = handle.recv_buf.take();
    let msghdr = handle.recv_msghdr.take();
    let addr = handle.recv_addr.take();
    handle.recv_iov = None;
    handle.read_pending = false;

    if result < 0 {
        let errno = if -result == libc::EBADF { libc::ECANCELED } else { -result };
        let should_rearm = errno != libc::ECANCELED;
        return (Some(Err(std::io::Error::from_raw_os_error(errno))), should_rearm);
    }

    let (buf, msghdr, addr) = match (buf, msghdr, addr) {
        (Some(b), Some(m), Some(a)) => (b, m, a),
        _ => return (Some(Err(std::io::Error::from_raw_os_error(libc::EINVAL))), true),
    };

    let n = result as usize;
    let partial = msghdr.msg_flags & libc::MSG_TRUNC != 0;
    let from = match sockaddr_to_socketaddr(&addr) {
        Some(a) => a,
        None => return (Some(Err(std::io::Error::from_raw_os_error(libc::EAFNOSUPPORT))), true),
    };

    let datagram = ReceivedDatagram {
        from,
        data: buf[..n.min(buf.len())].to_vec(),
        partial,
    };
    (Some(Ok(datagram)), true)
}
