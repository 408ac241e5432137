//! UDP Send Engine (C4): SPEC_FULL.md §4.4.
//!
//! `sendmsg_pump` drains `write_queue` into the kernel one datagram at a time (UDP sends are
//! atomic — there is no partial write to account for), capped by how many sends are already
//! in flight so `write_pending_queue` can't grow without bound under backpressure.

use std::mem::{offset_of, size_of, MaybeUninit};
use std::net::SocketAddr;
use std::os::unix::ffi::OsStrExt;

use io_uring::{opcode, types};
use tracing::trace;

use crate::ring::RingContext;
use crate::submitter::{self, push_sqe};
use crate::tag::Tag;
use crate::udp::{CompletedSend, Destination, PendingSend, SendOutcome, SendRequest, UdpHandle};

/// Cap on concurrently in-flight sends per handle, independent of `sync_limit`: this bounds how
/// much kernel-owned `msghdr`/buffer memory one handle can pin down at once.
pub const MAX_INFLIGHT_SENDS: usize = 16;

/// Fill a `sockaddr_storage` from a [`Destination`], family-sized (SPEC_FULL.md §4.4's
/// "family-based msghdr sizing" — an IPv4 destination only ever needs a `sockaddr_in`, not the
/// full `sockaddr_in6`-sized buffer). Returns `None` for [`Destination::Unspecified`]: the caller
/// leaves `msg_name` null so the kernel sends to the socket's connected peer instead.
fn fill_sockaddr(dest: &Destination, storage: &mut libc::sockaddr_storage) -> Option<libc::socklen_t> {
    match dest {
        Destination::Unspecified => None,
        Destination::Ip(SocketAddr::V4(v4)) => {
            let mut sin: libc::sockaddr_in = unsafe { MaybeUninit::zeroed().assume_init() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.ip().octets()),
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin as *const _ as *const u8,
                    storage as *mut _ as *mut u8,
                    size_of::<libc::sockaddr_in>(),
                );
            }
            Some(size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        Destination::Ip(SocketAddr::V6(v6)) => {
            let mut sin6: libc::sockaddr_in6 = unsafe { MaybeUninit::zeroed().assume_init() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr = libc::in6_addr {
                s6_addr: v6.ip().octets(),
            };
            sin6.sin6_scope_id = v6.scope_id();
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin6 as *const _ as *const u8,
                    storage as *mut _ as *mut u8,
                    size_of::<libc::sockaddr_in6>(),
                );
            }
            Some(size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
        Destination::Unix(path) => {
            let bytes = path.as_os_str().as_bytes();
            let mut sun: libc::sockaddr_un = unsafe { MaybeUninit::zeroed().assume_init() };
            sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
            assert!(
                bytes.len() < sun.sun_path.len(),
                "unix socket path longer than sun_path can hold"
            );
            for (slot, byte) in sun.sun_path.iter_mut().zip(bytes.iter()) {
                *slot = *byte as libc::c_char;
            }
            let len = offset_of!(libc::sockaddr_un, sun_path) + bytes.len() + 1;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sun as *const _ as *const u8,
                    storage as *mut _ as *mut u8,
                    size_of::<libc::sockaddr_un>(),
                );
            }
            Some(len as libc::socklen_t)
        }
    }
}

/// Pop queued sends and submit as many `sendmsg` SQEs as `MAX_INFLIGHT_SENDS` allows
/// (SPEC_FULL.md §4.4). `handle_index` is this handle's own slot in the loop-global `UdpTable`;
/// it travels in the tag alongside the per-handle `write_pending_queue` key so the dispatcher can
/// recover both the handle and the pending send from a single CQE — the two index spaces are
/// otherwise unrelated and must never be confused for one another.
pub fn sendmsg_pump(ctx: &mut RingContext, handle_index: usize, handle: &mut UdpHandle) -> std::io::Result<()> {
    while handle.write_pending_queue.len() < MAX_INFLIGHT_SENDS {
        let request = match handle.write_queue.pop_front() {
            Some(r) => r,
            None => break,
        };

        let mut addr = Box::new(unsafe { MaybeUninit::<libc::sockaddr_storage>::zeroed().assume_init() });
        let addrlen = fill_sockaddr(&request.dest, &mut addr);

        let mut iov = Box::new(libc::iovec {
            iov_base: request.data.as_ptr() as *mut libc::c_void,
            iov_len: request.data.len(),
        });

        let mut msghdr: Box<libc::msghdr> = Box::new(unsafe { MaybeUninit::zeroed().assume_init() });
        // SPEC_FULL.md §4.4: "set the address pointer to null when family is unspecified" — an
        // unspecified destination sends to the socket's connected peer.
        match addrlen {
            Some(len) => {
                msghdr.msg_name = addr.as_mut() as *mut _ as *mut libc::c_void;
                msghdr.msg_namelen = len;
            }
            None => {
                msghdr.msg_name = std::ptr::null_mut();
                msghdr.msg_namelen = 0;
            }
        }
        msghdr.msg_iov = iov.as_mut() as *mut libc::iovec;
        msghdr.msg_iovlen = 1;

        let entry = opcode::SendMsg::new(types::Fd(handle.fd), msghdr.as_ref() as *const libc::msghdr)
            .build();

        let pending = PendingSend {
            dest: request.dest,
            data: request.data,
            msghdr,
            iov,
            addr,
        };
        let pending_index = handle.write_pending_queue.insert(pending);
        let entry = entry.user_data(Tag::udp_send(handle_index, pending_index).encode());

        let queue_depth = submitter::pending_len(ctx);
        let entry = submitter::with_offload_policy(entry, queue_depth, ctx.sync_limit());
        push_sqe(ctx, entry)?;
        trace!(fd = handle.fd, handle_index, pending_index, "sendmsg submitted");
    }
    Ok(())
}

/// Resolve a `sendmsg` CQE: requeue at the front of `write_queue` on `EAGAIN`/`EWOULDBLOCK`/
/// `ENOBUFS` (the kernel's send buffer is momentarily full, not a real failure), otherwise record
/// it on `write_completed_queue` (SPEC_FULL.md §4.4).
pub fn sendmsg_done(handle: &mut UdpHandle, index: usize, result: i32) {
    let pending = match handle.write_pending_queue.try_remove(index) {
        Some(p) => p,
        None => return, // stale completion, slot already gone
    };

    if result < 0 {
        let errno = -result;
        if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK || errno == libc::ENOBUFS {
            trace!(fd = handle.fd, errno, "sendmsg requeued");
            handle.write_queue.push_front(SendRequest { dest: pending.dest, data: pending.data });
            return;
        }
        handle.write_completed_queue.push_back(CompletedSend {
            dest: pending.dest,
            outcome: SendOutcome::Err(std::io::Error::from_raw_os_error(errno)),
        });
        return;
    }

    handle.write_completed_queue.push_back(CompletedSend {
        dest: pending.dest,
        outcome: SendOutcome::Sent(result as usize),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_v4_roundtrips_port_and_family() {
        let dest: Destination = "127.0.0.1:4242".parse::<SocketAddr>().unwrap().into();
        let mut storage = unsafe { MaybeUninit::<libc::sockaddr_storage>::zeroed().assume_init() };
        let len = fill_sockaddr(&dest, &mut storage).unwrap();
        assert_eq!(len as usize, size_of::<libc::sockaddr_in>());
        assert_eq!(storage.ss_family as i32, libc::AF_INET);
    }

    #[test]
    fn sockaddr_v6_roundtrips_family() {
        let dest: Destination = "[::1]:4242".parse::<SocketAddr>().unwrap().into();
        let mut storage = unsafe { MaybeUninit::<libc::sockaddr_storage>::zeroed().assume_init() };
        let len = fill_sockaddr(&dest, &mut storage).unwrap();
        assert_eq!(len as usize, size_of::<libc::sockaddr_in6>());
        assert_eq!(storage.ss_family as i32, libc::AF_INET6);
    }

    #[test]
    fn unspecified_destination_leaves_address_unfilled() {
        let mut storage = unsafe { MaybeUninit::<libc::sockaddr_storage>::zeroed().assume_init() };
        assert!(fill_sockaddr(&Destination::Unspecified, &mut storage).is_none());
    }

    #[test]
    fn unix_domain_destination_sizes_by_path_length() {
        let dest = Destination::Unix(std::path::PathBuf::from("/tmp/test.sock"));
        let mut storage = unsafe { MaybeUninit::<libc::sockaddr_storage>::zeroed().assume_init() };
        let len = fill_sockaddr(&dest, &mut storage).unwrap();
        assert_eq!(storage.ss_family as i32, libc::AF_UNIX);
        assert_eq!(
            len as usize,
            offset_of!(libc::sockaddr_un, sun_path) + "/tmp/test.sock".len() + 1
        );
    }

    fn dummy_pending(dest: Destination, data: Vec<u8>) -> PendingSend {
        let mut addr = Box::new(unsafe { MaybeUninit::<libc::sockaddr_storage>::zeroed().assume_init() });
        fill_sockaddr(&dest, &mut addr);
        let iov = Box::new(libc::iovec {
            iov_base: data.as_ptr() as *mut libc::c_void,
            iov_len: data.len(),
        });
        let msghdr = Box::new(unsafe { MaybeUninit::<libc::msghdr>::zeroed().assume_init() });
        PendingSend { dest, data, msghdr, iov, addr }
    }

    /// S4 — send requeue: `ENOBUFS` returns the request to `write_queue`; a later success moves
    /// it to `write_completed_queue` exactly once.
    #[test]
    fn enobufs_requeues_then_succeeds_exactly_once() {
        let mut handle = UdpHandle::new(9);
        let dest: Destination = "127.0.0.1:9000".parse::<SocketAddr>().unwrap().into();
        let index = handle.write_pending_queue.insert(dummy_pending(dest, vec![1, 2, 3]));

        sendmsg_done(&mut handle, index, -(libc::ENOBUFS));
        assert!(handle.write_pending_queue.is_empty());
        assert_eq!(handle.write_queue.len(), 1);
        assert!(handle.write_completed_queue.is_empty());

        let requeued = handle.write_queue.pop_front().unwrap();
        let index = handle.write_pending_queue.insert(dummy_pending(requeued.dest, requeued.data));
        sendmsg_done(&mut handle, index, 3);

        assert!(handle.write_pending_queue.is_empty());
        assert!(handle.write_queue.is_empty());
        assert_eq!(handle.write_completed_queue.len(), 1);
        match &handle.write_completed_queue[0].outcome {
            SendOutcome::Sent(n) => assert_eq!(*n, 3),
            SendOutcome::Err(e) => panic!("unexpected error: {e}"),
        }
    }
}
