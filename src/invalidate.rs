//! FD Invalidation (SPEC_FULL.md §4.6).
//!
//! `platform_invalidate_fd` is called when the owner of an fd is about to close it (or already
//! has) while operations against it may still be outstanding in the ring. It removes the fd's
//! watcher entries — so any CQE that later arrives for them decodes through
//! [`crate::watcher::WatcherTable::complete`] as "not found" and is dropped by
//! [`crate::poller::drain`] — and posts a zero-tagged `PollRemove` so C3 discards the watcher's
//! own eventual CQE too (SPEC_FULL.md §4.6 names exactly this pair of steps for watchers).
//!
//! A UDP handle on the invalidated fd is removed from the table outright rather than cancelled
//! in-flight: this teacher's `io-uring` version exposes no generic cancel opcode, so an
//! outstanding `recvmsg` is left to either complete naturally against the now-closed fd (in which
//! case `recvmsg_done`'s `EBADF`→`ECANCELED` rewrite in `src/udp_recv.rs` handles it) or to
//! complete after the handle is already gone, in which case its `Tag::UdpRecv`/`Tag::UdpSend`
//! index no longer resolves in the table and the completion is silently discarded the same way a
//! stale watcher index is.

use std::os::unix::io::RawFd;

use io_uring::opcode;
use tracing::debug;

use crate::ring::RingContext;
use crate::submitter::push_sqe;
use crate::tag::Tag;
use crate::udp::UdpTable;
use crate::watcher::WatcherTable;

/// Remove every watcher and UDP handle registered against `fd`. Idempotent: invalidating an fd
/// with nothing registered is a no-op.
pub fn invalidate_fd(
    ctx: &mut RingContext,
    watchers: &mut WatcherTable,
    udp: &mut UdpTable,
    fd: RawFd,
) -> std::io::Result<()> {
    let on_fd: Vec<usize> = watchers
        .indices()
        .into_iter()
        .filter(|&i| watchers.get(i).map_or(false, |w| w.fd == fd))
        .collect();

    let armed_indices: Vec<usize> = on_fd.iter().copied().filter(|&i| watchers.is_armed(i)).collect();

    for index in &armed_indices {
        let entry = opcode::PollRemove::new(Tag::watcher(*index).encode())
            .build()
            .user_data(Tag::Zero.encode());
        push_sqe(ctx, entry)?;
    }

    for index in on_fd {
        watchers.remove(index);
    }

    let udp_removed: Vec<usize> = udp
        .indices()
        .into_iter()
        .filter(|&i| udp.get(i).map_or(false, |h| h.fd == fd))
        .collect();
    for index in udp_removed {
        udp.remove(index);
    }

    debug!(fd, armed = armed_indices.len(), "fd invalidated");
    Ok(())
}
