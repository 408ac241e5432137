//! Completion tagging.
//!
//! The original design recovers the owning watcher/request from a CQE by casting the raw
//! `user_data` pointer back to a struct and subtracting a fixed offset (SPEC_FULL.md §3, §9).
//! That scheme is pointer-arithmetic over freed memory waiting to happen, so this repo replaces
//! it with the redesign named in SPEC_FULL.md's REDESIGN FLAGS: user_data packs a small
//! discriminant plus a `slab` index, and the dispatcher recovers the owner through a checked
//! table lookup. A slot that has been removed (watcher dropped, fd invalidated, request
//! completed) simply isn't found, which *is* the "discard stale completion" rule from §4.3.3 and
//! §4.6 — it falls out of the data structure instead of needing to be asserted by hand.

const SHIFT: u32 = 56;
const INDEX_MASK: u64 = (1 << SHIFT) - 1;

/// A UDP send request is keyed by *two* independent slab indices: which [`UdpTable`](crate::udp::UdpTable)
/// handle it belongs to, and its slot in that handle's own `write_pending_queue`. Both have to
/// travel in the one `user_data` slot a CQE gives back, so the 56 index bits below the
/// discriminant byte are split evenly between them rather than letting one field silently stand
/// in for the other.
const SEND_FIELD_BITS: u32 = 28;
const SEND_FIELD_MASK: u64 = (1 << SEND_FIELD_BITS) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Discriminant {
    Watcher = 1,
    UdpSend = 2,
    UdpRecv = 3,
}

/// Decoded form of an SQE's `user_data` / a CQE's `user_data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    /// Fire-and-forget; the CQE is discarded unconditionally (used for poll-remove).
    Zero,
    /// Readiness completion; index into the loop's watcher slab.
    Watcher(usize),
    /// UDP send completion: the owning handle's index into the loop's `UdpTable`, and the
    /// completed request's index into that handle's own `write_pending_queue`. These are
    /// unrelated index spaces — a handle's `UdpTable` slot and the slot a given send happens to
    /// land in on that handle's own pending-send slab have no reason to coincide — so both travel
    /// together rather than the dispatcher guessing one from the other.
    UdpSend { handle: usize, pending: usize },
    /// UDP recv completion; index into the loop's UDP-handle slab.
    UdpRecv(usize),
}

impl Tag {
    pub fn watcher(index: usize) -> Tag {
        Tag::Watcher(index)
    }

    pub fn udp_send(handle: usize, pending: usize) -> Tag {
        Tag::UdpSend { handle, pending }
    }

    pub fn udp_recv(index: usize) -> Tag {
        Tag::UdpRecv(index)
    }

    /// Encode as the 64-bit value handed to `Entry::user_data`.
    pub fn encode(self) -> u64 {
        match self {
            Tag::Zero => 0,
            Tag::Watcher(i) => encode(Discriminant::Watcher, i),
            Tag::UdpSend { handle, pending } => {
                debug_assert!(handle as u64 <= SEND_FIELD_MASK, "udp handle index does not fit in tag");
                debug_assert!(pending as u64 <= SEND_FIELD_MASK, "pending-send index does not fit in tag");
                let packed = ((handle as u64 & SEND_FIELD_MASK) << SEND_FIELD_BITS)
                    | (pending as u64 & SEND_FIELD_MASK);
                encode(Discriminant::UdpSend, packed as usize)
            }
            Tag::UdpRecv(i) => encode(Discriminant::UdpRecv, i),
        }
    }

    /// Decode a CQE's `user_data`. Returns `Tag::Zero` for the reserved fire-and-forget value
    /// *and* for the ring's internal timeout sentinel (`u64::MAX`), so both are skipped the same
    /// way by the drain phase (SPEC_FULL.md §4.3.3).
    pub fn decode(user_data: u64) -> Tag {
        if user_data == 0 || user_data == TIMEOUT_SENTINEL {
            return Tag::Zero;
        }
        let index = user_data & INDEX_MASK;
        match user_data >> SHIFT {
            d if d == Discriminant::Watcher as u64 => Tag::Watcher(index as usize),
            d if d == Discriminant::UdpSend as u64 => {
                let handle = (index >> SEND_FIELD_BITS) & SEND_FIELD_MASK;
                let pending = index & SEND_FIELD_MASK;
                Tag::UdpSend { handle: handle as usize, pending: pending as usize }
            }
            d if d == Discriminant::UdpRecv as u64 => Tag::UdpRecv(index as usize),
            _ => Tag::Zero,
        }
    }
}

/// Reserved `user_data` for the internal timeout SQE armed by the poller while waiting with a
/// bounded deadline (SPEC_FULL.md §4.3.2, §4.3.3). Chosen so it can never collide with a slab
/// index, mirroring how downstream `io_uring` drivers in this ecosystem reserve the top of the
/// `user_data` space for bookkeeping entries.
pub const TIMEOUT_SENTINEL: u64 = u64::MAX;

fn encode(d: Discriminant, index: usize) -> u64 {
    debug_assert!(index as u64 <= INDEX_MASK, "slab index does not fit in tag");
    ((d as u64) << SHIFT) | (index as u64 & INDEX_MASK)
}
