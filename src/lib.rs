//! Linux `io_uring` readiness-poll and UDP datagram backend for an event loop
//! (SPEC_FULL.md §1, §2).
//!
//! This crate implements the five components SPEC_FULL.md names — Ring Context (C1), SQE
//! Allocator/Submitter (C2), Readiness Poller (C3), UDP Send Engine (C4), UDP Receive Engine
//! (C5) — plus FD Invalidation, and exposes them through [`loop_core::PlatformLoop`]. It is one
//! platform backend among several an embedding cross-platform event loop would select at compile
//! time; nothing here is meant to run outside Linux, hence the hard compile gate below rather
//! than a runtime check.

#![cfg(target_os = "linux")]

pub mod collab;
pub mod error;
pub mod invalidate;
pub mod loop_core;
pub mod poller;
pub mod ring;
pub mod submitter;
pub mod tag;
pub mod udp;
pub mod udp_recv;
pub mod udp_send;
pub mod watcher;

pub use collab::{Allocator, HeapAllocator, IdleTimeTracker, IoFeed, LoopClock, NullIdleTracker, SystemClock};
pub use error::{FdCheckError, RingInitError};
pub use loop_core::{io_check_fd, PlatformLoop};
pub use poller::WaitOutcome;
pub use ring::RingContext;
pub use udp::{CompletedSend, Destination, ReceivedDatagram, SendOutcome, UdpHandle};
pub use watcher::Interest;
