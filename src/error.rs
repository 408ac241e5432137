//! Error types for the pieces of the public contract that need a closed set of
//! outcomes rather than a bare `io::Error` (see SPEC_FULL.md §7, §10.2).

use std::fmt;
use std::io;

/// Outcome of [`crate::ring::RingContext::init`].
#[derive(Debug)]
pub enum RingInitError {
    /// The kernel or libc allocator could not satisfy the ring's memory requirements.
    OutOfMemory,
    /// `io_uring_setup` (or the surrounding mmaps) failed.
    Kernel(io::Error),
}

impl fmt::Display for RingInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RingInitError::OutOfMemory => f.write_str("out of memory initializing io_uring"),
            RingInitError::Kernel(e) => write!(f, "io_uring kernel error: {e}"),
        }
    }
}

impl std::error::Error for RingInitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RingInitError::OutOfMemory => None,
            RingInitError::Kernel(e) => Some(e),
        }
    }
}

impl From<io::Error> for RingInitError {
    fn from(e: io::Error) -> Self {
        match e.raw_os_error() {
            Some(libc::ENOMEM) => RingInitError::OutOfMemory,
            _ => RingInitError::Kernel(e),
        }
    }
}

/// Outcome of [`crate::io_check_fd`].
#[derive(Debug)]
pub enum FdCheckError {
    /// The fd is not open, or not pollable (`EINVAL` from the probe).
    Invalid,
    /// Any other kernel error surfaced while probing the fd.
    Other(io::Error),
}

impl fmt::Display for FdCheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FdCheckError::Invalid => f.write_str("fd is not open or not pollable"),
            FdCheckError::Other(e) => write!(f, "fd check failed: {e}"),
        }
    }
}

impl std::error::Error for FdCheckError {}

impl From<io::Error> for FdCheckError {
    fn from(e: io::Error) -> Self {
        match e.raw_os_error() {
            Some(libc::EINVAL) | Some(libc::EBADF) => FdCheckError::Invalid,
            _ => FdCheckError::Other(e),
        }
    }
}
