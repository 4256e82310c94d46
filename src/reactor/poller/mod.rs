//! Readiness-notification backends.
//!
//! The reactor talks to the OS through the [`Poller`] trait so the
//! multiplexing facility is a construction-time strategy rather than a
//! hard-wired dependency. The only backend shipped today is
//! [`Epoll`], edge-triggered epoll on Linux.

mod epoll;

pub(crate) use epoll::Epoll;

use crate::error::Result;

use std::os::fd::RawFd;

/// Per-descriptor interest bits.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const READ: Self = Self {
        read: true,
        write: false,
    };

    pub const WRITE: Self = Self {
        read: false,
        write: true,
    };

    pub const BOTH: Self = Self {
        read: true,
        write: true,
    };

    pub(crate) fn is_empty(self) -> bool {
        !self.read && !self.write
    }

    /// Bitwise union of two interest sets.
    pub(crate) fn with(self, other: Self) -> Self {
        Self {
            read: self.read || other.read,
            write: self.write || other.write,
        }
    }

    /// Clears the bits set in `other`.
    pub(crate) fn without(self, other: Self) -> Self {
        Self {
            read: self.read && !other.read,
            write: self.write && !other.write,
        }
    }
}

/// An edge-triggered readiness multiplexer.
///
/// Events fire once per state transition, not repeatedly while the
/// condition persists; consumers must drain the descriptor before waiting
/// again.
pub(crate) trait Poller: Send + Sync {
    /// Registers or widens interest for `fd`.
    fn watch(&self, fd: RawFd, interest: Interest) -> Result<()>;

    /// Clears the given interest bits. Returns `true` when the descriptor
    /// has no remaining interest and was fully removed, so the caller may
    /// forget its registration metadata.
    fn unwatch(&self, fd: RawFd, interest: Interest) -> Result<bool>;

    /// Whether the descriptor's current interest exactly equals `interest`.
    fn is_watching(&self, fd: RawFd, interest: Interest) -> bool;

    /// Blocks until at least one registered descriptor is ready or
    /// [`wake`](Self::wake) is called, pushing ready descriptors into the
    /// two lists, readable before writable.
    fn wait(&self, readable: &mut Vec<RawFd>, writable: &mut Vec<RawFd>) -> Result<()>;

    /// Unblocks a pending [`wait`](Self::wait).
    fn wake(&self) -> Result<()>;
}
