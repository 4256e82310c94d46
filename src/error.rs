//! Error types for fulcrum.

use std::os::fd::RawFd;

/// Error type for reactor, connection and pool operations.
///
/// Transient `WouldBlock` conditions never surface here; they drive the
/// partial-I/O state machines internally. Hard per-connection I/O failures
/// are contained as well: the connection transitions to dead and callers see
/// [`Error::ConnectionClosed`] on their next operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error from the underlying descriptor or poller.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection is dead; no further sends or reads are possible.
    #[error("connection {0} is closed")]
    ConnectionClosed(RawFd),

    /// A previous outbound message is still draining and the caller asked
    /// not to block.
    #[error("send already in progress on connection {0}")]
    SendBusy(RawFd),

    /// The descriptor is already registered with a different callback.
    #[error("descriptor {0} is registered to another callback")]
    CallbackConflict(RawFd),

    /// Push on a queue that has been closed.
    #[error("queue is closed")]
    QueueClosed,

    /// Submit on a pool that has been stopped.
    #[error("worker pool is stopped")]
    PoolStopped,

    /// A peer declared a payload length above the configured limit.
    #[error("pdu of {size} bytes exceeds the {max} byte limit")]
    PduTooLarge { size: usize, max: usize },
}

/// Result type for fulcrum operations.
pub type Result<T> = std::result::Result<T, Error>;
