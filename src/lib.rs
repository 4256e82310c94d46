//! Transport substrate for an RPC server: an edge-triggered reactor
//! multiplexing many sockets on one thread, per-connection non-blocking
//! length-framed message I/O, and a bounded queue/worker pool pair that
//! keeps application work off the reactor thread.
//!
//! The intended wiring: one [`Reactor`] per process, one [`Connection`]
//! per accepted socket, and a [`WorkerPool`] that [`PduHandler`]
//! implementations submit heavy work to so reactor callbacks never block.

mod connection;
mod reactor;

pub mod error;
pub mod pool;
pub mod queue;

pub use connection::{
    Connection, HEADER_LEN, MAX_PDU_LEN, PduHandler, ShortWriteIo, SocketIo, SysIo,
};
pub use error::{Error, Result};
pub use pool::{PoolBuilder, Task, WorkerPool};
pub use queue::BoundedQueue;
pub use reactor::{EventCallback, Interest, Reactor};
