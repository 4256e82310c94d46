//! Per-socket connection state machine.
//!
//! A [`Connection`] owns one non-blocking descriptor and performs partial,
//! length-framed message I/O driven by reactor callbacks. The wire format
//! is a 4-byte big-endian unsigned payload length followed by that many
//! payload bytes; nothing else is prescribed. Request ids, message types
//! and the like belong to whatever protocol rides on [`PduHandler`].
//!
//! Lifetime is reference counted through `Arc`: the reactor's table only
//! holds a weak entry, senders and the protocol handler hold strong ones,
//! and the descriptor is closed exactly once when the last handle drops.

use crate::error::{Error, Result};
use crate::reactor::{EventCallback, Interest, Reactor};

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Instant;

use tracing::{debug, trace, warn};

/// Width of the length header on the wire.
pub const HEADER_LEN: usize = 4;

/// Largest payload a peer may declare. A header above this kills the
/// connection rather than letting a bogus length drive an allocation.
pub const MAX_PDU_LEN: usize = 16 * 1024 * 1024;

/// Protocol hand-off for completed inbound messages.
///
/// Invoked on the reactor thread each time a connection assembles a full
/// frame. Returning `false` marks the message stream as faulted and closes
/// the connection. Heavy work must be offloaded (typically to a
/// [`WorkerPool`](crate::pool::WorkerPool)); this call blocks every other
/// multiplexed descriptor while it runs.
pub trait PduHandler: Send + Sync {
    fn got_pdu(&self, connection: &Arc<Connection>, payload: &[u8]) -> bool;
}

/// Raw socket I/O strategy.
///
/// Production code uses [`SysIo`]; tests inject fault models such as
/// [`ShortWriteIo`] without touching the connection's constructor surface.
pub trait SocketIo: Send + Sync {
    /// Non-blocking read. `Ok(0)` is end-of-stream.
    fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize>;

    /// Non-blocking write of as many bytes as the socket accepts.
    fn write(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize>;
}

/// Direct `read(2)`/`write(2)`.
pub struct SysIo;

impl SocketIo for SysIo {
    fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };

        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(n as usize)
    }

    fn write(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };

        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(n as usize)
    }
}

/// Deterministic short-write fault model for tests.
///
/// Writes at most `chunk` bytes per call and reports `WouldBlock` on every
/// other call, forcing large sends through the partial-write resume path
/// across several `write_ready` invocations. Reads pass through untouched.
pub struct ShortWriteIo {
    inner: SysIo,
    chunk: usize,
    starve: AtomicBool,
}

impl ShortWriteIo {
    pub fn new(chunk: usize) -> Self {
        assert!(chunk > 0, "chunk must be > 0");

        Self {
            inner: SysIo,
            chunk,
            starve: AtomicBool::new(false),
        }
    }
}

impl SocketIo for ShortWriteIo {
    fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(fd, buf)
    }

    fn write(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        if self.starve.fetch_xor(true, Ordering::AcqRel) {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }

        let len = buf.len().min(self.chunk);
        self.inner.write(fd, &buf[..len])
    }
}

enum ReadStage {
    Header,
    Payload,
}

/// In-progress inbound frame: header first, then the declared payload.
/// `bytes` counts progress within the current stage.
struct ReadBuf {
    header: [u8; HEADER_LEN],
    payload: Vec<u8>,
    bytes: usize,
    stage: ReadStage,
}

impl ReadBuf {
    fn new() -> Self {
        Self {
            header: [0; HEADER_LEN],
            payload: Vec::new(),
            bytes: 0,
            stage: ReadStage::Header,
        }
    }

    fn reset(&mut self) {
        self.payload = Vec::new();
        self.bytes = 0;
        self.stage = ReadStage::Header;
    }
}

/// In-progress outbound frame; `bytes` already sent.
struct WriteBuf {
    frame: Vec<u8>,
    bytes: usize,
}

struct IoState {
    read: ReadBuf,
    /// `None` while no outbound message is in flight.
    write: Option<WriteBuf>,
}

enum ReadOutcome {
    Pdu(Vec<u8>),
    Blocked,
    Eof,
    Failed(io::Error),
    Oversized(usize),
}

enum FlushOutcome {
    Done,
    Partial,
    Failed(io::Error),
}

/// One live socket: read/write buffers, liveness flag and framing state.
///
/// All I/O state sits behind one mutex; liveness is a separate atomic so
/// every operation can fail fast on a dead connection without contending
/// with buffer traffic. Once dead, the connection never touches the
/// descriptor again; the descriptor itself closes when the last `Arc`
/// drops.
pub struct Connection {
    handler: Arc<dyn PduHandler>,
    reactor: Arc<Reactor>,
    fd: RawFd,
    dead: AtomicBool,
    io: Mutex<IoState>,
    send_complete: Condvar,
    sock: Arc<dyn SocketIo>,
    created_at: Instant,
    weak: Weak<Connection>,
}

impl Connection {
    /// Takes ownership of `fd`, switches it to non-blocking mode and
    /// registers read interest with the reactor.
    pub fn open(
        handler: Arc<dyn PduHandler>,
        reactor: Arc<Reactor>,
        fd: RawFd,
    ) -> Result<Arc<Self>> {
        Self::open_with_io(handler, reactor, fd, Arc::new(SysIo))
    }

    /// [`open`](Self::open) with an injected I/O strategy.
    pub fn open_with_io(
        handler: Arc<dyn PduHandler>,
        reactor: Arc<Reactor>,
        fd: RawFd,
        sock: Arc<dyn SocketIo>,
    ) -> Result<Arc<Self>> {
        // Ownership of the descriptor starts here: on any failure before a
        // handle exists, close it ourselves.
        if let Err(e) = set_nonblocking(fd) {
            unsafe { libc::close(fd) };
            return Err(e);
        }

        let connection = Arc::new_cyclic(|weak| Self {
            handler,
            reactor,
            fd,
            dead: AtomicBool::new(false),
            io: Mutex::new(IoState {
                read: ReadBuf::new(),
                write: None,
            }),
            send_complete: Condvar::new(),
            sock,
            created_at: Instant::now(),
            weak: weak.clone(),
        });

        let callback: Arc<dyn EventCallback> = connection.clone();
        connection.reactor.add_callback(fd, Interest::READ, &callback)?;

        trace!(fd, "connection opened");

        Ok(connection)
    }

    /// The underlying descriptor, stable for the connection's life.
    pub fn chan_no(&self) -> RawFd {
        self.fd
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// When this connection was opened. Diagnostic only.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Queues one outbound message and writes as much as the socket takes.
    ///
    /// If a previous message is still draining, blocks until it completes
    /// when `block` is set, otherwise fails with [`Error::SendBusy`]. On a
    /// partial write the remainder drains through `write_ready` as the
    /// reactor reports writability.
    ///
    /// Never block-send from a reactor callback: the resume path runs on
    /// the loop thread being blocked.
    pub fn send(&self, payload: &[u8], block: bool) -> Result<()> {
        if payload.len() > MAX_PDU_LEN {
            return Err(Error::PduTooLarge {
                size: payload.len(),
                max: MAX_PDU_LEN,
            });
        }

        let mut io = self.io.lock().unwrap();

        loop {
            if self.is_dead() {
                return Err(Error::ConnectionClosed(self.fd));
            }

            if io.write.is_none() {
                break;
            }

            if !block {
                return Err(Error::SendBusy(self.fd));
            }

            io = self.send_complete.wait(io).unwrap();
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(payload);

        io.write = Some(WriteBuf { frame, bytes: 0 });

        match self.flush_locked(&mut io) {
            FlushOutcome::Done => {
                // A sender blocked behind this message wakes to find the
                // buffer idle.
                self.send_complete.notify_all();
                Ok(())
            }
            FlushOutcome::Partial => {
                drop(io);

                if let Err(e) = self.arm_write() {
                    self.die("write interest registration failed", None);
                    return Err(e);
                }

                Ok(())
            }
            FlushOutcome::Failed(e) => {
                drop(io);
                self.die("send failed", Some(&e));
                Err(e.into())
            }
        }
    }

    /// Marks the connection dead and retires it from the reactor.
    /// Idempotent. Off the reactor thread, returns only once no callback
    /// is (or will be) running for this descriptor.
    pub fn close(&self) {
        self.die("closed", None);
    }

    fn die(&self, reason: &str, error: Option<&io::Error>) {
        if self.dead.swap(true, Ordering::AcqRel) {
            return;
        }

        match error {
            Some(e) => warn!(fd = self.fd, error = %e, "connection dead: {reason}"),
            None => debug!(fd = self.fd, "connection dead: {reason}"),
        }

        if let Err(e) = self.reactor.unregister(self.fd) {
            warn!(fd = self.fd, error = %e, "failed to unregister connection");
        }

        // Taking the lock orders the wakeup after any sender's dead-check,
        // so none sleeps through it.
        let _io = self.io.lock().unwrap();
        self.send_complete.notify_all();
    }

    /// Re-arms (or arms) write interest. With an edge-triggered backend the
    /// modify call itself produces a fresh event if the socket is already
    /// writable.
    fn arm_write(&self) -> Result<()> {
        if self.is_dead() {
            return Err(Error::ConnectionClosed(self.fd));
        }

        let Some(callback) = self.as_callback() else {
            return Err(Error::ConnectionClosed(self.fd));
        };

        self.reactor.add_callback(self.fd, Interest::BOTH, &callback)
    }

    fn as_callback(&self) -> Option<Arc<dyn EventCallback>> {
        self.weak.upgrade().map(|conn| conn as Arc<dyn EventCallback>)
    }

    fn flush_locked(&self, io: &mut IoState) -> FlushOutcome {
        let Some(write) = io.write.as_mut() else {
            return FlushOutcome::Done;
        };

        while write.bytes < write.frame.len() {
            match self.sock.write(self.fd, &write.frame[write.bytes..]) {
                Ok(0) => return FlushOutcome::Partial,
                Ok(n) => write.bytes += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return FlushOutcome::Partial;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return FlushOutcome::Failed(e),
            }
        }

        io.write = None;
        FlushOutcome::Done
    }

    /// Advances the inbound frame, returning at a message boundary, on
    /// exhaustion, or on stream end/failure.
    fn fill_read_locked(&self, io: &mut IoState) -> ReadOutcome {
        loop {
            let read = &mut io.read;

            let buf = match read.stage {
                ReadStage::Header => &mut read.header[read.bytes..],
                ReadStage::Payload => &mut read.payload[read.bytes..],
            };

            match self.sock.read(self.fd, buf) {
                Ok(0) => return ReadOutcome::Eof,
                Ok(n) => read.bytes += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return ReadOutcome::Blocked;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return ReadOutcome::Failed(e),
            }

            match read.stage {
                ReadStage::Header if read.bytes == HEADER_LEN => {
                    let declared = u32::from_be_bytes(read.header) as usize;

                    if declared > MAX_PDU_LEN {
                        return ReadOutcome::Oversized(declared);
                    }

                    if declared == 0 {
                        read.reset();
                        return ReadOutcome::Pdu(Vec::new());
                    }

                    read.payload = vec![0; declared];
                    read.bytes = 0;
                    read.stage = ReadStage::Payload;
                }
                ReadStage::Payload if read.bytes == read.payload.len() => {
                    let payload = std::mem::take(&mut read.payload);
                    read.reset();
                    return ReadOutcome::Pdu(payload);
                }
                _ => {}
            }
        }
    }
}

impl EventCallback for Connection {
    /// Drains the socket (edge-triggered backends report one event per
    /// transition), handing each completed frame to the protocol handler
    /// with the I/O lock released so the handler may send.
    fn read_ready(&self, fd: RawFd) {
        loop {
            if self.is_dead() {
                return;
            }

            let outcome = {
                let mut io = self.io.lock().unwrap();
                self.fill_read_locked(&mut io)
            };

            match outcome {
                ReadOutcome::Pdu(payload) => {
                    let Some(connection) = self.weak.upgrade() else {
                        return;
                    };

                    trace!(fd, len = payload.len(), "pdu assembled");

                    if !self.handler.got_pdu(&connection, &payload) {
                        self.die("handler rejected pdu", None);
                        return;
                    }
                }
                ReadOutcome::Blocked => return,
                ReadOutcome::Eof => {
                    self.die("peer closed", None);
                    return;
                }
                ReadOutcome::Failed(e) => {
                    self.die("read failed", Some(&e));
                    return;
                }
                ReadOutcome::Oversized(declared) => {
                    warn!(fd, declared, max = MAX_PDU_LEN, "oversized pdu header");
                    self.die("oversized pdu", None);
                    return;
                }
            }
        }
    }

    /// Resumes a partial outbound frame from where the last pass stopped.
    fn write_ready(&self, fd: RawFd) {
        if self.is_dead() {
            return;
        }

        let mut io = self.io.lock().unwrap();

        match self.flush_locked(&mut io) {
            FlushOutcome::Done => {
                if let Err(e) = self.reactor.remove_callback(fd, Interest::WRITE) {
                    warn!(fd, error = %e, "failed to drop write interest");
                }

                trace!(fd, "outbound frame drained");
                self.send_complete.notify_all();
            }
            FlushOutcome::Partial => {
                drop(io);

                // Without write interest the frame would sit parked forever
                // and a blocked sender would sleep through it. Treat the
                // failure as fatal, exactly like the initial send path.
                if let Err(e) = self.arm_write() {
                    warn!(fd, error = %e, "failed to re-arm write interest");
                    self.die("write interest registration failed", None);
                }
            }
            FlushOutcome::Failed(e) => {
                drop(io);
                self.die("write failed", Some(&e));
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // A handle dropped while still ACTIVE never went through die(), so
        // the reactor and poller still carry entries for this descriptor
        // number. Purge them before the kernel can recycle it. No strong
        // handle remains, so dispatch can no longer reach this connection
        // and plain removal suffices.
        if !self.dead.swap(true, Ordering::AcqRel)
            && let Err(e) = self.reactor.remove_callback(self.fd, Interest::BOTH)
        {
            warn!(fd = self.fd, error = %e, "failed to unregister dropped connection");
        }

        // Last holder gone; release the descriptor exactly once.
        unsafe { libc::close(self.fd) };
        trace!(fd = self.fd, "descriptor released");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.fd)
            .field("dead", &self.is_dead())
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.fd == other.fd
    }
}

impl Eq for Connection {}

impl PartialOrd for Connection {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Total order by descriptor number, so connections can key ordered
/// containers.
impl Ord for Connection {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.fd.cmp(&other.fd)
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error().into());
    }

    let res = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if res < 0 {
        return Err(io::Error::last_os_error().into());
    }

    Ok(())
}
