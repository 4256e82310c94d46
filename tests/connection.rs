use fulcrum::{
    Connection, Error, HEADER_LEN, MAX_PDU_LEN, PduHandler, Reactor, ShortWriteIo,
};

use std::io::{Read, Write};
use std::os::fd::IntoRawFd;
use std::os::unix::net::UnixStream;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Serializes the tests in this binary so descriptor numbers observed by
/// one test cannot be recycled by another mid-assertion.
fn serial() -> MutexGuard<'static, ()> {
    static GATE: Mutex<()> = Mutex::new(());
    GATE.lock().unwrap_or_else(|e| e.into_inner())
}

/// Forwards every completed payload to an mpsc channel.
struct Collect {
    tx: Mutex<mpsc::Sender<Vec<u8>>>,
}

impl Collect {
    fn new() -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(Self { tx: Mutex::new(tx) }), rx)
    }
}

impl PduHandler for Collect {
    fn got_pdu(&self, _connection: &Arc<Connection>, payload: &[u8]) -> bool {
        self.tx.lock().unwrap().send(payload.to_vec()).unwrap();
        true
    }
}

/// Rejects every message.
struct Reject;

impl PduHandler for Reject {
    fn got_pdu(&self, _connection: &Arc<Connection>, _payload: &[u8]) -> bool {
        false
    }
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn wait_dead(connection: &Connection) {
    let deadline = Instant::now() + Duration::from_secs(5);

    while !connection.is_dead() {
        assert!(Instant::now() < deadline, "connection never died");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_whole_frame_delivers_exactly_one_pdu() {
    let _gate = serial();

    let reactor = Reactor::new().unwrap();
    let (handler, rx) = Collect::new();
    let (local, mut peer) = UnixStream::pair().unwrap();

    let conn = Connection::open(handler, reactor.clone(), local.into_raw_fd()).unwrap();

    let payload = b"hello, substrate";
    peer.write_all(&frame(payload)).unwrap();

    let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(got, payload);

    // Exactly once: nothing further arrives.
    assert_eq!(
        rx.recv_timeout(Duration::from_millis(100)),
        Err(RecvTimeoutError::Timeout)
    );

    conn.close();
    reactor.shutdown();
}

#[test]
fn test_frame_split_across_events_reassembles_once() {
    let _gate = serial();

    let reactor = Reactor::new().unwrap();
    let (handler, rx) = Collect::new();
    let (local, mut peer) = UnixStream::pair().unwrap();

    let conn = Connection::open(handler, reactor.clone(), local.into_raw_fd()).unwrap();

    let payload: Vec<u8> = (0..500u32).map(|i| (i % 251) as u8).collect();
    let wire = frame(&payload);

    // A sliver of the header first, then some payload, then the rest;
    // each write is a separate readiness edge.
    peer.write_all(&wire[..2]).unwrap();
    assert_eq!(
        rx.recv_timeout(Duration::from_millis(100)),
        Err(RecvTimeoutError::Timeout)
    );

    peer.write_all(&wire[2..100]).unwrap();
    assert_eq!(
        rx.recv_timeout(Duration::from_millis(100)),
        Err(RecvTimeoutError::Timeout)
    );

    peer.write_all(&wire[100..]).unwrap();

    let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(got, payload);

    assert_eq!(
        rx.recv_timeout(Duration::from_millis(100)),
        Err(RecvTimeoutError::Timeout)
    );

    conn.close();
    reactor.shutdown();
}

#[test]
fn test_two_frames_in_one_event() {
    let _gate = serial();

    let reactor = Reactor::new().unwrap();
    let (handler, rx) = Collect::new();
    let (local, mut peer) = UnixStream::pair().unwrap();

    let conn = Connection::open(handler, reactor.clone(), local.into_raw_fd()).unwrap();

    let mut wire = frame(b"first");
    wire.extend_from_slice(&frame(b"second"));
    peer.write_all(&wire).unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), b"first");
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), b"second");

    conn.close();
    reactor.shutdown();
}

#[test]
fn test_empty_payload_frame() {
    let _gate = serial();

    let reactor = Reactor::new().unwrap();
    let (handler, rx) = Collect::new();
    let (local, mut peer) = UnixStream::pair().unwrap();

    let conn = Connection::open(handler, reactor.clone(), local.into_raw_fd()).unwrap();

    peer.write_all(&frame(b"")).unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), b"");

    conn.close();
    reactor.shutdown();
}

#[test]
fn test_short_writes_deliver_identical_bytes() {
    let _gate = serial();

    let reactor = Reactor::new().unwrap();
    let (handler, _rx) = Collect::new();
    let (local, mut peer) = UnixStream::pair().unwrap();

    let conn = Connection::open_with_io(
        handler,
        reactor.clone(),
        local.into_raw_fd(),
        Arc::new(ShortWriteIo::new(1024)),
    )
    .unwrap();

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 241) as u8).collect();
    let expected = frame(&payload);

    let reader = {
        let total = expected.len();
        thread::spawn(move || {
            let mut buf = vec![0u8; total];
            peer.read_exact(&mut buf).unwrap();
            buf
        })
    };

    conn.send(&payload, true).unwrap();

    let received = reader.join().unwrap();
    assert_eq!(received, expected);

    conn.close();
    reactor.shutdown();
}

#[test]
fn test_nonblocking_send_while_draining_is_busy() {
    let _gate = serial();

    let reactor = Reactor::new().unwrap();
    let (handler, _rx) = Collect::new();
    let (local, peer) = UnixStream::pair().unwrap();

    let conn = Connection::open(handler, reactor.clone(), local.into_raw_fd()).unwrap();

    // Far more than a socket buffer, with nobody reading: the first send
    // must park a partial frame.
    let payload = vec![7u8; 2 * 1024 * 1024];
    conn.send(&payload, true).unwrap();

    assert!(matches!(
        conn.send(b"again", false),
        Err(Error::SendBusy(_))
    ));

    drop(peer);
    conn.close();
    reactor.shutdown();
}

#[test]
fn test_oversized_payload_is_rejected_before_framing() {
    let _gate = serial();

    let reactor = Reactor::new().unwrap();
    let (handler, _rx) = Collect::new();
    let (local, _peer) = UnixStream::pair().unwrap();

    let conn = Connection::open(handler, reactor.clone(), local.into_raw_fd()).unwrap();

    let payload = vec![0u8; MAX_PDU_LEN + 1];
    assert!(matches!(
        conn.send(&payload, true),
        Err(Error::PduTooLarge { .. })
    ));
    assert!(!conn.is_dead());

    conn.close();
    reactor.shutdown();
}

#[test]
fn test_oversized_header_kills_connection() {
    let _gate = serial();

    let reactor = Reactor::new().unwrap();
    let (handler, rx) = Collect::new();
    let (local, mut peer) = UnixStream::pair().unwrap();

    let conn = Connection::open(handler, reactor.clone(), local.into_raw_fd()).unwrap();

    let declared = (MAX_PDU_LEN as u32) + 1;
    peer.write_all(&declared.to_be_bytes()).unwrap();

    wait_dead(&conn);
    assert_eq!(
        rx.recv_timeout(Duration::from_millis(100)),
        Err(RecvTimeoutError::Timeout)
    );

    reactor.shutdown();
}

#[test]
fn test_rejecting_handler_closes_connection() {
    let _gate = serial();

    let reactor = Reactor::new().unwrap();
    let (local, mut peer) = UnixStream::pair().unwrap();

    let conn = Connection::open(Arc::new(Reject), reactor.clone(), local.into_raw_fd()).unwrap();

    peer.write_all(&frame(b"unwanted")).unwrap();
    wait_dead(&conn);

    // A dead connection stops accepting sends.
    assert!(matches!(
        conn.send(b"late", true),
        Err(Error::ConnectionClosed(_))
    ));

    reactor.shutdown();
}

#[test]
fn test_peer_eof_kills_connection() {
    let _gate = serial();

    let reactor = Reactor::new().unwrap();
    let (handler, _rx) = Collect::new();
    let (local, peer) = UnixStream::pair().unwrap();

    let conn = Connection::open(handler, reactor.clone(), local.into_raw_fd()).unwrap();

    drop(peer);
    wait_dead(&conn);

    reactor.shutdown();
}

#[test]
fn test_close_is_idempotent() {
    let _gate = serial();

    let reactor = Reactor::new().unwrap();
    let (handler, _rx) = Collect::new();
    let (local, _peer) = UnixStream::pair().unwrap();

    let conn = Connection::open(handler, reactor.clone(), local.into_raw_fd()).unwrap();

    conn.close();
    conn.close();
    assert!(conn.is_dead());

    reactor.shutdown();
}

#[test]
fn test_descriptor_released_once_and_never_early() {
    let _gate = serial();

    let reactor = Reactor::new().unwrap();
    let (handler, _rx) = Collect::new();
    let (local, _peer) = UnixStream::pair().unwrap();

    let conn = Connection::open(handler, reactor.clone(), local.into_raw_fd()).unwrap();
    let fd = conn.chan_no();

    let holders: Vec<_> = (0..2)
        .map(|_| {
            let conn = conn.clone();
            thread::spawn(move || {
                for _ in 0..1000 {
                    let another = conn.clone();
                    assert_eq!(another.chan_no(), conn.chan_no());
                }
            })
        })
        .collect();

    let closer = {
        let conn = conn.clone();
        thread::spawn(move || conn.close())
    };

    for holder in holders {
        holder.join().unwrap();
    }
    closer.join().unwrap();

    // Dead but still referenced: the descriptor must remain open.
    assert!(conn.is_dead());
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    assert!(flags >= 0, "descriptor released while handles exist");

    drop(conn);

    // Last handle gone: the descriptor is closed.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    assert!(flags < 0, "descriptor leaked after last handle dropped");

    reactor.shutdown();
}

#[test]
fn test_drop_without_close_retires_the_registration() {
    let _gate = serial();

    let reactor = Reactor::new().unwrap();
    let (handler, _rx) = Collect::new();

    let (local, _peer) = UnixStream::pair().unwrap();
    let fd = local.into_raw_fd();

    let conn = Connection::open(handler.clone(), reactor.clone(), fd).unwrap();
    drop(conn);

    // The kernel hands back the lowest free number, so the next socket
    // recycles the descriptor just released.
    let (local_again, _peer_again) = UnixStream::pair().unwrap();
    let reused = local_again.into_raw_fd();
    assert_eq!(reused, fd, "descriptor was not recycled as expected");

    // A stale registration for the old connection would make this fail.
    let conn = Connection::open(handler, reactor.clone(), reused).unwrap();

    conn.close();
    reactor.shutdown();
}

#[test]
fn test_blocked_sender_wakes_when_connection_dies_mid_drain() {
    let _gate = serial();

    let reactor = Reactor::new().unwrap();
    let (handler, _rx) = Collect::new();
    let (local, peer) = UnixStream::pair().unwrap();

    let conn = Connection::open(handler, reactor.clone(), local.into_raw_fd()).unwrap();

    // Nobody reads, so this parks a partial frame and occupies the
    // outbound buffer.
    let payload = vec![7u8; 2 * 1024 * 1024];
    conn.send(&payload, true).unwrap();

    let sender = {
        let conn = conn.clone();
        thread::spawn(move || conn.send(b"queued", true))
    };

    // Let the second sender reach the send-complete wait, then kill the
    // connection under it.
    thread::sleep(Duration::from_millis(100));
    conn.close();

    assert!(matches!(
        sender.join().unwrap(),
        Err(Error::ConnectionClosed(_))
    ));

    drop(peer);
    reactor.shutdown();
}

#[test]
fn test_open_on_invalid_descriptor_fails() {
    let _gate = serial();

    let reactor = Reactor::new().unwrap();
    let (handler, _rx) = Collect::new();

    assert!(matches!(
        Connection::open(handler, reactor.clone(), -1),
        Err(Error::Io(_))
    ));

    reactor.shutdown();
}

#[test]
fn test_ordering_is_a_strict_weak_order() {
    let _gate = serial();

    let reactor = Reactor::new().unwrap();
    let (handler, _rx) = Collect::new();

    let (a_local, _a_peer) = UnixStream::pair().unwrap();
    let (b_local, _b_peer) = UnixStream::pair().unwrap();
    let (c_local, _c_peer) = UnixStream::pair().unwrap();

    let a = Connection::open(handler.clone(), reactor.clone(), a_local.into_raw_fd()).unwrap();
    let b = Connection::open(handler.clone(), reactor.clone(), b_local.into_raw_fd()).unwrap();
    let c = Connection::open(handler.clone(), reactor.clone(), c_local.into_raw_fd()).unwrap();

    // Irreflexive and consistent with identity.
    assert!(!(*a < *a));
    assert_eq!(*a, *a);
    assert_ne!(*a, *b);

    // Total and transitive over distinct descriptors.
    let (x, y, z) = if a < b { (&a, &b, &c) } else { (&b, &a, &c) };
    assert!(x < y);
    if y < z {
        assert!(x < z);
    }

    a.close();
    b.close();
    c.close();
    reactor.shutdown();
}

#[test]
fn test_echo_through_handler_send() {
    let _gate = serial();

    struct Echo;

    impl PduHandler for Echo {
        fn got_pdu(&self, connection: &Arc<Connection>, payload: &[u8]) -> bool {
            connection.send(payload, false).is_ok()
        }
    }

    let reactor = Reactor::new().unwrap();
    let (local, mut peer) = UnixStream::pair().unwrap();

    let conn = Connection::open(Arc::new(Echo), reactor.clone(), local.into_raw_fd()).unwrap();

    let payload = b"ping";
    peer.write_all(&frame(payload)).unwrap();

    let mut echoed = vec![0u8; HEADER_LEN + payload.len()];
    peer.read_exact(&mut echoed).unwrap();
    assert_eq!(echoed, frame(payload));

    conn.close();
    reactor.shutdown();
}
