//! A framed echo server exercising the full substrate: the reactor owns
//! readiness, connections own framing, and the worker pool owns the
//! application work (here, just echoing the payload back).
//!
//! Try it with:
//!
//! ```sh
//! cargo run --example echo_server
//! printf '\x00\x00\x00\x05hello' | nc 127.0.0.1 7000
//! ```

use fulcrum::{Connection, PduHandler, Reactor, WorkerPool};

use std::net::TcpListener;
use std::os::fd::IntoRawFd;
use std::sync::{Arc, Mutex};

struct Echo {
    pool: Arc<WorkerPool>,
}

impl PduHandler for Echo {
    fn got_pdu(&self, connection: &Arc<Connection>, payload: &[u8]) -> bool {
        let connection = connection.clone();
        let payload = payload.to_vec();

        // Reply from a worker so the reactor thread never blocks on a
        // slow peer.
        self.pool
            .submit(Box::new(move || {
                if let Err(e) = connection.send(&payload, true) {
                    tracing::warn!(fd = connection.chan_no(), error = %e, "echo failed");
                }
            }))
            .is_ok()
    }
}

fn main() -> fulcrum::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let reactor = Reactor::new()?;
    let pool = Arc::new(WorkerPool::new());
    let handler = Arc::new(Echo { pool: pool.clone() });

    let listener = TcpListener::bind("127.0.0.1:7000")?;
    tracing::info!("echo server on 127.0.0.1:7000");

    // The connection table keeps each Arc alive until its peer goes away.
    let connections: Mutex<Vec<Arc<Connection>>> = Mutex::new(Vec::new());

    for stream in listener.incoming() {
        let stream = stream?;
        let fd = stream.into_raw_fd();

        match Connection::open(handler.clone(), reactor.clone(), fd) {
            Ok(connection) => {
                tracing::info!(fd, "accepted");

                let mut table = connections.lock().unwrap();
                table.retain(|c| !c.is_dead());
                table.push(connection);
            }
            Err(e) => tracing::warn!(fd, error = %e, "failed to open connection"),
        }
    }

    Ok(())
}
