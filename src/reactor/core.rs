use super::poller::{Epoll, Interest, Poller};
use crate::error::{Error, Result};

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::thread::{self, ThreadId};

use tracing::{debug, trace, warn};

/// Callbacks invoked by the reactor thread on descriptor readiness.
///
/// Implementations must never block: every multiplexed descriptor shares
/// the one loop thread.
pub trait EventCallback: Send + Sync {
    fn read_ready(&self, fd: RawFd);
    fn write_ready(&self, fd: RawFd);
}

struct Table {
    /// fd -> registered callback. Weak so the table never extends a
    /// callback owner's lifetime.
    callbacks: HashMap<RawFd, Weak<dyn EventCallback>>,
    /// Set by a remover, cleared by the loop at the top of an iteration.
    pending_change: bool,
}

/// The readiness loop.
///
/// One dedicated thread waits on the poller and dispatches read and write
/// callbacks for ready descriptors; within one iteration every read
/// callback runs before any write callback. Registration changes are
/// serialized against the wait call through a pending-change handshake, so
/// [`block_remove_fd`](Self::block_remove_fd) can guarantee that no stale
/// event reaches a defunct callback.
///
/// The reactor is an explicit object rather than a process-wide singleton;
/// the intended usage is still one instance per process, shared by handle.
pub struct Reactor {
    poller: Box<dyn Poller>,
    table: Mutex<Table>,
    settled: Condvar,
    shutdown: AtomicBool,
    loop_thread: Mutex<Option<thread::JoinHandle<()>>>,
    loop_thread_id: OnceLock<ThreadId>,
}

impl Reactor {
    /// Creates the reactor and starts its loop thread.
    pub fn new() -> Result<Arc<Self>> {
        let reactor = Arc::new(Self {
            poller: Box::new(Epoll::new()?),
            table: Mutex::new(Table {
                callbacks: HashMap::new(),
                pending_change: false,
            }),
            settled: Condvar::new(),
            shutdown: AtomicBool::new(false),
            loop_thread: Mutex::new(None),
            loop_thread_id: OnceLock::new(),
        });

        let handle = {
            let reactor = reactor.clone();
            thread::Builder::new()
                .name("fulcrum-reactor".into())
                .spawn(move || reactor.run())
                .map_err(Error::Io)?
        };

        *reactor.loop_thread.lock().unwrap() = Some(handle);

        Ok(reactor)
    }

    /// Registers `callback` for `fd` with the given interest, or widens the
    /// interest of an existing registration.
    ///
    /// A descriptor belongs to at most one callback; registering a
    /// different one is [`Error::CallbackConflict`].
    pub fn add_callback(
        &self,
        fd: RawFd,
        interest: Interest,
        callback: &Arc<dyn EventCallback>,
    ) -> Result<()> {
        let mut table = self.table.lock().unwrap();

        if let Some(existing) = table.callbacks.get(&fd).and_then(Weak::upgrade)
            && !Arc::ptr_eq(&existing, callback)
        {
            return Err(Error::CallbackConflict(fd));
        }

        self.poller.watch(fd, interest)?;
        table.callbacks.insert(fd, Arc::downgrade(callback));

        trace!(fd, ?interest, "callback registered");

        Ok(())
    }

    /// Drops the given interest bits for `fd`; the callback entry goes away
    /// with the last bit.
    pub fn remove_callback(&self, fd: RawFd, interest: Interest) -> Result<()> {
        let mut table = self.table.lock().unwrap();

        if self.poller.unwatch(fd, interest)? {
            table.callbacks.remove(&fd);
            trace!(fd, "callback removed");
        }

        Ok(())
    }

    /// Whether `fd` is still registered to `callback` with exactly the
    /// given interest. Guards against acting on a stale registration.
    pub fn has_callback(
        &self,
        fd: RawFd,
        interest: Interest,
        callback: &Arc<dyn EventCallback>,
    ) -> bool {
        let table = self.table.lock().unwrap();

        match table.callbacks.get(&fd).and_then(Weak::upgrade) {
            Some(existing) if Arc::ptr_eq(&existing, callback) => {}
            _ => return false,
        }

        self.poller.is_watching(fd, interest)
    }

    /// Unregisters `fd` and blocks until the loop has observed the change.
    ///
    /// After this returns, no callback for `fd` is running or will run
    /// again: the wait ends only once the loop has come back to the top of
    /// an iteration, past any dispatch that was in flight when the
    /// descriptor was unwatched.
    ///
    /// Must not be called from the loop thread; use
    /// [`unregister`](Self::unregister) when the call site may be a
    /// callback.
    pub fn block_remove_fd(&self, fd: RawFd) -> Result<()> {
        let mut table = self.table.lock().unwrap();

        self.poller.unwatch(fd, Interest::BOTH)?;
        table.callbacks.remove(&fd);

        table.pending_change = true;
        self.poller.wake()?;

        // Timed re-check so a racing shutdown can never strand this waiter.
        while table.pending_change && !self.shutdown.load(Ordering::Acquire) {
            (table, _) = self
                .settled
                .wait_timeout(table, std::time::Duration::from_millis(50))
                .unwrap();
        }

        trace!(fd, "descriptor retired");

        Ok(())
    }

    /// Removes `fd` entirely, picking the safe variant for the calling
    /// thread: the blocking handshake off the loop thread, direct removal
    /// on it (dispatch re-checks the table before every invocation, so
    /// direct removal already suppresses the rest of the iteration).
    pub fn unregister(&self, fd: RawFd) -> Result<()> {
        if self.on_loop_thread() {
            self.remove_callback(fd, Interest::BOTH)
        } else {
            self.block_remove_fd(fd)
        }
    }

    /// Stops the loop thread and joins it. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Err(e) = self.poller.wake() {
            warn!(error = %e, "failed to wake reactor for shutdown");
        }

        if !self.on_loop_thread()
            && let Some(handle) = self.loop_thread.lock().unwrap().take()
        {
            let _ = handle.join();
        }

        debug!("reactor stopped");
    }

    fn on_loop_thread(&self) -> bool {
        self.loop_thread_id.get() == Some(&thread::current().id())
    }

    fn callback_for(&self, fd: RawFd) -> Option<Arc<dyn EventCallback>> {
        let table = self.table.lock().unwrap();
        table.callbacks.get(&fd).and_then(Weak::upgrade)
    }

    fn run(&self) {
        let _ = self.loop_thread_id.set(thread::current().id());

        let mut readable: Vec<RawFd> = Vec::new();
        let mut writable: Vec<RawFd> = Vec::new();

        while !self.shutdown.load(Ordering::Acquire) {
            {
                let mut table = self.table.lock().unwrap();
                if table.pending_change {
                    table.pending_change = false;
                    self.settled.notify_all();
                }
            }

            readable.clear();
            writable.clear();

            if let Err(e) = self.poller.wait(&mut readable, &mut writable) {
                warn!(error = %e, "poller wait failed");
                break;
            }

            if readable.is_empty() && writable.is_empty() {
                continue;
            }

            // The table lock is released before each invocation; the
            // upgrade at dispatch time skips descriptors removed earlier in
            // the same iteration.
            for &fd in &readable {
                if let Some(callback) = self.callback_for(fd) {
                    callback.read_ready(fd);
                }
            }

            for &fd in &writable {
                if let Some(callback) = self.callback_for(fd) {
                    callback.write_ready(fd);
                }
            }
        }

        // Leave no remover stuck on the handshake, including removers that
        // arrive after an abnormal loop exit.
        self.shutdown.store(true, Ordering::Release);

        let mut table = self.table.lock().unwrap();
        table.pending_change = false;
        self.settled.notify_all();
    }
}
