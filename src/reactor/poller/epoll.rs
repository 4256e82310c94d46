//! Edge-triggered epoll backend.
//!
//! Wraps the raw epoll syscalls behind the [`Poller`] trait. Every
//! registration carries `EPOLLET`, so an event fires once per readiness
//! transition and consumers are expected to drain the descriptor. An
//! eventfd lives in the same epoll set as the explicit wake primitive for
//! registration handshakes and shutdown.
//!
//! Interest is tracked in a growable per-descriptor map; there is no hard
//! descriptor ceiling, only a fixed per-wait event batch.

use super::{Interest, Poller};
use crate::error::Result;

use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::sync::Mutex;

/// Upper bound on events returned by one wait call. Larger batches mean
/// fewer syscalls but more stack.
const MAX_EVENTS: usize = 64;

pub(crate) struct Epoll {
    epoll_fd: RawFd,
    wake_fd: RawFd,
    interest: Mutex<HashMap<RawFd, Interest>>,
}

impl Epoll {
    pub(crate) fn new() -> Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if wake_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(err.into());
        }

        let poller = Self {
            epoll_fd,
            wake_fd,
            interest: Mutex::new(HashMap::new()),
        };

        poller.ctl(libc::EPOLL_CTL_ADD, wake_fd, Interest::READ)?;

        Ok(poller)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) -> Result<()> {
        let mut event = libc::epoll_event {
            events: event_bits(interest),
            u64: fd as u64,
        };

        let res = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) };
        if res < 0 {
            return Err(io::Error::last_os_error().into());
        }

        Ok(())
    }
}

fn event_bits(interest: Interest) -> u32 {
    let mut bits = libc::EPOLLET as u32;

    if interest.read {
        bits |= libc::EPOLLIN as u32;
    }

    if interest.write {
        bits |= libc::EPOLLOUT as u32;
    }

    bits
}

impl Poller for Epoll {
    fn watch(&self, fd: RawFd, interest: Interest) -> Result<()> {
        let mut table = self.interest.lock().unwrap();

        let prior = table.get(&fd).copied().unwrap_or_default();
        let combined = prior.with(interest);

        let op = if prior.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };

        self.ctl(op, fd, combined)?;
        table.insert(fd, combined);

        Ok(())
    }

    fn unwatch(&self, fd: RawFd, interest: Interest) -> Result<bool> {
        let mut table = self.interest.lock().unwrap();

        let Some(prior) = table.get(&fd).copied() else {
            return Ok(true);
        };

        let remaining = prior.without(interest);

        if remaining.is_empty() {
            // Removing an already-closed descriptor is not an error worth
            // surfacing; the kernel dropped it from the set on close.
            let _ = self.ctl(libc::EPOLL_CTL_DEL, fd, remaining);
            table.remove(&fd);
            return Ok(true);
        }

        self.ctl(libc::EPOLL_CTL_MOD, fd, remaining)?;
        table.insert(fd, remaining);

        Ok(false)
    }

    fn is_watching(&self, fd: RawFd, interest: Interest) -> bool {
        self.interest.lock().unwrap().get(&fd) == Some(&interest)
    }

    fn wait(&self, readable: &mut Vec<RawFd>, writable: &mut Vec<RawFd>) -> Result<()> {
        let mut ready: [libc::epoll_event; MAX_EVENTS] = unsafe { mem::zeroed() };

        let num = unsafe {
            libc::epoll_wait(self.epoll_fd, ready.as_mut_ptr(), MAX_EVENTS as i32, -1)
        };

        if num < 0 {
            let err = io::Error::last_os_error();

            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }

            return Err(err.into());
        }

        for event in &ready[..num as usize] {
            let fd = event.u64 as RawFd;

            if fd == self.wake_fd {
                self.drain_wake();
                continue;
            }

            // Error and hangup surface as readability so the read path
            // observes the failure and kills the connection.
            let read_bits =
                (libc::EPOLLIN | libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLRDHUP) as u32;

            if event.events & read_bits != 0 {
                readable.push(fd);
            }

            if event.events & libc::EPOLLOUT as u32 != 0 {
                writable.push(fd);
            }
        }

        Ok(())
    }

    fn wake(&self) -> Result<()> {
        let one: u64 = 1;

        let res = unsafe {
            libc::write(
                self.wake_fd,
                (&raw const one).cast(),
                mem::size_of::<u64>(),
            )
        };

        if res < 0 {
            return Err(io::Error::last_os_error().into());
        }

        Ok(())
    }
}

impl Epoll {
    fn drain_wake(&self) {
        let mut counter: u64 = 0;

        unsafe {
            libc::read(
                self.wake_fd,
                (&raw mut counter).cast(),
                mem::size_of::<u64>(),
            )
        };
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epoll_fd);
        }
    }
}
