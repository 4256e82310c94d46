use crate::error::{Error, Result};

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// A thread-safe FIFO queue with a fixed maximum occupancy.
///
/// Producers block (or bail out) when the queue is full, consumers block
/// when it is empty, so a saturated queue propagates back-pressure to
/// whoever is pushing. [`close`](Self::close) wakes every blocked party:
/// pending pushes fail with [`Error::QueueClosed`] and pops drain the
/// remaining items before returning `None`.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

struct Inner<T> {
    items: VecDeque<T>,
    capacity: usize,
    closed: bool,
}

impl<T> Inner<T> {
    fn full(&self) -> bool {
        self.capacity != 0 && self.items.len() >= self.capacity
    }
}

impl<T> BoundedQueue<T> {
    /// Creates a queue holding at most `capacity` items.
    ///
    /// A capacity of 0 means unbounded; production callers always supply a
    /// positive capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                capacity,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Appends `item` at the tail.
    ///
    /// Returns `Ok(true)` once the item is queued. When the queue is at
    /// capacity, blocks until space frees if `block` is set, otherwise
    /// returns `Ok(false)` without touching the queue.
    pub fn push(&self, item: T, block: bool) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();

        while inner.full() {
            if inner.closed {
                return Err(Error::QueueClosed);
            }

            if !block {
                return Ok(false);
            }

            inner = self.not_full.wait(inner).unwrap();
        }

        if inner.closed {
            return Err(Error::QueueClosed);
        }

        inner.items.push_back(item);
        self.not_empty.notify_one();

        Ok(true)
    }

    /// Removes and returns the head, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();

        while inner.items.is_empty() {
            if inner.closed {
                return None;
            }

            inner = self.not_empty.wait(inner).unwrap();
        }

        let item = inner.items.pop_front();
        self.not_full.notify_one();

        item
    }

    /// Current occupancy. Advisory only: another thread may change it
    /// before the caller acts on the value.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes the queue, waking every blocked push and pop.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;

        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}
