use crate::error::{Error, Result};
use crate::queue::BoundedQueue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread;

use tracing::{debug, trace};

/// A unit of deferred work executed on a pool worker.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// How many tasks the shared queue holds per worker before submitters block.
const QUEUE_SLOTS_PER_WORKER: usize = 100;

/// A fixed set of worker threads pulling tasks from one [`BoundedQueue`].
///
/// Workers start immediately on construction and run until [`stop`]
/// (idempotent, also implied by drop) closes the queue and joins them.
/// [`submit`] blocks once the queue is saturated, which is the pool's
/// back-pressure: a caller that outruns the workers is slowed down rather
/// than allowed to grow an unbounded backlog.
///
/// A panicking task takes its worker down with it; fault isolation is the
/// task's own responsibility.
///
/// [`stop`]: Self::stop
/// [`submit`]: Self::submit
pub struct WorkerPool {
    running: Arc<AtomicBool>,
    queue: Arc<BoundedQueue<Task>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    stop_once: Once,
}

impl WorkerPool {
    /// Creates a pool with one worker per unit of host parallelism.
    pub fn new() -> Self {
        PoolBuilder::new().build()
    }

    /// Creates a pool with exactly `n` workers.
    pub fn with_threads(n: usize) -> Self {
        PoolBuilder::new().worker_threads(n).build()
    }

    fn start(threads: usize, queue_capacity: usize) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let queue = Arc::new(BoundedQueue::new(queue_capacity));

        let workers = (0..threads)
            .map(|id| {
                let running = running.clone();
                let queue = queue.clone();

                thread::Builder::new()
                    .name(format!("fulcrum-worker-{id}"))
                    .spawn(move || worker_loop(id, running, queue))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        debug!(threads, queue_capacity, "worker pool started");

        Self {
            running,
            queue,
            workers: Mutex::new(workers),
            stop_once: Once::new(),
        }
    }

    /// Enqueues a task, blocking while the queue is at capacity.
    ///
    /// Fails with [`Error::PoolStopped`] once [`stop`](Self::stop) has run.
    pub fn submit(&self, task: Task) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(Error::PoolStopped);
        }

        match self.queue.push(task, true) {
            Ok(_) => Ok(()),
            Err(Error::QueueClosed) => Err(Error::PoolStopped),
            Err(e) => Err(e),
        }
    }

    /// Number of tasks currently waiting for a worker. Advisory.
    pub fn backlog(&self) -> usize {
        self.queue.len()
    }

    /// Stops the pool: no further tasks run, all workers are joined.
    ///
    /// Safe to call repeatedly or from several threads at once; only the
    /// first caller performs the join sequence.
    pub fn stop(&self) {
        self.stop_once.call_once(|| {
            self.running.store(false, Ordering::Release);
            self.queue.close();

            let workers = std::mem::take(&mut *self.workers.lock().unwrap());
            for worker in workers {
                let _ = worker.join();
            }

            debug!("worker pool stopped");
        });
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(id: usize, running: Arc<AtomicBool>, queue: Arc<BoundedQueue<Task>>) {
    trace!(id, "worker up");

    while running.load(Ordering::Acquire) {
        // A closed queue drains remaining tasks, then yields None.
        let Some(task) = queue.pop() else {
            break;
        };

        task();
    }

    trace!(id, "worker down");
}

/// Builder for [`WorkerPool`].
pub struct PoolBuilder {
    worker_threads: usize,
    queue_capacity: Option<usize>,
}

impl PoolBuilder {
    pub fn new() -> Self {
        let worker_threads = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            worker_threads,
            queue_capacity: None,
        }
    }

    pub fn worker_threads(mut self, n: usize) -> Self {
        assert!(n > 0, "worker_threads must be > 0");

        self.worker_threads = n;
        self
    }

    /// Overrides the shared queue capacity. Defaults to
    /// `100 * worker_threads`.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn build(self) -> WorkerPool {
        let capacity = self
            .queue_capacity
            .unwrap_or(QUEUE_SLOTS_PER_WORKER * self.worker_threads);

        WorkerPool::start(self.worker_threads, capacity)
    }
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}
