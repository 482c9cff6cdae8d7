//! The thread pool: fixed workers draining a closable task queue.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use weft_queue::bounded::wait::FutexWait;
use weft_queue::{BoundedMpmc, ConcurrentQueue, PushError};

use crate::affinity;
use crate::task::Task;

/// Capacity of the default task queue.
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

const STOP: u8 = 1;
const WAIT: u8 = 2;

struct Shared<Q> {
    queue: Q,
    flags: AtomicU8,
}

/// A fixed set of worker threads over a closable task queue.
///
/// Workers loop on the queue: run each task as it arrives, exit when the
/// queue reports closed. [`stop`](Self::stop) and [`wait`](Self::wait)
/// both close the queue (the first caller wins); `stop` additionally tells
/// workers to exit without draining what remains, while `wait` lets the
/// queue drain and then joins every worker. Dropping the pool stops and
/// joins it.
///
/// The queue type is pluggable: the default is a futex-waiting bounded
/// ring of capacity 1024, so `submit` blocks when the pool is saturated
/// and parks rather than spins.
///
/// # Example
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use weft_pool::ThreadPool;
/// use weft_queue::MutexQueue;
///
/// // An unbounded queue instead of the default bounded ring.
/// let pool = ThreadPool::with_queue(2, MutexQueue::new());
/// let ran = Arc::new(AtomicUsize::new(0));
///
/// for _ in 0..10 {
///     let ran = Arc::clone(&ran);
///     pool.submit(move || {
///         ran.fetch_add(1, Ordering::Relaxed);
///     })
///     .unwrap();
/// }
///
/// pool.wait();
/// assert_eq!(ran.load(Ordering::Relaxed), 10);
/// ```
pub struct ThreadPool<Q = BoundedMpmc<Task, FutexWait>>
where
    Q: ConcurrentQueue<Task> + Send + Sync + 'static,
{
    shared: Arc<Shared<Q>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    /// Creates a pool of `workers` threads over the default bounded queue.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is zero.
    pub fn new(workers: usize) -> Self {
        Self::with_queue(workers, BoundedMpmc::new(DEFAULT_QUEUE_CAPACITY))
    }
}

impl<Q> ThreadPool<Q>
where
    Q: ConcurrentQueue<Task> + Send + Sync + 'static,
{
    /// Creates a pool of `workers` threads draining `queue`.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is zero.
    pub fn with_queue(workers: usize, queue: Q) -> Self {
        assert!(workers > 0, "thread pool needs at least one worker");

        let shared = Arc::new(Shared {
            queue,
            flags: AtomicU8::new(0),
        });

        let handles = (0..workers)
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || Self::work(&shared))
            })
            .collect();

        Self {
            shared,
            workers: Mutex::new(handles),
        }
    }

    fn work(shared: &Shared<Q>) {
        while shared.flags.load(Ordering::Relaxed) & STOP == 0 {
            match shared.queue.pop() {
                Ok(task) => {
                    // Tasks built by submit are never null, so call()
                    // cannot report an invalid invocation here.
                    let _ = task.call();
                }
                Err(_closed) => break,
            }
        }
    }

    /// Constructs a task from `target` and pushes it onto the queue,
    /// blocking if the queue is bounded and full.
    ///
    /// # Errors
    ///
    /// Returns the task if the queue is closed (the pool was stopped or
    /// waited on).
    pub fn submit<F>(&self, target: F) -> Result<(), PushError<Task>>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.queue.push(Task::new(target))
    }

    /// Tells workers to exit as soon as they finish their current task and
    /// closes the queue. Does not join; pair with [`wait`](Self::wait).
    pub fn stop(&self) {
        self.close(STOP);
    }

    /// Closes the queue, lets workers drain the remaining tasks, and joins
    /// them. Safe to call from multiple threads; each joins whatever
    /// workers are left to join.
    pub fn wait(&self) {
        self.close(WAIT);
        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for worker in workers.drain(..) {
            // A worker that panicked already tore its task down; the pool
            // keeps joining the rest.
            let _ = worker.join();
        }
    }

    /// Returns `true` once [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.shared.flags.load(Ordering::Relaxed) & STOP != 0
    }

    /// Returns the number of workers the pool was built with.
    pub fn workers(&self) -> usize {
        let workers = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        workers.len()
    }

    /// Restricts worker `index` to the given CPUs.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `index` does not name a live worker or
    /// the CPU set is unusable, and the OS error if the syscall fails.
    /// Succeeds without effect on platforms without thread affinity.
    pub fn pin_worker(&self, index: usize, cpus: &[usize]) -> io::Result<()> {
        let workers = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let handle = workers.get(index).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no such worker")
        })?;
        affinity::pin_thread(handle, cpus)
    }

    fn close(&self, flag: u8) {
        if self.shared.flags.fetch_or(flag, Ordering::Relaxed) == 0 {
            self.shared.queue.close();
        }
    }
}

impl<Q> Drop for ThreadPool<Q>
where
    Q: ConcurrentQueue<Task> + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.stop();
        self.wait();
    }
}

impl<Q> fmt::Debug for ThreadPool<Q>
where
    Q: ConcurrentQueue<Task> + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("workers", &self.workers())
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_submitted_tasks() {
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..1000 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        }

        pool.wait();
        assert_eq!(counter.load(Ordering::Relaxed), 1000);
    }

    #[test]
    fn submit_after_wait_is_refused() {
        let pool = ThreadPool::new(2);
        pool.wait();
        assert!(pool.submit(|| {}).is_err());
    }

    #[test]
    fn submit_after_stop_is_refused() {
        let pool = ThreadPool::new(2);
        pool.stop();
        pool.wait();
        assert!(pool.is_stopped());
        assert!(pool.submit(|| {}).is_err());
    }

    #[test]
    fn wait_is_safe_to_repeat() {
        let pool = ThreadPool::new(2);
        pool.submit(|| {}).unwrap();
        pool.wait();
        pool.wait();
    }

    #[test]
    fn mutex_queue_backed_pool_runs_tasks() {
        let pool = ThreadPool::with_queue(2, weft_queue::MutexQueue::new());
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        }

        pool.wait();
        assert_eq!(counter.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn pin_worker_validates_the_index() {
        let pool = ThreadPool::new(1);
        assert!(pool.pin_worker(5, &[0]).is_err());
        pool.wait();
    }
}
