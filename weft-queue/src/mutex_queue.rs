//! An unbounded FIFO behind a blocking lock and a condition variable.
//!
//! No novel machinery here: pushes append under the lock and signal one
//! waiter, pops wait on the condvar while the queue is open and empty.
//! Closing wakes everyone; pops keep succeeding while values remain and
//! report closed only once the queue is drained. The queue exists so that
//! consumers of [`ConcurrentQueue`] (the thread pool, most visibly) have an
//! unbounded alternative to the ring buffer.

use core::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt;

use weft_sync::backoff::Backoff;
use weft_sync::condvar::Condvar;
use weft_sync::lock::{FutexLock, RawLock};

use crate::{ConcurrentQueue, PopError, PushError, TryPopError, TryPushError};

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// An unbounded closable FIFO queue.
///
/// # Example
///
/// ```
/// use weft_queue::MutexQueue;
///
/// let queue = MutexQueue::new();
/// queue.push(1).unwrap();
/// assert_eq!(queue.pop(), Ok(1));
///
/// queue.close();
/// assert!(queue.push(2).is_err());
/// ```
pub struct MutexQueue<T> {
    lock: FutexLock,
    ready: Condvar,
    inner: UnsafeCell<Inner<T>>,
}

// Safety: `inner` is only touched while `lock` is held, which serializes
// all access; values are moved across threads, hence T: Send.
unsafe impl<T: Send> Send for MutexQueue<T> {}
unsafe impl<T: Send> Sync for MutexQueue<T> {}

impl<T> MutexQueue<T> {
    /// Creates an empty open queue.
    pub fn new() -> Self {
        Self {
            lock: FutexLock::new(),
            ready: Condvar::new(),
            inner: UnsafeCell::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
        }
    }

    /// Moves a value into the queue.
    ///
    /// Never blocks on capacity (the queue is unbounded); only lock
    /// acquisition can wait.
    pub fn push(&self, value: T) -> Result<(), PushError<T>> {
        let _guard = self.lock.guard();
        self.locked_push(value)
    }

    /// Like [`push`](Self::push), acquiring the lock with `backoff`.
    pub fn push_with_backoff<B: Backoff>(&self, value: T, backoff: B) -> Result<(), PushError<T>> {
        let _guard = self.lock.guard_with(backoff);
        self.locked_push(value)
    }

    /// Moves a value out of the queue, blocking until one is available or
    /// the queue is closed and drained.
    pub fn pop(&self) -> Result<T, PopError> {
        let mut guard = self.lock.guard();
        loop {
            // Safety: lock held (see the Send/Sync comment).
            let inner = unsafe { &mut *self.inner.get() };
            if let Some(value) = inner.items.pop_front() {
                return Ok(value);
            }
            if inner.closed {
                return Err(PopError);
            }
            self.ready.wait(&mut guard);
        }
    }

    /// Like [`pop`](Self::pop), acquiring the lock with `backoff`.
    pub fn pop_with_backoff<B: Backoff>(&self, backoff: B) -> Result<T, PopError> {
        let mut guard = self.lock.guard_with(backoff);
        loop {
            // Safety: lock held.
            let inner = unsafe { &mut *self.inner.get() };
            if let Some(value) = inner.items.pop_front() {
                return Ok(value);
            }
            if inner.closed {
                return Err(PopError);
            }
            self.ready.wait(&mut guard);
        }
    }

    /// Attempts to push without waiting for the lock.
    pub fn try_push(&self, value: T) -> Result<(), TryPushError<T>> {
        match self.lock.try_guard() {
            None => Err(TryPushError::Busy(value)),
            Some(_guard) => match self.locked_push(value) {
                Ok(()) => Ok(()),
                Err(PushError(value)) => Err(TryPushError::Closed(value)),
            },
        }
    }

    /// Attempts to pop without waiting for the lock or for a value.
    pub fn try_pop(&self) -> Result<T, TryPopError> {
        match self.lock.try_guard() {
            None => Err(TryPopError::Busy),
            Some(_guard) => {
                // Safety: lock held.
                let inner = unsafe { &mut *self.inner.get() };
                match inner.items.pop_front() {
                    Some(value) => Ok(value),
                    None if inner.closed => Err(TryPopError::Closed),
                    None => Err(TryPopError::Empty),
                }
            }
        }
    }

    /// Closes the queue and wakes every waiting consumer. Idempotent.
    pub fn close(&self) {
        let _guard = self.lock.guard();
        // Safety: lock held.
        let inner = unsafe { &mut *self.inner.get() };
        inner.closed = true;
        self.ready.notify_all();
    }

    /// Returns `true` once the queue has been closed.
    pub fn is_closed(&self) -> bool {
        let _guard = self.lock.guard();
        // Safety: lock held.
        unsafe { &*self.inner.get() }.closed
    }

    /// Returns `true` if the queue holds no values right now.
    pub fn is_empty(&self) -> bool {
        let _guard = self.lock.guard();
        // Safety: lock held.
        unsafe { &*self.inner.get() }.items.is_empty()
    }

    /// Returns the number of queued values right now.
    pub fn len(&self) -> usize {
        let _guard = self.lock.guard();
        // Safety: lock held.
        unsafe { &*self.inner.get() }.items.len()
    }

    fn locked_push(&self, value: T) -> Result<(), PushError<T>> {
        // Safety: every caller holds the lock.
        let inner = unsafe { &mut *self.inner.get() };
        if inner.closed {
            return Err(PushError(value));
        }
        inner.items.push_back(value);
        self.ready.notify_one();
        Ok(())
    }
}

impl<T> Default for MutexQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for MutexQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutexQueue")
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<T> ConcurrentQueue<T> for MutexQueue<T> {
    fn push(&self, value: T) -> Result<(), PushError<T>> {
        MutexQueue::push(self, value)
    }

    fn pop(&self) -> Result<T, PopError> {
        MutexQueue::pop(self)
    }

    fn try_push(&self, value: T) -> Result<(), TryPushError<T>> {
        MutexQueue::try_push(self, value)
    }

    fn try_pop(&self) -> Result<T, TryPopError> {
        MutexQueue::try_pop(self)
    }

    fn close(&self) {
        MutexQueue::close(self);
    }

    fn is_closed(&self) -> bool {
        MutexQueue::is_closed(self)
    }

    fn is_empty(&self) -> bool {
        MutexQueue::is_empty(self)
    }

    fn is_full(&self) -> bool {
        false
    }
}
