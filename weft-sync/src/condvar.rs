//! A condition variable paired with [`FutexLock`].
//!
//! [`Condvar::wait`] atomically releases the guard's lock and parks; on
//! wakeup it reacquires the lock before returning. Wakeups may be spurious,
//! so callers must re-check their predicate in a loop.
//!
//! `notify_all` does not wake a herd: it wakes one waiter and requeues the
//! rest directly onto the lock's futex word, so they surface one at a time
//! as the lock is handed over.

use core::sync::atomic::{fence, AtomicPtr, AtomicU32, Ordering};
use std::fmt;
use std::ptr;

use crate::futex;
use crate::lock::{FutexLock, LockGuard, RawLock};

/// A condition variable for use with [`FutexLock`].
///
/// A condvar binds to the first lock it waits with and must be used with
/// that lock for its whole life; the lock must outlive every notification.
/// Keep the pair in one struct and both properties hold for free.
///
/// # Example
///
/// ```
/// use weft_sync::condvar::Condvar;
/// use weft_sync::lock::{FutexLock, RawLock};
///
/// let lock = FutexLock::new();
/// let ready = Condvar::new();
///
/// let guard = lock.guard();
/// // Nobody is waiting in this single-threaded example, so only
/// // demonstrate the notify side.
/// ready.notify_one();
/// drop(guard);
/// ```
#[derive(Default)]
pub struct Condvar {
    /// Bumped on every notification; waiters park on the pre-notification
    /// value so a concurrent notify always unparks them.
    seq: AtomicU32,
    /// Number of threads inside `wait`.
    waiters: AtomicU32,
    /// The lock this condvar is bound to.
    owner: AtomicPtr<FutexLock>,
}

impl Condvar {
    /// Creates a condition variable bound to no lock yet.
    pub const fn new() -> Self {
        Self {
            seq: AtomicU32::new(0),
            waiters: AtomicU32::new(0),
            owner: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Releases the guard's lock, parks until notified, and reacquires the
    /// lock before returning.
    ///
    /// Spurious wakeups are permitted; re-check the predicate in a loop.
    ///
    /// # Panics
    ///
    /// Panics if this condvar is used with a different lock than the one
    /// it first waited with.
    pub fn wait(&self, guard: &mut LockGuard<'_, FutexLock>) {
        let lock = guard.lock;
        let owner = lock as *const FutexLock as *mut FutexLock;
        let previous = self.owner.load(Ordering::Relaxed);
        assert!(
            previous.is_null() || previous == owner,
            "condition variable used with two different locks"
        );
        self.owner.store(owner, Ordering::Relaxed);

        self.waiters.fetch_add(1, Ordering::Relaxed);
        fence(Ordering::AcqRel);
        let seq = self.seq.load(Ordering::Relaxed);

        lock.unlock();

        futex::wait(&self.seq, seq);

        self.waiters.fetch_sub(1, Ordering::Relaxed);
        lock.lock_contended();
    }

    /// Wakes one waiting thread, if any.
    pub fn notify_one(&self) {
        self.seq.fetch_add(1, Ordering::AcqRel);
        if self.waiters.load(Ordering::Relaxed) != 0 {
            futex::wake(&self.seq, 1);
        }
    }

    /// Wakes all waiting threads.
    ///
    /// One waiter is woken outright; the rest are requeued onto the bound
    /// lock's word and wake as the lock becomes available.
    pub fn notify_all(&self) {
        self.seq.fetch_add(1, Ordering::AcqRel);
        if self.waiters.load(Ordering::Relaxed) != 0 {
            let owner = self.owner.load(Ordering::Relaxed);
            if owner.is_null() {
                futex::wake(&self.seq, i32::MAX);
            } else {
                // Safety: `owner` was stored by a waiter borrowing the lock
                // for the duration of its wait; a non-zero waiter count
                // means such a borrow is live, so the lock is too.
                let word = unsafe { (*owner).word() };
                futex::requeue(&self.seq, 1, i32::MAX, word);
            }
        }
    }
}

impl fmt::Debug for Condvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condvar")
            .field("waiters", &self.waiters.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    struct Flag {
        lock: FutexLock,
        cond: Condvar,
        set: AtomicBool,
    }

    impl Flag {
        fn new() -> Self {
            Self {
                lock: FutexLock::new(),
                cond: Condvar::new(),
                set: AtomicBool::new(false),
            }
        }

        fn wait_set(&self) {
            let mut guard = self.lock.guard();
            while !self.set.load(Ordering::Relaxed) {
                self.cond.wait(&mut guard);
            }
        }

        fn signal(&self, notify_all: bool) {
            let _guard = self.lock.guard();
            self.set.store(true, Ordering::Relaxed);
            if notify_all {
                self.cond.notify_all();
            } else {
                self.cond.notify_one();
            }
        }
    }

    #[test]
    fn notify_one_wakes_a_waiter() {
        let flag = Arc::new(Flag::new());
        let waiter = {
            let flag = Arc::clone(&flag);
            thread::spawn(move || flag.wait_set())
        };

        thread::sleep(Duration::from_millis(20));
        flag.signal(false);
        waiter.join().unwrap();
    }

    #[test]
    fn notify_all_wakes_every_waiter() {
        let flag = Arc::new(Flag::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let flag = Arc::clone(&flag);
                thread::spawn(move || flag.wait_set())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        flag.signal(true);
        for waiter in waiters {
            waiter.join().unwrap();
        }
    }

    #[test]
    fn notify_without_waiters_is_harmless() {
        let cond = Condvar::new();
        cond.notify_one();
        cond.notify_all();
    }
}
