//! Mutual-exclusion locks with backoff-parameterized acquisition.
//!
//! Every lock implements [`RawLock`]: a raw flag with `lock` / `try_lock` /
//! `unlock` and no owned data. Acquisition loops accept any
//! [`Backoff`](crate::backoff::Backoff) by value; the plain `lock` uses
//! [`NoBackoff`], which for the spinning locks means a tight retry loop and
//! for [`FutexLock`] means parking on the first failed attempt.
//!
//! Acquisition carries acquire ordering and release carries release
//! ordering, so data written before `unlock` is visible after the next
//! `lock`. Calling `unlock` without a matching `lock` on the same thread is
//! a logic error: it will not corrupt memory, but it hands the lock to
//! nobody in particular.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crossbeam_utils::CachePadded;

use crate::backoff::{Backoff, NoBackoff};
use crate::futex;

/// A raw mutual-exclusion flag.
pub trait RawLock {
    /// Acquires the lock, spinning or blocking as the implementation
    /// dictates.
    #[inline]
    fn lock(&self) {
        self.lock_with(NoBackoff);
    }

    /// Acquires the lock, delaying between failed attempts with `backoff`.
    fn lock_with<B: Backoff>(&self, backoff: B);

    /// Attempts to acquire the lock without waiting.
    fn try_lock(&self) -> bool;

    /// Releases the lock.
    fn unlock(&self);

    /// Acquires the lock and returns a guard that releases it on drop.
    #[inline]
    fn guard(&self) -> LockGuard<'_, Self>
    where
        Self: Sized,
    {
        self.lock();
        LockGuard { lock: self }
    }

    /// Acquires the lock with `backoff` and returns a releasing guard.
    #[inline]
    fn guard_with<B: Backoff>(&self, backoff: B) -> LockGuard<'_, Self>
    where
        Self: Sized,
    {
        self.lock_with(backoff);
        LockGuard { lock: self }
    }

    /// Attempts to acquire the lock, returning a releasing guard on
    /// success.
    #[inline]
    fn try_guard(&self) -> Option<LockGuard<'_, Self>>
    where
        Self: Sized,
    {
        if self.try_lock() {
            Some(LockGuard { lock: self })
        } else {
            None
        }
    }
}

/// Releases a [`RawLock`] when dropped.
#[derive(Debug)]
pub struct LockGuard<'a, L: RawLock> {
    pub(crate) lock: &'a L,
}

impl<L: RawLock> Drop for LockGuard<'_, L> {
    #[inline]
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// The plainest spin lock: test-and-set on a single flag.
///
/// Every failed attempt performs a write cycle on the flag's cache line,
/// so heavy contention bounces the line between cores. Prefer
/// [`TatasLock`] when more than a couple of threads contend.
#[derive(Debug, Default)]
pub struct SpinLock {
    flag: AtomicBool,
}

impl SpinLock {
    /// Creates an unlocked spin lock.
    pub const fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
        }
    }
}

impl RawLock for SpinLock {
    fn lock_with<B: Backoff>(&self, mut backoff: B) {
        while self.flag.swap(true, Ordering::Acquire) {
            backoff.backoff();
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        !self.flag.swap(true, Ordering::Acquire)
    }

    #[inline]
    fn unlock(&self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Test-and-test-and-set: spin on a plain read, attempt the swap only when
/// the flag was observed clear.
///
/// Waiters share the cache line in the shared state instead of fighting
/// over exclusive ownership, which keeps contention off the bus.
#[derive(Debug, Default)]
pub struct TatasLock {
    flag: AtomicBool,
}

impl TatasLock {
    /// Creates an unlocked lock.
    pub const fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
        }
    }
}

impl RawLock for TatasLock {
    fn lock_with<B: Backoff>(&self, mut backoff: B) {
        loop {
            if !self.flag.load(Ordering::Relaxed) && !self.flag.swap(true, Ordering::Acquire) {
                return;
            }
            backoff.backoff();
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        !self.flag.load(Ordering::Relaxed) && !self.flag.swap(true, Ordering::Acquire)
    }

    #[inline]
    fn unlock(&self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// A FIFO spin lock: acquirers take a ticket and are served in order.
///
/// The backoff receives the distance from the head of the line through
/// [`Backoff::backoff_by`], so a
/// [`ProportionalBackoff`](crate::backoff::ProportionalBackoff) makes
/// threads far back in the queue poll less often.
#[derive(Debug, Default)]
pub struct TicketLock {
    head: CachePadded<AtomicU32>,
    tail: CachePadded<AtomicU32>,
}

impl TicketLock {
    /// Creates an unlocked ticket lock.
    pub fn new() -> Self {
        Self::default()
    }
}

impl RawLock for TicketLock {
    fn lock_with<B: Backoff>(&self, mut backoff: B) {
        let ticket = self.tail.fetch_add(1, Ordering::Relaxed);
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head == ticket {
                return;
            }
            backoff.backoff_by(ticket.wrapping_sub(head));
        }
    }

    fn try_lock(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Relaxed);
        // Only claim a ticket that would be served immediately.
        head == tail
            && self
                .tail
                .compare_exchange(tail, tail.wrapping_add(1), Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
    }

    #[inline]
    fn unlock(&self) {
        self.head.fetch_add(1, Ordering::Release);
    }
}

/// A blocking lock over a three-state futex word.
///
/// The word is 0 when unlocked, 1 when locked with no waiters, 2 when
/// locked with possible waiters. Acquisition spins under the caller's
/// backoff; when the backoff reaches its ceiling the thread marks the word
/// contended and parks in the OS. Release only issues a wake syscall when
/// the word says somebody may be parked.
#[derive(Debug, Default)]
pub struct FutexLock {
    word: AtomicU32,
}

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

impl FutexLock {
    /// Creates an unlocked lock.
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(UNLOCKED),
        }
    }

    pub(crate) fn word(&self) -> &AtomicU32 {
        &self.word
    }

    /// Acquires through the contended path, leaving the word marked
    /// contended. Used on the slow path and by the condition variable when
    /// it reacquires after a wait.
    pub(crate) fn lock_contended(&self) {
        while self.word.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
            futex::wait(&self.word, CONTENDED);
        }
    }
}

impl RawLock for FutexLock {
    fn lock_with<B: Backoff>(&self, mut backoff: B) {
        loop {
            match self
                .word
                .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => {
                    if backoff.backoff() {
                        if observed == CONTENDED
                            || self.word.swap(CONTENDED, Ordering::Acquire) != UNLOCKED
                        {
                            self.lock_contended();
                        }
                        return;
                    }
                }
            }
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        self.word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn unlock(&self) {
        if self.word.fetch_sub(1, Ordering::Release) != LOCKED {
            // The word was 2: somebody may be parked. Hand the lock back
            // and wake one waiter.
            self.word.store(UNLOCKED, Ordering::Release);
            futex::wake(&self.word, 1);
        }
    }
}
