//! Park and unpark threads on the address of a 32-bit atomic word.
//!
//! On Linux these are thin wrappers over the `futex` syscall. Everywhere
//! else the same contract is emulated with a fixed table of bucketed
//! mutex/condvar pairs hashed by word address.
//!
//! All three operations are best-effort: [`wait`] may return spuriously and
//! [`wake`]/[`requeue`] may wake threads that have nothing to do. Callers
//! must re-check their predicate after every return; every user in this
//! workspace does.
//!
//! Return values follow the syscall convention: a non-negative count on
//! success, a negated `errno` on failure. Callers that treat wakeups as
//! best-effort are free to ignore them.

use core::sync::atomic::AtomicU32;

/// Parks the calling thread while `*futex == expected`.
///
/// Returns immediately if the word does not hold `expected` by the time the
/// thread would sleep. Spurious returns are permitted.
#[inline]
pub fn wait(futex: &AtomicU32, expected: u32) -> i32 {
    sys::wait(futex, expected)
}

/// Wakes up to `count` threads parked on `futex`.
///
/// Returns the number of threads woken (best-effort on emulated targets).
#[inline]
pub fn wake(futex: &AtomicU32, count: i32) -> i32 {
    sys::wake(futex, count)
}

/// Wakes up to `wake_count` threads parked on `futex` and moves up to
/// `requeue_count` of the remainder onto `target`, as if they had parked
/// there originally.
///
/// Used by condition variables to hand waiters straight to a lock's wait
/// queue instead of waking a herd that would immediately contend. Emulated
/// targets degrade to waking everything on `futex`.
#[inline]
pub fn requeue(futex: &AtomicU32, wake_count: i32, requeue_count: i32, target: &AtomicU32) -> i32 {
    sys::requeue(futex, wake_count, requeue_count, target)
}

#[cfg(target_os = "linux")]
mod sys {
    use core::sync::atomic::AtomicU32;
    use std::io;
    use std::ptr;

    fn errno() -> i32 {
        io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL)
    }

    pub(super) fn wait(futex: &AtomicU32, expected: u32) -> i32 {
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                futex as *const AtomicU32,
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                expected,
                ptr::null::<libc::timespec>(),
            )
        };
        if rc == -1 {
            -errno()
        } else {
            0
        }
    }

    pub(super) fn wake(futex: &AtomicU32, count: i32) -> i32 {
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                futex as *const AtomicU32,
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                count,
            )
        };
        if rc == -1 {
            -errno()
        } else {
            rc as i32
        }
    }

    pub(super) fn requeue(
        futex: &AtomicU32,
        wake_count: i32,
        requeue_count: i32,
        target: &AtomicU32,
    ) -> i32 {
        // The fourth argument slot carries the requeue limit for
        // FUTEX_REQUEUE; there is no timeout.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                futex as *const AtomicU32,
                libc::FUTEX_REQUEUE | libc::FUTEX_PRIVATE_FLAG,
                wake_count,
                requeue_count as libc::c_long,
                target as *const AtomicU32,
            )
        };
        if rc == -1 {
            -errno()
        } else {
            rc as i32
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    //! Condvar-backed emulation for targets without an addressable wait
    //! syscall. Words hash into a small fixed table of mutex/condvar
    //! buckets; colliding words produce extra spurious wakeups, which the
    //! contract already permits.

    use core::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Condvar, Mutex, OnceLock, PoisonError};

    struct Bucket {
        lock: Mutex<()>,
        cond: Condvar,
    }

    const BUCKETS: usize = 64;

    fn bucket(futex: &AtomicU32) -> &'static Bucket {
        static TABLE: OnceLock<Box<[Bucket]>> = OnceLock::new();
        let table = TABLE.get_or_init(|| {
            (0..BUCKETS)
                .map(|_| Bucket {
                    lock: Mutex::new(()),
                    cond: Condvar::new(),
                })
                .collect()
        });
        let addr = futex as *const AtomicU32 as usize;
        &table[(addr >> 2) & (BUCKETS - 1)]
    }

    pub(super) fn wait(futex: &AtomicU32, expected: u32) -> i32 {
        let bucket = bucket(futex);
        let guard = bucket
            .lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Re-check under the bucket lock: a waker stores the new value
        // before taking this lock, so either we see it here or the
        // notification cannot be lost.
        if futex.load(Ordering::Acquire) != expected {
            return 0;
        }
        let _guard = bucket
            .cond
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner);
        0
    }

    pub(super) fn wake(futex: &AtomicU32, count: i32) -> i32 {
        let bucket = bucket(futex);
        let _guard = bucket
            .lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if count == 1 {
            bucket.cond.notify_one();
        } else {
            bucket.cond.notify_all();
        }
        0
    }

    pub(super) fn requeue(
        futex: &AtomicU32,
        _wake_count: i32,
        _requeue_count: i32,
        _target: &AtomicU32,
    ) -> i32 {
        // No way to move emulated waiters between buckets; wake everything
        // and let them re-check their predicates.
        wake(futex, i32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_returns_on_value_mismatch() {
        let futex = AtomicU32::new(1);
        // Expected value differs from the stored one, so this must not block.
        wait(&futex, 0);
    }

    #[test]
    fn wake_without_waiters_is_harmless() {
        let futex = AtomicU32::new(0);
        assert!(wake(&futex, i32::MAX) >= 0);
    }

    #[test]
    fn woken_thread_observes_new_value() {
        let futex = Arc::new(AtomicU32::new(0));
        let futex2 = Arc::clone(&futex);

        let waiter = thread::spawn(move || {
            // Spurious returns are fine; re-check in a loop.
            while futex2.load(Ordering::Acquire) == 0 {
                wait(&futex2, 0);
            }
            futex2.load(Ordering::Acquire)
        });

        thread::sleep(Duration::from_millis(10));
        futex.store(7, Ordering::Release);
        wake(&futex, i32::MAX);

        assert_eq!(waiter.join().unwrap(), 7);
    }
}
