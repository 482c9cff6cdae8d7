//! Slot tokens and the waiting strategies layered on them.
//!
//! Every ring slot carries a token: a 32-bit atomic word whose high bits
//! hold the sequence number the slot expects next and whose low bits hold
//! status flags. A [`SlotWait`] implementation owns that word and decides
//! what a thread does when the token is not yet the one it needs: spin,
//! yield, park in the OS, or sleep on a slot-local condition variable.
//!
//! The queue's protocol loop is the same for all strategies; only the
//! `wait`/`wake` pair changes, so strategy selection is a type parameter
//! and monomorphizes to zero dispatch overhead.

use core::sync::atomic::{AtomicU32, Ordering};

use weft_sync::condvar::Condvar;
use weft_sync::futex;
use weft_sync::lock::{FutexLock, RawLock};

/// Number of low token bits reserved for status flags.
pub const STATUS_BITS: u32 = 4;

/// A value is present in the slot and safe to move out.
pub const VALID: u32 = 1 << 0;

/// The producer failed mid-publish; the slot holds no usable value and
/// consumers skip it.
pub const INVALID: u32 = 1 << 1;

/// At least one thread is parked on this slot (futex strategy only).
pub const WAITING: u32 = 1 << 2;

/// The queue was closed; parked threads must re-check their tickets.
pub const CLOSED: u32 = 1 << 3;

/// Mask selecting the sequence bits of a token.
pub const SEQ_MASK: u32 = !((1 << STATUS_BITS) - 1);

/// A slot token plus the policy for waiting on it.
///
/// `wait` takes the token value the caller just observed and returns a
/// fresh observation, having possibly slept in between. `wake` publishes a
/// new token with release ordering and unparks anyone the strategy put to
/// sleep. `close` flags the token so parked threads wake and re-check the
/// queue's close state.
pub trait SlotWait: Send + Sync + Default {
    /// Sets the token's initial value. Called once per slot before the
    /// queue is shared.
    fn init(&self, value: u32);

    /// Reads the token with acquire ordering.
    fn load(&self) -> u32;

    /// Waits until the token has (probably) changed from `current`, then
    /// returns a fresh read. May return spuriously.
    fn wait(&self, current: u32) -> u32;

    /// Publishes a new token value and wakes any parked threads.
    fn wake(&self, value: u32);

    /// Sets the [`CLOSED`] flag and wakes any parked threads.
    fn close(&self);
}

/// Pure spinning: waiting rereads the token and nothing ever parks.
///
/// Lowest latency when a peer is always running on another core; burns a
/// full core while it waits.
#[derive(Debug, Default)]
pub struct SpinWait {
    token: AtomicU32,
}

impl SlotWait for SpinWait {
    #[inline]
    fn init(&self, value: u32) {
        self.token.store(value, Ordering::Relaxed);
    }

    #[inline]
    fn load(&self) -> u32 {
        self.token.load(Ordering::Acquire)
    }

    #[inline]
    fn wait(&self, _current: u32) -> u32 {
        self.load()
    }

    #[inline]
    fn wake(&self, value: u32) {
        self.token.store(value, Ordering::Release);
    }

    fn close(&self) {
        self.token.fetch_or(CLOSED, Ordering::Release);
    }
}

/// Spinning with a scheduler yield between rereads.
///
/// The compromise default: near-spin latency when the machine is idle,
/// and other runnable threads get the core when it is not.
#[derive(Debug, Default)]
pub struct YieldWait {
    token: AtomicU32,
}

impl SlotWait for YieldWait {
    #[inline]
    fn init(&self, value: u32) {
        self.token.store(value, Ordering::Relaxed);
    }

    #[inline]
    fn load(&self) -> u32 {
        self.token.load(Ordering::Acquire)
    }

    #[inline]
    fn wait(&self, _current: u32) -> u32 {
        std::thread::yield_now();
        self.load()
    }

    #[inline]
    fn wake(&self, value: u32) {
        self.token.store(value, Ordering::Release);
    }

    fn close(&self) {
        self.token.fetch_or(CLOSED, Ordering::Release);
    }
}

/// OS-level parking keyed on the token word itself.
///
/// A waiter flags the token with [`WAITING`] and parks in the kernel; a
/// waker that observes the flag wakes every thread parked on the slot.
/// Waking all is deliberate: at most one of them can proceed, but per-slot
/// parking stays trivially correct and the herd is bounded by the threads
/// committed to this one slot.
#[derive(Debug, Default)]
pub struct FutexWait {
    token: AtomicU32,
}

impl SlotWait for FutexWait {
    #[inline]
    fn init(&self, value: u32) {
        self.token.store(value, Ordering::Relaxed);
    }

    #[inline]
    fn load(&self) -> u32 {
        self.token.load(Ordering::Acquire)
    }

    fn wait(&self, current: u32) -> u32 {
        let marked = current | WAITING;
        match self
            .token
            .compare_exchange(current, marked, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => {
                futex::wait(&self.token, marked);
            }
            Err(observed) => {
                // Someone else already flagged the slot: join them. Any
                // other change means the token moved on and there is no
                // reason to sleep.
                if observed == marked {
                    futex::wait(&self.token, marked);
                }
            }
        }
        self.load()
    }

    fn wake(&self, value: u32) {
        let previous = self.token.swap(value, Ordering::AcqRel);
        if previous & WAITING != 0 {
            futex::wake(&self.token, i32::MAX);
        }
    }

    fn close(&self) {
        let previous = self.token.fetch_or(CLOSED, Ordering::AcqRel);
        if previous & WAITING != 0 {
            futex::wake(&self.token, i32::MAX);
        }
    }
}

/// A slot-local lock and condition variable.
///
/// The portable fallback shape: no token-word tricks, just sleep while the
/// token still holds the value we saw. Heavier than [`FutexWait`] per
/// wakeup, with the same protocol semantics.
#[derive(Debug, Default)]
pub struct CondvarWait {
    token: AtomicU32,
    lock: FutexLock,
    changed: Condvar,
}

impl SlotWait for CondvarWait {
    #[inline]
    fn init(&self, value: u32) {
        self.token.store(value, Ordering::Relaxed);
    }

    #[inline]
    fn load(&self) -> u32 {
        self.token.load(Ordering::Acquire)
    }

    fn wait(&self, current: u32) -> u32 {
        let mut guard = self.lock.guard();
        if self.token.load(Ordering::Relaxed) == current {
            self.changed.wait(&mut guard);
        }
        drop(guard);
        self.load()
    }

    fn wake(&self, value: u32) {
        let _guard = self.lock.guard();
        self.token.store(value, Ordering::Release);
        self.changed.notify_all();
    }

    fn close(&self) {
        let _guard = self.lock.guard();
        self.token.fetch_or(CLOSED, Ordering::Release);
        self.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn wake_reaches_waiter<W: SlotWait + 'static>() {
        let slot = Arc::new(W::default());
        slot.init(0);

        let waiter = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                let mut token = slot.load();
                // The WAITING flag is set by wait() itself; only a change
                // in the sequence bits means the waited-for event happened.
                while token & SEQ_MASK == 0 {
                    token = slot.wait(token);
                }
                token & SEQ_MASK
            })
        };

        thread::sleep(Duration::from_millis(10));
        slot.wake(SEQ_MASK & 0x40);
        assert_eq!(waiter.join().unwrap(), 0x40);
    }

    #[test]
    fn spin_wake_reaches_waiter() {
        wake_reaches_waiter::<SpinWait>();
    }

    #[test]
    fn yield_wake_reaches_waiter() {
        wake_reaches_waiter::<YieldWait>();
    }

    #[test]
    fn futex_wake_reaches_waiter() {
        wake_reaches_waiter::<FutexWait>();
    }

    #[test]
    fn condvar_wake_reaches_waiter() {
        wake_reaches_waiter::<CondvarWait>();
    }

    fn close_unblocks_waiter<W: SlotWait + 'static>() {
        let slot = Arc::new(W::default());
        slot.init(0);

        let waiter = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                let mut token = slot.load();
                while token & CLOSED == 0 {
                    token = slot.wait(token);
                }
            })
        };

        thread::sleep(Duration::from_millis(10));
        slot.close();
        waiter.join().unwrap();
    }

    #[test]
    fn futex_close_unblocks_waiter() {
        close_unblocks_waiter::<FutexWait>();
    }

    #[test]
    fn condvar_close_unblocks_waiter() {
        close_unblocks_waiter::<CondvarWait>();
    }

    #[test]
    fn futex_waiting_flag_round_trips() {
        let slot = FutexWait::default();
        slot.init(0x10);
        // A wake with no waiter flag must not issue a wakeup, only store.
        slot.wake(0x20);
        assert_eq!(slot.load(), 0x20);
    }
}
