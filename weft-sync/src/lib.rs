//! Low-level waiting and mutual exclusion for throughput-sensitive code.
//!
//! This crate collects the primitives that the rest of the `weft` workspace
//! spins, sleeps and blocks on:
//!
//! - [`pause`]: architecture-appropriate micro-delays (busy cycles, the CPU
//!   spin-wait hint, short sleeps).
//! - [`backoff`]: stateful policies that compose those delays into waiting
//!   strategies and signal when a caller should escalate to a real block.
//! - [`futex`]: park/unpark keyed on the address of a 32-bit atomic word,
//!   with a condvar-backed emulation where the OS offers no such call.
//! - [`lock`]: spinning and blocking locks whose acquisition loops are
//!   parameterized by a backoff.
//! - [`condvar`]: a condition variable paired with the blocking lock.
//!
//! # Example
//!
//! ```
//! use weft_sync::backoff::ExponentialBackoff;
//! use weft_sync::lock::{RawLock, TicketLock};
//! use weft_sync::pause::CpuRelax;
//!
//! let lock = TicketLock::new();
//! lock.lock_with(ExponentialBackoff::<CpuRelax>::new(64));
//! // ... critical section ...
//! lock.unlock();
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, missing_debug_implementations)]

pub mod backoff;
pub mod condvar;
pub mod futex;
pub mod lock;
pub mod pause;

pub use backoff::{
    Backoff, CompositeBackoff, ConstBackoff, ExponentialBackoff, LinearBackoff, NoBackoff,
    ProportionalBackoff, YieldBackoff,
};
pub use condvar::Condvar;
pub use lock::{FutexLock, LockGuard, RawLock, SpinLock, TatasLock, TicketLock};
pub use pause::{CpuCycle, CpuRelax, NanoSleep, Pause};
