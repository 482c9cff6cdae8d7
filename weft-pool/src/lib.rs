//! A fixed thread pool over the `weft-queue` queues.
//!
//! [`Task`] is a move-only, type-erased callable with small-buffer
//! storage: closures up to two words live inline, bigger ones cost one
//! allocation at submission and none afterwards. [`ThreadPool`] owns a
//! closable task queue (the bounded ring by default, the unbounded mutex
//! queue or anything else implementing
//! [`ConcurrentQueue`](weft_queue::ConcurrentQueue) by choice) and a
//! fixed set of workers that drain it until it closes.
//!
//! # Example
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use weft_pool::ThreadPool;
//!
//! let pool = ThreadPool::new(4);
//! let counter = Arc::new(AtomicUsize::new(0));
//!
//! for _ in 0..100 {
//!     let counter = Arc::clone(&counter);
//!     pool.submit(move || {
//!         counter.fetch_add(1, Ordering::Relaxed);
//!     })
//!     .unwrap();
//! }
//!
//! pool.wait();
//! assert_eq!(counter.load(Ordering::Relaxed), 100);
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, missing_debug_implementations)]

pub mod affinity;
pub mod pool;
pub mod task;

pub use pool::ThreadPool;
pub use task::{InvalidCall, Task};
