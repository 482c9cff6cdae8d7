//! A move-only callable for thread-pool dispatch.
//!
//! `std` closures erased through `Box<dyn FnOnce()>` pay an allocation per
//! task no matter how small the closure. A [`Task`] instead carries a
//! two-word inline buffer and a static vtable: targets that fit the buffer
//! (a function pointer, a closure over a couple of references) are stored
//! in place, and only larger targets fall back to one heap allocation
//! whose pointer then occupies the buffer. Moving a task is always a plain
//! memcpy; ownership of the target travels with the task, from the
//! submitting thread through the queue to the worker that runs it.

use core::fmt;
use core::mem::{self, MaybeUninit};
use std::marker::PhantomData;

const INLINE_WORDS: usize = 2;

type Repr = [usize; INLINE_WORDS];

/// Error returned when a null task is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidCall;

impl fmt::Display for InvalidCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invoked a null task")
    }
}

impl std::error::Error for InvalidCall {}

struct TaskVtable {
    /// Moves the target out of the buffer and runs it.
    invoke: unsafe fn(*mut u8),
    /// Destroys the target without running it.
    dispose: unsafe fn(*mut u8),
}

struct Vtables<F>(PhantomData<F>);

impl<F: FnOnce() + Send + 'static> Vtables<F> {
    const INLINE: TaskVtable = TaskVtable {
        invoke: Self::invoke_inline,
        dispose: Self::dispose_inline,
    };

    const BOXED: TaskVtable = TaskVtable {
        invoke: Self::invoke_boxed,
        dispose: Self::dispose_boxed,
    };

    /// # Safety
    /// `repr` holds an initialized inline `F` that is never touched again.
    unsafe fn invoke_inline(repr: *mut u8) {
        let target = unsafe { repr.cast::<F>().read() };
        target();
    }

    /// # Safety
    /// `repr` holds an initialized inline `F` that is never touched again.
    unsafe fn dispose_inline(repr: *mut u8) {
        unsafe { repr.cast::<F>().drop_in_place() };
    }

    /// # Safety
    /// `repr` holds a `Box<F>` pointer that is never touched again.
    unsafe fn invoke_boxed(repr: *mut u8) {
        let target = unsafe { Box::from_raw(repr.cast::<*mut F>().read()) };
        target();
    }

    /// # Safety
    /// `repr` holds a `Box<F>` pointer that is never touched again.
    unsafe fn dispose_boxed(repr: *mut u8) {
        drop(unsafe { Box::from_raw(repr.cast::<*mut F>().read()) });
    }
}

/// A move-only, no-argument callable with small-buffer storage.
///
/// A task is either *null* (default-constructed, or already consumed by a
/// move) or holds exactly one target. Invoking a null task reports
/// [`InvalidCall`]; dropping a non-null task destroys the target without
/// running it.
///
/// # Example
///
/// ```
/// use std::sync::atomic::{AtomicU32, Ordering};
/// use std::sync::Arc;
/// use weft_pool::Task;
///
/// let hits = Arc::new(AtomicU32::new(0));
/// let task = Task::new({
///     let hits = Arc::clone(&hits);
///     move || {
///         hits.fetch_add(1, Ordering::Relaxed);
///     }
/// });
///
/// // Moving a task never allocates or runs it.
/// let moved = task;
/// moved.call().unwrap();
/// assert_eq!(hits.load(Ordering::Relaxed), 1);
///
/// assert!(Task::default().call().is_err());
/// ```
pub struct Task {
    repr: MaybeUninit<Repr>,
    vtable: Option<&'static TaskVtable>,
}

// Safety: the erased target is constrained to `Send` at construction, and
// a task grants no shared access to it.
unsafe impl Send for Task {}

impl Task {
    /// Targets up to this many bytes (and word alignment) are stored
    /// inline; larger ones are boxed once at construction.
    pub const INLINE_SIZE: usize = mem::size_of::<Repr>();

    /// Wraps a callable, allocating only if it does not fit the inline
    /// buffer.
    pub fn new<F>(target: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let mut repr = MaybeUninit::<Repr>::uninit();
        let vtable = if fits_inline::<F>() {
            // Safety: size and alignment were just checked; the buffer is
            // exclusively ours.
            unsafe { repr.as_mut_ptr().cast::<F>().write(target) };
            &Vtables::<F>::INLINE
        } else {
            let boxed = Box::into_raw(Box::new(target));
            // Safety: a thin pointer always fits the buffer.
            unsafe { repr.as_mut_ptr().cast::<*mut F>().write(boxed) };
            &Vtables::<F>::BOXED
        };
        Self {
            repr,
            vtable: Some(vtable),
        }
    }

    /// Runs the target, consuming the task.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidCall`] if the task is null.
    pub fn call(mut self) -> Result<(), InvalidCall> {
        match self.vtable.take() {
            None => Err(InvalidCall),
            Some(vtable) => {
                // The vtable is cleared above, so Drop will not dispose
                // the target a second time.
                unsafe { (vtable.invoke)(self.repr.as_mut_ptr().cast()) };
                Ok(())
            }
        }
    }

    /// Returns `true` if the task holds no target.
    pub fn is_null(&self) -> bool {
        self.vtable.is_none()
    }
}

const fn fits_inline<F>() -> bool {
    mem::size_of::<F>() <= mem::size_of::<Repr>() && mem::align_of::<F>() <= mem::align_of::<Repr>()
}

impl Default for Task {
    /// Creates a null task.
    fn default() -> Self {
        Self {
            repr: MaybeUninit::uninit(),
            vtable: None,
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if let Some(vtable) = self.vtable.take() {
            // Safety: a present vtable means the buffer holds a live
            // target in the representation that vtable expects.
            unsafe { (vtable.dispose)(self.repr.as_mut_ptr().cast()) };
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("null", &self.is_null())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn null_task_reports_invalid_call() {
        assert_eq!(Task::default().call(), Err(InvalidCall));
        assert!(Task::default().is_null());
    }

    #[test]
    fn function_pointer_runs_inline() {
        static HITS: AtomicUsize = AtomicUsize::new(0);
        fn bump() {
            HITS.fetch_add(1, Ordering::Relaxed);
        }

        assert!(fits_inline::<fn()>());
        let task = Task::new(bump as fn());
        task.call().unwrap();
        assert_eq!(HITS.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn moves_preserve_the_target() {
        let hits = Arc::new(AtomicUsize::new(0));
        let task = Task::new({
            let hits = Arc::clone(&hits);
            move || {
                hits.fetch_add(1, Ordering::Relaxed);
            }
        });

        let task = task;
        let task = task;
        task.call().unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn large_targets_round_trip_through_the_heap() {
        let hits = Arc::new(AtomicUsize::new(0));
        let payload = [7u64; 16];
        let task = Task::new({
            let hits = Arc::clone(&hits);
            move || {
                hits.fetch_add(payload.iter().sum::<u64>() as usize, Ordering::Relaxed);
            }
        });

        task.call().unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 7 * 16);
    }

    #[test]
    fn dropping_an_unrun_task_releases_the_target() {
        let drops = Arc::new(AtomicUsize::new(0));

        struct Sentinel(Arc<AtomicUsize>);
        impl Drop for Sentinel {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let small = Task::new({
            let sentinel = Sentinel(Arc::clone(&drops));
            move || drop(sentinel)
        });
        let large = Task::new({
            let sentinel = Sentinel(Arc::clone(&drops));
            let padding = [0u8; 64];
            move || {
                drop(sentinel);
                drop(padding);
            }
        });

        drop(small);
        drop(large);
        assert_eq!(drops.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn consumed_task_does_not_double_drop() {
        let drops = Arc::new(AtomicUsize::new(0));

        struct Sentinel(Arc<AtomicUsize>);
        impl Drop for Sentinel {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let task = Task::new({
            let sentinel = Sentinel(Arc::clone(&drops));
            move || drop(sentinel)
        });
        task.call().unwrap();
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }
}
