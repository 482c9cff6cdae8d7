//! The bounded ring queue: a fixed-capacity MPMC FIFO with per-slot
//! sequence tokens and pluggable waiting.
//!
//! # How it works
//!
//! Producers and consumers each take a *ticket* from a monotonically
//! increasing counter (`tail` for producers, `head` for consumers). A
//! ticket commits its holder to one slot, `ring[ticket % N]`, for one
//! *round*; the holder then waits for the slot's token to show the
//! sequence number of its round.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ head (cache-line padded)  - next consumer ticket            │
//! ├─────────────────────────────────────────────────────────────┤
//! │ tail (cache-line padded)  - next producer ticket            │
//! ├─────────────────────────────────────────────────────────────┤
//! │ close: open / closing / closed  +  last accepted ticket     │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Slot[0]: { token, value }   (one cache line each)           │
//! │ Slot[1]: { token, value }                                   │
//! │ ...                                                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A token fuses the expected sequence with status flags; since capacity is
//! at least 16 (a full status nibble), the low bits of any ticket are
//! slot-index bits and can be masked off without loss. A producer finding
//! its sequence publishes the value and flags the token `VALID`; the
//! consumer of the same round moves the value out and re-arms the slot for
//! one round later (`ticket + N`). Claim order is delivery order, so the
//! queue is FIFO by ticket.
//!
//! Closing is a three-step handshake (open → closing → closed). The one
//! thread that wins the transition bumps `tail` by a whole lap and records
//! the pre-bump value as the *last accepted* ticket: producers already
//! holding earlier tickets finish normally (their values remain
//! deliverable), while any later claim compares past the mark and reports
//! closed. Consumers drain up to the mark and then report closed too.
//!
//! Counters are 32-bit and wrap; comparisons are by signed difference, so
//! correctness requires producers and consumers never to lag each other by
//! 2³¹ tickets or more, far beyond any reachable in-flight window.

pub mod wait;

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU32, Ordering};
use std::fmt;
use std::hint;

use crossbeam_utils::CachePadded;

use weft_sync::backoff::{Backoff, NoBackoff};

use crate::{ConcurrentQueue, PopError, PushError, TryPopError, TryPushError};
use self::wait::{SlotWait, SpinWait, INVALID, SEQ_MASK, VALID};

/// The smallest accepted capacity: one slot per distinct value of the
/// status nibble, so that masking a ticket's low bits never conflates two
/// rounds of the same slot.
pub const MIN_CAPACITY: usize = 1 << wait::STATUS_BITS;

/// A ticket counter, parameterized by whether one thread or many play the
/// counter's role.
pub trait Counter: Send + Sync + Default {
    /// Reads the counter's current value.
    fn load(&self) -> u32;

    /// Takes the next ticket.
    fn claim(&self) -> u32;

    /// Takes the ticket `observed` if the counter still holds it. Used by
    /// the non-blocking operations, which must inspect the target slot
    /// before committing.
    fn try_claim(&self, observed: u32) -> bool;

    /// Advances the counter by a whole lap, returning the pre-advance
    /// value. Always a real read-modify-write: the close protocol calls
    /// this from an arbitrary thread, whatever the counter's role.
    fn reserve_lap(&self, lap: u32) -> u32;
}

/// A counter shared by any number of threads in the same role.
#[derive(Debug, Default)]
pub struct SharedCounter(AtomicU32);

impl Counter for SharedCounter {
    #[inline]
    fn load(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    #[inline]
    fn claim(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    fn try_claim(&self, observed: u32) -> bool {
        self.0
            .compare_exchange(
                observed,
                observed.wrapping_add(1),
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    #[inline]
    fn reserve_lap(&self, lap: u32) -> u32 {
        self.0.fetch_add(lap, Ordering::Relaxed)
    }
}

/// A counter whose role belongs to a single thread.
///
/// Claims are plain load/store pairs instead of read-modify-writes. The
/// single-role contract is encoded in the queue aliases ([`BoundedSpsc`]
/// and friends); violating it loses tickets but cannot corrupt memory.
///
/// The close protocol's lap reservation *is* a read-modify-write, so on
/// queues with an owned tail counter, `close` must not race the producer's
/// own claims: have the producer close the queue itself, or close after it
/// has stopped pushing. Shared counters carry no such restriction.
#[derive(Debug, Default)]
pub struct OwnedCounter(AtomicU32);

impl Counter for OwnedCounter {
    #[inline]
    fn load(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    #[inline]
    fn claim(&self) -> u32 {
        let ticket = self.0.load(Ordering::Relaxed);
        self.0.store(ticket.wrapping_add(1), Ordering::Relaxed);
        ticket
    }

    #[inline]
    fn try_claim(&self, observed: u32) -> bool {
        self.0.store(observed.wrapping_add(1), Ordering::Relaxed);
        true
    }

    #[inline]
    fn reserve_lap(&self, lap: u32) -> u32 {
        self.0.fetch_add(lap, Ordering::Relaxed)
    }
}

/// Multi-producer, multi-consumer bounded queue.
pub type BoundedMpmc<T, W = SpinWait> = BoundedQueue<T, W, SharedCounter, SharedCounter>;

/// Single-producer, single-consumer bounded queue.
pub type BoundedSpsc<T, W = SpinWait> = BoundedQueue<T, W, OwnedCounter, OwnedCounter>;

/// Multi-producer, single-consumer bounded queue.
pub type BoundedMpsc<T, W = SpinWait> = BoundedQueue<T, W, SharedCounter, OwnedCounter>;

/// Single-producer, multi-consumer bounded queue.
pub type BoundedSpmc<T, W = SpinWait> = BoundedQueue<T, W, OwnedCounter, SharedCounter>;

/// Error returned by [`BoundedQueue::push_from`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushFromError<E> {
    /// The queue was closed before a slot was available; the constructor
    /// was never called.
    Closed,
    /// The constructor failed. Its slot was republished as a gap that
    /// consumers skip, and the error is handed back.
    Failed(E),
}

impl<E> fmt::Display for PushFromError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "queue is closed"),
            Self::Failed(_) => write!(f, "value construction failed"),
        }
    }
}

impl<E: fmt::Debug> std::error::Error for PushFromError<E> {}

const OPEN: u32 = 0;
const CLOSING: u32 = 1;
const CLOSED: u32 = 2;

struct CloseState {
    /// open → closing → closed; the closing step has exactly one winner.
    flag: AtomicU32,
    /// First refused ticket. Written by the close winner before the flag's
    /// release store of `CLOSED`, so any acquire load seeing `CLOSED` sees
    /// this too.
    last_accepted: AtomicU32,
}

struct Slot<T, W> {
    token: W,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Republishes a slot as an unusable gap if the armed scope unwinds or
/// errors before the value lands.
struct PublishGuard<'a, W: SlotWait> {
    token: &'a W,
    sequence: u32,
}

impl<W: SlotWait> Drop for PublishGuard<'_, W> {
    fn drop(&mut self) {
        self.token.wake(self.sequence | INVALID);
    }
}

/// A fixed-capacity multi-producer/multi-consumer FIFO.
///
/// `W` selects the [slot waiting strategy](wait); `P` and `C` select
/// shared or single-threaded ticket counters for the producer and consumer
/// sides. Use the [`BoundedMpmc`], [`BoundedSpsc`], [`BoundedMpsc`] and
/// [`BoundedSpmc`] aliases rather than naming the counters directly.
///
/// # Example
///
/// ```
/// use weft_queue::BoundedMpmc;
/// use weft_queue::bounded::wait::FutexWait;
/// use std::sync::Arc;
/// use std::thread;
///
/// let queue = Arc::new(BoundedMpmc::<u64, FutexWait>::new(64));
///
/// let producer = {
///     let queue = Arc::clone(&queue);
///     thread::spawn(move || {
///         for i in 0..1000 {
///             queue.push(i).unwrap();
///         }
///         queue.close();
///     })
/// };
///
/// let mut received = Vec::new();
/// while let Ok(value) = queue.pop() {
///     received.push(value);
/// }
///
/// producer.join().unwrap();
/// assert_eq!(received, (0..1000).collect::<Vec<u64>>());
/// ```
pub struct BoundedQueue<T, W: SlotWait = SpinWait, P = SharedCounter, C = SharedCounter> {
    head: CachePadded<C>,
    tail: CachePadded<P>,
    close: CachePadded<CloseState>,
    ring: Box<[CachePadded<Slot<T, W>>]>,
    mask: u32,
}

// Safety: values move through slots guarded by the token protocol (one
// producer and one consumer per slot round, serialized by acquire/release
// on the token), so sharing the queue only requires the values themselves
// to be sendable.
unsafe impl<T: Send, W: SlotWait, P: Counter, C: Counter> Send for BoundedQueue<T, W, P, C> {}
unsafe impl<T: Send, W: SlotWait, P: Counter, C: Counter> Sync for BoundedQueue<T, W, P, C> {}

impl<T, W, P, C> BoundedQueue<T, W, P, C>
where
    W: SlotWait,
    P: Counter,
    C: Counter,
{
    /// Creates an open queue with room for `capacity` values.
    ///
    /// # Panics
    ///
    /// Panics unless `capacity` is a power of two and at least
    /// [`MIN_CAPACITY`]. Both are programmer errors: the capacity is part
    /// of the queue's type-level contract with its users.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity >= MIN_CAPACITY,
            "bounded queue capacity must be at least {MIN_CAPACITY}"
        );
        assert!(
            capacity.is_power_of_two(),
            "bounded queue capacity must be a power of two"
        );
        assert!(
            capacity <= 1 << 31,
            "bounded queue capacity overflows its 32-bit tickets"
        );

        let ring: Box<[CachePadded<Slot<T, W>>]> = (0..capacity)
            .map(|i| {
                let slot = Slot {
                    token: W::default(),
                    value: UnsafeCell::new(MaybeUninit::uninit()),
                };
                // Slot i expects ticket i first; status bits start empty.
                slot.token.init(i as u32 & SEQ_MASK);
                CachePadded::new(slot)
            })
            .collect();

        Self {
            head: CachePadded::new(C::default()),
            tail: CachePadded::new(P::default()),
            close: CachePadded::new(CloseState {
                flag: AtomicU32::new(OPEN),
                last_accepted: AtomicU32::new(0),
            }),
            ring,
            mask: capacity as u32 - 1,
        }
    }

    /// Returns the queue's capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity_u32() as usize
    }

    #[inline]
    fn capacity_u32(&self) -> u32 {
        self.mask + 1
    }

    #[inline]
    fn slot(&self, ticket: u32) -> &Slot<T, W> {
        &self.ring[(ticket & self.mask) as usize]
    }

    #[inline]
    fn sequence(ticket: u32) -> u32 {
        ticket & SEQ_MASK
    }

    /// Whether `ticket` falls past the last accepted ticket of a closed
    /// queue. Cheap while the queue is open: one relaxed load.
    #[inline]
    fn refused(&self, ticket: u32) -> bool {
        if self.close.flag.load(Ordering::Relaxed) == OPEN {
            return false;
        }
        if self.close.flag.load(Ordering::Acquire) != CLOSED {
            // Mid-close; the mark is not published yet. Keep waiting.
            return false;
        }
        let last = self.close.last_accepted.load(Ordering::Relaxed);
        last.wrapping_sub(ticket) as i32 <= 0
    }

    /// Waits until the slot is writable for the producer round `ticket`.
    ///
    /// Returns `Err(())` if the queue closed and the ticket is past the
    /// accepted mark.
    fn await_write_turn<B: Backoff>(
        &self,
        slot: &Slot<T, W>,
        ticket: u32,
        mut backoff: B,
    ) -> Result<(), ()> {
        let expected = Self::sequence(ticket);
        let mut token = slot.token.load();
        let mut escalated = false;
        loop {
            // Writable when the sequence matches and no value flag is set;
            // WAITING and CLOSED are transient and do not block the turn.
            if token & (SEQ_MASK | VALID | INVALID) == expected {
                return Ok(());
            }
            if self.refused(ticket) {
                return Err(());
            }
            if escalated {
                token = slot.token.wait(token);
            } else {
                escalated = backoff.backoff();
                token = slot.token.load();
            }
        }
    }

    /// Waits until the slot is readable for the consumer round `ticket`,
    /// returning the value-status flags (`VALID` or `INVALID`).
    fn await_read_turn<B: Backoff>(
        &self,
        slot: &Slot<T, W>,
        ticket: u32,
        mut backoff: B,
    ) -> Result<u32, ()> {
        let expected = Self::sequence(ticket);
        let mut token = slot.token.load();
        let mut escalated = false;
        loop {
            if token & SEQ_MASK == expected {
                let status = token & (VALID | INVALID);
                if status != 0 {
                    return Ok(status);
                }
            }
            if self.refused(ticket) {
                return Err(());
            }
            if escalated {
                token = slot.token.wait(token);
            } else {
                escalated = backoff.backoff();
                token = slot.token.load();
            }
        }
    }

    /// Moves a value into the queue, blocking until a slot frees up or the
    /// queue closes.
    ///
    /// The first failed check escalates straight to the slot's waiting
    /// strategy; use [`push_with_backoff`](Self::push_with_backoff) to
    /// spin under a policy first.
    pub fn push(&self, value: T) -> Result<(), PushError<T>> {
        self.push_with_backoff(value, NoBackoff)
    }

    /// Like [`push`](Self::push), spinning under `backoff` before falling
    /// back to the slot's waiting strategy.
    pub fn push_with_backoff<B: Backoff>(&self, value: T, backoff: B) -> Result<(), PushError<T>> {
        let ticket = self.tail.claim();
        let slot = self.slot(ticket);
        match self.await_write_turn(slot, ticket, backoff) {
            Err(()) => Err(PushError(value)),
            Ok(()) => {
                // Safety: the slot granted this round's write turn, so no
                // other thread touches the cell until the token below
                // publishes it.
                unsafe { (*slot.value.get()).write(value) };
                slot.token.wake(Self::sequence(ticket) | VALID);
                Ok(())
            }
        }
    }

    /// Builds a value directly into the next slot, blocking like
    /// [`push`](Self::push).
    ///
    /// If `constructor` fails (or panics), the already-claimed slot is
    /// republished as a gap that consumers silently skip, and the failure
    /// propagates to the caller; the queue remains fully usable.
    pub fn push_from<F, E>(&self, constructor: F) -> Result<(), PushFromError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        self.push_from_with_backoff(constructor, NoBackoff)
    }

    /// Like [`push_from`](Self::push_from), spinning under `backoff`
    /// before falling back to the slot's waiting strategy.
    pub fn push_from_with_backoff<F, E, B>(
        &self,
        constructor: F,
        backoff: B,
    ) -> Result<(), PushFromError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        B: Backoff,
    {
        let ticket = self.tail.claim();
        let slot = self.slot(ticket);
        match self.await_write_turn(slot, ticket, backoff) {
            Err(()) => Err(PushFromError::Closed),
            Ok(()) => {
                let sequence = Self::sequence(ticket);
                let guard = PublishGuard {
                    token: &slot.token,
                    sequence,
                };
                match constructor() {
                    Ok(value) => {
                        core::mem::forget(guard);
                        // Safety: as in push; this thread owns the slot's
                        // write turn.
                        unsafe { (*slot.value.get()).write(value) };
                        slot.token.wake(sequence | VALID);
                        Ok(())
                    }
                    // The guard drops here and republishes the slot as a
                    // gap, which also covers a panicking constructor.
                    Err(error) => Err(PushFromError::Failed(error)),
                }
            }
        }
    }

    /// Moves a value out of the queue, blocking until one arrives or the
    /// queue is closed and drained.
    pub fn pop(&self) -> Result<T, PopError> {
        self.pop_with_backoff(NoBackoff)
    }

    /// Like [`pop`](Self::pop), spinning under `backoff` before falling
    /// back to the slot's waiting strategy. Each internal retry (on a
    /// skipped gap) starts from a fresh clone of the policy.
    pub fn pop_with_backoff<B: Backoff + Clone>(&self, backoff: B) -> Result<T, PopError> {
        loop {
            let ticket = self.head.claim();
            let slot = self.slot(ticket);
            match self.await_read_turn(slot, ticket, backoff.clone()) {
                Err(()) => return Err(PopError),
                Ok(status) => {
                    let next = Self::sequence(ticket.wrapping_add(self.capacity_u32()));
                    if status & VALID != 0 {
                        // Safety: the slot granted this round's read turn;
                        // the producer's release publish made the value
                        // visible and nobody else will read it.
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.token.wake(next);
                        return Ok(value);
                    }
                    // A gap from a failed producer: re-arm the slot for
                    // the next round and take a fresh ticket.
                    slot.token.wake(next);
                }
            }
        }
    }

    /// Attempts to push without blocking.
    ///
    /// Fails with `Full` when the queue has no room, `Busy` when the
    /// target slot is still mid-handoff or another producer won the
    /// ticket race, and `Closed` once the queue is closed.
    pub fn try_push(&self, value: T) -> Result<(), TryPushError<T>> {
        if self.close.flag.load(Ordering::Acquire) != OPEN {
            return Err(TryPushError::Closed(value));
        }
        let ticket = self.tail.load();
        let slot = self.slot(ticket);
        let token = slot.token.load();
        if token & (SEQ_MASK | VALID | INVALID) == Self::sequence(ticket) {
            if self.tail.try_claim(ticket) {
                // Safety: ticket claimed and the slot was observed
                // writable for exactly this round.
                unsafe { (*slot.value.get()).write(value) };
                slot.token.wake(Self::sequence(ticket) | VALID);
                Ok(())
            } else {
                Err(TryPushError::Busy(value))
            }
        } else {
            let head = self.head.load();
            if ticket.wrapping_sub(head) as i32 >= self.capacity_u32() as i32 {
                Err(TryPushError::Full(value))
            } else {
                Err(TryPushError::Busy(value))
            }
        }
    }

    /// Attempts to pop without blocking.
    ///
    /// Fails with `Empty` when no value is queued, `Busy` when a handoff
    /// is mid-flight, and `Closed` once the queue is closed and drained.
    pub fn try_pop(&self) -> Result<T, TryPopError> {
        loop {
            let ticket = self.head.load();
            let slot = self.slot(ticket);
            let token = slot.token.load();
            if token & SEQ_MASK == Self::sequence(ticket) && token & (VALID | INVALID) != 0 {
                if !self.head.try_claim(ticket) {
                    return Err(TryPopError::Busy);
                }
                let next = Self::sequence(ticket.wrapping_add(self.capacity_u32()));
                if token & VALID != 0 {
                    // Safety: ticket claimed and the slot was observed
                    // readable for exactly this round.
                    let value = unsafe { (*slot.value.get()).assume_init_read() };
                    slot.token.wake(next);
                    return Ok(value);
                }
                // Skip the gap and look at the next ticket.
                slot.token.wake(next);
                continue;
            }
            if self.refused(ticket) {
                return Err(TryPopError::Closed);
            }
            let tail = self.tail.load();
            return if tail.wrapping_sub(ticket) as i32 <= 0 {
                Err(TryPopError::Empty)
            } else {
                Err(TryPopError::Busy)
            };
        }
    }

    /// Closes the queue. Idempotent, and safe to race from any number of
    /// threads; every call returns only once the queue is fully closed.
    ///
    /// Producers that already hold tickets finish normally and their
    /// values stay deliverable; consumers drain everything accepted before
    /// the close and then observe the closed state. Producers blocked on a
    /// full ring with no consumers left are *not* rescued: the queue
    /// blocks producers by design, and closing does not conjure consumers
    /// for values that nobody will take.
    ///
    /// On the single-producer shapes ([`BoundedSpsc`], [`BoundedSpmc`])
    /// close must not race the producer's own claims; see
    /// [`OwnedCounter`].
    pub fn close(&self) {
        match self
            .close
            .flag
            .compare_exchange(OPEN, CLOSING, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => {
                // Reserve a full lap of tickets so that every claim from
                // here on compares past the mark, forever.
                let last = self.tail.reserve_lap(self.capacity_u32());
                self.close.last_accepted.store(last, Ordering::Relaxed);
                self.close.flag.store(CLOSED, Ordering::Release);
                for slot in self.ring.iter() {
                    slot.token.close();
                }
            }
            Err(_) => {
                // Lost the race; wait for the winner so that close() has
                // fully happened by the time any call returns.
                while self.close.flag.load(Ordering::Acquire) != CLOSED {
                    hint::spin_loop();
                }
            }
        }
    }

    /// Returns `true` once the queue has been closed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.close.flag.load(Ordering::Acquire) == CLOSED
    }

    /// Returns `true` if the queue holds no values. Racy by nature.
    #[inline]
    pub fn is_empty(&self) -> bool {
        let head = self.head.load();
        let tail = self.tail.load();
        tail.wrapping_sub(head) as i32 <= 0
    }

    /// Returns `true` if a push would currently block. Racy by nature.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// Returns the number of values in the queue right now, clamped to the
    /// capacity (in-flight ticket bookkeeping can transiently overshoot).
    /// Racy by nature.
    pub fn len(&self) -> usize {
        let head = self.head.load();
        let tail = self.tail.load();
        let distance = tail.wrapping_sub(head) as i32;
        distance.clamp(0, self.capacity_u32() as i32) as usize
    }

    /// Always `false`: every waiting strategy may park or yield the
    /// calling thread.
    #[inline]
    pub fn is_lock_free(&self) -> bool {
        false
    }
}

impl<T, W: SlotWait, P, C> Drop for BoundedQueue<T, W, P, C> {
    fn drop(&mut self) {
        // Exclusive access: drop any values that were published but never
        // consumed. Slots mid-publish at close time carry INVALID instead
        // and hold no value.
        for slot in self.ring.iter() {
            if slot.token.load() & VALID != 0 {
                // Safety: VALID means an initialized value nobody moved out.
                unsafe { (*slot.value.get()).assume_init_drop() };
            }
        }
    }
}

impl<T, W, P, C> fmt::Debug for BoundedQueue<T, W, P, C>
where
    W: SlotWait,
    P: Counter,
    C: Counter,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<T, W, P, C> ConcurrentQueue<T> for BoundedQueue<T, W, P, C>
where
    W: SlotWait,
    P: Counter,
    C: Counter,
{
    fn push(&self, value: T) -> Result<(), PushError<T>> {
        BoundedQueue::push(self, value)
    }

    fn pop(&self) -> Result<T, PopError> {
        BoundedQueue::pop(self)
    }

    fn try_push(&self, value: T) -> Result<(), TryPushError<T>> {
        BoundedQueue::try_push(self, value)
    }

    fn try_pop(&self) -> Result<T, TryPopError> {
        BoundedQueue::try_pop(self)
    }

    fn close(&self) {
        BoundedQueue::close(self);
    }

    fn is_closed(&self) -> bool {
        BoundedQueue::is_closed(self)
    }

    fn is_empty(&self) -> bool {
        BoundedQueue::is_empty(self)
    }

    fn is_full(&self) -> bool {
        BoundedQueue::is_full(self)
    }
}
