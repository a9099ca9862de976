//! Lock-free single-producer single-consumer edge queue.
//!
//! Cross-tasklet communication runs exclusively through these queues: one
//! per (producer instance, consumer instance) pair of an edge. The producing
//! and consuming tasklets may migrate between worker threads over time, but
//! at any instant each side is driven by at most one thread (tasklet
//! hand-offs synchronize through the executor's run queue), which is the
//! SPSC requirement.
//!
//! Power-of-two capacity with bitmask indexing, one slot reserved to tell
//! full from empty, and cache-line-padded head/tail indices to prevent false
//! sharing.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Pads a value out to a cache line so adjacent atomics never share one.
#[repr(C, align(64))]
struct CachePadded<T>(T);

/// A bounded lock-free SPSC queue.
///
/// `push` must only ever be called from the producing side and `pop`/`peek`
/// from the consuming side; the type does not police this, the executor's
/// wiring does.
pub struct SpscQueue<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// Consumer position.
    head: CachePadded<AtomicUsize>,
    /// Producer position.
    tail: CachePadded<AtomicUsize>,
    mask: usize,
}

// SAFETY: the queue hands each value from exactly one producer thread to
// exactly one consumer thread; values only need to be Send.
unsafe impl<T: Send> Send for SpscQueue<T> {}
// SAFETY: shared access is one producer plus one consumer, synchronized by
// the acquire/release pairs on head and tail.
unsafe impl<T: Send> Sync for SpscQueue<T> {}

impl<T> SpscQueue<T> {
    /// Creates a queue holding `capacity - 1` items after rounding
    /// `capacity` up to a power of two.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        let capacity = capacity.next_power_of_two();
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            head: CachePadded(AtomicUsize::new(0)),
            tail: CachePadded(AtomicUsize::new(0)),
            mask: capacity - 1,
        }
    }

    /// Number of slots; one is always kept free.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Snapshot emptiness check.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.0.load(Ordering::Acquire) == self.tail.0.load(Ordering::Acquire)
    }

    /// Snapshot item count.
    #[must_use]
    pub fn len(&self) -> usize {
        let head = self.head.0.load(Ordering::Acquire);
        let tail = self.tail.0.load(Ordering::Acquire);
        tail.wrapping_sub(head) & self.mask
    }

    /// Enqueues an item, handing it back if the queue is full.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` when the queue is full.
    pub fn push(&self, item: T) -> Result<(), T> {
        let tail = self.tail.0.load(Ordering::Relaxed);
        let next = (tail + 1) & self.mask;
        if next == self.head.0.load(Ordering::Acquire) {
            return Err(item);
        }
        // SAFETY: the slot at `tail` is not yet published (tail unchanged)
        // and the consumer never reads unpublished slots, so the single
        // producer has exclusive access to it.
        unsafe {
            (*self.slots[tail].get()).write(item);
        }
        self.tail.0.store(next, Ordering::Release);
        Ok(())
    }

    /// Dequeues the oldest item, if any.
    pub fn pop(&self) -> Option<T> {
        let head = self.head.0.load(Ordering::Relaxed);
        if head == self.tail.0.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: head < tail was just observed with acquire ordering, so
        // the slot at `head` holds a published value the single consumer
        // now has exclusive access to.
        let item = unsafe { (*self.slots[head].get()).assume_init_read() };
        self.head.0.store((head + 1) & self.mask, Ordering::Release);
        Some(item)
    }

    /// Peeks at the oldest item without consuming it.
    pub fn peek(&self) -> Option<&T> {
        let head = self.head.0.load(Ordering::Relaxed);
        if head == self.tail.0.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: as in `pop`, the slot is published and owned by the
        // consumer until head advances.
        unsafe { Some((*self.slots[head].get()).assume_init_ref()) }
    }
}

impl<T> Drop for SpscQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

impl<T> std::fmt::Debug for SpscQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpscQueue")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}
