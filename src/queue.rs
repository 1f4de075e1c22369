//! RingQueue - Bounded lock-free MPSC queue.
//!
//! Detector threads push, one executor thread pops.
//!
//! # Protocol
//!
//! ```text
//! producer:  load tail (relaxed) -> load head (acquire) -> full?
//!            CAS tail -> tail+1 (release / relaxed on failure)
//!            write slot[tail & mask], ready = true (release)
//!
//! consumer:  load head (relaxed), tail (acquire) -> empty?
//!            wait for slot[head & mask].ready (acquire)
//!            take value, ready = false, head = head+1 (release)
//! ```
//!
//! Reserving `tail` and writing the slot are separate steps, so the consumer
//! can see a reserved slot that is not yet written. It waits a bounded number
//! of pause rounds for the write and otherwise reports empty without moving
//! `head`; the item is returned by a later pop.
//!
//! `head` and `tail` are 64-bit and only ever increase. Wrapping them would
//! take 2^64 pushes, which is treated as unreachable.

use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arrayvec::ArrayVec;
use crossbeam_utils::CachePadded;

use crate::error::{PushError, QueueError};
use crate::hint::{cpu_relax, SpinPolicy};

/// Largest capacity accepted before rounding up to a power of two
pub const MAX_CAPACITY: usize = 1 << (usize::BITS - 2);

/// One cell of the ring. `ready` is the empty/full sentinel.
struct Slot<T> {
    ready: AtomicBool,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// Bounded multi-producer / single-consumer queue.
///
/// Producers call [`push`](RingQueue::push) through a shared reference
/// (usually an `Arc`). Popping needs the [`Consumer`] token from
/// [`consumer`](RingQueue::consumer), of which at most one exists at a time.
pub struct RingQueue<T> {
    /// Next position to read. Written only by the consumer.
    head: CachePadded<AtomicU64>,
    /// Next position to reserve. Producers race on it with CAS.
    tail: CachePadded<AtomicU64>,
    consumer_claimed: AtomicBool,
    slots: Box<[Slot<T>]>,
    mask: u64,
    capacity: u64,
    spin: SpinPolicy,
}

// SAFETY: slot values are handed between threads under the ready/head
// protocol above; each value is accessed by one thread at a time.
unsafe impl<T: Send> Send for RingQueue<T> {}
unsafe impl<T: Send> Sync for RingQueue<T> {}

impl<T> RingQueue<T> {
    /// Create a queue holding at least `capacity` items.
    ///
    /// The capacity is rounded up to the next power of two. Fails with
    /// `QueueError::Alloc` if the slot array cannot be allocated.
    pub fn new(capacity: usize, spin: SpinPolicy) -> Result<Self, QueueError> {
        if capacity == 0 || capacity > MAX_CAPACITY {
            return Err(QueueError::InvalidCapacity(capacity));
        }
        let capacity = capacity.next_power_of_two();
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| QueueError::Alloc { capacity })?;
        slots.extend((0..capacity).map(|_| Slot::new()));
        let slots = slots.into_boxed_slice();

        Ok(Self {
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            consumer_claimed: AtomicBool::new(false),
            slots,
            mask: capacity as u64 - 1,
            capacity: capacity as u64,
            spin,
        })
    }

    /// Create a shared queue with the default spin policy.
    pub fn shared(capacity: usize) -> Result<Arc<Self>, QueueError> {
        Self::new(capacity, SpinPolicy::default()).map(Arc::new)
    }

    /// Enqueue `item` without blocking.
    ///
    /// Returns `PushError::Full` when `capacity` items are queued. The queue
    /// never drops or retries a refused item; the caller decides.
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        let mut tail = self.tail.load(Ordering::Relaxed);
        let mut backoff = self.spin.backoff();

        loop {
            let head = self.head.load(Ordering::Acquire);
            let used = tail.wrapping_sub(head);

            if (used as i64) < 0 {
                // Stale tail: the consumer already moved past it.
                tail = self.tail.load(Ordering::Relaxed);
                continue;
            }
            if used >= self.capacity {
                return Err(PushError::Full(item));
            }

            match self.tail.compare_exchange_weak(
                tail,
                tail.wrapping_add(1),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    let slot = &self.slots[(tail & self.mask) as usize];
                    // SAFETY: the CAS gave us position `tail` exclusively, and
                    // `used < capacity` (observed with acquire on head) means
                    // the consumer has already emptied this slot.
                    unsafe { (*slot.value.get()).write(item) };
                    slot.ready.store(true, Ordering::Release);
                    return Ok(());
                }
                Err(observed) => {
                    tail = observed;
                    if !backoff.snooze() {
                        return Err(PushError::Contended(item));
                    }
                }
            }
        }
    }

    /// Reserve the next position without writing it, like a producer
    /// paused between its CAS and its publish.
    #[cfg(test)]
    pub(crate) fn reserve(&self) -> u64 {
        self.tail.fetch_add(1, Ordering::Relaxed)
    }

    /// Write and publish `item` at a position from [`reserve`](Self::reserve).
    #[cfg(test)]
    pub(crate) fn publish(&self, pos: u64, item: T) {
        let slot = &self.slots[(pos & self.mask) as usize];
        // SAFETY: `reserve` handed out `pos` to this caller only.
        unsafe { (*slot.value.get()).write(item) };
        slot.ready.store(true, Ordering::Release);
    }

    /// Claim the single consumer token.
    pub fn consumer(self: &Arc<Self>) -> Result<Consumer<T>, QueueError> {
        self.consumer_claimed
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .map_err(|_| QueueError::ConsumerTaken)?;

        Ok(Consumer {
            queue: Arc::clone(self),
            _not_sync: PhantomData,
        })
    }

    /// Approximate number of queued items (monitoring only).
    #[inline]
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head).min(self.capacity) as usize
    }

    /// Approximate emptiness check (monitoring only).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Single-consumer pop. Only reachable through `Consumer`.
    fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);

        if (tail.wrapping_sub(head) as i64) <= 0 {
            return None;
        }

        let slot = &self.slots[(head & self.mask) as usize];
        if !self.wait_published(slot) {
            return None;
        }

        // SAFETY: ready == true (acquire) means the producer's write is
        // visible, and only the consumer reads slots.
        let item = unsafe { (*slot.value.get()).assume_init_read() };
        slot.ready.store(false, Ordering::Relaxed);
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(item)
    }

    #[inline]
    fn wait_published(&self, slot: &Slot<T>) -> bool {
        if slot.ready.load(Ordering::Acquire) {
            return true;
        }
        for _ in 0..self.spin.publish_spins {
            cpu_relax();
            if slot.ready.load(Ordering::Acquire) {
                return true;
            }
        }
        false
    }
}

impl<T> Drop for RingQueue<T> {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            if *slot.ready.get_mut() {
                // SAFETY: ready marks an initialized, unconsumed value.
                unsafe { slot.value.get_mut().assume_init_drop() };
            }
        }
    }
}

impl<T> fmt::Debug for RingQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingQueue")
            .field("capacity", &self.capacity)
            .field("head", &self.head.load(Ordering::Relaxed))
            .field("tail", &self.tail.load(Ordering::Relaxed))
            .finish()
    }
}

/// The one-per-queue consumer token.
///
/// `Send` so it can move to the executor thread, but neither `Sync` nor
/// `Clone`, and every pop takes `&mut self`: two threads can never pop the
/// same queue at once. Dropping the token lets another consumer be claimed.
pub struct Consumer<T> {
    queue: Arc<RingQueue<T>>,
    _not_sync: PhantomData<Cell<()>>,
}

impl<T> Consumer<T> {
    /// Dequeue the oldest published item, or `None` if empty.
    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        self.queue.pop()
    }

    /// Pop up to `max` items (clamped to `N`) into stack storage.
    ///
    /// Not atomic as a whole: pushes may land between individual pops.
    pub fn pop_batch<const N: usize>(&mut self, max: usize) -> ArrayVec<T, N> {
        let mut batch = ArrayVec::new();
        let limit = max.min(N);
        while batch.len() < limit {
            match self.queue.pop() {
                Some(item) => batch.push(item),
                None => break,
            }
        }
        batch
    }

    /// Pop up to `max` items into `out`, returning how many were moved.
    pub fn drain_into<E: Extend<T>>(&mut self, out: &mut E, max: usize) -> usize {
        let mut count = 0;
        while count < max {
            match self.queue.pop() {
                Some(item) => {
                    out.extend(std::iter::once(item));
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// The queue this token consumes from.
    #[inline]
    pub fn queue(&self) -> &Arc<RingQueue<T>> {
        &self.queue
    }
}

impl<T> Drop for Consumer<T> {
    fn drop(&mut self) {
        self.queue.consumer_claimed.store(false, Ordering::Release);
    }
}

impl<T> fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer").field("queue", &self.queue).finish()
    }
}
