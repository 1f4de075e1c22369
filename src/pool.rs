//! ObjectPool - Bounded lock-free free-list of fixed-size blocks.
//!
//! The pool pre-allocates its blocks at startup so the hot path never
//! touches the allocator. When it runs dry, `get` falls back to a direct
//! allocation instead of failing; when it is full, `put` hands the block
//! back to the allocator instead of growing.
//!
//! The free-list is a ring of block pointers with one sequence number per
//! slot. For position `pos` in slot `pos % max_blocks`:
//!
//! | `seq`            | meaning                          |
//! |------------------|----------------------------------|
//! | `pos`            | empty, `put` may fill it         |
//! | `pos + 1`        | holds a free block, `get` may take it |
//! | `pos + max`      | emptied, ready for the next lap  |
//!
//! Reserving a slot and checking capacity are one CAS, so the free count
//! can never exceed `max_blocks`.

use std::alloc::Layout;
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;
use serde::{Deserialize, Serialize};

use crate::block::{Block, CACHE_LINE};
use crate::error::PoolError;
use crate::hint::SpinPolicy;

const PAGE_SIZE: usize = 4096;

/// Sizing of one pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Bytes per block
    pub block_size: usize,
    /// Blocks allocated up front
    pub initial_blocks: usize,
    /// Most free blocks the pool will hold
    pub max_blocks: usize,
    /// Touch every page of the initial blocks during init
    pub prefault: bool,
}

impl PoolConfig {
    pub const fn new(block_size: usize, initial_blocks: usize) -> Self {
        Self {
            block_size,
            initial_blocks,
            max_blocks: 1024,
            prefault: false,
        }
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.block_size == 0 {
            return Err(PoolError::InvalidConfig("block_size must be non-zero".into()));
        }
        if Layout::from_size_align(self.block_size, CACHE_LINE).is_err() {
            return Err(PoolError::InvalidConfig(format!(
                "block_size {} is not a valid {}-byte aligned layout",
                self.block_size, CACHE_LINE
            )));
        }
        if self.max_blocks == 0 {
            return Err(PoolError::InvalidConfig("max_blocks must be non-zero".into()));
        }
        if self.initial_blocks > self.max_blocks {
            return Err(PoolError::InvalidConfig(format!(
                "initial_blocks ({}) exceeds max_blocks ({})",
                self.initial_blocks, self.max_blocks
            )));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(256, 512)
    }
}

/// Point-in-time counters for one pool (monitoring only).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub block_size: usize,
    pub max_blocks: usize,
    /// Approximate free blocks (`tail - head`)
    pub free: usize,
    /// `get` calls served by the allocator because the pool was empty, or
    /// a bounded [`SpinPolicy`] ran out of retries
    pub fallback_allocs: u64,
    /// `put` calls that freed the block because the pool was full
    pub overflow_frees: u64,
    /// `put` calls that freed the block because a bounded [`SpinPolicy`]
    /// ran out of retries (always 0 when unbounded)
    pub contended_frees: u64,
    /// `put` calls that freed a block of the wrong size
    pub foreign_frees: u64,
}

struct FreeSlot {
    seq: AtomicU64,
    block: AtomicPtr<u8>,
}

#[derive(Default)]
struct Counters {
    fallback_allocs: AtomicU64,
    overflow_frees: AtomicU64,
    contended_frees: AtomicU64,
    foreign_frees: AtomicU64,
}

/// Lock-free pool of equally sized [`Block`]s.
///
/// Any number of threads may call `get` and `put` concurrently.
pub struct ObjectPool {
    /// Next position to take a block from
    head: CachePadded<AtomicU64>,
    /// Next position to return a block to
    tail: CachePadded<AtomicU64>,
    slots: Box<[FreeSlot]>,
    max_blocks: u64,
    block_size: usize,
    spin: SpinPolicy,
    counters: CachePadded<Counters>,
    #[cfg(test)]
    fallback_fails: std::sync::atomic::AtomicBool,
}

impl ObjectPool {
    /// Build a pool and pre-allocate `initial_blocks` blocks.
    ///
    /// All-or-nothing: if the free-list or any block cannot be allocated,
    /// everything allocated so far is freed and `PoolError::Init` is returned.
    pub fn new(config: PoolConfig, spin: SpinPolicy) -> Result<Self, PoolError> {
        config.validate()?;

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(config.max_blocks)
            .map_err(|_| PoolError::Init {
                block_size: config.block_size,
                requested: config.initial_blocks,
                allocated: 0,
            })?;
        slots.extend((0..config.max_blocks).map(|i| FreeSlot {
            seq: AtomicU64::new(i as u64),
            block: AtomicPtr::new(ptr::null_mut()),
        }));

        let mut pool = Self {
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            slots: slots.into_boxed_slice(),
            max_blocks: config.max_blocks as u64,
            block_size: config.block_size,
            spin,
            counters: CachePadded::new(Counters::default()),
            #[cfg(test)]
            fallback_fails: std::sync::atomic::AtomicBool::new(false),
        };

        for allocated in 0..config.initial_blocks {
            let Some(block) = Block::try_alloc(config.block_size) else {
                // `pool` drops here and frees what it holds.
                return Err(PoolError::Init {
                    block_size: config.block_size,
                    requested: config.initial_blocks,
                    allocated,
                });
            };
            pool.put(block);
        }

        if config.prefault {
            pool.warm_up();
        }

        tracing::debug!(
            block_size = config.block_size,
            initial_blocks = config.initial_blocks,
            max_blocks = config.max_blocks,
            "object pool initialized"
        );
        Ok(pool)
    }

    /// Take a block, falling back to the allocator when the pool is empty.
    ///
    /// Never fails; aborts only if the system itself is out of memory.
    #[inline]
    pub fn get(&self) -> Block {
        match self.take() {
            Some(block) => block,
            None => {
                self.note_fallback();
                Block::alloc_or_abort(self.block_size)
            }
        }
    }

    /// Like [`get`](Self::get) but reports allocator failure as an error.
    #[inline]
    pub fn try_get(&self) -> Result<Block, PoolError> {
        if let Some(block) = self.take() {
            return Ok(block);
        }
        self.note_fallback();
        if self.fallback_blocked() {
            return Err(PoolError::OutOfMemory {
                block_size: self.block_size,
            });
        }
        Block::try_alloc(self.block_size).ok_or(PoolError::OutOfMemory {
            block_size: self.block_size,
        })
    }

    /// Make every later `try_get` fallback report out-of-memory.
    #[cfg(test)]
    pub(crate) fn fail_fallback(&self) {
        self.fallback_fails.store(true, Ordering::Relaxed);
    }

    #[cfg(test)]
    fn fallback_blocked(&self) -> bool {
        self.fallback_fails.load(Ordering::Relaxed)
    }

    #[cfg(not(test))]
    #[inline(always)]
    fn fallback_blocked(&self) -> bool {
        false
    }

    /// Return a block to the pool.
    ///
    /// Blocks of another size, blocks arriving while the pool already holds
    /// `max_blocks`, and blocks a bounded [`SpinPolicy`] could not place go
    /// back to the allocator. Each case has its own [`PoolStats`] counter.
    pub fn put(&self, block: Block) {
        if block.capacity() != self.block_size {
            self.counters.foreign_frees.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                expected = self.block_size,
                actual = block.capacity(),
                "freeing block of foreign size"
            );
            return;
        }

        let mut backoff = self.spin.backoff();
        let mut pos = self.tail.load(Ordering::Relaxed);

        let full = loop {
            let slot = &self.slots[(pos % self.max_blocks) as usize];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as i64;

            if diff == 0 {
                match self.tail.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        slot.block.store(block.into_raw().as_ptr(), Ordering::Relaxed);
                        slot.seq.store(pos.wrapping_add(1), Ordering::Release);
                        return;
                    }
                    Err(current) => {
                        pos = current;
                        if !backoff.snooze() {
                            break false;
                        }
                    }
                }
            } else if diff < 0 {
                // Slot still holds a block from the previous lap: full.
                break true;
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        };

        if full {
            self.counters.overflow_frees.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(block_size = self.block_size, "pool full, freeing block");
        } else {
            self.counters.contended_frees.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(block_size = self.block_size, "put retries exhausted, freeing block");
        }
    }

    fn take(&self) -> Option<Block> {
        let mut backoff = self.spin.backoff();
        let mut pos = self.head.load(Ordering::Relaxed);

        loop {
            let slot = &self.slots[(pos % self.max_blocks) as usize];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos.wrapping_add(1)) as i64;

            if diff == 0 {
                match self.head.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let raw = slot.block.swap(ptr::null_mut(), Ordering::Relaxed);
                        slot.seq
                            .store(pos.wrapping_add(self.max_blocks), Ordering::Release);
                        debug_assert!(!raw.is_null(), "published slot without a block");
                        // SAFETY: the slot was published by `put` with a
                        // pointer from `Block::into_raw` of this pool's size.
                        return NonNull::new(raw)
                            .map(|ptr| unsafe { Block::from_raw(ptr, self.block_size) });
                    }
                    Err(current) => {
                        pos = current;
                        if !backoff.snooze() {
                            return None;
                        }
                    }
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    #[inline]
    fn note_fallback(&self) {
        self.counters.fallback_allocs.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(block_size = self.block_size, "pool empty, allocating");
    }

    /// Approximate number of free blocks (monitoring only).
    #[inline]
    pub fn free_count(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head).min(self.max_blocks) as usize
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    pub fn max_blocks(&self) -> usize {
        self.max_blocks as usize
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            block_size: self.block_size,
            max_blocks: self.max_blocks as usize,
            free: self.free_count(),
            fallback_allocs: self.counters.fallback_allocs.load(Ordering::Relaxed),
            overflow_frees: self.counters.overflow_frees.load(Ordering::Relaxed),
            contended_frees: self.counters.contended_frees.load(Ordering::Relaxed),
            foreign_frees: self.counters.foreign_frees.load(Ordering::Relaxed),
        }
    }

    /// Pre-fault every page of every free block.
    ///
    /// Forces the OS to back the pool with physical memory before the hot
    /// path runs.
    pub fn warm_up(&mut self) {
        for slot in self.slots.iter_mut() {
            let raw = *slot.block.get_mut();
            if raw.is_null() {
                continue;
            }
            let mut offset = 0;
            while offset < self.block_size {
                // SAFETY: raw points to a free block of block_size bytes
                // owned by the pool, and &mut self excludes other access.
                unsafe {
                    let byte = raw.add(offset);
                    ptr::write_volatile(byte, ptr::read_volatile(byte));
                }
                offset += PAGE_SIZE;
            }
        }
    }
}

impl Drop for ObjectPool {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Some(ptr) = NonNull::new(*slot.block.get_mut()) {
                // SAFETY: non-null slots hold blocks owned by the pool.
                drop(unsafe { Block::from_raw(ptr, self.block_size) });
            }
        }
    }
}

impl fmt::Debug for ObjectPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("block_size", &self.block_size)
            .field("max_blocks", &self.max_blocks)
            .field("free", &self.free_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(block_size: usize, initial: usize, max: usize) -> ObjectPool {
        let config = PoolConfig {
            block_size,
            initial_blocks: initial,
            max_blocks: max,
            prefault: false,
        };
        ObjectPool::new(config, SpinPolicy::DEFAULT).unwrap()
    }

    #[test]
    fn test_pool_creation() {
        let pool = pool(512, 16, 64);
        assert_eq!(pool.free_count(), 16);
        assert_eq!(pool.block_size(), 512);
        assert_eq!(pool.max_blocks(), 64);
    }

    #[test]
    fn test_invalid_config() {
        let spin = SpinPolicy::DEFAULT;
        assert!(ObjectPool::new(PoolConfig::new(0, 1), spin).is_err());
        let config = PoolConfig {
            max_blocks: 4,
            ..PoolConfig::new(64, 5)
        };
        assert!(matches!(
            ObjectPool::new(config, spin),
            Err(PoolError::InvalidConfig(_))
        ));
        let config = PoolConfig {
            max_blocks: 1,
            ..PoolConfig::new(usize::MAX, 0)
        };
        assert!(matches!(
            ObjectPool::new(config, spin),
            Err(PoolError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_unallocatable_free_list_is_init_error() {
        let config = PoolConfig {
            max_blocks: 1 << 50,
            ..PoolConfig::new(64, 0)
        };
        assert!(matches!(
            ObjectPool::new(config, SpinPolicy::DEFAULT),
            Err(PoolError::Init { allocated: 0, .. })
        ));
    }

    #[test]
    fn test_get_put_keeps_free_count() {
        let pool = pool(256, 8, 16);
        let block = pool.get();
        assert_eq!(pool.free_count(), 7);
        pool.put(block);
        assert_eq!(pool.free_count(), 8);
    }

    #[test]
    fn test_exhaustion_falls_back() {
        let pool = pool(256, 3, 8);
        let held: Vec<_> = (0..3).map(|_| pool.get()).collect();
        assert_eq!(pool.free_count(), 0);

        let extra = pool.get();
        assert_eq!(extra.capacity(), 256);
        assert_eq!(pool.stats().fallback_allocs, 1);

        for block in held {
            pool.put(block);
        }
        pool.put(extra);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn test_put_beyond_max_frees() {
        let pool = pool(64, 2, 2);
        pool.put(Block::try_alloc(64).unwrap());
        assert_eq!(pool.free_count(), 2);
        assert_eq!(pool.stats().overflow_frees, 1);
    }

    #[test]
    fn test_foreign_block_not_recycled() {
        let pool = pool(64, 0, 4);
        pool.put(Block::try_alloc(128).unwrap());
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.stats().foreign_frees, 1);
    }

    #[test]
    fn test_recycles_same_memory() {
        let pool = pool(256, 2, 4);
        let a = pool.get();
        let b = pool.get();
        assert_ne!(a.as_ptr(), b.as_ptr());
        let originals = [a.as_ptr(), b.as_ptr()];

        pool.put(a);
        pool.put(b);
        assert_eq!(pool.free_count(), 2);

        let c = pool.get();
        assert!(originals.contains(&c.as_ptr()));
    }

    #[test]
    fn test_many_laps_non_power_of_two() {
        let pool = pool(32, 3, 3);
        for _ in 0..1000 {
            let a = pool.get();
            let b = pool.get();
            pool.put(a);
            pool.put(b);
        }
        assert_eq!(pool.free_count(), 3);
        assert_eq!(pool.stats().fallback_allocs, 0);
    }

    #[test]
    fn test_warm_up() {
        let config = PoolConfig {
            prefault: true,
            ..PoolConfig::new(8192, 4)
        };
        let pool = ObjectPool::new(config, SpinPolicy::DEFAULT).unwrap();
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn test_try_get_out_of_memory() {
        let pool = pool(1 << 50, 0, 1);
        assert!(matches!(
            pool.try_get(),
            Err(PoolError::OutOfMemory { block_size }) if block_size == 1 << 50
        ));
        assert_eq!(pool.stats().fallback_allocs, 1);
    }

    #[test]
    fn test_failed_fallback_leaves_free_list() {
        let pool = pool(128, 1, 2);
        pool.fail_fallback();
        assert!(pool.try_get().is_ok());
        assert!(matches!(pool.try_get(), Err(PoolError::OutOfMemory { block_size: 128 })));
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn test_try_get() {
        let pool = pool(128, 1, 2);
        assert!(pool.try_get().is_ok());
        assert!(pool.try_get().is_ok());
        assert_eq!(pool.stats().fallback_allocs, 1);
    }
}
