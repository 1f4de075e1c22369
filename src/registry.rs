//! PoolRegistry - The three size-classed pools of a pipeline.
//!
//! | Class      | Block  | Pre-allocated |
//! |------------|--------|---------------|
//! | `Result`   | 256 B  | 512           |
//! | `Tx`       | 512 B  | 256           |
//! | `Calldata` | 2048 B | 128           |
//!
//! A registry is an ordinary value: build one per pipeline at startup and
//! share it by reference or `Arc`. Construction is the one-time init.

use std::fmt;
use std::sync::Arc;

use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::error::PoolError;
use crate::hint::SpinPolicy;
use crate::pool::{ObjectPool, PoolConfig, PoolStats};

pub const RESULT_BLOCK_SIZE: usize = 256;
pub const TX_BLOCK_SIZE: usize = 512;
pub const CALLDATA_BLOCK_SIZE: usize = 2048;

/// Bucket of request sizes served by one pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SizeClass {
    /// Small opportunity/result records
    Result = 0,
    /// Signed transaction buffers
    Tx = 1,
    /// ABI-encoded calldata
    Calldata = 2,
}

impl SizeClass {
    pub const ALL: [SizeClass; 3] = [SizeClass::Result, SizeClass::Tx, SizeClass::Calldata];

    /// Class for `size` bytes under the default block sizes.
    #[inline]
    pub const fn for_size(size: usize) -> Self {
        if size <= RESULT_BLOCK_SIZE {
            SizeClass::Result
        } else if size <= TX_BLOCK_SIZE {
            SizeClass::Tx
        } else {
            SizeClass::Calldata
        }
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SizeClass::Result => "result",
            SizeClass::Tx => "tx",
            SizeClass::Calldata => "calldata",
        })
    }
}

/// Configuration of all three pools.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolsConfig {
    pub result: PoolConfig,
    pub tx: PoolConfig,
    pub calldata: PoolConfig,
}

impl PoolsConfig {
    pub fn validate(&self) -> Result<(), PoolError> {
        self.result.validate()?;
        self.tx.validate()?;
        self.calldata.validate()?;
        if !(self.result.block_size < self.tx.block_size
            && self.tx.block_size < self.calldata.block_size)
        {
            return Err(PoolError::InvalidConfig(format!(
                "block sizes must increase result < tx < calldata, got {} / {} / {}",
                self.result.block_size, self.tx.block_size, self.calldata.block_size
            )));
        }
        Ok(())
    }
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            result: PoolConfig::new(RESULT_BLOCK_SIZE, 512),
            tx: PoolConfig::new(TX_BLOCK_SIZE, 256),
            calldata: PoolConfig::new(CALLDATA_BLOCK_SIZE, 128),
        }
    }
}

/// Approximate free counts of the three pools.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub tx_free: usize,
    pub calldata_free: usize,
    pub result_free: usize,
}

/// Owner of the result, tx and calldata pools.
pub struct PoolRegistry {
    result: ObjectPool,
    tx: ObjectPool,
    calldata: ObjectPool,
}

impl PoolRegistry {
    /// Build and pre-populate all three pools.
    ///
    /// Any pre-allocation failure is fatal: the pipeline must not start.
    pub fn new(config: &PoolsConfig, spin: SpinPolicy) -> Result<Self, PoolError> {
        config.validate()?;

        let registry = Self {
            result: ObjectPool::new(config.result, spin)?,
            tx: ObjectPool::new(config.tx, spin)?,
            calldata: ObjectPool::new(config.calldata, spin)?,
        };

        tracing::info!(
            result_free = registry.result.free_count(),
            tx_free = registry.tx.free_count(),
            calldata_free = registry.calldata.free_count(),
            "pool registry initialized"
        );
        Ok(registry)
    }

    /// Build a registry behind an `Arc` for sharing across threads.
    pub fn shared(config: &PoolsConfig, spin: SpinPolicy) -> Result<Arc<Self>, PoolError> {
        Self::new(config, spin).map(Arc::new)
    }

    #[inline]
    pub fn pool(&self, class: SizeClass) -> &ObjectPool {
        match class {
            SizeClass::Result => &self.result,
            SizeClass::Tx => &self.tx,
            SizeClass::Calldata => &self.calldata,
        }
    }

    /// Class serving `size` bytes under this registry's block sizes.
    ///
    /// Sizes above the calldata block size still map to `Calldata`; use
    /// [`checked_class`](Self::checked_class) to reject them.
    #[inline]
    pub fn class_for(&self, size: usize) -> SizeClass {
        if size <= self.result.block_size() {
            SizeClass::Result
        } else if size <= self.tx.block_size() {
            SizeClass::Tx
        } else {
            SizeClass::Calldata
        }
    }

    /// Class for `size`, rejecting requests no block can hold.
    #[inline]
    pub fn checked_class(&self, size: usize) -> Result<SizeClass, PoolError> {
        let max = self.calldata.block_size();
        if size > max {
            return Err(PoolError::TooLarge {
                requested: size,
                max,
            });
        }
        Ok(self.class_for(size))
    }

    #[inline]
    pub fn alloc(&self, class: SizeClass) -> Block {
        self.pool(class).get()
    }

    #[inline]
    pub fn alloc_tx(&self) -> Block {
        self.tx.get()
    }

    #[inline]
    pub fn alloc_calldata(&self) -> Block {
        self.calldata.get()
    }

    #[inline]
    pub fn alloc_result(&self) -> Block {
        self.result.get()
    }

    #[inline]
    pub fn free(&self, class: SizeClass, block: Block) {
        self.pool(class).put(block)
    }

    #[inline]
    pub fn free_tx(&self, block: Block) {
        self.tx.put(block)
    }

    #[inline]
    pub fn free_calldata(&self, block: Block) {
        self.calldata.put(block)
    }

    #[inline]
    pub fn free_result(&self, block: Block) {
        self.result.put(block)
    }

    /// Return a block to whichever pool matches its size.
    ///
    /// A block matching no pool is freed to the allocator.
    pub fn release(&self, block: Block) {
        let size = block.capacity();
        match SizeClass::ALL
            .into_iter()
            .find(|&class| self.pool(class).block_size() == size)
        {
            Some(class) => self.pool(class).put(block),
            None => tracing::debug!(size, "released block matches no pool"),
        }
    }

    /// Take `count` blocks able to hold `size` bytes each.
    ///
    /// Fails without side effects when `count > N` or `size` exceeds the
    /// largest class. If the allocator fails mid-batch, the blocks already
    /// taken go back to the pool before the error is returned.
    pub fn alloc_batch<const N: usize>(
        &self,
        count: usize,
        size: usize,
    ) -> Result<ArrayVec<Block, N>, PoolError> {
        if count > N {
            return Err(PoolError::BatchTooLarge {
                requested: count,
                limit: N,
            });
        }
        let pool = self.pool(self.checked_class(size)?);

        let mut batch = ArrayVec::new();
        for _ in 0..count {
            match pool.try_get() {
                Ok(block) => batch.push(block),
                Err(err) => {
                    for block in batch.drain(..) {
                        pool.put(block);
                    }
                    return Err(err);
                }
            }
        }
        Ok(batch)
    }

    /// Return every block in `blocks` to the pool for `size`.
    pub fn free_batch<I>(&self, blocks: I, size: usize)
    where
        I: IntoIterator<Item = Block>,
    {
        let pool = self.pool(self.class_for(size));
        for block in blocks {
            pool.put(block);
        }
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            tx_free: self.tx.free_count(),
            calldata_free: self.calldata.free_count(),
            result_free: self.result.free_count(),
        }
    }

    #[inline]
    pub fn pool_stats(&self, class: SizeClass) -> PoolStats {
        self.pool(class).stats()
    }
}

impl fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("result", &self.result)
            .field("tx", &self.tx)
            .field("calldata", &self.calldata)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> PoolsConfig {
        PoolsConfig {
            result: PoolConfig::new(256, 4),
            tx: PoolConfig::new(512, 4),
            calldata: PoolConfig::new(2048, 4),
        }
    }

    fn registry() -> PoolRegistry {
        PoolRegistry::new(&small_config(), SpinPolicy::DEFAULT).unwrap()
    }

    #[test]
    fn test_size_class_dispatch() {
        assert_eq!(SizeClass::for_size(1), SizeClass::Result);
        assert_eq!(SizeClass::for_size(256), SizeClass::Result);
        assert_eq!(SizeClass::for_size(257), SizeClass::Tx);
        assert_eq!(SizeClass::for_size(512), SizeClass::Tx);
        assert_eq!(SizeClass::for_size(513), SizeClass::Calldata);
        assert_eq!(SizeClass::for_size(100_000), SizeClass::Calldata);

        let reg = registry();
        assert_eq!(reg.class_for(300), SizeClass::Tx);
        assert!(matches!(
            reg.checked_class(4096),
            Err(PoolError::TooLarge { requested: 4096, max: 2048 })
        ));
    }

    #[test]
    fn test_default_config() {
        let reg = PoolRegistry::new(&PoolsConfig::default(), SpinPolicy::DEFAULT).unwrap();
        assert_eq!(
            reg.stats(),
            RegistryStats {
                tx_free: 256,
                calldata_free: 128,
                result_free: 512,
            }
        );
    }

    #[test]
    fn test_unordered_sizes_rejected() {
        let mut config = small_config();
        config.tx.block_size = 128;
        assert!(matches!(
            PoolRegistry::new(&config, SpinPolicy::DEFAULT),
            Err(PoolError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_typed_alloc_free() {
        let reg = registry();
        let tx = reg.alloc_tx();
        let cd = reg.alloc_calldata();
        let res = reg.alloc_result();
        assert_eq!((tx.capacity(), cd.capacity(), res.capacity()), (512, 2048, 256));
        assert_eq!(reg.stats(), RegistryStats { tx_free: 3, calldata_free: 3, result_free: 3 });

        reg.free_tx(tx);
        reg.free_calldata(cd);
        reg.free_result(res);
        assert_eq!(reg.stats(), RegistryStats { tx_free: 4, calldata_free: 4, result_free: 4 });
    }

    #[test]
    fn test_release_routes_by_size() {
        let reg = registry();
        let block = reg.alloc(SizeClass::Tx);
        reg.release(block);
        assert_eq!(reg.stats().tx_free, 4);

        reg.release(Block::try_alloc(100).unwrap());
        assert_eq!(reg.stats(), RegistryStats { tx_free: 4, calldata_free: 4, result_free: 4 });
    }

    #[test]
    fn test_alloc_batch_round_trip() {
        let reg = registry();
        let before = reg.stats();

        let batch = reg.alloc_batch::<8>(6, 400).unwrap();
        assert_eq!(batch.len(), 6);
        assert!(batch.iter().all(|b| b.capacity() == 512));
        assert_eq!(reg.stats().tx_free, 0);
        assert_eq!(reg.pool_stats(SizeClass::Tx).fallback_allocs, 2);

        reg.free_batch(batch, 400);
        assert_eq!(reg.stats().tx_free, before.tx_free + 2);
    }

    #[test]
    fn test_alloc_batch_rolls_back_on_allocator_failure() {
        let reg = registry();
        let before = reg.stats();
        reg.tx.fail_fallback();

        assert!(matches!(
            reg.alloc_batch::<8>(6, 400),
            Err(PoolError::OutOfMemory { block_size: 512 })
        ));
        assert_eq!(reg.stats(), before);
        assert_eq!(reg.pool_stats(SizeClass::Tx).fallback_allocs, 1);

        let batch = reg.alloc_batch::<8>(4, 400).unwrap();
        assert_eq!(batch.len(), 4);
    }

    #[test]
    fn test_alloc_batch_rejects_without_side_effects() {
        let reg = registry();
        let before = reg.stats();
        assert!(matches!(
            reg.alloc_batch::<2>(3, 64),
            Err(PoolError::BatchTooLarge { requested: 3, limit: 2 })
        ));
        assert!(matches!(
            reg.alloc_batch::<8>(1, 9000),
            Err(PoolError::TooLarge { .. })
        ));
        assert_eq!(reg.stats(), before);
    }
}
