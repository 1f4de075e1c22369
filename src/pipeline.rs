//! Pipeline - Detectors feed one executor through the queue.
//!
//! ```text
//! [Detector] --acquire--> Block --fill--> submit --+
//! [Detector] ------------------------------------> [RingQueue] --> [Executor (pinned)]
//! [Detector] ------------------------------------+                     |
//!                                                                  release
//!                                                                      v
//!                                                              [PoolRegistry]
//! ```
//!
//! An [`Opportunity`] owns its block the whole way, so a buffer is never
//! visible to two threads at once.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::block::Block;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PoolError, PushError};
use crate::hint::{cpu_relax, cycles, prefetch};
use crate::queue::{Consumer, RingQueue};
use crate::registry::{PoolRegistry, RegistryStats};

/// Largest batch the executor drains per poll
pub const MAX_BATCH: usize = 256;

/// A detected opportunity travelling to the executor.
#[derive(Debug)]
pub struct Opportunity {
    /// Buffer holding the encoded payload
    pub block: Block,
    /// Bytes of `block` in use
    pub len: usize,
    /// Detector that produced it
    pub detector: u16,
    /// Per-detector sequence number, starting at 0
    pub seq: u64,
    /// Cycle counter when submitted
    pub detected_at: u64,
}

impl Opportunity {
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.block[..self.len]
    }
}

/// Why a submission did not reach the queue.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The queue refused; the opportunity is inside
    #[error("opportunity refused: {0}")]
    Refused(PushError<Opportunity>),

    /// `len` exceeded the block; nothing was queued
    #[error("payload length {len} exceeds block capacity {capacity}")]
    LengthOutOfRange {
        len: usize,
        capacity: usize,
        block: Block,
    },
}

impl SubmitError {
    /// Recover the block so it can be retried or released.
    pub fn into_block(self) -> Block {
        match self {
            SubmitError::Refused(err) => err.into_inner().block,
            SubmitError::LengthOutOfRange { block, .. } => block,
        }
    }
}

/// Processes opportunities on the executor thread.
pub trait Handler {
    fn handle(&mut self, opportunity: &Opportunity);
}

impl<F: FnMut(&Opportunity)> Handler for F {
    #[inline]
    fn handle(&mut self, opportunity: &Opportunity) {
        self(opportunity)
    }
}

/// Snapshot of pipeline counters (monitoring only).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub queued: usize,
    pub dropped: u64,
    pub pools: RegistryStats,
}

/// Top-level context owning the registry and queue of one pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    registry: Arc<PoolRegistry>,
    queue: Arc<RingQueue<Opportunity>>,
    executor: Option<Executor>,
    dropped: Arc<AtomicU64>,
}

impl Pipeline {
    /// Pre-allocate the pools, create the queue and claim its consumer.
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;

        let spin = config.queue.spin;
        let registry = PoolRegistry::shared(&config.pools, spin)?;
        let queue = Arc::new(RingQueue::new(config.queue.capacity, spin)?);
        let executor = Executor {
            consumer: queue.consumer()?,
            registry: Arc::clone(&registry),
            batch_size: config.executor.batch_size,
            pin: config.executor.pin_to_core,
            processed: 0,
        };

        tracing::info!(
            queue_capacity = queue.capacity(),
            batch_size = config.executor.batch_size,
            "pipeline ready"
        );

        Ok(Self {
            config,
            registry,
            queue,
            executor: Some(executor),
            dropped: Arc::new(AtomicU64::new(0)),
        })
    }

    /// A producer handle for detector `id`.
    pub fn detector(&self, id: u16) -> Detector {
        Detector {
            id,
            seq: 0,
            registry: Arc::clone(&self.registry),
            queue: Arc::clone(&self.queue),
            dropped: Arc::clone(&self.dropped),
        }
    }

    /// Hand out the executor. Returns `None` after the first call.
    pub fn take_executor(&mut self) -> Option<Executor> {
        self.executor.take()
    }

    #[inline]
    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    #[inline]
    pub fn queue(&self) -> &Arc<RingQueue<Opportunity>> {
        &self.queue
    }

    #[inline]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            queued: self.queue.len(),
            dropped: self.dropped.load(Ordering::Relaxed),
            pools: self.registry.stats(),
        }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("queue", &self.queue)
            .field("registry", &self.registry)
            .field("executor_taken", &self.executor.is_none())
            .finish()
    }
}

/// Producer side used by one detector thread.
pub struct Detector {
    id: u16,
    seq: u64,
    registry: Arc<PoolRegistry>,
    queue: Arc<RingQueue<Opportunity>>,
    dropped: Arc<AtomicU64>,
}

impl Detector {
    #[inline]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Get a block able to hold `size` bytes from the matching pool.
    #[inline]
    pub fn acquire(&self, size: usize) -> Result<Block, PoolError> {
        let class = self.registry.checked_class(size)?;
        Ok(self.registry.alloc(class))
    }

    /// Queue the first `len` bytes of `block` for the executor.
    ///
    /// On refusal the opportunity comes back inside the error; the
    /// sequence number is only consumed on success.
    pub fn submit(&mut self, block: Block, len: usize) -> Result<(), SubmitError> {
        if len > block.capacity() {
            return Err(SubmitError::LengthOutOfRange {
                len,
                capacity: block.capacity(),
                block,
            });
        }

        let opportunity = Opportunity {
            block,
            len,
            detector: self.id,
            seq: self.seq,
            detected_at: cycles(),
        };
        self.queue.push(opportunity).map_err(SubmitError::Refused)?;
        self.seq += 1;
        Ok(())
    }

    /// Submit, or return the block to its pool and count a drop.
    ///
    /// Returns `true` if the opportunity was queued.
    pub fn submit_or_drop(&mut self, block: Block, len: usize) -> bool {
        match self.submit(block, len) {
            Ok(()) => true,
            Err(err) => {
                tracing::trace!(detector = self.id, error = %err, "dropping opportunity");
                self.registry.release(err.into_block());
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Opportunities queued by this detector so far.
    #[inline]
    pub fn submitted(&self) -> u64 {
        self.seq
    }
}

impl fmt::Debug for Detector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Detector")
            .field("id", &self.id)
            .field("seq", &self.seq)
            .finish()
    }
}

/// The single consumer of a pipeline.
pub struct Executor {
    consumer: Consumer<Opportunity>,
    registry: Arc<PoolRegistry>,
    batch_size: usize,
    pin: bool,
    processed: u64,
}

impl Executor {
    /// Drain up to one batch, returning every block to the registry after
    /// `handler` has seen it.
    #[inline]
    pub fn poll<H: Handler>(&mut self, handler: &mut H) -> usize {
        let batch = self.consumer.pop_batch::<MAX_BATCH>(self.batch_size);
        let count = batch.len();
        let mut batch = batch.into_iter().peekable();
        while let Some(opportunity) = batch.next() {
            if let Some(next) = batch.peek() {
                prefetch(next.block.as_ptr());
            }
            handler.handle(&opportunity);
            self.registry.release(opportunity.block);
        }
        self.processed += count as u64;
        count
    }

    /// Busy-poll until `stop` is set, then drain what is left.
    ///
    /// Stop every detector before setting `stop`. The final drain also waits
    /// for pushes that reserved a slot but had not yet written it, so it only
    /// returns once the queue is empty; detectors still submitting keep it
    /// running.
    ///
    /// Returns the number of opportunities processed by this call.
    pub fn run_until<H: Handler>(&mut self, stop: &AtomicBool, handler: &mut H) -> u64 {
        if self.pin {
            self.pin_to_core();
        }
        let start = self.processed;
        tracing::info!(batch_size = self.batch_size, "executor started");

        loop {
            if self.poll(handler) == 0 {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                cpu_relax();
            }
        }
        while self.poll(handler) > 0 || !self.consumer.is_empty() {
            cpu_relax();
        }

        let processed = self.processed - start;
        tracing::info!(processed, "executor stopped");
        processed
    }

    /// Pin the current thread to the last available CPU core.
    ///
    /// The last core is typically isolated from OS interrupts.
    pub fn pin_to_core(&self) -> bool {
        let pinned = core_affinity::get_core_ids()
            .and_then(|ids| ids.last().copied())
            .map(core_affinity::set_for_current)
            .unwrap_or(false);
        if !pinned {
            tracing::warn!("failed to pin executor thread");
        }
        pinned
    }

    /// Opportunities processed over the executor's lifetime.
    #[inline]
    pub fn processed(&self) -> u64 {
        self.processed
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("batch_size", &self.batch_size)
            .field("processed", &self.processed)
            .finish()
    }
}
