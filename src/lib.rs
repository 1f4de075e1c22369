//! # Flash-MEV
//!
//! Lock-free hand-off and buffer recycling for a low-latency MEV pipeline.
//!
//! ## Design Principles
//!
//! - **Many producers, one consumer**: detector threads push, one executor pops
//! - **No locks**: every shared index moves by CAS or an ordered store
//! - **Cache-isolated indices**: head and tail live on separate cache lines
//! - **Pre-allocated buffers**: no heap allocation in the steady state;
//!   exhausted pools degrade to the allocator instead of failing
//!
//! ## Architecture
//!
//! ```text
//! [Detector 0] --+
//! [Detector 1] --+--> [RingQueue (MPSC)] --> [Executor Thread (Pinned)]
//! [Detector N] --+                                    |
//!      ^                                              |
//!      +------------- [PoolRegistry] <----------------+
//!                 result 256B / tx 512B / calldata 2KB
//! ```

pub mod block;
pub mod config;
pub mod error;
pub mod hint;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod rlp;

// Re-exports for convenience
pub use block::{Block, CACHE_LINE};
pub use config::{ExecutorConfig, PipelineConfig, QueueConfig};
pub use error::{ConfigError, PipelineError, PoolError, PushError, QueueError, RlpError};
pub use hint::SpinPolicy;
pub use pipeline::{Detector, Executor, Handler, Opportunity, Pipeline, PipelineStats, SubmitError};
pub use pool::{ObjectPool, PoolConfig, PoolStats};
pub use queue::{Consumer, RingQueue};
pub use registry::{PoolRegistry, PoolsConfig, RegistryStats, SizeClass};
