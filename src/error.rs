//! Error types for the queue, the pools, RLP and configuration.
//!
//! Pool exhaustion is not an error here: an empty pool falls back to the
//! allocator instead of failing.

use std::fmt;

use thiserror::Error;

/// Errors raised while creating a queue or claiming its consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Capacity was zero or too large to round up to a power of two
    #[error("invalid queue capacity: {0}")]
    InvalidCapacity(usize),

    /// The slot array could not be allocated
    #[error("failed to allocate a queue of {capacity} slots")]
    Alloc { capacity: usize },

    /// Another `Consumer` for this queue is still alive
    #[error("queue consumer already claimed")]
    ConsumerTaken,
}

/// Refusal from [`RingQueue::push`](crate::queue::RingQueue::push).
///
/// The item is handed back so the caller can drop it, retry, or apply
/// backpressure.
#[derive(PartialEq, Eq)]
pub enum PushError<T> {
    /// The queue held `capacity` items when the push was attempted
    Full(T),
    /// The bounded CAS retry budget ran out under producer contention
    Contended(T),
}

impl<T> PushError<T> {
    /// Recover the refused item.
    #[inline]
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(item) | PushError::Contended(item) => item,
        }
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        matches!(self, PushError::Full(_))
    }
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Full(_) => f.write_str("Full(..)"),
            PushError::Contended(_) => f.write_str("Contended(..)"),
        }
    }
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Full(_) => f.write_str("queue is full"),
            PushError::Contended(_) => f.write_str("push retry budget exhausted"),
        }
    }
}

impl<T> std::error::Error for PushError<T> {}

/// Errors raised by object pools and the registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Pool parameters rejected before any allocation happened
    #[error("invalid pool config: {0}")]
    InvalidConfig(String),

    /// Pre-allocation failed; the pool was not created
    #[error("pool init failed after {allocated} of {requested} blocks of {block_size} bytes")]
    Init {
        block_size: usize,
        requested: usize,
        allocated: usize,
    },

    /// The fallback allocation failed (system out of memory)
    #[error("out of memory allocating a {block_size}-byte block")]
    OutOfMemory { block_size: usize },

    /// A request larger than the biggest size class
    #[error("request of {requested} bytes exceeds largest block size {max}")]
    TooLarge { requested: usize, max: usize },

    /// A batch request exceeded the caller's batch storage
    #[error("batch of {requested} blocks exceeds limit of {limit}")]
    BatchTooLarge { requested: usize, limit: usize },
}

/// Errors raised by the RLP encoder and decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RlpError {
    #[error("output buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("empty input")]
    Empty,

    #[error("input truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("expected a string, found a list prefix {0:#04x}")]
    UnexpectedList(u8),

    #[error("length prefix of {0} bytes does not fit in usize")]
    LengthOverflow(usize),
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// Errors raised while assembling a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}
