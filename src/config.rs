//! Pipeline configuration, loaded from TOML.
//!
//! ```toml
//! [queue]
//! capacity = 4096
//!
//! [queue.spin]
//! spin_limit = 6
//! max_attempts = 0
//!
//! [pools.tx]
//! block_size = 512
//! initial_blocks = 256
//! max_blocks = 1024
//!
//! [executor]
//! batch_size = 32
//! pin_to_core = true
//! ```
//!
//! Every field is optional; missing values take the defaults below. A
//! partially written pool table fills its gaps from `PoolConfig::default()`
//! (the 256-byte result pool), so give `block_size` whenever a pool table
//! appears.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::hint::SpinPolicy;
use crate::pipeline::MAX_BATCH;
use crate::queue::MAX_CAPACITY;
use crate::registry::PoolsConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Requested slots, rounded up to a power of two
    pub capacity: usize,
    /// CAS retry policy shared by the queue and the pools
    pub spin: SpinPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            spin: SpinPolicy::DEFAULT,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Items drained per poll
    pub batch_size: usize,
    /// Pin the executor thread to the last CPU core
    pub pin_to_core: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            pin_to_core: false,
        }
    }
}

/// Top-level configuration of one pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue: QueueConfig,
    pub pools: PoolsConfig,
    pub executor: ExecutorConfig,
}

impl PipelineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "loaded pipeline config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.capacity == 0 || self.queue.capacity > MAX_CAPACITY {
            return Err(ConfigError::invalid(
                "queue.capacity",
                format!("must be in 1..={MAX_CAPACITY}, got {}", self.queue.capacity),
            ));
        }
        if self.executor.batch_size == 0 || self.executor.batch_size > MAX_BATCH {
            return Err(ConfigError::invalid(
                "executor.batch_size",
                format!("must be in 1..={MAX_BATCH}, got {}", self.executor.batch_size),
            ));
        }
        self.pools
            .validate()
            .map_err(|err| ConfigError::invalid("pools", err.to_string()))
    }
}
