//! # Pool Configuration
//!
//! Loaded once at startup, usually from a `[pool]`-style TOML table:
//!
//! ```toml
//! workers = 8
//! thread_name_prefix = "tessera-compute"
//! default_timeout_ms = 50
//! target_chunk_size = 2048
//! reply_capacity = 64
//! ```
//!
//! Missing keys fall back to [`PoolConfig::default`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult};

/// Worker pool settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of compute threads.
    pub workers: usize,
    /// Thread name prefix. Threads are named `{prefix}-{generation}-{index}`.
    pub thread_name_prefix: String,
    /// Wall-clock bound applied to runs that do not set their own.
    pub default_timeout_ms: Option<u64>,
    /// Rows per chunk for dispatches that do not set their own.
    pub target_chunk_size: usize,
    /// Capacity of the shared reply channel.
    pub reply_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            thread_name_prefix: "tessera-compute".to_string(),
            default_timeout_ms: None,
            target_chunk_size: 1024,
            reply_capacity: 64,
        }
    }
}

impl PoolConfig {
    /// One worker per available core, leaving one for the coordinator.
    #[must_use]
    pub fn production() -> Self {
        let cores = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Self {
            workers: cores.saturating_sub(1).max(1),
            default_timeout_ms: Some(100),
            target_chunk_size: 4096,
            ..Default::default()
        }
    }

    /// Parses a TOML document and validates it.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidConfig`] on a parse error or a failed [`validate`](Self::validate).
    pub fn from_toml_str(text: &str) -> PoolResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| PoolError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> PoolResult<()> {
        if self.workers == 0 {
            return Err(PoolError::InvalidConfig("workers must be at least 1".into()));
        }
        if self.target_chunk_size == 0 {
            return Err(PoolError::InvalidConfig(
                "target_chunk_size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Sets the worker count.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the default run timeout.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Default run timeout, if any.
    #[must_use]
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    /// Reply channel capacity, never below the worker count.
    #[must_use]
    pub fn reply_channel_capacity(&self) -> usize {
        self.reply_capacity.max(self.workers)
    }
}
