//! # Compute Error Types
//!
//! Failures of the worker pool and of the dispatcher. Usage errors (unknown
//! entity, unknown column) never surface here; they stay `Option`/`bool`
//! returns in the storage layer.

use std::time::Duration;

use tessera_core::{ComponentTypeId, CoreError};
use thiserror::Error;

/// Errors that settle a pool run as failed, or prevent it from starting.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// A run is already outstanding.
    #[error("pool is busy with run {0}")]
    Busy(u64),

    /// The pool was disposed.
    #[error("pool has been disposed")]
    Disposed,

    /// No run is outstanding.
    #[error("no run in progress")]
    NotRunning,

    /// The run exceeded its wall-clock bound.
    #[error("run timed out after {0:?}")]
    Timeout(Duration),

    /// The run's cancel signal fired.
    #[error("run cancelled")]
    Cancelled,

    /// A kernel returned an error or panicked.
    #[error("worker failed on job {job}: {reason}")]
    WorkerFailed {
        /// Payload index of the failed job.
        job: usize,
        /// Kernel error message or panic payload.
        reason: String,
    },

    /// A kernel reported writes outside its declared set.
    #[error("kernel '{kernel}' wrote undeclared columns {undeclared:?}")]
    UndeclaredWrite {
        /// Kernel id.
        kernel: String,
        /// Column indices missing from the declared writes.
        undeclared: Vec<usize>,
    },

    /// A compute thread could not be started.
    #[error("failed to spawn worker: {0}")]
    WorkerSpawn(String),

    /// Invalid pool configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Error returned by a kernel for one chunk.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct KernelError {
    message: String,
}

impl KernelError {
    /// Creates a kernel error with a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Errors that abort a parallel dispatch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The chunk batch aliases rows of one archetype.
    #[error("{0} overlapping chunk pairs in batch")]
    OverlappingChunks(usize),

    /// A dispatched column cannot be sent to a worker (boxed values).
    #[error("component {0:?} is not dispatchable")]
    NotDispatchable(ComponentTypeId),

    /// The kernel has no registered write metadata.
    #[error("unknown kernel '{0}'")]
    UnknownKernel(String),

    /// Leasing a shared column failed.
    #[error(transparent)]
    Lease(#[from] CoreError),

    /// The pool run failed.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;
