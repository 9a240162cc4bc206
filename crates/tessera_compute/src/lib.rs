//! # Tessera Compute
//!
//! Runs kernels over archetype chunks on a fixed pool of compute threads.
//!
//! ## Flow
//!
//! ```text
//! ParallelDispatch ──► ChunkedQuery ──► overlap check ──► ChunkPayload[]
//!                                                             │
//!        ChangeTracker ◄── commit_changed ◄── WorkerPool::run ┘
//! ```
//!
//! ## Architecture Rules
//!
//! 1. **One run at a time** - a second submit while running fails fast
//! 2. **Every reply is tagged** - `(generation, run, job)`; anything not awaited
//!    is discarded
//! 3. **A failed run poisons its threads** - the whole worker set is rebuilt
//! 4. **Declared writes are enforced** - a kernel reporting an undeclared
//!    column fails the run
//!
//! ## Example
//!
//! ```rust,ignore
//! use tessera_compute::{KernelMeta, KernelRegistry, ParallelDispatch, PoolConfig, WorkerPool};
//!
//! let mut kernels = KernelRegistry::new();
//! kernels.register_kernel("integrate", integrate);
//! kernels.register_host_kernel("integrate", integrate, KernelMeta::writes(&[0]));
//!
//! let mut pool = WorkerPool::new(PoolConfig::production(), Arc::new(kernels))?;
//! ParallelDispatch::new("integrate", &[position, velocity])
//!     .run(&mut world, &mut pool, frame, &mut change_log)?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]
#![allow(clippy::module_name_repetitions)]

pub mod cancel;
pub mod commit;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod kernel;
pub mod payload;
pub mod pool;

pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use commit::{commit_changed, stamp_rows};
pub use config::PoolConfig;
pub use dispatch::{DispatchReport, ParallelDispatch};
pub use error::{DispatchError, DispatchResult, KernelError, PoolError, PoolResult};
pub use kernel::{KernelFn, KernelMeta, KernelParams, KernelRegistry, ParamValue, WriteValidation};
pub use payload::{ChunkPayload, ChunkResult, CopiedColumn, KernelColumns, PayloadColumn};
pub use pool::{PoolStats, RunOptions, WorkerPool};
