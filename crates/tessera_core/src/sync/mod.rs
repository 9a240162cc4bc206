//! # Concurrency-Safety Layer
//!
//! Everything that makes parallel in-place mutation of archetype columns
//! correct.
//!
//! ## The Problem
//!
//! ```text
//! Worker A:  mutate rows [0, 4) of archetype X
//! Worker B:  mutate rows [2, 6) of archetype X   <- aliasing, data race
//! Coordinator: read rows while A still writes    <- torn / stale reads
//! ```
//!
//! ## The Pieces
//!
//! - [`validate_non_overlapping_chunks`]: rejects aliasing batches before any
//!   thread runs.
//! - [`SharedColumn`] / [`SharedColumnView`]: leased row windows over one
//!   buffer; overlapping leases fail.
//! - [`WriteMask`]: which rows a worker actually wrote.
//! - [`MemoryFence`]: release on the worker, acquire on the coordinator.

mod fence;
mod overlap;
mod shared;
mod write_mask;

pub use fence::MemoryFence;
pub use overlap::{find_overlaps, validate_non_overlapping_chunks};
pub use shared::{SharedBuffer, SharedColumn, SharedColumnView};
pub use write_mask::WriteMask;
