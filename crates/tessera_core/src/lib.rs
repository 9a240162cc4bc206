//! # Tessera Core
//!
//! Archetype storage and the concurrency-safety layer for parallel
//! entity processing.
//!
//! - tens of thousands of entities per frame, predictable latency
//! - columnar tables keyed by the exact component set
//! - row ranges handed to compute threads and mutated in place
//!
//! ## Architecture Rules
//!
//! 1. **Storage shape decides what can be chunked** - rows are dense per archetype
//! 2. **Chunk shape decides what can run in parallel** - chunks never span archetypes
//! 3. **Nothing runs in parallel unchecked** - overlap validation, leases and
//!    fences guard every shared write
//!
//! ## Example
//!
//! ```rust,ignore
//! use tessera_core::{ChunkedQuery, ColumnStorage, ComponentTypes, Entity, World};
//!
//! let mut types = ComponentTypes::new();
//! let pos = types.register_record::<[f32; 2]>("Position", ColumnStorage::Shared)?;
//! let mut world = World::new(std::sync::Arc::new(types));
//! world.spawn(Entity::new(1), &[pos])?;
//!
//! let query = ChunkedQuery::new(&[pos], 1024);
//! for chunk in query.chunks(world.archetype_index()) {
//!     // hand chunk.descriptor() to the dispatcher
//! }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]
#![allow(clippy::module_name_repetitions)]

pub mod ecs;
pub mod error;
pub mod sync;

pub use ecs::{
    Archetype, ArchetypeId, ArchetypeIndex, ChangeLog, ChangeTracker, ChunkDescriptor, ChunkView,
    ChunkedQuery, Column, ColumnKind, ColumnLayout, ColumnStorage, ComponentInfo,
    ComponentTypeId, ComponentTypes, Entity, EntityLocation, FieldKind, RecordColumn,
    RecordSchema, Signature, SignatureKey, Value, ValueRef, World,
};
pub use error::{CoreError, CoreResult};
pub use sync::{
    validate_non_overlapping_chunks, MemoryFence, SharedColumn, SharedColumnView, WriteMask,
};
