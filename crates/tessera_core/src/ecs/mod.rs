//! # Entity Component Storage
//!
//! Archetype-based columnar storage.
//!
//! ## Layers
//!
//! ```text
//! Signature        bitset of component type ids
//!    │
//! Archetype        one table per exact signature
//!    │
//! ArchetypeIndex   signature -> archetype, required/forbidden matching
//!    │
//! ChunkedQuery     matching archetypes sliced into row ranges
//!    │
//! World            entity locations, migration, deferred commands
//! ```

mod archetype;
mod change;
mod column;
mod commands;
mod component;
mod entity;
mod index;
mod query;
mod signature;
mod world;

pub use archetype::{Archetype, ArchetypeId, RemovedRow};
pub use change::{ChangeLog, ChangeTracker};
pub use column::{column_for, BoxedColumn, Column, ColumnKind, RecordColumn};
pub use commands::{Command, CommandBuffer};
pub use component::{
    ColumnLayout, ColumnStorage, ComponentInfo, ComponentTypeId, ComponentTypes, FieldDesc,
    FieldKind, RecordSchema, Value, ValueRef, MAX_RECORD_ALIGN,
};
pub use entity::Entity;
pub use index::ArchetypeIndex;
pub use query::{chunk_ranges, ChunkDescriptor, ChunkView, ChunkedQuery};
pub use signature::{Signature, SignatureIter, SignatureKey};
pub use world::{EntityLocation, World};
