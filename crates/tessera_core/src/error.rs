//! # Core Error Types
//!
//! Errors raised by the storage engine.
//!
//! Acting on a missing entity, row or component type is NOT an error here:
//! those calls return `None` / `false` so the hot path stays branch-light.
//! Only configuration mistakes and shared-memory lease conflicts surface as
//! [`CoreError`].

use thiserror::Error;

use crate::ecs::{ArchetypeId, ComponentTypeId, Entity};

/// Errors that can occur in the storage engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A record component needs stronger alignment than column buffers give.
    #[error("component {name} needs alignment {align}, record columns support at most {max}")]
    AlignmentTooLarge {
        /// Component name.
        name: &'static str,
        /// Requested alignment.
        align: usize,
        /// Maximum supported alignment.
        max: usize,
    },

    /// Zero-sized record components cannot be laid out in a stride buffer.
    #[error("component {0} is zero-sized and cannot be stored as a record")]
    ZeroSizedRecord(&'static str),

    /// The registry was frozen before this registration.
    #[error("component registry is frozen, cannot register {0}")]
    RegistryFrozen(&'static str),

    /// Two different Rust types were registered under one name.
    #[error("component name {0} is already registered for another type")]
    DuplicateName(&'static str),

    /// A schema was attached to an unknown or non-record component.
    #[error("component {0:?} is not a registered record component")]
    NotARecord(ComponentTypeId),

    /// A schema field does not fit inside the record.
    #[error("field {field} at offset {offset} overflows record of {size} bytes")]
    FieldOutOfRecord {
        /// Field name.
        field: String,
        /// Field byte offset.
        offset: usize,
        /// Record size in bytes.
        size: usize,
    },

    /// A signature names a component id the registry does not know.
    #[error("component {0:?} is not registered")]
    UnknownComponent(ComponentTypeId),

    /// An archetype id no longer resolves (dropped by cleanup).
    #[error("{0} no longer exists")]
    StaleArchetype(ArchetypeId),

    /// The entity already has a row in the target archetype.
    #[error("{0} already stored in this archetype")]
    EntityExists(Entity),

    /// A value's kind or size does not fit the component's column.
    #[error("value does not fit the column of component {0:?}")]
    ValueMismatch(ComponentTypeId),

    /// A shared column is full and cannot reallocate while rows are leased.
    #[error("shared column of component {0:?} is leased and cannot grow")]
    SharedBufferBusy(ComponentTypeId),

    /// A requested row range overlaps a range that is already leased out.
    #[error("rows [{start}, {end}) overlap leased rows [{held_start}, {held_end})")]
    LeaseConflict {
        /// Requested start row.
        start: usize,
        /// Requested end row (exclusive).
        end: usize,
        /// Start of the conflicting lease.
        held_start: usize,
        /// End of the conflicting lease (exclusive).
        held_end: usize,
    },

    /// A row needs a value for a component that has none and no default.
    #[error("no value or default for component {0:?}")]
    MissingValue(ComponentTypeId),

    /// A requested row range falls outside the column.
    #[error("rows [{start}, {end}) outside column of {len} rows")]
    RangeOutOfBounds {
        /// Requested start row.
        start: usize,
        /// Requested end row (exclusive).
        end: usize,
        /// Column length.
        len: usize,
    },
}

/// Result type for storage operations.
pub type CoreResult<T> = Result<T, CoreError>;
