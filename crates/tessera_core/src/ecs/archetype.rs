//! # Archetype Tables
//!
//! All entities sharing one exact [`Signature`] live in one archetype: a
//! dense entity list plus one column per component type, all indexed by the
//! same row.
//!
//! ```text
//! Archetype {Position, Velocity}
//!   row:        0      1      2
//!   entities: [e10]  [e20]  [e30]
//!   Position: [P10]  [P20]  [P30]
//!   Velocity: [V10]  [V20]  [V30]
//! ```
//!
//! ## Invariants
//!
//! - every column has exactly `entities.len()` rows.
//! - `rows[entities[r]] == r` for every row `r`.
//! - removal swaps the last row into the hole, so rows stay dense.

use std::collections::HashMap;
use std::fmt;

use bytemuck::Pod;

use super::column::{column_for, Column, RecordColumn};
use super::component::{ComponentTypeId, ComponentTypes, Value, ValueRef};
use super::entity::Entity;
use super::signature::{Signature, SignatureKey};
use crate::error::{CoreError, CoreResult};
use crate::sync::SharedColumn;

/// Index of an archetype inside its [`ArchetypeIndex`](super::ArchetypeIndex).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ArchetypeId(u32);

impl ArchetypeId {
    /// Wraps a raw id.
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Returns the id as a table index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ArchetypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "archetype#{}", self.0)
    }
}

/// A row taken out by [`Archetype::swap_remove`].
#[derive(Debug)]
pub struct RemovedRow {
    /// Entity that owned the row.
    pub entity: Entity,
    /// Component values of the row, in column order.
    pub values: Vec<(ComponentTypeId, Value)>,
    /// Entity moved from the last row into the freed slot, if any.
    pub moved: Option<Entity>,
}

/// Columnar table for one exact component set.
pub struct Archetype {
    id: ArchetypeId,
    signature: Signature,
    key: SignatureKey,
    /// Component types, ascending. Column `i` stores `types[i]`.
    types: Vec<ComponentTypeId>,
    columns: Vec<Box<dyn Column>>,
    entities: Vec<Entity>,
    rows: HashMap<Entity, usize>,
}

impl Archetype {
    /// Creates an empty archetype with one column per type in `signature`.
    ///
    /// # Errors
    ///
    /// [`CoreError::UnknownComponent`] if a type is not registered.
    pub fn new(id: ArchetypeId, signature: Signature, types: &ComponentTypes) -> CoreResult<Self> {
        let ids: Vec<ComponentTypeId> = signature.iter().collect();
        let columns = ids
            .iter()
            .map(|&ty| {
                types
                    .info(ty)
                    .map(column_for)
                    .ok_or(CoreError::UnknownComponent(ty))
            })
            .collect::<CoreResult<Vec<_>>>()?;

        Ok(Self {
            id,
            key: signature.key(),
            signature,
            types: ids,
            columns,
            entities: Vec::new(),
            rows: HashMap::new(),
        })
    }

    /// Archetype id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    /// Component set.
    #[inline]
    #[must_use]
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Canonical identity key.
    #[inline]
    #[must_use]
    pub fn key(&self) -> &SignatureKey {
        &self.key
    }

    /// Component types in column order.
    #[inline]
    #[must_use]
    pub fn component_types(&self) -> &[ComponentTypeId] {
        &self.types
    }

    /// Number of rows.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.entities.len()
    }

    /// Checks if the archetype has no rows.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Row → entity.
    #[inline]
    #[must_use]
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    /// Row of `entity`, if stored here.
    #[inline]
    #[must_use]
    pub fn get_row(&self, entity: Entity) -> Option<usize> {
        self.rows.get(&entity).copied()
    }

    /// Checks whether `entity` has a row here.
    #[inline]
    #[must_use]
    pub fn contains(&self, entity: Entity) -> bool {
        self.rows.contains_key(&entity)
    }

    /// Column position of `ty`, if stored here.
    #[inline]
    #[must_use]
    pub fn column_index(&self, ty: ComponentTypeId) -> Option<usize> {
        self.types.binary_search(&ty).ok()
    }

    /// Column for `ty`.
    #[must_use]
    pub fn column(&self, ty: ComponentTypeId) -> Option<&dyn Column> {
        let idx = self.column_index(ty)?;
        Some(self.columns[idx].as_ref())
    }

    /// Mutable column for `ty`.
    pub fn column_mut(&mut self, ty: ComponentTypeId) -> Option<&mut dyn Column> {
        let idx = self.column_index(ty)?;
        Some(self.columns[idx].as_mut())
    }

    /// Plain record column for `ty`.
    #[must_use]
    pub fn record_column(&self, ty: ComponentTypeId) -> Option<&RecordColumn> {
        self.column(ty)?.as_any().downcast_ref()
    }

    /// Mutable plain record column for `ty`.
    pub fn record_column_mut(&mut self, ty: ComponentTypeId) -> Option<&mut RecordColumn> {
        self.column_mut(ty)?.as_any_mut().downcast_mut()
    }

    /// Shared column for `ty`.
    #[must_use]
    pub fn shared_column(&self, ty: ComponentTypeId) -> Option<&SharedColumn> {
        self.column(ty)?.as_any().downcast_ref()
    }

    /// Mutable shared column for `ty`.
    pub fn shared_column_mut(&mut self, ty: ComponentTypeId) -> Option<&mut SharedColumn> {
        self.column_mut(ty)?.as_any_mut().downcast_mut()
    }

    /// Checks whether every column can take one more row.
    #[must_use]
    pub fn can_grow(&self) -> bool {
        self.columns.iter().all(|c| c.can_grow())
    }

    /// Appends a row for `entity`, filling each column from `factory`.
    ///
    /// Returns the new row, always `size() - 1`. Nothing is written unless
    /// every value fits its column.
    ///
    /// # Errors
    ///
    /// Fails if `entity` is already stored, a shared column cannot grow, or
    /// `factory` yields a value that does not fit its column.
    pub fn push<F>(&mut self, entity: Entity, mut factory: F) -> CoreResult<usize>
    where
        F: FnMut(ComponentTypeId) -> Value,
    {
        self.try_push(entity, |ty| Ok(factory(ty)))
    }

    /// Like [`push`](Self::push), with a factory that can fail.
    ///
    /// # Errors
    ///
    /// As [`push`](Self::push), plus the first error `factory` returns.
    pub fn try_push<F>(&mut self, entity: Entity, mut factory: F) -> CoreResult<usize>
    where
        F: FnMut(ComponentTypeId) -> CoreResult<Value>,
    {
        if self.contains(entity) {
            return Err(CoreError::EntityExists(entity));
        }
        if let Some(i) = self.columns.iter().position(|c| !c.can_grow()) {
            return Err(CoreError::SharedBufferBusy(self.types[i]));
        }

        let mut values = Vec::with_capacity(self.types.len());
        for (i, &ty) in self.types.iter().enumerate() {
            let value = factory(ty)?;
            if !self.columns[i].accepts(&value) {
                return Err(CoreError::ValueMismatch(ty));
            }
            values.push(value);
        }

        for (column, value) in self.columns.iter_mut().zip(values) {
            let pushed = column.push(value);
            debug_assert!(pushed, "checked by accepts/can_grow");
        }
        let row = self.entities.len();
        self.entities.push(entity);
        self.rows.insert(entity, row);
        Ok(row)
    }

    /// Removes `row` by moving the last row into it, then truncating.
    ///
    /// Returns `None` if `row >= size()` or a shared column is leased.
    pub fn swap_remove(&mut self, row: usize) -> Option<RemovedRow> {
        if row >= self.entities.len() {
            return None;
        }
        if self
            .columns
            .iter()
            .any(|c| c.as_any().downcast_ref::<SharedColumn>().is_some_and(SharedColumn::is_leased))
        {
            return None;
        }

        let mut values = Vec::with_capacity(self.columns.len());
        for (&ty, column) in self.types.iter().zip(self.columns.iter_mut()) {
            if let Some(value) = column.swap_remove(row) {
                values.push((ty, value));
            }
        }

        let entity = self.entities.swap_remove(row);
        self.rows.remove(&entity);
        let moved = self.entities.get(row).copied();
        if let Some(moved) = moved {
            self.rows.insert(moved, row);
        }

        Some(RemovedRow {
            entity,
            values,
            moved,
        })
    }

    /// Borrows the value of `ty` for `entity`.
    #[must_use]
    pub fn get_component(&self, entity: Entity, ty: ComponentTypeId) -> Option<ValueRef<'_>> {
        let row = self.get_row(entity)?;
        self.column(ty)?.get(row)
    }

    /// Overwrites the value of `ty` for `entity`.
    pub fn set_component(&mut self, entity: Entity, ty: ComponentTypeId, value: Value) -> bool {
        let Some(row) = self.get_row(entity) else {
            return false;
        };
        self.column_mut(ty).is_some_and(|c| c.set(row, value))
    }

    /// Reads a record component as `T`.
    #[must_use]
    pub fn get<T: Pod>(&self, entity: Entity, ty: ComponentTypeId) -> Option<T> {
        self.get_component(entity, ty)?.read()
    }

    /// Writes a record component.
    pub fn set<T: Pod>(&mut self, entity: Entity, ty: ComponentTypeId, value: T) -> bool {
        self.set_component(entity, ty, Value::record(value))
    }
}

impl fmt::Debug for Archetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archetype")
            .field("id", &self.id)
            .field("key", &self.key.to_string())
            .field("types", &self.types)
            .field("size", &self.entities.len())
            .finish_non_exhaustive()
    }
}
