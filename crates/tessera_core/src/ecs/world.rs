//! # World
//!
//! Owns the archetype index and knows which archetype each entity lives in.
//! Adding or removing a component migrates the entity's row to the
//! archetype of the new signature.
//!
//! ## Iteration Guard
//!
//! ```text
//! begin_iteration()            depth 0 -> 1
//!   despawn(e)                 queued, not applied
//!   insert(e, T, v)            queued, not applied
//! end_iteration()              depth 1 -> 0, queue replayed in order
//! ```
//!
//! Reads and in-place `set` stay direct at any depth.

use std::collections::HashMap;
use std::sync::Arc;

use bytemuck::Pod;

use super::archetype::{Archetype, ArchetypeId};
use super::commands::{Command, CommandBuffer};
use super::component::{ComponentTypeId, ComponentTypes, Value, ValueRef};
use super::entity::Entity;
use super::index::ArchetypeIndex;
use super::signature::Signature;
use crate::error::{CoreError, CoreResult};
use crate::sync::SharedColumn;

/// Where an entity's row lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntityLocation {
    /// Owning archetype.
    pub archetype: ArchetypeId,
    /// Row inside the archetype.
    pub row: usize,
}

/// Entity/component container.
#[derive(Debug)]
pub struct World {
    types: Arc<ComponentTypes>,
    index: ArchetypeIndex,
    locations: HashMap<Entity, ArchetypeId>,
    commands: CommandBuffer,
    iteration_depth: usize,
}

impl World {
    /// Creates an empty world over a component registry.
    #[must_use]
    pub fn new(types: Arc<ComponentTypes>) -> Self {
        Self {
            types,
            index: ArchetypeIndex::new(),
            locations: HashMap::new(),
            commands: CommandBuffer::new(),
            iteration_depth: 0,
        }
    }

    /// Component registry.
    #[inline]
    #[must_use]
    pub fn types(&self) -> &ComponentTypes {
        &self.types
    }

    /// Archetype index, for iteration outside the parallel path.
    #[inline]
    #[must_use]
    pub fn archetype_index(&self) -> &ArchetypeIndex {
        &self.index
    }

    /// Mutable archetype by id, for leasing columns.
    ///
    /// Rows may be written but must not be added or removed.
    pub fn archetype_mut(&mut self, id: ArchetypeId) -> Option<&mut Archetype> {
        self.index.get_mut(id)
    }

    /// Number of live entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locations.len()
    }

    /// Checks if no entity is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    /// Checks whether `entity` is live.
    #[must_use]
    pub fn contains(&self, entity: Entity) -> bool {
        self.locations.contains_key(&entity)
    }

    /// Archetype and row of `entity`.
    #[must_use]
    pub fn location(&self, entity: Entity) -> Option<EntityLocation> {
        let archetype = *self.locations.get(&entity)?;
        let row = self.index.get(archetype)?.get_row(entity)?;
        Some(EntityLocation { archetype, row })
    }

    fn archetype_of(&self, entity: Entity) -> Option<&Archetype> {
        self.index.get(*self.locations.get(&entity)?)
    }

    // =========================================================================
    // Iteration guard
    // =========================================================================

    /// Enters an iteration scope. Structural changes are queued until the
    /// outermost scope ends.
    pub fn begin_iteration(&mut self) {
        self.iteration_depth += 1;
    }

    /// Leaves an iteration scope; at depth 0 replays queued commands.
    ///
    /// Returns how many commands were applied. Commands that fail on replay
    /// are logged and skipped, and not counted.
    pub fn end_iteration(&mut self) -> usize {
        debug_assert!(self.iteration_depth > 0, "end_iteration without begin_iteration");
        self.iteration_depth = self.iteration_depth.saturating_sub(1);
        if self.iteration_depth > 0 {
            return 0;
        }

        let commands = self.commands.take();
        let queued = commands.len();
        let mut applied = 0;
        for command in commands {
            match self.apply(command) {
                Ok(()) => applied += 1,
                Err(err) => tracing::warn!("deferred command failed: {}", err),
            }
        }
        if queued > 0 {
            tracing::debug!("replayed {} of {} deferred commands", applied, queued);
        }
        applied
    }

    /// Checks whether an iteration scope is open.
    #[must_use]
    pub fn is_iterating(&self) -> bool {
        self.iteration_depth > 0
    }

    /// Number of queued structural commands.
    #[must_use]
    pub fn pending_commands(&self) -> usize {
        self.commands.len()
    }

    // =========================================================================
    // Structural changes
    // =========================================================================

    /// Spawns `entity` with default values for `component_types`.
    ///
    /// # Errors
    ///
    /// See [`World::spawn_with`].
    pub fn spawn(&mut self, entity: Entity, component_types: &[ComponentTypeId]) -> CoreResult<()> {
        let values = component_types
            .iter()
            .map(|&ty| {
                self.types
                    .default_value(ty)
                    .map(|v| (ty, v))
                    .ok_or(CoreError::UnknownComponent(ty))
            })
            .collect::<CoreResult<Vec<_>>>()?;
        self.spawn_with(entity, values)
    }

    /// Spawns `entity` with explicit component values.
    ///
    /// Queued while iterating.
    ///
    /// # Errors
    ///
    /// Fails if the entity is live, a component is unregistered or a value
    /// does not fit its column.
    pub fn spawn_with(
        &mut self,
        entity: Entity,
        values: Vec<(ComponentTypeId, Value)>,
    ) -> CoreResult<()> {
        self.submit(Command::Spawn { entity, values })
    }

    /// Removes `entity`. No-op if it is not live. Queued while iterating.
    ///
    /// # Errors
    ///
    /// Fails if a shared column of its archetype is leased.
    pub fn despawn(&mut self, entity: Entity) -> CoreResult<()> {
        self.submit(Command::Despawn { entity })
    }

    /// Adds or overwrites component `ty`. Queued while iterating.
    ///
    /// # Errors
    ///
    /// Fails if `ty` is unregistered, `value` does not fit, or a shared
    /// column involved in the migration is leased.
    pub fn insert(&mut self, entity: Entity, ty: ComponentTypeId, value: Value) -> CoreResult<()> {
        self.submit(Command::Insert { entity, ty, value })
    }

    /// Removes component `ty`. No-op if absent. Queued while iterating.
    ///
    /// # Errors
    ///
    /// Fails if a shared column involved in the migration is leased.
    pub fn remove(&mut self, entity: Entity, ty: ComponentTypeId) -> CoreResult<()> {
        self.submit(Command::Remove { entity, ty })
    }

    fn submit(&mut self, command: Command) -> CoreResult<()> {
        if self.is_iterating() {
            self.commands.push(command);
            return Ok(());
        }
        self.apply(command)
    }

    fn apply(&mut self, command: Command) -> CoreResult<()> {
        match command {
            Command::Spawn { entity, values } => self.apply_spawn(entity, values),
            Command::Despawn { entity } => self.apply_despawn(entity),
            Command::Insert { entity, ty, value } => self.apply_insert(entity, ty, value),
            Command::Remove { entity, ty } => self.apply_remove(entity, ty),
        }
    }

    fn apply_spawn(&mut self, entity: Entity, values: Vec<(ComponentTypeId, Value)>) -> CoreResult<()> {
        if self.contains(entity) {
            return Err(CoreError::EntityExists(entity));
        }
        let signature = Signature::from_ids(values.iter().map(|(ty, _)| *ty));
        let target = self.index.get_or_create(&signature, &self.types)?;
        self.place(entity, target, values)
    }

    fn apply_despawn(&mut self, entity: Entity) -> CoreResult<()> {
        let Some(location) = self.location(entity) else {
            return Ok(());
        };
        self.take_row(location)?;
        self.locations.remove(&entity);
        Ok(())
    }

    fn apply_insert(&mut self, entity: Entity, ty: ComponentTypeId, value: Value) -> CoreResult<()> {
        let Some(location) = self.location(entity) else {
            return Ok(());
        };
        let source = self
            .index
            .get(location.archetype)
            .ok_or(CoreError::StaleArchetype(location.archetype))?;
        if source.signature().contains(ty) {
            let accepted = self
                .index
                .get_mut(location.archetype)
                .is_some_and(|a| a.set_component(entity, ty, value));
            return if accepted {
                Ok(())
            } else {
                Err(CoreError::ValueMismatch(ty))
            };
        }

        let signature = source.signature().with(ty);
        let target = self.index.get_or_create(&signature, &self.types)?;
        self.check_target(target, ty, &value)?;

        let mut values = self.take_row(location)?;
        values.push((ty, value));
        self.place(entity, target, values)
    }

    fn apply_remove(&mut self, entity: Entity, ty: ComponentTypeId) -> CoreResult<()> {
        let Some(location) = self.location(entity) else {
            return Ok(());
        };
        let Some(source) = self.index.get(location.archetype) else {
            return Ok(());
        };
        if !source.signature().contains(ty) {
            return Ok(());
        }

        let signature = source.signature().without(ty);
        let target = self.index.get_or_create(&signature, &self.types)?;
        if self.index.get(target).is_some_and(|a| !a.can_grow()) {
            return Err(CoreError::SharedBufferBusy(ty));
        }

        let mut values = self.take_row(location)?;
        values.retain(|(t, _)| *t != ty);
        self.place(entity, target, values)
    }

    /// Checks the target can take a row with `value` in column `ty`.
    fn check_target(&self, target: ArchetypeId, ty: ComponentTypeId, value: &Value) -> CoreResult<()> {
        let archetype = self.index.get(target).ok_or(CoreError::StaleArchetype(target))?;
        if !archetype.can_grow() {
            return Err(CoreError::SharedBufferBusy(ty));
        }
        if !archetype.column(ty).is_some_and(|c| c.accepts(value)) {
            return Err(CoreError::ValueMismatch(ty));
        }
        Ok(())
    }

    /// Swap-removes the entity's row and returns its values.
    fn take_row(&mut self, location: EntityLocation) -> CoreResult<Vec<(ComponentTypeId, Value)>> {
        let archetype = self
            .index
            .get_mut(location.archetype)
            .ok_or(CoreError::StaleArchetype(location.archetype))?;
        if let Some(&busy) = archetype
            .component_types()
            .iter()
            .find(|&&ty| archetype.shared_column(ty).is_some_and(SharedColumn::is_leased))
        {
            return Err(CoreError::SharedBufferBusy(busy));
        }
        let len = archetype.size();
        archetype
            .swap_remove(location.row)
            .map(|removed| removed.values)
            .ok_or(CoreError::RangeOutOfBounds {
                start: location.row,
                end: location.row + 1,
                len,
            })
    }

    /// Pushes a row built from `values` (defaults for the rest) into `target`.
    fn place(
        &mut self,
        entity: Entity,
        target: ArchetypeId,
        values: Vec<(ComponentTypeId, Value)>,
    ) -> CoreResult<()> {
        let mut values: HashMap<ComponentTypeId, Value> = values.into_iter().collect();
        let types = Arc::clone(&self.types);
        let archetype = self
            .index
            .get_mut(target)
            .ok_or(CoreError::StaleArchetype(target))?;
        archetype.try_push(entity, |ty| {
            values
                .remove(&ty)
                .or_else(|| types.default_value(ty))
                .ok_or(CoreError::MissingValue(ty))
        })?;
        self.locations.insert(entity, target);
        Ok(())
    }

    /// Drops empty archetypes. Skipped while iterating.
    pub fn cleanup_empty_archetypes(&mut self) -> usize {
        if self.is_iterating() {
            return 0;
        }
        self.index.cleanup_empty()
    }

    // =========================================================================
    // Component access
    // =========================================================================

    /// Borrows component `ty` of `entity`.
    #[must_use]
    pub fn get(&self, entity: Entity, ty: ComponentTypeId) -> Option<ValueRef<'_>> {
        self.archetype_of(entity)?.get_component(entity, ty)
    }

    /// Reads a record component.
    #[must_use]
    pub fn get_record<T: Pod>(&self, entity: Entity, ty: ComponentTypeId) -> Option<T> {
        self.get(entity, ty)?.read()
    }

    /// Borrows a boxed component.
    #[must_use]
    pub fn get_boxed<T: 'static>(&self, entity: Entity, ty: ComponentTypeId) -> Option<&T> {
        self.get(entity, ty)?.downcast_ref()
    }

    /// Overwrites component `ty` of `entity` in place. Allowed while iterating.
    pub fn set(&mut self, entity: Entity, ty: ComponentTypeId, value: Value) -> bool {
        let Some(&archetype) = self.locations.get(&entity) else {
            return false;
        };
        self.index
            .get_mut(archetype)
            .is_some_and(|a| a.set_component(entity, ty, value))
    }

    /// Writes a record component in place.
    pub fn set_record<T: Pod>(&mut self, entity: Entity, ty: ComponentTypeId, value: T) -> bool {
        self.set(entity, ty, Value::record(value))
    }

    /// Every `(entity, value)` pair for component `ty`, archetype by archetype.
    pub fn store(&self, ty: ComponentTypeId) -> impl Iterator<Item = (Entity, ValueRef<'_>)> + '_ {
        self.index
            .iter()
            .filter_map(move |a| a.column(ty).map(|c| (a, c)))
            .flat_map(|(a, c)| {
                a.entities()
                    .iter()
                    .enumerate()
                    .filter_map(move |(row, &e)| c.get(row).map(|v| (e, v)))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::ColumnStorage;
    use bytemuck::Zeroable;

    #[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Velocity {
        dx: f32,
        dy: f32,
    }

    #[derive(Debug, Default, PartialEq)]
    struct Label(String);

    struct Fixture {
        world: World,
        pos: ComponentTypeId,
        vel: ComponentTypeId,
        label: ComponentTypeId,
    }

    fn fixture() -> Fixture {
        let mut types = ComponentTypes::new();
        let pos = types.register_record::<Position>("Position", ColumnStorage::Plain).unwrap();
        let vel = types.register_record::<Velocity>("Velocity", ColumnStorage::Shared).unwrap();
        let label = types.register_boxed::<Label>("Label").unwrap();
        types.freeze();
        Fixture {
            world: World::new(Arc::new(types)),
            pos,
            vel,
            label,
        }
    }

    #[test]
    fn test_spawn_and_access() {
        let Fixture { mut world, pos, vel, .. } = fixture();
        let e = Entity::new(1);
        world
            .spawn_with(e, vec![(pos, Value::record(Position { x: 1.0, y: 2.0 }))])
            .unwrap();
        assert!(world.contains(e));
        assert_eq!(world.get_record::<Position>(e, pos), Some(Position { x: 1.0, y: 2.0 }));
        assert!(world.get(e, vel).is_none());
        assert_eq!(
            world.spawn(e, &[pos]),
            Err(CoreError::EntityExists(e))
        );
    }

    #[test]
    fn test_insert_migrates_and_keeps_values() {
        let Fixture { mut world, pos, vel, label } = fixture();
        let a = Entity::new(1);
        let b = Entity::new(2);
        world.spawn(a, &[pos]).unwrap();
        world.spawn(b, &[pos]).unwrap();
        world.set_record(a, pos, Position { x: 5.0, y: 6.0 });
        world.set_record(b, pos, Position { x: 7.0, y: 8.0 });

        world.insert(a, vel, Value::record(Velocity { dx: 1.0, dy: 0.0 })).unwrap();
        world.insert(a, label, Value::boxed(Label("a".into()))).unwrap();

        assert_eq!(world.get_record::<Position>(a, pos), Some(Position { x: 5.0, y: 6.0 }));
        assert_eq!(world.get_record::<Velocity>(a, vel), Some(Velocity { dx: 1.0, dy: 0.0 }));
        assert_eq!(world.get_boxed::<Label>(a, label), Some(&Label("a".into())));
        // b was swapped into a's old row.
        assert_eq!(world.location(b).map(|l| l.row), Some(0));
        assert_eq!(world.get_record::<Position>(b, pos), Some(Position { x: 7.0, y: 8.0 }));
    }

    #[test]
    fn test_insert_existing_overwrites_in_place() {
        let Fixture { mut world, pos, .. } = fixture();
        let e = Entity::new(1);
        world.spawn(e, &[pos]).unwrap();
        let before = world.location(e);
        world.insert(e, pos, Value::record(Position { x: 3.0, y: 3.0 })).unwrap();
        assert_eq!(world.location(e), before);
        assert!(matches!(
            world.insert(e, pos, Value::record(1u8)),
            Err(CoreError::ValueMismatch(_))
        ));
    }

    #[test]
    fn test_remove_migrates_down() {
        let Fixture { mut world, pos, vel, .. } = fixture();
        let e = Entity::new(1);
        world.spawn(e, &[pos, vel]).unwrap();
        world.set_record(e, pos, Position { x: 9.0, y: 9.0 });
        world.remove(e, vel).unwrap();
        assert!(world.get(e, vel).is_none());
        assert_eq!(world.get_record::<Position>(e, pos), Some(Position { x: 9.0, y: 9.0 }));

        // Removing every component keeps the entity in the empty archetype.
        world.remove(e, pos).unwrap();
        assert!(world.contains(e));
        assert!(world.location(e).is_some());
    }

    #[test]
    fn test_despawn_and_missing_entity_noops() {
        let Fixture { mut world, pos, .. } = fixture();
        let e = Entity::new(1);
        world.spawn(e, &[pos]).unwrap();
        world.despawn(e).unwrap();
        assert!(!world.contains(e));
        assert!(world.despawn(e).is_ok());
        assert!(world.remove(e, pos).is_ok());
        assert!(world.insert(e, pos, Value::record(Position::default())).is_ok());
        assert!(!world.contains(e));
        assert!(!world.set_record(e, pos, Position::default()));
    }

    #[test]
    fn test_structural_changes_deferred_while_iterating() {
        let Fixture { mut world, pos, vel, .. } = fixture();
        let a = Entity::new(1);
        world.spawn(a, &[pos]).unwrap();

        world.begin_iteration();
        world.begin_iteration();
        world.despawn(a).unwrap();
        world.spawn(Entity::new(2), &[pos, vel]).unwrap();
        assert!(world.contains(a));
        assert!(!world.contains(Entity::new(2)));
        assert!(world.set_record(a, pos, Position { x: 1.0, y: 1.0 }));
        assert_eq!(world.pending_commands(), 2);

        assert_eq!(world.end_iteration(), 0);
        assert!(world.contains(a));
        assert_eq!(world.end_iteration(), 2);
        assert!(!world.contains(a));
        assert!(world.contains(Entity::new(2)));
        assert!(!world.is_iterating());
    }

    #[test]
    fn test_failed_replay_not_counted() {
        let Fixture { mut world, pos, .. } = fixture();
        let e = Entity::new(5);

        world.begin_iteration();
        world.spawn(e, &[pos]).unwrap();
        world.spawn(e, &[pos]).unwrap();
        assert_eq!(world.pending_commands(), 2);

        // The second spawn finds the entity live and is dropped.
        assert_eq!(world.end_iteration(), 1);
        assert_eq!(world.pending_commands(), 0);
        assert!(world.contains(e));
    }

    #[test]
    fn test_store_iterates_all_archetypes() {
        let Fixture { mut world, pos, vel, .. } = fixture();
        world.spawn(Entity::new(1), &[pos]).unwrap();
        world.spawn(Entity::new(2), &[pos, vel]).unwrap();
        world.spawn(Entity::new(3), &[vel]).unwrap();
        let mut with_pos: Vec<Entity> = world.store(pos).map(|(e, _)| e).collect();
        with_pos.sort();
        assert_eq!(with_pos, vec![Entity::new(1), Entity::new(2)]);
    }

    #[test]
    fn test_cleanup_after_migration() {
        let Fixture { mut world, pos, vel, .. } = fixture();
        let e = Entity::new(1);
        world.spawn(e, &[pos]).unwrap();
        world.insert(e, vel, Value::record(Velocity::default())).unwrap();
        assert_eq!(world.cleanup_empty_archetypes(), 1);
        assert_eq!(world.get_record::<Velocity>(e, vel), Some(Velocity::default()));
    }
}
