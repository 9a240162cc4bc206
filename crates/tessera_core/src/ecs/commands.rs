//! # Deferred Structural Commands
//!
//! Structural changes requested while the world is being iterated are
//! recorded here and replayed, in order, once iteration ends. The archetype
//! being iterated is never mutated in place.

use super::component::{ComponentTypeId, Value};
use super::entity::Entity;

/// One deferred structural change.
#[derive(Debug)]
pub enum Command {
    /// Creates an entity with the given component values.
    Spawn {
        /// Entity handle, allocated by the caller.
        entity: Entity,
        /// Initial values; types missing a value get their default.
        values: Vec<(ComponentTypeId, Value)>,
    },

    /// Removes an entity and all its components.
    Despawn {
        /// Entity to remove.
        entity: Entity,
    },

    /// Adds or overwrites a component, migrating if the type is new.
    Insert {
        /// Target entity.
        entity: Entity,
        /// Component type.
        ty: ComponentTypeId,
        /// Value to store.
        value: Value,
    },

    /// Removes a component, migrating to the smaller archetype.
    Remove {
        /// Target entity.
        entity: Entity,
        /// Component type.
        ty: ComponentTypeId,
    },
}

/// FIFO queue of [`Command`]s.
#[derive(Debug, Default)]
pub struct CommandBuffer {
    commands: Vec<Command>,
}

impl CommandBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a command.
    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Number of pending commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Checks if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Takes every pending command, oldest first.
    pub fn drain(&mut self) -> std::vec::Drain<'_, Command> {
        self.commands.drain(..)
    }

    /// Moves the pending commands out, leaving the buffer empty.
    #[must_use]
    pub fn take(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }
}
