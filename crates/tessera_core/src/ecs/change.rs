//! # Change Tracking
//!
//! Write-back stamps "component `ty` of `entity` was written in frame `F`"
//! through [`ChangeTracker`]. Schedulers and change-detection queries live
//! outside this crate; [`ChangeLog`] is the in-memory store they can use.

use std::collections::HashMap;

use super::component::ComponentTypeId;
use super::entity::Entity;

/// Receiver of change notifications.
pub trait ChangeTracker {
    /// Records that `ty` of `entity` was written in `frame`.
    fn mark_changed(&mut self, entity: Entity, ty: ComponentTypeId, frame: u64);
}

/// Last-written frame per `(entity, component)`.
#[derive(Debug, Default, Clone)]
pub struct ChangeLog {
    stamps: HashMap<(Entity, ComponentTypeId), u64>,
}

impl ChangeLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame `ty` of `entity` was last written in.
    #[must_use]
    pub fn last_changed(&self, entity: Entity, ty: ComponentTypeId) -> Option<u64> {
        self.stamps.get(&(entity, ty)).copied()
    }

    /// Entities whose `ty` was written in `frame` or later, ascending.
    #[must_use]
    pub fn changed_since(&self, ty: ComponentTypeId, frame: u64) -> Vec<Entity> {
        let mut entities: Vec<Entity> = self
            .stamps
            .iter()
            .filter(|(key, stamp)| key.1 == ty && **stamp >= frame)
            .map(|(key, _)| key.0)
            .collect();
        entities.sort_unstable();
        entities
    }

    /// Drops every stamp of `entity`.
    pub fn forget(&mut self, entity: Entity) {
        self.stamps.retain(|&(e, _), _| e != entity);
    }

    /// Number of stamped pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    /// Checks if nothing was stamped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }

    /// Drops every stamp.
    pub fn clear(&mut self) {
        self.stamps.clear();
    }
}

impl ChangeTracker for ChangeLog {
    fn mark_changed(&mut self, entity: Entity, ty: ComponentTypeId, frame: u64) {
        let stamp = self.stamps.entry((entity, ty)).or_insert(frame);
        *stamp = (*stamp).max(frame);
    }
}
