//! # Commit-Changed Write-Back
//!
//! After a successful run, only rows a kernel actually marked are stamped in
//! the change tracker. No diffing.
//!
//! ```text
//! written column i ─► observe fence ─► drain write-mask ─► rows
//!                                                          │
//!                      entities[row] ◄─────────────────────┘
//!                           │
//!                           ▼
//!               mark_changed(entity, type, frame)
//! ```

use tessera_core::{Archetype, ChangeTracker, ComponentTypeId};

/// Stamps the rows marked in the shared columns at `written` positions.
///
/// Draining clears the masks, so the next run starts empty. Plain columns
/// are skipped; their marks come back with the copied rows. Returns the
/// number of stamps.
///
/// # Arguments
///
/// * `archetype` - Archetype the chunks were cut from
/// * `columns` - Dispatched component types, in kernel order
/// * `written` - Kernel-order column indices reported as written
/// * `frame` - Frame number to stamp
/// * `tracker` - Change-tracking store
pub fn commit_changed(
    archetype: &Archetype,
    columns: &[ComponentTypeId],
    written: &[usize],
    frame: u64,
    tracker: &mut dyn ChangeTracker,
) -> usize {
    let mut stamped = 0;
    for &index in written {
        let Some(&ty) = columns.get(index) else {
            continue;
        };
        let Some(column) = archetype.shared_column(ty) else {
            continue;
        };
        column.observe();
        stamped += stamp_rows(archetype, ty, column.drain_writes(), frame, tracker);
    }
    stamped
}

/// Stamps `rows` of component `ty`. Rows past the archetype's end are
/// ignored.
pub fn stamp_rows(
    archetype: &Archetype,
    ty: ComponentTypeId,
    rows: impl IntoIterator<Item = usize>,
    frame: u64,
    tracker: &mut dyn ChangeTracker,
) -> usize {
    let entities = archetype.entities();
    let mut stamped = 0;
    for row in rows {
        if let Some(&entity) = entities.get(row) {
            tracker.mark_changed(entity, ty, frame);
            stamped += 1;
        }
    }
    stamped
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::ecs::{ArchetypeIndex, ComponentTypes};
    use tessera_core::{ChangeLog, ColumnStorage, Entity, Signature};

    #[test]
    fn test_only_marked_rows_stamped() {
        let mut types = ComponentTypes::new();
        let shared = types.register_record::<u32>("Shared", ColumnStorage::Shared).unwrap();
        let plain = types.register_record::<u64>("Plain", ColumnStorage::Plain).unwrap();
        let mut index = ArchetypeIndex::new();
        let id = index
            .get_or_create(&Signature::from_ids([shared, plain]), &types)
            .unwrap();
        let archetype = index.get_mut(id).unwrap();
        for e in [10, 20, 30, 40] {
            archetype
                .push(Entity::new(e), |ty| types.default_value(ty).unwrap())
                .unwrap();
        }
        let mask = archetype.shared_column(shared).unwrap().write_mask();
        mask.mark(1);
        mask.mark(3);

        let mut log = ChangeLog::new();
        let columns = [shared, plain];
        let stamped = commit_changed(archetype, &columns, &[0, 1, 5], 9, &mut log);

        assert_eq!(stamped, 2);
        assert_eq!(log.changed_since(shared, 9), vec![Entity::new(20), Entity::new(40)]);
        assert_eq!(log.last_changed(Entity::new(10), shared), None);
        assert_eq!(archetype.shared_column(shared).unwrap().write_mask().pending(), 0);

        // Drained: a second commit stamps nothing.
        assert_eq!(commit_changed(archetype, &columns, &[0], 10, &mut log), 0);
    }

    #[test]
    fn test_stamp_rows_ignores_out_of_range() {
        let mut types = ComponentTypes::new();
        let a = types.register_record::<u32>("A", ColumnStorage::Plain).unwrap();
        let mut index = ArchetypeIndex::new();
        let id = index.get_or_create(&Signature::from_ids([a]), &types).unwrap();
        let archetype = index.get_mut(id).unwrap();
        archetype
            .push(Entity::new(1), |ty| types.default_value(ty).unwrap())
            .unwrap();

        let mut log = ChangeLog::new();
        assert_eq!(stamp_rows(archetype, a, [0, 4], 3, &mut log), 1);
        assert_eq!(log.last_changed(Entity::new(1), a), Some(3));
    }
}
