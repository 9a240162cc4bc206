//! # Storage Integration Tests
//!
//! End-to-end checks over the public API: swap-remove, matching, chunking,
//! overlap validation and shared-column leasing.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use tessera_core::ecs::{ArchetypeIndex, ComponentTypes};
use tessera_core::{
    validate_non_overlapping_chunks, ChunkedQuery, ColumnStorage, ComponentTypeId, CoreError,
    Entity, Signature, Value, World,
};

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

#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
struct Frozen(u32);

fn registry() -> (ComponentTypes, ComponentTypeId, ComponentTypeId, ComponentTypeId) {
    let mut types = ComponentTypes::new();
    let pos = types.register_record::<Position>("Position", ColumnStorage::Plain).unwrap();
    let vel = types.register_record::<Velocity>("Velocity", ColumnStorage::Shared).unwrap();
    let frozen = types.register_record::<Frozen>("Frozen", ColumnStorage::Plain).unwrap();
    (types, pos, vel, frozen)
}

// ============================================================================
// ARCHETYPE
// ============================================================================

#[test]
fn swap_remove_entity_twenty() {
    let (types, pos, vel, _) = registry();
    let mut index = ArchetypeIndex::new();
    let id = index.get_or_create(&Signature::from_ids([pos, vel]), &types).unwrap();
    let archetype = index.get_mut(id).unwrap();
    for e in [10, 20, 30] {
        archetype.push(Entity::new(e), |ty| types.default_value(ty).unwrap()).unwrap();
    }

    archetype.swap_remove(1).unwrap();

    assert_eq!(archetype.entities(), &[Entity::new(10), Entity::new(30)]);
    assert_eq!(archetype.get_row(Entity::new(30)), Some(1));
    assert_eq!(archetype.size(), 2);
}

#[test]
fn padded_signatures_share_an_archetype() {
    let (types, pos, vel, _) = registry();
    let mut index = ArchetypeIndex::new();
    let mut padded = Signature::with_words(6);
    padded.insert(vel);
    padded.insert(pos);

    let a = index.get_or_create(&Signature::from_ids([pos, vel]), &types).unwrap();
    let b = index.get_or_create(&padded, &types).unwrap();
    assert_eq!(a, b);
    assert_eq!(index.len(), 1);
}

// ============================================================================
// CHUNKING + OVERLAP
// ============================================================================

#[test]
fn ten_rows_in_chunks_of_four() {
    let (types, pos, vel, frozen) = registry();
    let mut world = World::new(Arc::new(types));
    for e in 0..10 {
        world.spawn(Entity::new(e), &[pos, vel]).unwrap();
    }
    world.spawn(Entity::new(99), &[pos, vel, frozen]).unwrap();

    let query = ChunkedQuery::new(&[pos, vel], 4).without(&[frozen]);
    let ranges: Vec<_> = query
        .descriptors(world.archetype_index())
        .iter()
        .map(|d| (d.start_row, d.end_row))
        .collect();
    assert_eq!(ranges, vec![(0, 4), (4, 8), (8, 10)]);

    let chunks = query.descriptors(world.archetype_index());
    assert!(validate_non_overlapping_chunks(&chunks, None));
    assert!(validate_non_overlapping_chunks(&chunks, Some(&[1])));
}

#[test]
fn overlapping_batch_rejected_only_within_an_archetype() {
    let (types, pos, vel, frozen) = registry();
    let mut world = World::new(Arc::new(types));
    for e in 0..8 {
        world.spawn(Entity::new(e), &[pos, vel]).unwrap();
        world.spawn(Entity::new(100 + e), &[pos, vel, frozen]).unwrap();
    }

    let all = ChunkedQuery::new(&[pos, vel], 5).descriptors(world.archetype_index());
    let mut bad = all.clone();
    bad[1].start_row = 3;
    assert!(!validate_non_overlapping_chunks(&bad, None));
    assert!(validate_non_overlapping_chunks(&bad, Some(&[7])));

    // Same row ranges, different archetypes.
    let mixed = [all[0], all[2]];
    assert_ne!(mixed[0].archetype, mixed[1].archetype);
    assert!(validate_non_overlapping_chunks(&mixed, None));
}

// ============================================================================
// SHARED COLUMNS
// ============================================================================

#[test]
#[allow(clippy::cast_precision_loss)]
fn leased_views_mutate_in_place_across_threads() {
    let (types, pos, vel, _) = registry();
    let mut world = World::new(Arc::new(types));
    for e in 0..8 {
        world
            .spawn_with(
                Entity::new(e),
                vec![
                    (pos, Value::record(Position::default())),
                    (vel, Value::record(Velocity { dx: e as f32, dy: 0.0 })),
                ],
            )
            .unwrap();
    }
    let id = world.location(Entity::new(0)).unwrap().archetype;

    world.begin_iteration();
    let column = world.archetype_mut(id).unwrap().shared_column_mut(vel).unwrap();
    let views = vec![column.view(0, 4).unwrap(), column.view(4, 8).unwrap()];
    assert!(matches!(column.view(2, 6), Err(CoreError::LeaseConflict { .. })));

    let handles: Vec<_> = views
        .into_iter()
        .map(|mut view| {
            std::thread::spawn(move || {
                let rows: &mut [Velocity] = bytemuck::cast_slice_mut(view.bytes_mut());
                for v in rows.iter_mut().step_by(2) {
                    v.dy = 1.0;
                }
                for i in (0..view.len()).step_by(2) {
                    view.mark(i);
                }
                view.publish();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    world.end_iteration();

    let column = world.archetype_mut(id).unwrap().shared_column_mut(vel).unwrap();
    column.observe();
    assert_eq!(column.drain_writes(), vec![0, 2, 4, 6]);
    assert_eq!(
        world.get_record::<Velocity>(Entity::new(2), vel),
        Some(Velocity { dx: 2.0, dy: 1.0 })
    );
    assert_eq!(
        world.get_record::<Velocity>(Entity::new(3), vel),
        Some(Velocity { dx: 3.0, dy: 0.0 })
    );
}
