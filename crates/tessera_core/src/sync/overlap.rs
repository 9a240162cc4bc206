//! # Chunk Overlap Validation
//!
//! Guard run before a batch of chunks is handed to threads for in-place
//! mutation. Rows are never locked individually, so two chunks that alias
//! the same `(archetype, row)` must be rejected up front.
//!
//! Chunks of different archetypes address disjoint columns and never
//! conflict, even with identical row numbers. Aliasing of one backing buffer
//! by two archetypes is not modelled.

use std::collections::HashMap;

use crate::ecs::{ArchetypeId, ChunkDescriptor};

/// Finds chunks that alias rows of one archetype.
///
/// Each offending chunk is paired with the earlier chunk (by start row) that
/// reaches furthest. With `write_columns`, only archetypes exposing at least
/// one of those column indices are checked; every chunk of such an archetype
/// takes part, whatever its own width.
#[must_use]
pub fn find_overlaps(
    chunks: &[ChunkDescriptor],
    write_columns: Option<&[usize]>,
) -> Vec<(ChunkDescriptor, ChunkDescriptor)> {
    let mut groups: HashMap<ArchetypeId, Vec<&ChunkDescriptor>> = HashMap::new();
    for chunk in chunks {
        groups.entry(chunk.archetype).or_default().push(chunk);
    }
    if let Some(cols) = write_columns {
        groups.retain(|_, group| {
            group
                .iter()
                .any(|chunk| cols.iter().any(|&c| chunk.exposes(c)))
        });
    }

    let mut conflicts = Vec::new();
    for group in groups.values_mut() {
        group.sort_by_key(|c| (c.start_row, c.end_row));
        let Some((&first, rest)) = group.split_first() else {
            continue;
        };
        let mut reach = first;
        for &chunk in rest {
            if chunk.start_row < reach.end_row {
                conflicts.push((*reach, *chunk));
            }
            if chunk.end_row > reach.end_row {
                reach = chunk;
            }
        }
    }
    conflicts.sort_by_key(|(a, b)| (a.archetype, a.start_row, b.start_row));
    conflicts
}

/// Checks that no two chunks alias rows of one archetype.
///
/// The caller must not dispatch the batch in parallel on `false`. Each
/// offending pair is logged.
#[must_use]
pub fn validate_non_overlapping_chunks(
    chunks: &[ChunkDescriptor],
    write_columns: Option<&[usize]>,
) -> bool {
    let conflicts = find_overlaps(chunks, write_columns);
    for (a, b) in &conflicts {
        tracing::warn!(
            "overlapping chunks in {}: [{}, {}) and [{}, {})",
            a.archetype,
            a.start_row,
            a.end_row,
            b.start_row,
            b.end_row
        );
    }
    conflicts.is_empty()
}
