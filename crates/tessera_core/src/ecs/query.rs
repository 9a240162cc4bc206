//! # Chunked Queries
//!
//! A query selects archetypes by `required` / `forbidden` component sets and
//! slices each match into contiguous row ranges, the unit of parallel
//! dispatch.
//!
//! ```text
//! size = 10, target = 4
//!   [0, 4)  [4, 8)  [8, 10)
//! ```
//!
//! Chunks never span archetypes. Row numbers are archetype-local.
//!
//! ## Columns
//!
//! The query's column list fixes the index order a kernel sees: required
//! columns first, in the order given, then optional ones. A chunk exposes
//! every required column plus the leading optional columns its archetype
//! stores; that count is the chunk's `column_count`.

use super::archetype::{Archetype, ArchetypeId};
use super::column::{Column, RecordColumn};
use super::component::ComponentTypeId;
use super::entity::Entity;
use super::index::ArchetypeIndex;
use super::signature::Signature;
use crate::sync::SharedColumn;

/// Plain description of one chunk, enough to check for overlap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChunkDescriptor {
    /// Owning archetype.
    pub archetype: ArchetypeId,
    /// First row.
    pub start_row: usize,
    /// One past the last row.
    pub end_row: usize,
    /// Number of query columns the chunk exposes.
    pub column_count: usize,
}

impl ChunkDescriptor {
    /// Number of rows.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.end_row.saturating_sub(self.start_row)
    }

    /// Checks if the chunk covers no row.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks whether column index `column` is exposed by this chunk.
    #[inline]
    #[must_use]
    pub fn exposes(&self, column: usize) -> bool {
        column < self.column_count
    }

    /// Same archetype and intersecting row ranges.
    #[inline]
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.archetype == other.archetype
            && self.start_row < other.end_row
            && other.start_row < self.end_row
    }
}

/// Splits `size` rows into `[start, end)` ranges of at most `target` rows.
///
/// A `target` of 0 is treated as 1. The last range may be short.
pub fn chunk_ranges(size: usize, target: usize) -> impl Iterator<Item = (usize, usize)> {
    let step = target.max(1);
    (0..size)
        .step_by(step)
        .map(move |start| (start, (start + step).min(size)))
}

/// Query over an [`ArchetypeIndex`] that yields row-range chunks.
#[derive(Clone, Debug)]
pub struct ChunkedQuery {
    required: Signature,
    forbidden: Signature,
    columns: Vec<ComponentTypeId>,
    required_count: usize,
    target_chunk_size: usize,
}

impl ChunkedQuery {
    /// Query requiring `columns`, in that kernel-visible order.
    #[must_use]
    pub fn new(columns: &[ComponentTypeId], target_chunk_size: usize) -> Self {
        Self {
            required: Signature::from_ids(columns.iter().copied()),
            forbidden: Signature::new(),
            columns: columns.to_vec(),
            required_count: columns.len(),
            target_chunk_size,
        }
    }

    /// Query from raw bitsets. Columns are the required ids, ascending.
    #[must_use]
    pub fn from_signatures(required: Signature, forbidden: Signature, target_chunk_size: usize) -> Self {
        let columns: Vec<ComponentTypeId> = required.iter().collect();
        Self {
            required_count: columns.len(),
            columns,
            required,
            forbidden,
            target_chunk_size,
        }
    }

    /// Excludes archetypes that store any of `ids`.
    #[must_use]
    pub fn without(mut self, ids: &[ComponentTypeId]) -> Self {
        for &id in ids {
            self.forbidden.insert(id);
        }
        self
    }

    /// Appends optional columns after the required ones.
    #[must_use]
    pub fn optional(mut self, ids: &[ComponentTypeId]) -> Self {
        self.columns.extend(ids.iter().copied().filter(|id| !self.required.contains(*id)));
        self
    }

    /// Required set.
    #[must_use]
    pub fn required(&self) -> &Signature {
        &self.required
    }

    /// Forbidden set.
    #[must_use]
    pub fn forbidden(&self) -> &Signature {
        &self.forbidden
    }

    /// Kernel-visible column order.
    #[must_use]
    pub fn columns(&self) -> &[ComponentTypeId] {
        &self.columns
    }

    /// Target rows per chunk.
    #[must_use]
    pub fn target_chunk_size(&self) -> usize {
        self.target_chunk_size
    }

    fn exposed_count(&self, archetype: &Archetype) -> usize {
        let optional = self.columns[self.required_count..]
            .iter()
            .take_while(|&&id| archetype.signature().contains(id))
            .count();
        self.required_count + optional
    }

    /// Lazily yields chunks for every matching archetype, ascending rows.
    pub fn chunks<'a>(&'a self, index: &'a ArchetypeIndex) -> impl Iterator<Item = ChunkView<'a>> + 'a {
        index
            .matching(&self.required, &self.forbidden)
            .flat_map(move |archetype| {
                let columns = &self.columns[..self.exposed_count(archetype)];
                chunk_ranges(archetype.size(), self.target_chunk_size).map(move |(start, end)| {
                    ChunkView {
                        archetype,
                        start_row: start,
                        end_row: end,
                        columns,
                    }
                })
            })
    }

    /// Descriptors of every chunk, in iteration order.
    #[must_use]
    pub fn descriptors(&self, index: &ArchetypeIndex) -> Vec<ChunkDescriptor> {
        self.chunks(index).map(|c| c.descriptor()).collect()
    }
}

/// Non-owning window over rows `[start_row, end_row)` of one archetype.
#[derive(Clone, Copy, Debug)]
pub struct ChunkView<'a> {
    archetype: &'a Archetype,
    start_row: usize,
    end_row: usize,
    columns: &'a [ComponentTypeId],
}

impl<'a> ChunkView<'a> {
    /// Owning archetype.
    #[must_use]
    pub fn archetype(&self) -> &'a Archetype {
        self.archetype
    }

    /// First row.
    #[inline]
    #[must_use]
    pub fn start_row(&self) -> usize {
        self.start_row
    }

    /// One past the last row.
    #[inline]
    #[must_use]
    pub fn end_row(&self) -> usize {
        self.end_row
    }

    /// Number of rows.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.end_row - self.start_row
    }

    /// Checks if the chunk has no rows.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entities of the chunk's rows.
    #[must_use]
    pub fn entities(&self) -> &'a [Entity] {
        &self.archetype.entities()[self.start_row..self.end_row]
    }

    /// Exposed component types, in kernel order.
    #[must_use]
    pub fn column_types(&self) -> &'a [ComponentTypeId] {
        self.columns
    }

    /// Column `i` in kernel order.
    #[must_use]
    pub fn column(&self, i: usize) -> Option<&'a dyn Column> {
        self.archetype.column(*self.columns.get(i)?)
    }

    /// Bytes of the chunk's rows in record column `i`.
    ///
    /// `None` for boxed columns, and for shared columns while leased.
    #[must_use]
    pub fn record_bytes(&self, i: usize) -> Option<&'a [u8]> {
        let column = self.column(i)?;
        let any = column.as_any();
        if let Some(shared) = any.downcast_ref::<SharedColumn>() {
            return shared.rows(self.start_row, self.end_row);
        }
        any.downcast_ref::<RecordColumn>()?
            .rows(self.start_row, self.end_row)
    }

    /// Plain descriptor of this chunk.
    #[must_use]
    pub fn descriptor(&self) -> ChunkDescriptor {
        ChunkDescriptor {
            archetype: self.archetype.id(),
            start_row: self.start_row,
            end_row: self.end_row,
            column_count: self.columns.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::{ColumnStorage, ComponentTypes, Value};

    #[test]
    fn test_chunk_ranges_ten_by_four() {
        let ranges: Vec<_> = chunk_ranges(10, 4).collect();
        assert_eq!(ranges, vec![(0, 4), (4, 8), (8, 10)]);
    }

    #[test]
    fn test_chunk_ranges_small_and_zero() {
        assert_eq!(chunk_ranges(3, 8).collect::<Vec<_>>(), vec![(0, 3)]);
        assert_eq!(chunk_ranges(0, 8).count(), 0);
        assert_eq!(chunk_ranges(3, 0).collect::<Vec<_>>(), vec![(0, 1), (1, 2), (2, 3)]);
    }

    #[test]
    fn test_chunk_coverage_exhaustive() {
        for size in 0..40 {
            for target in 1..12 {
                let mut next = 0;
                for (start, end) in chunk_ranges(size, target) {
                    assert_eq!(start, next, "gap or overlap at size={size} target={target}");
                    assert!(end > start && end - start <= target);
                    next = end;
                }
                assert_eq!(next, size);
                assert_eq!(chunk_ranges(size, target).count(), size.div_ceil(target));
            }
        }
    }

    #[test]
    fn test_descriptor_overlap() {
        let a = ChunkDescriptor {
            archetype: ArchetypeId::new(0),
            start_row: 0,
            end_row: 5,
            column_count: 1,
        };
        let b = ChunkDescriptor {
            start_row: 3,
            end_row: 8,
            ..a
        };
        let c = ChunkDescriptor {
            archetype: ArchetypeId::new(1),
            ..b
        };
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(!a.overlaps(&ChunkDescriptor { start_row: 5, ..b }));
    }

    #[test]
    fn test_chunks_per_archetype_and_optional_columns() {
        let mut types = ComponentTypes::new();
        let a = types.register_record::<u32>("A", ColumnStorage::Plain).unwrap();
        let b = types.register_record::<u64>("B", ColumnStorage::Plain).unwrap();
        let c = types.register_record::<u16>("C", ColumnStorage::Plain).unwrap();
        let mut index = ArchetypeIndex::new();
        let narrow = index.get_or_create(&Signature::from_ids([a]), &types).unwrap();
        let wide = index.get_or_create(&Signature::from_ids([a, b]), &types).unwrap();
        let excluded = index.get_or_create(&Signature::from_ids([a, c]), &types).unwrap();
        for (id, count) in [(narrow, 5u64), (wide, 3), (excluded, 2)] {
            let arch = index.get_mut(id).unwrap();
            for e in 0..count {
                arch.push(Entity::new(e), |ty| types.default_value(ty).unwrap()).unwrap();
            }
        }

        let query = ChunkedQuery::new(&[a], 2).without(&[c]).optional(&[b]);
        let chunks = query.descriptors(&index);
        let shape: Vec<_> = chunks
            .iter()
            .map(|d| (d.archetype, d.start_row, d.end_row, d.column_count))
            .collect();
        assert_eq!(
            shape,
            vec![
                (narrow, 0, 2, 1),
                (narrow, 2, 4, 1),
                (narrow, 4, 5, 1),
                (wide, 0, 2, 2),
                (wide, 2, 3, 2),
            ]
        );
    }

    #[test]
    fn test_chunk_view_slices() {
        let mut types = ComponentTypes::new();
        let a = types.register_record::<u32>("A", ColumnStorage::Shared).unwrap();
        let mut index = ArchetypeIndex::new();
        let id = index.get_or_create(&Signature::from_ids([a]), &types).unwrap();
        for e in 0..6u32 {
            index
                .get_mut(id)
                .unwrap()
                .push(Entity::new(u64::from(e)), |_| Value::record(e * 10))
                .unwrap();
        }

        let query = ChunkedQuery::new(&[a], 4);
        let chunk = query.chunks(&index).nth(1).unwrap();
        assert_eq!(chunk.entities(), &[Entity::new(4), Entity::new(5)]);
        let values: &[u32] = bytemuck::cast_slice(chunk.record_bytes(0).unwrap());
        assert_eq!(values, &[40, 50]);
        assert!(chunk.record_bytes(1).is_none());
    }
}
