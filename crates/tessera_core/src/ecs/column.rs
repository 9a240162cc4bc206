//! # Columns
//!
//! Every component type an archetype stores gets one column. All columns
//! share the [`Column`] contract so the archetype can push, read, write and
//! swap-remove rows without knowing the element type.
//!
//! ```text
//! RecordColumn   [r0 bytes][r1 bytes][r2 bytes]...   stride = size_of::<T>()
//! BoxedColumn    [Box<T>]  [Box<T>]  [Box<T>]  ...
//! SharedColumn   (see sync::shared) same layout as RecordColumn, leasable
//! ```

use std::any::{Any, TypeId};

use super::component::{ColumnLayout, ColumnStorage, ComponentInfo, Value, ValueRef};
use crate::sync::SharedColumn;

/// Concrete kind of a column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnKind {
    /// Owned record buffer.
    Record,
    /// Boxed values.
    Boxed,
    /// Shared record buffer with a write-mask.
    Shared,
}

/// Type-erased column contract.
///
/// Misuse (wrong value kind, row out of range) returns `false` / `None`.
pub trait Column: Send + Sync {
    /// Number of rows.
    fn len(&self) -> usize;

    /// Checks if the column has no rows.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Concrete kind.
    fn kind(&self) -> ColumnKind;

    /// Checks whether `value` can be stored in this column.
    fn accepts(&self, value: &Value) -> bool;

    /// Checks whether a row can be appended right now.
    fn can_grow(&self) -> bool {
        true
    }

    /// Appends a row.
    fn push(&mut self, value: Value) -> bool;

    /// Borrows a row.
    fn get(&self, row: usize) -> Option<ValueRef<'_>>;

    /// Overwrites a row.
    fn set(&mut self, row: usize, value: Value) -> bool;

    /// Moves the last row into `row`, truncates, and returns the removed value.
    fn swap_remove(&mut self, row: usize) -> Option<Value>;

    /// Upcast for downcasting to the concrete column.
    fn as_any(&self) -> &dyn Any;

    /// Mutable upcast for downcasting to the concrete column.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Builds an empty column for a registered component.
#[must_use]
pub fn column_for(info: &ComponentInfo) -> Box<dyn Column> {
    match (info.layout, info.storage) {
        (ColumnLayout::Record { size, .. }, ColumnStorage::Plain) => {
            Box::new(RecordColumn::new(size))
        }
        (ColumnLayout::Record { size, .. }, ColumnStorage::Shared) => {
            Box::new(SharedColumn::new(size))
        }
        (ColumnLayout::Boxed, _) => Box::new(BoxedColumn::new(info.rust_type())),
    }
}

// ============================================================================
// RECORD COLUMN
// ============================================================================

/// Fixed-stride byte buffer, 8-byte aligned.
#[derive(Clone, Debug)]
pub struct RecordColumn {
    stride: usize,
    words: Vec<u64>,
    len: usize,
}

impl RecordColumn {
    /// Creates an empty column of `stride` bytes per row.
    #[must_use]
    pub fn new(stride: usize) -> Self {
        Self {
            stride,
            words: Vec::new(),
            len: 0,
        }
    }

    /// Bytes per row.
    #[inline]
    #[must_use]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// All row bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.len * self.stride]
    }

    /// All row bytes, mutable.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let end = self.len * self.stride;
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..end]
    }

    /// Bytes of rows `[start, end)`.
    #[must_use]
    pub fn rows(&self, start: usize, end: usize) -> Option<&[u8]> {
        if start > end || end > self.len {
            return None;
        }
        let s = self.stride;
        self.as_bytes().get(start * s..end * s)
    }

    /// Mutable bytes of rows `[start, end)`.
    pub fn rows_mut(&mut self, start: usize, end: usize) -> Option<&mut [u8]> {
        if start > end || end > self.len {
            return None;
        }
        let s = self.stride;
        self.as_bytes_mut().get_mut(start * s..end * s)
    }

    /// Bytes of one row.
    #[inline]
    #[must_use]
    pub fn row(&self, row: usize) -> Option<&[u8]> {
        self.rows(row, row + 1)
    }

    fn reserve_rows(&mut self, rows: usize) {
        let words = (rows * self.stride).div_ceil(8);
        if words > self.words.len() {
            self.words.resize(words, 0);
        }
    }
}

impl Column for RecordColumn {
    fn len(&self) -> usize {
        self.len
    }

    fn kind(&self) -> ColumnKind {
        ColumnKind::Record
    }

    fn accepts(&self, value: &Value) -> bool {
        matches!(value, Value::Record(bytes) if bytes.len() == self.stride)
    }

    fn push(&mut self, value: Value) -> bool {
        let Value::Record(bytes) = value else {
            return false;
        };
        if bytes.len() != self.stride {
            return false;
        }
        self.reserve_rows(self.len + 1);
        self.len += 1;
        let row = self.len - 1;
        if let Some(dst) = self.rows_mut(row, row + 1) {
            dst.copy_from_slice(&bytes);
        }
        true
    }

    fn get(&self, row: usize) -> Option<ValueRef<'_>> {
        self.row(row).map(ValueRef::Record)
    }

    fn set(&mut self, row: usize, value: Value) -> bool {
        let stride = self.stride;
        match (value, self.rows_mut(row, row + 1)) {
            (Value::Record(bytes), Some(dst)) if bytes.len() == stride => {
                dst.copy_from_slice(&bytes);
                true
            }
            _ => false,
        }
    }

    fn swap_remove(&mut self, row: usize) -> Option<Value> {
        let removed = self.row(row)?.to_vec();
        let last = self.len - 1;
        let s = self.stride;
        if row != last {
            self.as_bytes_mut()
                .copy_within(last * s..(last + 1) * s, row * s);
        }
        self.len -= 1;
        self.words.truncate((self.len * s).div_ceil(8));
        Some(Value::Record(removed))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ============================================================================
// BOXED COLUMN
// ============================================================================

/// One boxed value per row. Values never leave the coordinating thread.
pub struct BoxedColumn {
    type_id: TypeId,
    values: Vec<Box<dyn Any + Send + Sync>>,
}

impl BoxedColumn {
    /// Creates an empty column holding values of the Rust type `type_id`.
    #[must_use]
    pub fn new(type_id: TypeId) -> Self {
        Self {
            type_id,
            values: Vec::new(),
        }
    }

    /// Borrows a row as `T`.
    #[must_use]
    pub fn get_as<T: Any>(&self, row: usize) -> Option<&T> {
        self.values.get(row)?.downcast_ref::<T>()
    }

    /// Mutably borrows a row as `T`.
    pub fn get_as_mut<T: Any>(&mut self, row: usize) -> Option<&mut T> {
        self.values.get_mut(row)?.downcast_mut::<T>()
    }

    fn matches(&self, value: &Value) -> bool {
        matches!(value, Value::Boxed(b) if (**b).type_id() == self.type_id)
    }
}

impl Column for BoxedColumn {
    fn len(&self) -> usize {
        self.values.len()
    }

    fn kind(&self) -> ColumnKind {
        ColumnKind::Boxed
    }

    fn accepts(&self, value: &Value) -> bool {
        self.matches(value)
    }

    fn push(&mut self, value: Value) -> bool {
        if !self.matches(&value) {
            return false;
        }
        let Value::Boxed(b) = value else {
            return false;
        };
        self.values.push(b);
        true
    }

    fn get(&self, row: usize) -> Option<ValueRef<'_>> {
        self.values.get(row).map(|b| ValueRef::Boxed(b.as_ref()))
    }

    fn set(&mut self, row: usize, value: Value) -> bool {
        if !self.matches(&value) || row >= self.values.len() {
            return false;
        }
        let Value::Boxed(b) = value else {
            return false;
        };
        self.values[row] = b;
        true
    }

    fn swap_remove(&mut self, row: usize) -> Option<Value> {
        if row >= self.values.len() {
            return None;
        }
        Some(Value::Boxed(self.values.swap_remove(row)))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_push_get_set() {
        let mut col = RecordColumn::new(4);
        assert!(col.push(Value::record(1u32)));
        assert!(col.push(Value::record(2u32)));
        assert!(!col.push(Value::record(3u64)));
        assert!(!col.push(Value::boxed(3u32)));

        assert_eq!(col.len(), 2);
        assert_eq!(col.get(1).and_then(ValueRef::read::<u32>), Some(2));
        assert!(col.set(0, Value::record(9u32)));
        assert_eq!(col.get(0).and_then(ValueRef::read::<u32>), Some(9));
        assert!(!col.set(5, Value::record(9u32)));
    }

    #[test]
    fn test_record_swap_remove_moves_last() {
        let mut col = RecordColumn::new(2);
        for v in [10u16, 20, 30] {
            col.push(Value::record(v));
        }
        let removed = col.swap_remove(0).and_then(|v| v.read::<u16>());
        assert_eq!(removed, Some(10));
        assert_eq!(col.len(), 2);
        assert_eq!(col.get(0).and_then(ValueRef::read::<u16>), Some(30));
        assert_eq!(col.get(1).and_then(ValueRef::read::<u16>), Some(20));

        // Removing the last row just truncates.
        assert_eq!(col.swap_remove(1).and_then(|v| v.read::<u16>()), Some(20));
        assert_eq!(col.len(), 1);
        assert!(col.swap_remove(1).is_none());
    }

    #[test]
    fn test_record_odd_stride_rows() {
        let mut col = RecordColumn::new(3);
        for v in 0u8..5 {
            col.push(Value::Record(vec![v, v, v]));
        }
        assert_eq!(col.rows(1, 3), Some(&[1, 1, 1, 2, 2, 2][..]));
        assert!(col.rows(4, 6).is_none());
    }

    #[test]
    fn test_boxed_type_checked() {
        let mut col = BoxedColumn::new(TypeId::of::<String>());
        assert!(col.push(Value::boxed(String::from("a"))));
        assert!(!col.push(Value::boxed(5u32)));
        assert!(col.set(0, Value::boxed(String::from("b"))));
        assert_eq!(col.get_as::<String>(0).map(String::as_str), Some("b"));
        assert_eq!(
            col.get(0).and_then(|v| v.downcast_ref::<String>()).map(String::as_str),
            Some("b")
        );
        assert!(col.swap_remove(0).is_some());
        assert!(col.is_empty());
    }
}
