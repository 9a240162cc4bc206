//! # Shared-Memory Columns
//!
//! Record columns whose bytes can be handed to compute threads and mutated in
//! place, without copying.
//!
//! ## Safety Note
//!
//! The buffer is a slab of `UnsafeCell<u64>`. Aliasing is ruled out by
//! leases, not by the borrow checker:
//!
//! - a [`SharedColumnView`] owns a lease on `[start, end)`; leases on one
//!   buffer never overlap.
//! - leases are only created through `&mut SharedColumn`.
//! - while any lease is active the coordinator's `get`/`set`/`swap_remove`
//!   return `None`/`false`, and the buffer is never reallocated.
//!
//! ## Layout
//!
//! ```text
//!   SharedColumn ──Arc──► SharedBuffer [row0][row1][row2][row3]...
//!        │                     ▲  leases: [0,2) [2,4)
//!        │                     │
//!        └──Arc──► WriteMask   ├── SharedColumnView [0,2)  (worker A)
//!                     ▲        └── SharedColumnView [2,4)  (worker B)
//!                     └─────────── mark(row)
//! ```

#![allow(unsafe_code)]

use std::any::Any;
use std::cell::UnsafeCell;
use std::sync::Arc;

use parking_lot::Mutex;

use super::fence::MemoryFence;
use super::write_mask::WriteMask;
use crate::ecs::{Column, ColumnKind, Value, ValueRef};
use crate::error::{CoreError, CoreResult};

/// Initial row capacity of a shared column.
const MIN_CAPACITY: usize = 16;

// ============================================================================
// SHARED BUFFER
// ============================================================================

/// Fixed-capacity, 8-byte aligned byte buffer shared between threads.
#[derive(Debug)]
pub struct SharedBuffer {
    cells: Box<[UnsafeCell<u64>]>,
    stride: usize,
    capacity: usize,
    leases: Mutex<Vec<(usize, usize)>>,
    fence: MemoryFence,
}

// SAFETY: Row ranges are handed out through non-overlapping leases, and the
// coordinator stops touching the bytes while any lease is held.
unsafe impl Sync for SharedBuffer {}

impl SharedBuffer {
    /// Allocates a zeroed buffer of `capacity` rows of `stride` bytes.
    #[must_use]
    pub fn new(stride: usize, capacity: usize) -> Self {
        let words = (stride * capacity).div_ceil(8);
        Self {
            cells: (0..words).map(|_| UnsafeCell::new(0)).collect(),
            stride,
            capacity,
            leases: Mutex::new(Vec::new()),
            fence: MemoryFence::new(),
        }
    }

    /// Bytes per row.
    #[inline]
    #[must_use]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Rows the buffer can hold.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Visibility fence for this buffer.
    #[inline]
    #[must_use]
    pub fn fence(&self) -> &MemoryFence {
        &self.fence
    }

    /// Number of active leases.
    #[must_use]
    pub fn active_leases(&self) -> usize {
        self.leases.lock().len()
    }

    /// Checks whether any lease is active.
    #[must_use]
    pub fn is_leased(&self) -> bool {
        !self.leases.lock().is_empty()
    }

    fn lease(self: &Arc<Self>, start: usize, end: usize) -> CoreResult<Lease> {
        if start > end || end > self.capacity {
            return Err(CoreError::RangeOutOfBounds {
                start,
                end,
                len: self.capacity,
            });
        }
        let mut leases = self.leases.lock();
        if let Some(&(held_start, held_end)) = leases
            .iter()
            .find(|&&(s, e)| start < e && s < end)
        {
            return Err(CoreError::LeaseConflict {
                start,
                end,
                held_start,
                held_end,
            });
        }
        leases.push((start, end));
        Ok(Lease {
            buffer: Arc::clone(self),
            start,
            end,
        })
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.cells.as_ptr()).cast::<u8>()
    }

    /// # Safety
    ///
    /// Rows `[start, end)` must be in bounds and not written concurrently.
    unsafe fn bytes(&self, start: usize, end: usize) -> &[u8] {
        debug_assert!(start <= end && end <= self.capacity);
        std::slice::from_raw_parts(self.base().add(start * self.stride), (end - start) * self.stride)
    }

    /// # Safety
    ///
    /// Rows `[start, end)` must be in bounds and accessed by nobody else
    /// while the returned slice lives.
    #[allow(clippy::mut_from_ref)]
    unsafe fn bytes_mut(&self, start: usize, end: usize) -> &mut [u8] {
        debug_assert!(start <= end && end <= self.capacity);
        std::slice::from_raw_parts_mut(
            self.base().add(start * self.stride),
            (end - start) * self.stride,
        )
    }
}

/// Registration of one leased row range. Released on drop.
#[derive(Debug)]
struct Lease {
    buffer: Arc<SharedBuffer>,
    start: usize,
    end: usize,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut leases = self.buffer.leases.lock();
        if let Some(pos) = leases
            .iter()
            .position(|&r| r == (self.start, self.end))
        {
            leases.swap_remove(pos);
        }
    }
}

// ============================================================================
// SHARED COLUMN
// ============================================================================

/// Record column backed by a [`SharedBuffer`] with write tracking.
#[derive(Debug)]
pub struct SharedColumn {
    buffer: Arc<SharedBuffer>,
    mask: Arc<WriteMask>,
    len: usize,
}

impl SharedColumn {
    /// Creates an empty column of `stride` bytes per row.
    #[must_use]
    pub fn new(stride: usize) -> Self {
        Self::with_capacity(stride, MIN_CAPACITY)
    }

    /// Creates an empty column with room for `capacity` rows.
    #[must_use]
    pub fn with_capacity(stride: usize, capacity: usize) -> Self {
        Self {
            buffer: Arc::new(SharedBuffer::new(stride, capacity)),
            mask: Arc::new(WriteMask::with_capacity(capacity)),
            len: 0,
        }
    }

    /// Bytes per row.
    #[inline]
    #[must_use]
    pub fn stride(&self) -> usize {
        self.buffer.stride
    }

    /// Rows available before the next reallocation.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.capacity
    }

    /// The column's write-mask.
    #[inline]
    #[must_use]
    pub fn write_mask(&self) -> &WriteMask {
        &self.mask
    }

    /// Checks whether any row range is leased out.
    #[must_use]
    pub fn is_leased(&self) -> bool {
        self.buffer.is_leased()
    }

    /// Leases rows `[start, end)` for in-place mutation on another thread.
    ///
    /// # Errors
    ///
    /// [`CoreError::RangeOutOfBounds`] past the column length,
    /// [`CoreError::LeaseConflict`] if the range overlaps an active lease.
    pub fn view(&mut self, start: usize, end: usize) -> CoreResult<SharedColumnView> {
        if end > self.len {
            return Err(CoreError::RangeOutOfBounds {
                start,
                end,
                len: self.len,
            });
        }
        let lease = self.buffer.lease(start, end)?;
        Ok(SharedColumnView {
            lease,
            mask: Arc::clone(&self.mask),
        })
    }

    /// Coordinator side of the fence. Call before reading worker writes.
    pub fn observe(&self) -> u64 {
        self.buffer.fence.observe()
    }

    /// Drains the write-mask: rows written since the last drain, ascending.
    #[must_use]
    pub fn drain_writes(&self) -> Vec<usize> {
        self.mask.drain()
    }

    /// Bytes of rows `[start, end)`. `None` while leased or out of range.
    #[must_use]
    pub fn rows(&self, start: usize, end: usize) -> Option<&[u8]> {
        if start > end || end > self.len || self.is_leased() {
            return None;
        }
        // SAFETY: In bounds, and no lease is active. New leases need
        // `&mut self`, which cannot coexist with the returned borrow.
        Some(unsafe { self.buffer.bytes(start, end) })
    }

    fn grow(&mut self, min_rows: usize) {
        let capacity = (self.capacity() * 2).max(min_rows).max(MIN_CAPACITY);
        let next = SharedBuffer::new(self.stride(), capacity);
        // SAFETY: Only called with no active lease; `&mut self` excludes
        // coordinator borrows. `next` is not shared yet.
        unsafe {
            next.bytes_mut(0, self.len)
                .copy_from_slice(self.buffer.bytes(0, self.len));
        }
        self.mask = Arc::new(self.mask.grown(capacity));
        self.buffer = Arc::new(next);
        tracing::debug!("shared column grown to {} rows", capacity);
    }
}

impl Column for SharedColumn {
    fn len(&self) -> usize {
        self.len
    }

    fn kind(&self) -> ColumnKind {
        ColumnKind::Shared
    }

    fn accepts(&self, value: &Value) -> bool {
        matches!(value, Value::Record(bytes) if bytes.len() == self.stride())
    }

    fn can_grow(&self) -> bool {
        self.len < self.capacity() || !self.is_leased()
    }

    fn push(&mut self, value: Value) -> bool {
        if !self.can_grow() || !self.accepts(&value) {
            return false;
        }
        let Value::Record(bytes) = value else {
            return false;
        };
        if self.len == self.capacity() {
            self.grow(self.len + 1);
        }
        let row = self.len;
        // SAFETY: `row < capacity`. Leases end at or before `len`, so this
        // row is not visible to any worker.
        unsafe { self.buffer.bytes_mut(row, row + 1) }.copy_from_slice(&bytes);
        self.mask.unmark(row);
        self.len += 1;
        true
    }

    fn get(&self, row: usize) -> Option<ValueRef<'_>> {
        self.rows(row, row + 1).map(ValueRef::Record)
    }

    fn set(&mut self, row: usize, value: Value) -> bool {
        if row >= self.len || self.is_leased() || !self.accepts(&value) {
            return false;
        }
        let Value::Record(bytes) = value else {
            return false;
        };
        // SAFETY: In bounds, unleased, and `&mut self` is exclusive.
        unsafe { self.buffer.bytes_mut(row, row + 1) }.copy_from_slice(&bytes);
        true
    }

    fn swap_remove(&mut self, row: usize) -> Option<Value> {
        if row >= self.len || self.is_leased() {
            return None;
        }
        let last = self.len - 1;
        // SAFETY: In bounds, unleased, and `&mut self` is exclusive.
        let removed = unsafe {
            let removed = self.buffer.bytes(row, row + 1).to_vec();
            if row != last {
                let moved = self.buffer.bytes(last, last + 1).to_vec();
                self.buffer.bytes_mut(row, row + 1).copy_from_slice(&moved);
            }
            removed
        };
        if row == last {
            self.mask.unmark(row);
        } else {
            self.mask.move_row(last, row);
        }
        self.len -= 1;
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
// VIEW
// ============================================================================

/// Exclusive window over leased rows of a [`SharedColumn`].
///
/// Sent to a worker thread inside a chunk payload. Dropping the view releases
/// the lease.
#[derive(Debug)]
pub struct SharedColumnView {
    lease: Lease,
    mask: Arc<WriteMask>,
}

impl SharedColumnView {
    /// First leased row (column-relative).
    #[inline]
    #[must_use]
    pub fn start(&self) -> usize {
        self.lease.start
    }

    /// One past the last leased row (column-relative).
    #[inline]
    #[must_use]
    pub fn end(&self) -> usize {
        self.lease.end
    }

    /// Number of leased rows.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.lease.end - self.lease.start
    }

    /// Checks if the window is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes per row.
    #[inline]
    #[must_use]
    pub fn stride(&self) -> usize {
        self.lease.buffer.stride
    }

    /// Leased bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: The lease grants this view sole access to its rows.
        unsafe { self.lease.buffer.bytes(self.lease.start, self.lease.end) }
    }

    /// Leased bytes, mutable.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: The lease grants this view sole access to its rows, and
        // `&mut self` makes the returned slice unique.
        unsafe { self.lease.buffer.bytes_mut(self.lease.start, self.lease.end) }
    }

    /// Marks a view-relative row as written.
    #[inline]
    pub fn mark(&self, local_row: usize) -> bool {
        local_row < self.len() && self.mask.mark(self.lease.start + local_row)
    }

    /// Marks every leased row as written.
    pub fn mark_all(&self) {
        self.mask.mark_range(self.lease.start, self.lease.end);
    }

    /// Worker side of the fence. Call after the last write.
    pub fn publish(&self) -> u64 {
        self.lease.buffer.fence.publish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column_of(values: &[u32]) -> SharedColumn {
        let mut col = SharedColumn::with_capacity(4, 2);
        for &v in values {
            assert!(col.push(Value::record(v)));
        }
        col
    }

    fn read(col: &SharedColumn, row: usize) -> Option<u32> {
        col.get(row).and_then(ValueRef::read::<u32>)
    }

    #[test]
    fn test_push_grows_and_keeps_rows() {
        let col = column_of(&[1, 2, 3, 4, 5]);
        assert!(col.capacity() >= 5);
        assert_eq!((0..5).map(|r| read(&col, r)).collect::<Vec<_>>(),
            vec![Some(1), Some(2), Some(3), Some(4), Some(5)]);
    }

    #[test]
    fn test_overlapping_leases_conflict() {
        let mut col = column_of(&[0; 8]);
        let a = col.view(0, 5).unwrap();
        assert!(matches!(
            col.view(3, 8),
            Err(CoreError::LeaseConflict { held_start: 0, held_end: 5, .. })
        ));
        let b = col.view(5, 8).unwrap();
        assert_eq!(col.buffer.active_leases(), 2);
        drop(a);
        drop(b);
        assert!(!col.is_leased());
        assert!(col.view(3, 8).is_ok());
    }

    #[test]
    fn test_view_out_of_range() {
        let mut col = column_of(&[0; 3]);
        assert!(matches!(col.view(2, 4), Err(CoreError::RangeOutOfBounds { .. })));
    }

    #[test]
    fn test_coordinator_blocked_while_leased() {
        let mut col = column_of(&[7, 8]);
        let view = col.view(0, 1).unwrap();
        assert!(read(&col, 1).is_none());
        assert!(!col.set(1, Value::record(9u32)));
        assert!(col.swap_remove(1).is_none());
        drop(view);
        assert_eq!(read(&col, 1), Some(8));
    }

    #[test]
    fn test_worker_writes_visible_after_fence() {
        let mut col = column_of(&[1, 2, 3, 4]);
        let mut view = col.view(1, 3).unwrap();
        let handle = std::thread::spawn(move || {
            let rows: &mut [u32] = bytemuck::cast_slice_mut(view.bytes_mut());
            rows[1] = 30;
            view.mark(1);
            view.publish();
        });
        handle.join().unwrap();

        assert!(col.observe() >= 1);
        assert_eq!(read(&col, 2), Some(30));
        assert_eq!(col.drain_writes(), vec![2]);
    }

    #[test]
    fn test_swap_remove_moves_mask_bit() {
        let mut col = column_of(&[10, 20, 30]);
        col.write_mask().mark(2);
        assert_eq!(col.swap_remove(0).and_then(|v| v.read::<u32>()), Some(10));
        assert_eq!(read(&col, 0), Some(30));
        assert_eq!(col.drain_writes(), vec![0]);
    }

    #[test]
    fn test_push_while_leased_without_room_fails() {
        let mut col = SharedColumn::with_capacity(4, 2);
        col.push(Value::record(1u32));
        col.push(Value::record(2u32));
        let _view = col.view(0, 2).unwrap();
        assert!(!col.can_grow());
        assert!(!col.push(Value::record(3u32)));
    }
}
