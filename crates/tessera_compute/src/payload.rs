//! # Chunk Payloads
//!
//! What travels to a worker for one chunk, and what comes back.
//!
//! ```text
//! coordinator                         worker
//!   ChunkPayload ────────────────────► KernelColumns ─► kernel(...)
//!     Shared(view)   leased rows, in place   │
//!     Copied(bytes)  owned copy              ▼
//!   ChunkResult  ◄──────────────────── publish fences, drop views,
//!     written, copied columns                hand copies back
//! ```
//!
//! Shared views are published and dropped on the worker before the reply is
//! sent, so by the time the coordinator sees a result its leases are gone.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytemuck::Pod;
use tessera_core::SharedColumnView;

use crate::kernel::{KernelFn, KernelParams};

// ============================================================================
// COPIED COLUMN
// ============================================================================

/// Owned copy of a chunk's rows from a plain record column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopiedColumn {
    stride: usize,
    rows: usize,
    words: Vec<u64>,
    marked: Vec<usize>,
}

impl CopiedColumn {
    /// Copies `bytes`, a whole number of `stride`-byte rows.
    #[must_use]
    pub fn from_bytes(stride: usize, bytes: &[u8]) -> Self {
        let mut words = vec![0u64; bytes.len().div_ceil(8)];
        bytemuck::cast_slice_mut::<u64, u8>(&mut words)[..bytes.len()].copy_from_slice(bytes);
        Self {
            stride,
            rows: bytes.len().checked_div(stride).unwrap_or(0),
            words,
            marked: Vec::new(),
        }
    }

    /// Bytes per row.
    #[inline]
    #[must_use]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Number of rows.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows
    }

    /// Checks if there are no rows.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Row bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.rows * self.stride]
    }

    /// Row bytes, mutable.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let end = self.rows * self.stride;
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..end]
    }

    /// Marks a chunk-relative row as written.
    pub fn mark(&mut self, row: usize) -> bool {
        if row >= self.rows {
            return false;
        }
        self.marked.push(row);
        true
    }

    /// Chunk-relative rows marked as written, ascending.
    #[must_use]
    pub fn marked(&self) -> &[usize] {
        &self.marked
    }

    fn finish(&mut self) {
        self.marked.sort_unstable();
        self.marked.dedup();
    }
}

// ============================================================================
// PAYLOAD
// ============================================================================

/// One column of a chunk payload.
#[derive(Debug)]
pub enum PayloadColumn {
    /// Leased rows of a shared column, mutated in place.
    Shared(SharedColumnView),
    /// Copy of a plain column's rows, written back by the coordinator.
    Copied(CopiedColumn),
}

impl PayloadColumn {
    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Shared(view) => view.len(),
            Self::Copied(column) => column.len(),
        }
    }

    /// Checks if there are no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Shared(view) => view.bytes(),
            Self::Copied(column) => column.bytes(),
        }
    }

    /// Row bytes, mutable.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Self::Shared(view) => view.bytes_mut(),
            Self::Copied(column) => column.bytes_mut(),
        }
    }

    /// Marks a chunk-relative row as written.
    pub fn mark(&mut self, row: usize) -> bool {
        match self {
            Self::Shared(view) => view.mark(row),
            Self::Copied(column) => column.mark(row),
        }
    }
}

/// Everything a worker needs for one chunk.
#[derive(Debug)]
pub struct ChunkPayload {
    kernel_id: Arc<str>,
    columns: Vec<PayloadColumn>,
    length: usize,
    params: Arc<KernelParams>,
}

impl ChunkPayload {
    /// Creates a payload.
    ///
    /// # Arguments
    ///
    /// * `kernel_id` - Registered kernel to run
    /// * `columns` - Chunk columns in kernel order
    /// * `length` - Rows in the chunk
    /// * `params` - Parameters shared by the whole dispatch
    #[must_use]
    pub fn new(
        kernel_id: impl Into<Arc<str>>,
        columns: Vec<PayloadColumn>,
        length: usize,
        params: Arc<KernelParams>,
    ) -> Self {
        Self {
            kernel_id: kernel_id.into(),
            columns,
            length,
            params,
        }
    }

    /// Kernel id.
    #[must_use]
    pub fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    /// Shared handle to the kernel id.
    #[must_use]
    pub fn kernel_handle(&self) -> Arc<str> {
        Arc::clone(&self.kernel_id)
    }

    /// Rows in the chunk.
    #[must_use]
    pub fn length(&self) -> usize {
        self.length
    }

    /// Columns in kernel order.
    #[must_use]
    pub fn columns(&self) -> &[PayloadColumn] {
        &self.columns
    }
}

/// Result of one chunk.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChunkResult {
    /// Column indices the kernel reports as written.
    pub written: Vec<usize>,
    /// Copied columns handed back, `None` at shared positions.
    pub copied: Vec<Option<CopiedColumn>>,
}

impl ChunkResult {
    /// Copied column `index`, if that position was copied.
    #[must_use]
    pub fn copied(&self, index: usize) -> Option<&CopiedColumn> {
        self.copied.get(index)?.as_ref()
    }
}

// ============================================================================
// KERNEL VIEW
// ============================================================================

/// Kernel-facing access to a chunk's columns.
#[derive(Debug)]
pub struct KernelColumns<'a> {
    columns: &'a mut [PayloadColumn],
}

impl<'a> KernelColumns<'a> {
    /// Wraps payload columns.
    pub fn new(columns: &'a mut [PayloadColumn]) -> Self {
        Self { columns }
    }

    /// Number of columns.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Checks if there are no columns.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Bytes of column `index`.
    #[must_use]
    pub fn bytes(&self, index: usize) -> Option<&[u8]> {
        self.columns.get(index).map(PayloadColumn::bytes)
    }

    /// Bytes of column `index`, mutable.
    pub fn bytes_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        self.columns.get_mut(index).map(PayloadColumn::bytes_mut)
    }

    /// Column `index` as typed rows. `None` if the row layout does not fit `T`.
    #[must_use]
    pub fn slice<T: Pod>(&self, index: usize) -> Option<&[T]> {
        bytemuck::try_cast_slice(self.bytes(index)?).ok()
    }

    /// Column `index` as typed rows, mutable.
    pub fn slice_mut<T: Pod>(&mut self, index: usize) -> Option<&mut [T]> {
        bytemuck::try_cast_slice_mut(self.bytes_mut(index)?).ok()
    }

    /// Marks `row` of column `index` as written.
    pub fn mark(&mut self, index: usize, row: usize) -> bool {
        self.columns
            .get_mut(index)
            .is_some_and(|column| column.mark(row))
    }

    /// Marks every row of column `index` as written.
    pub fn mark_all(&mut self, index: usize) {
        let Some(column) = self.columns.get_mut(index) else {
            return;
        };
        match column {
            PayloadColumn::Shared(view) => view.mark_all(),
            PayloadColumn::Copied(copied) => {
                for row in 0..copied.len() {
                    copied.mark(row);
                }
            }
        }
    }
}

// ============================================================================
// EXECUTION
// ============================================================================

/// Runs `kernel` over one payload and releases its shared views.
///
/// Panics inside the kernel are caught and reported as errors.
pub(crate) fn execute(kernel: KernelFn, payload: ChunkPayload) -> Result<ChunkResult, String> {
    let ChunkPayload {
        mut columns,
        length,
        params,
        ..
    } = payload;
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        kernel(&mut KernelColumns::new(&mut columns), length, &params)
    }));
    let copied = release(columns);
    match outcome {
        Ok(Ok(written)) => Ok(ChunkResult { written, copied }),
        Ok(Err(err)) => Err(err.to_string()),
        Err(panic) => Err(panic_message(&*panic)),
    }
}

fn release(columns: Vec<PayloadColumn>) -> Vec<Option<CopiedColumn>> {
    columns
        .into_iter()
        .map(|column| match column {
            PayloadColumn::Shared(view) => {
                view.publish();
                None
            }
            PayloadColumn::Copied(mut copied) => {
                copied.finish();
                Some(copied)
            }
        })
        .collect()
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        return format!("kernel panicked: {msg}");
    }
    if let Some(msg) = panic.downcast_ref::<String>() {
        return format!("kernel panicked: {msg}");
    }
    "kernel panicked".to_string()
}
