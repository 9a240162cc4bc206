//! # Parallel Dispatch
//!
//! One kernel over every chunk of a query, end to end:
//!
//! ```text
//! begin_iteration
//!   → chunk the query
//!   → overlap check against the kernel's declared writes
//!   → payloads: shared column → leased view, plain record → copy,
//!               boxed → NotDispatchable
//!   → pool run
//!   → copy plain columns back, stamp their marked rows
//!   → commit-changed on reported shared columns,
//!     drop marks on every other exposed shared column
//! end_iteration (always; replays deferred structural commands)
//! ```
//!
//! Structural changes requested while the dispatch is open are queued by the
//! world and applied when it closes, so row numbers stay valid for the whole
//! run.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tessera_core::sync::find_overlaps;
use tessera_core::{
    validate_non_overlapping_chunks, Archetype, ArchetypeId, ChangeTracker, ChunkDescriptor,
    ChunkedQuery, Column, ComponentTypeId, CoreError, World,
};

use crate::cancel::CancelSignal;
use crate::commit::{commit_changed, stamp_rows};
use crate::config::PoolConfig;
use crate::error::{DispatchError, DispatchResult, PoolResult};
use crate::kernel::{KernelParams, KernelRegistry};
use crate::payload::{ChunkPayload, ChunkResult, CopiedColumn, PayloadColumn};
use crate::pool::{RunOptions, WorkerPool};

/// What a finished dispatch did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Chunks dispatched.
    pub chunks: usize,
    /// `(entity, component)` stamps written to the change tracker.
    pub stamped: usize,
    /// Deferred structural commands replayed on exit.
    pub replayed: usize,
}

/// A kernel bound to the columns it runs over.
#[derive(Clone, Debug)]
pub struct ParallelDispatch {
    /// Registered kernel id.
    pub kernel_id: String,
    /// Required columns, in kernel order.
    pub columns: Vec<ComponentTypeId>,
    /// Optional columns appended after the required ones where present.
    pub optional: Vec<ComponentTypeId>,
    /// Archetypes storing any of these are skipped.
    pub forbidden: Vec<ComponentTypeId>,
    /// Parameters shared by every chunk.
    pub params: Arc<KernelParams>,
    /// Rows per chunk. Falls back to the pool configuration.
    pub target_chunk_size: Option<usize>,
    /// Run timeout. Falls back to the pool configuration.
    pub timeout: Option<Duration>,
    /// Cancel signal for the run.
    pub cancel: Option<CancelSignal>,
}

impl ParallelDispatch {
    /// Dispatch of `kernel_id` over entities that have every one of `columns`.
    #[must_use]
    pub fn new(kernel_id: impl Into<String>, columns: &[ComponentTypeId]) -> Self {
        Self {
            kernel_id: kernel_id.into(),
            columns: columns.to_vec(),
            optional: Vec::new(),
            forbidden: Vec::new(),
            params: Arc::new(KernelParams::new()),
            target_chunk_size: None,
            timeout: None,
            cancel: None,
        }
    }

    /// Sets the kernel parameters.
    #[must_use]
    pub fn with_params(mut self, params: KernelParams) -> Self {
        self.params = Arc::new(params);
        self
    }

    /// Sets the rows per chunk.
    #[must_use]
    pub fn with_chunk_size(mut self, rows: usize) -> Self {
        self.target_chunk_size = Some(rows);
        self
    }

    /// Appends optional columns.
    #[must_use]
    pub fn optional(mut self, ids: &[ComponentTypeId]) -> Self {
        self.optional.extend_from_slice(ids);
        self
    }

    /// Skips archetypes storing any of `ids`.
    #[must_use]
    pub fn without(mut self, ids: &[ComponentTypeId]) -> Self {
        self.forbidden.extend_from_slice(ids);
        self
    }

    /// Sets the run timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the cancel signal.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Query this dispatch chunks.
    #[must_use]
    pub fn query(&self, target_chunk_size: usize) -> ChunkedQuery {
        ChunkedQuery::new(&self.columns, target_chunk_size)
            .optional(&self.optional)
            .without(&self.forbidden)
    }

    /// Runs the kernel on the pool.
    ///
    /// # Errors
    ///
    /// [`DispatchError::UnknownKernel`] without metadata,
    /// [`DispatchError::OverlappingChunks`], [`DispatchError::NotDispatchable`],
    /// [`DispatchError::Lease`] if a shared column is still leased by a
    /// detached worker, or [`DispatchError::Pool`] if the run fails.
    pub fn run(
        &self,
        world: &mut World,
        pool: &mut WorkerPool,
        frame: u64,
        tracker: &mut dyn ChangeTracker,
    ) -> DispatchResult<DispatchReport> {
        let writes = self.declared_writes(pool.kernels())?;
        let target = self
            .target_chunk_size
            .unwrap_or(pool.config().target_chunk_size);
        let options = RunOptions {
            timeout: self.timeout,
            cancel: self.cancel.clone(),
        };
        self.execute(world, &writes, target, frame, tracker, |payloads| {
            pool.run(payloads, options)
        })
    }

    /// Runs the kernel's host variant sequentially on the calling thread.
    ///
    /// # Errors
    ///
    /// As [`run`](Self::run).
    pub fn run_host(
        &self,
        world: &mut World,
        kernels: &KernelRegistry,
        frame: u64,
        tracker: &mut dyn ChangeTracker,
    ) -> DispatchResult<DispatchReport> {
        let writes = self.declared_writes(kernels)?;
        let target = self
            .target_chunk_size
            .unwrap_or(PoolConfig::default().target_chunk_size);
        self.execute(world, &writes, target, frame, tracker, |payloads| {
            kernels.run_host(payloads)
        })
    }

    fn declared_writes(&self, kernels: &KernelRegistry) -> DispatchResult<Vec<usize>> {
        kernels
            .meta(&self.kernel_id)
            .map(|meta| meta.writes.clone())
            .ok_or_else(|| DispatchError::UnknownKernel(self.kernel_id.clone()))
    }

    fn execute<F>(
        &self,
        world: &mut World,
        writes: &[usize],
        target: usize,
        frame: u64,
        tracker: &mut dyn ChangeTracker,
        runner: F,
    ) -> DispatchResult<DispatchReport>
    where
        F: FnOnce(Vec<ChunkPayload>) -> PoolResult<Vec<ChunkResult>>,
    {
        world.begin_iteration();
        let outcome = self.dispatch(world, writes, target, frame, tracker, runner);
        let replayed = world.end_iteration();
        let mut report = outcome?;
        report.replayed = replayed;
        Ok(report)
    }

    fn dispatch<F>(
        &self,
        world: &mut World,
        writes: &[usize],
        target: usize,
        frame: u64,
        tracker: &mut dyn ChangeTracker,
        runner: F,
    ) -> DispatchResult<DispatchReport>
    where
        F: FnOnce(Vec<ChunkPayload>) -> PoolResult<Vec<ChunkResult>>,
    {
        let query = self.query(target);
        let chunks = query.descriptors(world.archetype_index());
        if !validate_non_overlapping_chunks(&chunks, Some(writes)) {
            let pairs = find_overlaps(&chunks, Some(writes)).len();
            return Err(DispatchError::OverlappingChunks(pairs));
        }

        let payloads = self.payloads(world, &query, &chunks)?;
        let results = match runner(payloads) {
            Ok(results) => results,
            Err(err) => {
                for (id, count) in exposed_archetypes(&chunks) {
                    if let Some(archetype) = world.archetype_index().get(id) {
                        drop_unreported(archetype, &query.columns()[..count], &BTreeSet::new());
                    }
                }
                return Err(err.into());
            }
        };

        let mut stamped = 0;
        let mut reported: Vec<(ArchetypeId, BTreeSet<usize>)> = Vec::new();
        for (chunk, result) in chunks.iter().zip(&results) {
            let written: BTreeSet<usize> = result.written.iter().copied().collect();
            let columns = &query.columns()[..chunk.column_count];
            if let Some(archetype) = world.archetype_mut(chunk.archetype) {
                stamped += write_back(archetype, columns, chunk, &written, result, frame, tracker);
            }
            match reported.iter_mut().find(|r| r.0 == chunk.archetype) {
                Some(entry) => entry.1.extend(written),
                None => reported.push((chunk.archetype, written)),
            }
        }
        for (id, count) in exposed_archetypes(&chunks) {
            let Some(archetype) = world.archetype_index().get(id) else {
                continue;
            };
            let columns = &query.columns()[..count];
            let written = reported
                .iter()
                .find(|r| r.0 == id)
                .map(|r| r.1.clone())
                .unwrap_or_default();
            let dropped = drop_unreported(archetype, columns, &written);
            if dropped > 0 {
                tracing::warn!(
                    "kernel '{}' marked {} rows of columns it did not report; dropped",
                    self.kernel_id,
                    dropped
                );
            }
            let written: Vec<usize> = written.into_iter().collect();
            stamped += commit_changed(archetype, columns, &written, frame, tracker);
        }

        tracing::debug!(
            "dispatch '{}': {} chunks, {} stamps at frame {}",
            self.kernel_id,
            chunks.len(),
            stamped,
            frame
        );
        Ok(DispatchReport {
            chunks: chunks.len(),
            stamped,
            replayed: 0,
        })
    }

    fn payloads(
        &self,
        world: &mut World,
        query: &ChunkedQuery,
        chunks: &[ChunkDescriptor],
    ) -> DispatchResult<Vec<ChunkPayload>> {
        let kernel: Arc<str> = Arc::from(self.kernel_id.as_str());
        let mut payloads = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let archetype = world
                .archetype_mut(chunk.archetype)
                .ok_or(CoreError::StaleArchetype(chunk.archetype))?;
            let mut columns = Vec::with_capacity(chunk.column_count);
            for &ty in &query.columns()[..chunk.column_count] {
                columns.push(payload_column(archetype, ty, chunk.start_row, chunk.end_row)?);
            }
            payloads.push(ChunkPayload::new(
                Arc::clone(&kernel),
                columns,
                chunk.len(),
                Arc::clone(&self.params),
            ));
        }
        Ok(payloads)
    }
}

fn payload_column(
    archetype: &mut Archetype,
    ty: ComponentTypeId,
    start: usize,
    end: usize,
) -> DispatchResult<PayloadColumn> {
    if let Some(shared) = archetype.shared_column_mut(ty) {
        return Ok(PayloadColumn::Shared(shared.view(start, end)?));
    }
    let Some(plain) = archetype.record_column(ty) else {
        return Err(DispatchError::NotDispatchable(ty));
    };
    let bytes = plain.rows(start, end).ok_or(CoreError::RangeOutOfBounds {
        start,
        end,
        len: Column::len(plain),
    })?;
    Ok(PayloadColumn::Copied(CopiedColumn::from_bytes(plain.stride(), bytes)))
}

/// Copies written plain columns back and stamps their marked rows.
fn write_back(
    archetype: &mut Archetype,
    columns: &[ComponentTypeId],
    chunk: &ChunkDescriptor,
    written: &BTreeSet<usize>,
    result: &ChunkResult,
    frame: u64,
    tracker: &mut dyn ChangeTracker,
) -> usize {
    let mut stamped = 0;
    for &index in written {
        let (Some(&ty), Some(copied)) = (columns.get(index), result.copied(index)) else {
            continue;
        };
        if let Some(rows) = archetype
            .record_column_mut(ty)
            .and_then(|column| column.rows_mut(chunk.start_row, chunk.end_row))
        {
            rows.copy_from_slice(copied.bytes());
        }
        let rows = copied.marked().iter().map(|row| chunk.start_row + row);
        stamped += stamp_rows(archetype, ty, rows, frame, tracker);
    }
    stamped
}

/// Each archetype the chunks cover, with its dispatched column count.
fn exposed_archetypes(chunks: &[ChunkDescriptor]) -> Vec<(ArchetypeId, usize)> {
    let mut seen: Vec<(ArchetypeId, usize)> = Vec::new();
    for chunk in chunks {
        match seen.iter_mut().find(|s| s.0 == chunk.archetype) {
            Some(entry) => entry.1 = entry.1.max(chunk.column_count),
            None => seen.push((chunk.archetype, chunk.column_count)),
        }
    }
    seen
}

/// Drains the write-masks of shared `columns` not in `reported`.
///
/// Returns the number of marked rows dropped.
fn drop_unreported(archetype: &Archetype, columns: &[ComponentTypeId], reported: &BTreeSet<usize>) -> usize {
    let mut dropped = 0;
    for (index, &ty) in columns.iter().enumerate() {
        if reported.contains(&index) {
            continue;
        }
        if let Some(column) = archetype.shared_column(ty) {
            dropped += column.drain_writes().len();
        }
    }
    dropped
}
