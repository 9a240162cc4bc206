//! # Kernel Registry
//!
//! Kernels are plain functions addressed by string id, because the id is
//! what crosses the thread boundary inside a payload.
//!
//! ```text
//! register_kernel(id, f)             worker side, looked up by pool threads
//! register_host_kernel(id, f, meta)  coordinator side, in-process fallback
//!                                    and the declared `writes` set
//! ```
//!
//! Every reply is checked against the declared writes before the
//! coordinator trusts it, so a kernel dispatched to the pool needs host
//! metadata too.
//!
//! ## Kernel contract
//!
//! A kernel gets the columns of exactly one chunk, the chunk length and the
//! dispatch parameters, and returns the column indices it wrote. Rows it
//! wants stamped as changed are marked through [`KernelColumns::mark`].

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, PoolError, PoolResult};
use crate::payload::{execute, ChunkPayload, ChunkResult, KernelColumns};

/// Kernel entry point: `(columns, length, params) -> written column indices`.
pub type KernelFn =
    fn(&mut KernelColumns<'_>, usize, &KernelParams) -> Result<Vec<usize>, KernelError>;

// ============================================================================
// PARAMETERS
// ============================================================================

/// One scalar dispatch parameter.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Float.
    Float(f64),
}

/// Named scalar parameters shared by every chunk of a dispatch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KernelParams(BTreeMap<String, ParamValue>);

impl KernelParams {
    /// Empty parameter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a parameter.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    /// Raw parameter.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<ParamValue> {
        self.0.get(name).copied()
    }

    /// Float parameter. Integers are widened.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn float(&self, name: &str) -> Option<f64> {
        match self.get(name)? {
            ParamValue::Float(v) => Some(v),
            ParamValue::Int(v) => Some(v as f64),
            ParamValue::Bool(_) => None,
        }
    }

    /// Integer parameter.
    #[must_use]
    pub fn int(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            ParamValue::Int(v) => Some(v),
            _ => None,
        }
    }

    /// Boolean parameter.
    #[must_use]
    pub fn flag(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            ParamValue::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// Number of parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Checks if there are no parameters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ============================================================================
// METADATA
// ============================================================================

/// Static description of a kernel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KernelMeta {
    /// Column indices the kernel may write.
    pub writes: Vec<usize>,
}

impl KernelMeta {
    /// Metadata declaring `writes`.
    #[must_use]
    pub fn writes(writes: &[usize]) -> Self {
        Self {
            writes: writes.to_vec(),
        }
    }

    /// Checks whether column `index` is declared written.
    #[inline]
    #[must_use]
    pub fn declares(&self, index: usize) -> bool {
        self.writes.contains(&index)
    }
}

/// Outcome of checking reported writes against [`KernelMeta`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteValidation {
    /// No undeclared write, and the kernel is known.
    pub valid: bool,
    /// Reported indices outside the declared set, first occurrence order.
    pub undeclared: Vec<usize>,
}

#[derive(Clone, Debug)]
struct HostKernel {
    kernel: KernelFn,
    meta: KernelMeta,
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Explicit kernel registry, shared with pool threads behind an `Arc`.
#[derive(Debug, Default)]
pub struct KernelRegistry {
    workers: HashMap<String, KernelFn>,
    host: HashMap<String, HostKernel>,
}

impl KernelRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a kernel runnable on pool threads.
    pub fn register_kernel(&mut self, id: impl Into<String>, kernel: KernelFn) {
        let id = id.into();
        if self.workers.insert(id.clone(), kernel).is_some() {
            tracing::debug!("worker kernel '{}' replaced", id);
        }
    }

    /// Registers an in-process kernel together with its metadata.
    pub fn register_host_kernel(&mut self, id: impl Into<String>, kernel: KernelFn, meta: KernelMeta) {
        let id = id.into();
        if self.host.insert(id.clone(), HostKernel { kernel, meta }).is_some() {
            tracing::debug!("host kernel '{}' replaced", id);
        }
    }

    /// Worker-side kernel lookup.
    #[must_use]
    pub fn kernel(&self, id: &str) -> Option<KernelFn> {
        self.workers.get(id).copied()
    }

    /// Declared metadata of `id`.
    #[must_use]
    pub fn meta(&self, id: &str) -> Option<&KernelMeta> {
        self.host.get(id).map(|h| &h.meta)
    }

    /// Checks reported writes against the declared set.
    ///
    /// An unknown id is invalid, with every reported index undeclared.
    #[must_use]
    pub fn validate_written_against_meta(&self, id: &str, written: &[usize]) -> WriteValidation {
        let meta = self.meta(id);
        let mut undeclared: Vec<usize> = Vec::new();
        for &index in written {
            let declared = meta.is_some_and(|m| m.declares(index));
            if !declared && !undeclared.contains(&index) {
                undeclared.push(index);
            }
        }
        WriteValidation {
            valid: meta.is_some() && undeclared.is_empty(),
            undeclared,
        }
    }

    /// Runs payloads one after another on the calling thread.
    ///
    /// Same contract as a pool run: ordered results, or the first failure.
    ///
    /// # Errors
    ///
    /// [`PoolError::WorkerFailed`] on an unknown kernel, a kernel error or a
    /// panic; [`PoolError::UndeclaredWrite`] on a contract violation.
    pub fn run_host(&self, payloads: Vec<ChunkPayload>) -> PoolResult<Vec<ChunkResult>> {
        let mut results = Vec::with_capacity(payloads.len());
        for (job, payload) in payloads.into_iter().enumerate() {
            let kernel_id = payload.kernel_id().to_string();
            let Some(host) = self.host.get(&kernel_id) else {
                return Err(PoolError::WorkerFailed {
                    job,
                    reason: format!("unknown kernel '{kernel_id}'"),
                });
            };
            let result = execute(host.kernel, payload)
                .map_err(|reason| PoolError::WorkerFailed { job, reason })?;
            let validation = self.validate_written_against_meta(&kernel_id, &result.written);
            if !validation.valid {
                tracing::warn!(
                    "kernel '{}' wrote undeclared columns {:?}",
                    kernel_id,
                    validation.undeclared
                );
                return Err(PoolError::UndeclaredWrite {
                    kernel: kernel_id,
                    undeclared: validation.undeclared,
                });
            }
            results.push(result);
        }
        Ok(results)
    }

    /// Number of worker kernels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Checks if no worker kernel is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Drops every kernel and all metadata.
    pub fn clear(&mut self) {
        self.workers.clear();
        self.host.clear();
    }
}
