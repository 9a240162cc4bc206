//! # Worker Pool
//!
//! A fixed set of long-lived compute threads, one chunk payload per thread
//! at a time, and at most one outstanding run.
//!
//! ```text
//!   Idle ──submit──► Running(run) ──► Settled ──► Idle
//!                        │              ├─ Success: ordered results
//!                        │              └─ Failure: error, timeout, cancel,
//!                        │                 undeclared write → rebuild
//!                        └── reply (generation, worker, run, job)
//!                              stale / duplicate / unknown → discarded
//! ```
//!
//! ## Recovery
//!
//! Any failed run tears the whole worker set down and spawns a fresh one
//! before the next run is accepted. Threads still inside a kernel are
//! detached; they exit after their job, and whatever they reply is tagged
//! with the old generation and discarded.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let mut pool = WorkerPool::new(PoolConfig::default(), Arc::new(kernels))?;
//! let results = pool.run(payloads, RunOptions::default().with_timeout(ms(50)))?;
//! ```

mod run;
mod worker;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{at, bounded, never, select, Receiver, Sender};

use crate::cancel::CancelSignal;
use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::kernel::KernelRegistry;
use crate::payload::{ChunkPayload, ChunkResult};
use run::RunContext;
use worker::{Job, Reply, WorkerHandle};

/// Per-run options.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Wall-clock bound on the whole run. Falls back to the pool default.
    pub timeout: Option<Duration>,
    /// Cooperative cancellation.
    pub cancel: Option<CancelSignal>,
}

impl RunOptions {
    /// Sets the timeout.
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
}

/// Counters since the pool was created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Runs settled with results.
    pub runs_succeeded: u64,
    /// Runs settled with an error.
    pub runs_failed: u64,
    /// Worker sets rebuilt after a failure.
    pub rebuilds: u64,
    /// Replies discarded as stale, duplicate or unknown.
    pub stale_replies: u64,
}

/// Fixed-size compute pool with run isolation and dirty-worker recovery.
#[derive(Debug)]
pub struct WorkerPool {
    config: PoolConfig,
    kernels: Arc<KernelRegistry>,
    workers: Vec<WorkerHandle>,
    idle: VecDeque<usize>,
    reply_tx: Sender<Reply>,
    replies: Receiver<Reply>,
    run: Option<RunContext>,
    next_run: u64,
    generation: u64,
    stats: PoolStats,
    disposed: bool,
}

impl WorkerPool {
    /// Validates `config` and starts the first worker set.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidConfig`] or [`PoolError::WorkerSpawn`].
    pub fn new(config: PoolConfig, kernels: Arc<KernelRegistry>) -> PoolResult<Self> {
        config.validate()?;
        let (reply_tx, replies) = bounded(config.reply_channel_capacity());
        let mut pool = Self {
            config,
            kernels,
            workers: Vec::new(),
            idle: VecDeque::new(),
            reply_tx,
            replies,
            run: None,
            next_run: 0,
            generation: 0,
            stats: PoolStats::default(),
            disposed: false,
        };
        pool.spawn_workers()?;
        Ok(pool)
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    /// Configuration the pool was built with.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Kernel registry shared with the threads.
    #[must_use]
    pub fn kernels(&self) -> &KernelRegistry {
        &self.kernels
    }

    /// Worker set generation, bumped on every rebuild.
    #[inline]
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    /// Number of live compute threads.
    #[must_use]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Threads waiting for a job.
    #[must_use]
    pub fn idle_workers(&self) -> usize {
        self.idle.len()
    }

    /// Id of the outstanding run.
    #[must_use]
    pub fn current_run(&self) -> Option<u64> {
        self.run.as_ref().map(|r| r.id)
    }

    /// Checks if a run is outstanding.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    /// Checks if the pool was disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    // =========================================================================
    // RUNS
    // =========================================================================

    /// Submits payloads and blocks until the run settles.
    ///
    /// Results are in payload order.
    ///
    /// # Errors
    ///
    /// Any error of [`submit`](Self::submit) or [`wait`](Self::wait).
    pub fn run(&mut self, payloads: Vec<ChunkPayload>, options: RunOptions) -> PoolResult<Vec<ChunkResult>> {
        self.submit(payloads, options)?;
        self.wait()
    }

    /// Starts a run without waiting for it. Returns the run id.
    ///
    /// # Errors
    ///
    /// [`PoolError::Busy`] while another run is outstanding,
    /// [`PoolError::Disposed`] after [`dispose`](Self::dispose).
    pub fn submit(&mut self, payloads: Vec<ChunkPayload>, options: RunOptions) -> PoolResult<u64> {
        if self.disposed {
            return Err(PoolError::Disposed);
        }
        if let Some(run) = &self.run {
            return Err(PoolError::Busy(run.id));
        }
        if self.workers.is_empty() {
            self.rebuild()?;
        }
        while let Ok(reply) = self.replies.try_recv() {
            self.discard(&reply, "no run outstanding");
        }

        self.next_run += 1;
        let id = self.next_run;
        let timeout = options.timeout.or_else(|| self.config.default_timeout());
        tracing::debug!("run {} submitted: {} payloads", id, payloads.len());
        self.run = Some(RunContext::new(id, payloads, timeout, options.cancel));
        if let Some(err) = self.assign() {
            return Err(self.fail(err));
        }
        Ok(id)
    }

    /// Non-blocking progress check.
    ///
    /// `Ok(None)` while the run is still going.
    ///
    /// # Errors
    ///
    /// [`PoolError::NotRunning`] without a run, or the run's failure.
    pub fn try_complete(&mut self) -> PoolResult<Option<Vec<ChunkResult>>> {
        while let Ok(reply) = self.replies.try_recv() {
            if let Some(outcome) = self.handle_reply(reply) {
                return outcome.map(Some);
            }
        }
        self.poll_settled().transpose()
    }

    /// Blocks until the outstanding run settles.
    ///
    /// # Errors
    ///
    /// [`PoolError::NotRunning`] without a run, or the run's failure.
    pub fn wait(&mut self) -> PoolResult<Vec<ChunkResult>> {
        loop {
            if let Some(outcome) = self.poll_settled() {
                return outcome;
            }
            let Some(run) = self.run.as_ref() else {
                return Err(PoolError::NotRunning);
            };
            let replies = self.replies.clone();
            let cancelled = run
                .cancel
                .as_ref()
                .map_or_else(never, |c| c.receiver().clone());
            let expired = run.deadline.map_or_else(never, at);

            select! {
                recv(replies) -> msg => {
                    if let Ok(reply) = msg {
                        if let Some(outcome) = self.handle_reply(reply) {
                            return outcome;
                        }
                    }
                }
                recv(cancelled) -> _ => {}
                recv(expired) -> _ => {}
            }
        }
    }

    /// Settles any outstanding run as failed and stops every thread.
    /// Later calls fail with [`PoolError::Disposed`].
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        if let Some(run) = self.run.take() {
            self.stats.runs_failed += 1;
            tracing::debug!("run {} settled: disposed", run.id);
        }
        self.teardown();
    }

    // =========================================================================
    // PROTOCOL
    // =========================================================================

    /// Hands queued payloads to idle threads.
    fn assign(&mut self) -> Option<PoolError> {
        let run = self.run.as_mut()?;
        while let Some(&worker) = self.idle.front() {
            let Some((job, payload)) = run.next_job() else {
                break;
            };
            self.idle.pop_front();
            let message = Job {
                run: run.id,
                job,
                payload,
            };
            if let Err(message) = self.workers[worker].send(message) {
                run.requeue(message.job, message.payload);
                return Some(PoolError::WorkerFailed {
                    job,
                    reason: format!("compute thread {worker} is gone"),
                });
            }
        }
        None
    }

    fn handle_reply(&mut self, reply: Reply) -> Option<PoolResult<Vec<ChunkResult>>> {
        if reply.generation != self.generation {
            self.discard(&reply, "previous worker set");
            return None;
        }
        if let Some(worker) = self.workers.get_mut(reply.worker) {
            if worker.busy {
                worker.busy = false;
                self.idle.push_back(reply.worker);
            }
        }
        let Some(run) = self.run.as_mut().filter(|r| r.expects(reply.run, reply.job)) else {
            self.discard(&reply, "not awaited");
            return None;
        };

        let job = reply.job;
        let result = match reply.outcome {
            Ok(result) => result,
            Err(reason) => return Some(Err(self.fail(PoolError::WorkerFailed { job, reason }))),
        };
        let kernel = run.kernel(job).unwrap_or_default().to_string();
        let validation = self.kernels.validate_written_against_meta(&kernel, &result.written);
        if !validation.valid {
            tracing::warn!(
                "kernel '{}' wrote undeclared columns {:?} on job {}",
                kernel,
                validation.undeclared,
                job
            );
            let err = PoolError::UndeclaredWrite {
                kernel,
                undeclared: validation.undeclared,
            };
            return Some(Err(self.fail(err)));
        }

        run.record(job, result);
        if run.is_complete() {
            return Some(Ok(self.succeed()));
        }
        self.assign().map(|err| Err(self.fail(err)))
    }

    /// Settles the run if it completed, was cancelled or expired.
    fn poll_settled(&mut self) -> Option<PoolResult<Vec<ChunkResult>>> {
        let Some(run) = self.run.as_ref() else {
            let err = if self.disposed {
                PoolError::Disposed
            } else {
                PoolError::NotRunning
            };
            return Some(Err(err));
        };
        if run.is_complete() {
            return Some(Ok(self.succeed()));
        }
        if run.is_cancelled() {
            return Some(Err(self.fail(PoolError::Cancelled)));
        }
        if run.is_expired(Instant::now()) {
            let timeout = run.timeout.unwrap_or_default();
            return Some(Err(self.fail(PoolError::Timeout(timeout))));
        }
        None
    }

    fn succeed(&mut self) -> Vec<ChunkResult> {
        let Some(run) = self.run.take() else {
            return Vec::new();
        };
        self.stats.runs_succeeded += 1;
        tracing::debug!(
            "run {} settled: success, {} payloads in {:?}",
            run.id,
            run.len(),
            run.started.elapsed()
        );
        run.into_results()
    }

    /// Settles the run as failed and rebuilds the worker set.
    fn fail(&mut self, error: PoolError) -> PoolError {
        if let Some(run) = self.run.take() {
            self.stats.runs_failed += 1;
            tracing::debug!(
                "run {} settled: {} after {:?}",
                run.id,
                error,
                run.started.elapsed()
            );
        }
        if let Err(e) = self.rebuild() {
            tracing::error!("worker set rebuild failed: {}", e);
        }
        error
    }

    fn discard(&mut self, reply: &Reply, reason: &str) {
        self.stats.stale_replies += 1;
        tracing::debug!(
            "discarded reply for run {} job {} (generation {}): {}",
            reply.run,
            reply.job,
            reply.generation,
            reason
        );
    }

    // =========================================================================
    // WORKER SET
    // =========================================================================

    fn spawn_workers(&mut self) -> PoolResult<()> {
        self.generation += 1;
        let count = self.config.workers;
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let name = format!("{}-{}-{}", self.config.thread_name_prefix, self.generation, index);
            workers.push(WorkerHandle::spawn(
                name,
                self.generation,
                index,
                Arc::clone(&self.kernels),
                self.reply_tx.clone(),
            )?);
        }
        self.workers = workers;
        self.idle = (0..count).collect();
        tracing::info!("worker set created: generation {}, {} threads", self.generation, count);
        Ok(())
    }

    fn teardown(&mut self) {
        let workers = std::mem::take(&mut self.workers);
        self.idle.clear();
        if workers.is_empty() {
            return;
        }
        let detached = workers.iter().filter(|w| w.busy).count();
        for worker in workers {
            worker.shutdown();
        }
        tracing::info!(
            "worker set torn down: generation {}, {} detached",
            self.generation,
            detached
        );
    }

    fn rebuild(&mut self) -> PoolResult<()> {
        self.teardown();
        self.stats.rebuilds += 1;
        self.spawn_workers()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KernelError;
    use crate::kernel::{KernelMeta, KernelParams, ParamValue};
    use crate::payload::KernelColumns;

    fn noop(_: &mut KernelColumns<'_>, _: usize, _: &KernelParams) -> Result<Vec<usize>, KernelError> {
        Ok(Vec::new())
    }

    fn nap(_: &mut KernelColumns<'_>, _: usize, params: &KernelParams) -> Result<Vec<usize>, KernelError> {
        let ms = params.int("ms").unwrap_or(0).unsigned_abs();
        std::thread::sleep(Duration::from_millis(ms));
        Ok(Vec::new())
    }

    fn pool(workers: usize) -> WorkerPool {
        let mut kernels = KernelRegistry::new();
        for (id, kernel) in [("noop", noop as crate::kernel::KernelFn), ("nap", nap)] {
            kernels.register_kernel(id, kernel);
            kernels.register_host_kernel(id, kernel, KernelMeta::default());
        }
        WorkerPool::new(PoolConfig::default().with_workers(workers), Arc::new(kernels)).unwrap()
    }

    fn payloads(kernel: &str, n: usize, ms: i64) -> Vec<ChunkPayload> {
        let params = Arc::new(KernelParams::new().with("ms", ParamValue::Int(ms)));
        (0..n)
            .map(|_| ChunkPayload::new(kernel, Vec::new(), 0, Arc::clone(&params)))
            .collect()
    }

    #[test]
    fn test_more_payloads_than_workers() {
        let mut pool = pool(2);
        let results = pool.run(payloads("noop", 9, 0), RunOptions::default()).unwrap();
        assert_eq!(results.len(), 9);
        assert_eq!(pool.idle_workers(), 2);
        assert_eq!(pool.stats().runs_succeeded, 1);
    }

    #[test]
    fn test_empty_run_settles_immediately() {
        let mut pool = pool(1);
        assert!(pool.run(Vec::new(), RunOptions::default()).unwrap().is_empty());
    }

    #[test]
    fn test_busy_then_not_running() {
        let mut pool = pool(1);
        let id = pool.submit(payloads("nap", 1, 20), RunOptions::default()).unwrap();
        assert_eq!(
            pool.submit(payloads("noop", 1, 0), RunOptions::default()),
            Err(PoolError::Busy(id))
        );
        assert_eq!(pool.wait().unwrap().len(), 1);
        assert_eq!(pool.wait(), Err(PoolError::NotRunning));
        assert_eq!(pool.try_complete(), Err(PoolError::NotRunning));
    }

    #[test]
    fn test_try_complete_polls() {
        let mut pool = pool(2);
        pool.submit(payloads("nap", 2, 5), RunOptions::default()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let results = loop {
            if let Some(results) = pool.try_complete().unwrap() {
                break results;
            }
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        };
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_unknown_kernel_fails_and_rebuilds() {
        let mut pool = pool(1);
        let err = pool.run(payloads("missing", 1, 0), RunOptions::default()).unwrap_err();
        assert!(matches!(err, PoolError::WorkerFailed { job: 0, .. }));
        assert_eq!(pool.generation(), 2);
        assert!(pool.run(payloads("noop", 3, 0), RunOptions::default()).is_ok());
    }

    #[test]
    fn test_dispose() {
        let mut pool = pool(2);
        pool.dispose();
        assert_eq!(pool.size(), 0);
        assert_eq!(
            pool.run(payloads("noop", 1, 0), RunOptions::default()),
            Err(PoolError::Disposed)
        );
    }
}
