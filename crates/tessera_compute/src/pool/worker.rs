//! Compute thread and its messages.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::{PoolError, PoolResult};
use crate::kernel::KernelRegistry;
use crate::payload::{execute, ChunkPayload, ChunkResult};

/// Coordinator → worker.
#[derive(Debug)]
pub(crate) struct Job {
    pub run: u64,
    pub job: usize,
    pub payload: ChunkPayload,
}

/// Worker → coordinator. Tagged so replies can be matched to the run that
/// issued them, or discarded.
#[derive(Debug)]
pub(crate) struct Reply {
    pub generation: u64,
    pub worker: usize,
    pub run: u64,
    pub job: usize,
    pub outcome: Result<ChunkResult, String>,
}

/// Coordinator-side handle of one compute thread.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    jobs: Sender<Job>,
    thread: JoinHandle<()>,
    pub busy: bool,
}

impl WorkerHandle {
    /// Starts a compute thread.
    pub fn spawn(
        name: String,
        generation: u64,
        index: usize,
        kernels: Arc<KernelRegistry>,
        replies: Sender<Reply>,
    ) -> PoolResult<Self> {
        let (jobs, inbox) = bounded(1);
        let thread = std::thread::Builder::new()
            .name(name)
            .spawn(move || worker_loop(generation, index, &kernels, &inbox, &replies))
            .map_err(|e| PoolError::WorkerSpawn(e.to_string()))?;
        Ok(Self {
            jobs,
            thread,
            busy: false,
        })
    }

    /// Hands a job to the thread. Gives the job back if the thread is gone.
    pub fn send(&mut self, job: Job) -> Result<(), Job> {
        self.jobs.send(job).map_err(|e| e.into_inner())?;
        self.busy = true;
        Ok(())
    }

    /// Closes the job channel. Idle threads exit, busy ones are detached and
    /// exit after their current job.
    pub fn shutdown(self) {
        let Self { jobs, thread, busy } = self;
        drop(jobs);
        if !busy && thread.join().is_err() {
            tracing::warn!("compute thread exited with a panic");
        }
    }
}

fn worker_loop(
    generation: u64,
    index: usize,
    kernels: &KernelRegistry,
    inbox: &Receiver<Job>,
    replies: &Sender<Reply>,
) {
    while let Ok(Job { run, job, payload }) = inbox.recv() {
        let kernel_id = payload.kernel_handle();
        // The payload is consumed here; leases are released before the reply.
        let outcome = match kernels.kernel(&kernel_id) {
            Some(kernel) => execute(kernel, payload),
            None => {
                drop(payload);
                Err(format!("unknown kernel '{kernel_id}'"))
            }
        };
        if let Err(reason) = &outcome {
            tracing::error!("kernel '{}' failed on job {} of run {}: {}", kernel_id, job, run, reason);
        }
        let reply = Reply {
            generation,
            worker: index,
            run,
            job,
            outcome,
        };
        if replies.send(reply).is_err() {
            break;
        }
    }
}
