//! Per-run bookkeeping.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cancel::CancelSignal;
use crate::payload::{ChunkPayload, ChunkResult};

/// Lifecycle of one job inside a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum JobState {
    Queued,
    InFlight,
    Done,
}

/// State of the outstanding run.
#[derive(Debug)]
pub(crate) struct RunContext {
    pub id: u64,
    pub timeout: Option<Duration>,
    pub deadline: Option<Instant>,
    pub cancel: Option<CancelSignal>,
    pub started: Instant,
    unassigned: VecDeque<(usize, ChunkPayload)>,
    kernels: Vec<Arc<str>>,
    states: Vec<JobState>,
    results: Vec<Option<ChunkResult>>,
    remaining: usize,
}

impl RunContext {
    pub fn new(
        id: u64,
        payloads: Vec<ChunkPayload>,
        timeout: Option<Duration>,
        cancel: Option<CancelSignal>,
    ) -> Self {
        let started = Instant::now();
        let count = payloads.len();
        Self {
            id,
            timeout,
            deadline: timeout.map(|t| started + t),
            cancel,
            started,
            kernels: payloads.iter().map(ChunkPayload::kernel_handle).collect(),
            unassigned: payloads.into_iter().enumerate().collect(),
            states: vec![JobState::Queued; count],
            results: (0..count).map(|_| None).collect(),
            remaining: count,
        }
    }

    /// Number of payloads in the run.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Next payload waiting for a worker.
    pub fn next_job(&mut self) -> Option<(usize, ChunkPayload)> {
        let (job, payload) = self.unassigned.pop_front()?;
        self.states[job] = JobState::InFlight;
        Some((job, payload))
    }

    /// Puts a payload back at the head of the queue.
    pub fn requeue(&mut self, job: usize, payload: ChunkPayload) {
        self.states[job] = JobState::Queued;
        self.unassigned.push_front((job, payload));
    }

    /// Checks that `(run, job)` names a job of this run still awaiting its
    /// result. Late, duplicate and unknown replies fail this check.
    pub fn expects(&self, run: u64, job: usize) -> bool {
        run == self.id && self.states.get(job) == Some(&JobState::InFlight)
    }

    /// Kernel id of `job`.
    pub fn kernel(&self, job: usize) -> Option<&str> {
        self.kernels.get(job).map(AsRef::as_ref)
    }

    /// Stores a result at its payload index.
    pub fn record(&mut self, job: usize, result: ChunkResult) {
        self.states[job] = JobState::Done;
        self.results[job] = Some(result);
        self.remaining -= 1;
    }

    /// Every payload has a result.
    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    /// Results in payload order.
    pub fn into_results(self) -> Vec<ChunkResult> {
        self.results.into_iter().flatten().collect()
    }

    /// Deadline has passed.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    /// Cancel signal has fired.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelSignal::is_cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelParams;

    fn payloads(n: usize) -> Vec<ChunkPayload> {
        let params = Arc::new(KernelParams::new());
        (0..n)
            .map(|_| ChunkPayload::new("noop", Vec::new(), 0, Arc::clone(&params)))
            .collect()
    }

    #[test]
    fn test_results_keep_payload_order() {
        let mut run = RunContext::new(7, payloads(3), None, None);
        let a = run.next_job().unwrap().0;
        let b = run.next_job().unwrap().0;
        let c = run.next_job().unwrap().0;
        assert_eq!((a, b, c), (0, 1, 2));

        for job in [2, 0, 1] {
            assert!(run.expects(7, job));
            run.record(job, ChunkResult { written: vec![job], copied: Vec::new() });
        }
        assert!(run.is_complete());
        let written: Vec<_> = run.into_results().into_iter().map(|r| r.written).collect();
        assert_eq!(written, vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn test_stale_duplicate_and_unknown_jobs_rejected() {
        let mut run = RunContext::new(2, payloads(2), None, None);
        assert!(!run.expects(2, 0), "queued job has no reply yet");
        let (job, _) = run.next_job().unwrap();
        assert!(!run.expects(1, job), "older run");
        assert!(!run.expects(2, 9), "unknown job");
        run.record(job, ChunkResult::default());
        assert!(!run.expects(2, job), "duplicate");
    }

    #[test]
    fn test_deadline() {
        let run = RunContext::new(1, payloads(1), Some(Duration::ZERO), None);
        assert!(run.is_expired(Instant::now()));
        let open = RunContext::new(1, payloads(1), None, None);
        assert!(!open.is_expired(Instant::now()));
    }
}
