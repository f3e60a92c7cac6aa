//! Worker pool evaluating trials on supervisor threads.
//!
//! Each worker takes jobs from a shared unbounded queue and reports back on
//! a bounded results queue that only the coordinator drains. Workers never
//! touch trial stores. Backends run their heavy work in child processes, so
//! a worker thread only supervises and a crashing backend cannot take the
//! coordinator down with it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use cs_types::{internal_error, Assignment, CancelToken, CsResult, EvaluationError};
use tracing::{debug, error, warn};

use crate::evaluation::{panic_message, EvaluationRequest, Objective};
use crate::trial::TrialResult;

/// One trial evaluation handed to a worker.
pub struct Job {
    /// Coordinator-side session the trial belongs to.
    pub session: usize,
    pub trial_id: u64,
    pub parameters: Assignment,
    pub objective: Arc<dyn Objective>,
    /// Session token, derived from [`WorkerPool::token`]. Cancelling it
    /// skips the session's queued jobs and stops its running ones.
    pub cancel: CancelToken,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(TrialResult),
    Failed(String),
    /// Not evaluated (or stopped) because the session was abandoned.
    Skipped,
    /// Interrupted by pool termination; the trial was never recorded.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct JobResult {
    pub session: usize,
    pub trial_id: u64,
    pub worker: usize,
    pub outcome: JobOutcome,
    pub elapsed: Duration,
}

/// Bounded set of worker threads.
pub struct WorkerPool {
    jobs: Option<Sender<Job>>,
    results: Receiver<JobResult>,
    handles: Vec<JoinHandle<()>>,
    cancel: CancelToken,
    in_flight: usize,
}

impl WorkerPool {
    /// Start `workers` threads. Terminating the pool or cancelling `parent`
    /// cancels every running evaluation.
    pub fn new(workers: usize, parent: &CancelToken) -> CsResult<Self> {
        let workers = workers.max(1);
        let (job_tx, job_rx) = unbounded::<Job>();
        let (result_tx, result_rx) = bounded::<JobResult>(workers * 2);
        let cancel = parent.child();

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let jobs = job_rx.clone();
            let results = result_tx.clone();
            let cancel = cancel.clone();
            let handle = thread::Builder::new()
                .name(format!("cs-worker-{worker}"))
                .spawn(move || worker_loop(worker, jobs, results, cancel))?;
            handles.push(handle);
        }
        debug!(workers, "Started worker pool");

        Ok(Self {
            jobs: Some(job_tx),
            results: result_rx,
            handles,
            cancel,
            in_flight: 0,
        })
    }

    /// Parent of every job's session token.
    pub fn token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    /// Jobs submitted whose result has not been received yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn submit(&mut self, job: Job) -> CsResult<()> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| internal_error!("worker pool is closed"))?;
        jobs.send(job)
            .map_err(|_| internal_error!("all pool workers have exited"))?;
        self.in_flight += 1;
        Ok(())
    }

    /// Wait up to `timeout` for the next result.
    pub fn recv_timeout(&mut self, timeout: Duration) -> CsResult<Option<JobResult>> {
        match self.results.recv_timeout(timeout) {
            Ok(result) => {
                self.in_flight = self.in_flight.saturating_sub(1);
                Ok(Some(result))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(internal_error!("all pool workers have exited")),
        }
    }

    /// Let queued jobs finish, then join the workers.
    pub fn close(&mut self, grace: Duration) {
        self.jobs.take();
        self.join(grace);
    }

    /// Cancel running evaluations, drop queued jobs and join the workers.
    /// Workers still busy after `grace` are detached.
    pub fn terminate(&mut self, grace: Duration) {
        self.cancel.cancel();
        self.jobs.take();
        self.join(grace);
    }

    fn join(&mut self, grace: Duration) {
        let deadline = Instant::now() + grace;
        let mut pending = std::mem::take(&mut self.handles);
        while !pending.is_empty() {
            // Keep the results queue moving so no worker blocks on a full channel
            while self.results.try_recv().is_ok() {
                self.in_flight = self.in_flight.saturating_sub(1);
            }

            let (finished, running): (Vec<_>, Vec<_>) = pending.into_iter().partition(|h| h.is_finished());
            for handle in finished {
                if handle.join().is_err() {
                    error!("Pool worker panicked outside of an evaluation");
                }
            }
            pending = running;

            if !pending.is_empty() {
                if Instant::now() >= deadline {
                    warn!(workers = pending.len(), "Pool workers did not stop in time, detaching them");
                    break;
                }
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.terminate(Duration::from_secs(5));
        }
    }
}

fn worker_loop(worker: usize, jobs: Receiver<Job>, results: Sender<JobResult>, cancel: CancelToken) {
    for job in jobs.iter() {
        let started = Instant::now();
        let outcome = if cancel.is_cancelled() {
            JobOutcome::Cancelled
        } else if job.cancel.is_cancelled() {
            JobOutcome::Skipped
        } else {
            run_job(&job, &cancel)
        };

        let result = JobResult {
            session: job.session,
            trial_id: job.trial_id,
            worker,
            outcome,
            elapsed: started.elapsed(),
        };
        if results.send(result).is_err() {
            // Coordinator is gone
            break;
        }
    }
}

fn run_job(job: &Job, cancel: &CancelToken) -> JobOutcome {
    let request = EvaluationRequest {
        trial_id: job.trial_id,
        parameters: job.parameters.clone(),
        cancel: job.cancel.clone(),
    };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| job.objective.evaluate(&request)))
        .unwrap_or_else(|payload| {
            Err(EvaluationError::Panicked {
                message: panic_message(payload.as_ref()),
            })
        });

    match outcome {
        Ok(result) => JobOutcome::Completed(result),
        Err(EvaluationError::Cancelled) if cancel.is_cancelled() => JobOutcome::Cancelled,
        Err(EvaluationError::Cancelled) => JobOutcome::Skipped,
        Err(e) => {
            warn!(trial = job.trial_id, error = %e, "Trial evaluation failed");
            JobOutcome::Failed(e.to_string())
        }
    }
}
