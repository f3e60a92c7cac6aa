//! Per-pipeline optimization sessions: passes, early abort and summaries.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cs_engine::Pipeline;
use cs_types::{Assignment, CancelToken, CsResult, SearchSpace, TaskConfig};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::evaluation::Objective;
use crate::pool::{Job, JobOutcome, JobResult};
use crate::search::SuggestionAlgorithm;
use crate::trial::{EnqueueOutcome, Trial, TrialResult, TrialState, TrialStore};

/// Budget and abandon rules of every session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionPolicy {
    pub evaluations_per_pass: usize,
    pub passes: usize,
    /// `(check_after, max_loss)`
    pub early_abort: Option<(usize, f64)>,
    pub max_consecutive_failures: Option<usize>,
    pub time_limit: Option<Duration>,
}

impl SessionPolicy {
    pub fn from_config(config: &TaskConfig) -> Self {
        Self {
            evaluations_per_pass: config.evaluations_per_pass,
            passes: config.passes,
            early_abort: config.early_abort(),
            max_consecutive_failures: config.max_consecutive_failures,
            time_limit: config.pipeline_time_limit(),
        }
    }

    /// Total trials of one pipeline.
    pub fn budget(&self) -> usize {
        self.evaluations_per_pass * self.passes
    }
}

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Every pass was evaluated.
    Completed,
    /// The suggestion algorithm had no further points.
    Exhausted,
    EarlyAbort,
    TooManyFailures,
    TimeLimit,
    Cancelled,
    /// The trial store could not be read or written.
    Failed(String),
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Exhausted => write!(f, "search space exhausted"),
            Self::EarlyAbort => write!(f, "aborted early"),
            Self::TooManyFailures => write!(f, "too many consecutive failures"),
            Self::TimeLimit => write!(f, "time limit reached"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed(message) => write!(f, "failed: {message}"),
        }
    }
}

/// A successful evaluation, reported to the best-result tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub session: usize,
    pub trial_id: u64,
    pub loss: f64,
    pub parameters: Assignment,
}

/// Aggregate of one pipeline's trials.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSummary {
    pub pipeline_id: Uuid,
    pub description: String,
    pub evaluated: usize,
    pub failed: usize,
    pub skipped: usize,
    pub best_loss: f64,
    /// `(trial id, loss)` of every finished trial.
    pub losses: Vec<(u64, f64)>,
    pub finish_reason: Option<FinishReason>,
}

impl PipelineSummary {
    fn from_store(pipeline: &Pipeline, store: &TrialStore, finish_reason: Option<FinishReason>) -> Self {
        let mut summary = Self {
            pipeline_id: pipeline.id(),
            description: pipeline.describe(),
            evaluated: 0,
            failed: 0,
            skipped: 0,
            best_loss: store.best().and_then(Trial::loss).unwrap_or(f64::INFINITY),
            losses: store.loss_series(),
            finish_reason,
        };
        for trial in store.trials() {
            if trial.is_placeholder() {
                summary.skipped += 1;
            } else if trial.state == TrialState::Error {
                summary.failed += 1;
            } else if trial.state == TrialState::Done {
                summary.evaluated += 1;
            }
        }
        summary
    }

    /// Simple moving average of the loss series; empty when the series is
    /// shorter than `window`. Infinite losses propagate into their windows.
    pub fn moving_average(&self, window: usize) -> Vec<f64> {
        if window == 0 || self.losses.len() < window {
            return Vec::new();
        }
        self.losses
            .windows(window)
            .map(|w| w.iter().map(|(_, loss)| loss).sum::<f64>() / window as f64)
            .collect()
    }

    /// The pipeline produced at least one successful evaluation.
    pub fn is_usable(&self) -> bool {
        self.best_loss.is_finite()
    }
}

/// Coordinator-side state of one pipeline's optimization.
///
/// Pass `p` tops the store up to `e·p` trials and evaluates the slice
/// `[e·(p−1), e·p)`. Trials of the slice that already finished in an earlier
/// run are replayed instead of evaluated again.
pub struct PipelineSession {
    index: usize,
    pipeline: Arc<Pipeline>,
    space: SearchSpace,
    store: TrialStore,
    algorithm: Box<dyn SuggestionAlgorithm>,
    objective: Arc<dyn Objective>,
    policy: SessionPolicy,
    cancel: CancelToken,
    pass: usize,
    exhausted: bool,
    in_flight: BTreeSet<u64>,
    consecutive_failures: usize,
    started: Option<Instant>,
    finished: Option<FinishReason>,
}

impl PipelineSession {
    /// `cancel` is the session's own token; cancelling it abandons the
    /// session's outstanding evaluations.
    pub fn new(
        index: usize,
        pipeline: Arc<Pipeline>,
        store: TrialStore,
        algorithm: Box<dyn SuggestionAlgorithm>,
        objective: Arc<dyn Objective>,
        policy: SessionPolicy,
        cancel: CancelToken,
    ) -> Self {
        let space = pipeline.parameter_space();
        Self {
            index,
            pipeline,
            space,
            store,
            algorithm,
            objective,
            policy,
            cancel,
            pass: 0,
            exhausted: false,
            in_flight: BTreeSet::new(),
            consecutive_failures: 0,
            started: None,
            finished: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn store(&self) -> &TrialStore {
        &self.store
    }

    pub fn finish_reason(&self) -> Option<&FinishReason> {
        self.finished.as_ref()
    }

    /// Finished and no evaluation outstanding.
    pub fn is_done(&self) -> bool {
        self.finished.is_some() && self.in_flight.is_empty()
    }

    pub fn summary(&self) -> PipelineSummary {
        PipelineSummary::from_store(&self.pipeline, &self.store, self.finished.clone())
    }

    /// Start the first pass and return the jobs to dispatch.
    pub fn begin(&mut self, completions: &mut Vec<Completion>) -> CsResult<Vec<Job>> {
        self.started = Some(Instant::now());
        info!(
            pipeline = %self.pipeline.id(),
            description = %self.pipeline.describe(),
            parameters = self.space.len(),
            stored = self.store.len(),
            "Optimizing pipeline"
        );
        self.advance(completions)
    }

    /// Record a worker result and return the jobs of the next pass, if the
    /// current one is complete.
    pub fn on_result(&mut self, result: JobResult, completions: &mut Vec<Completion>) -> CsResult<Vec<Job>> {
        let id = result.trial_id;
        self.in_flight.remove(&id);
        if matches!(self.finished, Some(FinishReason::Failed(_))) {
            return Ok(Vec::new());
        }

        match result.outcome {
            JobOutcome::Completed(trial_result) => self.store.complete(id, trial_result)?,
            JobOutcome::Failed(message) => self.store.fail(id, message)?,
            JobOutcome::Skipped => self.store.complete(id, TrialResult::skipped(self.best_loss()))?,
            JobOutcome::Cancelled => {
                debug!(pipeline = %self.pipeline.id(), trial = id, "Evaluation cancelled");
                return Ok(Vec::new());
            }
        }

        if let Some(trial) = self.store.get(id) {
            observe(self.index, trial, &mut self.consecutive_failures, completions);
        }
        self.check_policies()?;

        if self.in_flight.is_empty() {
            self.advance(completions)
        } else {
            Ok(Vec::new())
        }
    }

    /// Periodic check of the time limit while evaluations are running.
    pub fn poll(&mut self) -> CsResult<()> {
        self.check_policies()
    }

    /// Mark the session failed after an unrecoverable store error.
    pub fn fail(&mut self, message: String) {
        warn!(pipeline = %self.pipeline.id(), error = %message, "Abandoning pipeline");
        self.cancel.cancel();
        self.finished = Some(FinishReason::Failed(message));
    }

    /// Mark the session cancelled without touching its store.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        if self.finished.is_none() {
            self.finished = Some(FinishReason::Cancelled);
        }
    }

    /// Run every pass on the calling thread.
    pub fn run_serial(&mut self, completions: &mut Vec<Completion>) -> CsResult<()> {
        self.started = Some(Instant::now());
        info!(
            pipeline = %self.pipeline.id(),
            description = %self.pipeline.describe(),
            parameters = self.space.len(),
            "Optimizing pipeline serially"
        );

        while self.finished.is_none() {
            if self.cancel.is_cancelled() {
                self.finished = Some(FinishReason::Cancelled);
                break;
            }
            let Some(range) = self.next_pass()? else {
                break;
            };

            let evaluated = self
                .store
                .evaluate_pending(range.clone(), self.objective.as_ref(), &self.cancel)?;
            for trial in &self.store.trials()[range.start..range.end.min(self.store.len())] {
                if trial.is_finished() {
                    observe(self.index, trial, &mut self.consecutive_failures, completions);
                }
            }
            self.check_policies()?;

            if evaluated == 0 && self.exhausted && self.finished.is_none() {
                self.finished = Some(FinishReason::Exhausted);
            }
        }
        Ok(())
    }

    fn best_loss(&self) -> f64 {
        self.store.best().and_then(Trial::loss).unwrap_or(f64::INFINITY)
    }

    /// Enqueue the next pass and return its slice, or `None` when done.
    fn next_pass(&mut self) -> CsResult<Option<std::ops::Range<usize>>> {
        if self.pass >= self.policy.passes {
            self.finished = Some(FinishReason::Completed);
            return Ok(None);
        }
        self.pass += 1;

        let e = self.policy.evaluations_per_pass;
        let target = e * self.pass;
        if let EnqueueOutcome::Stopped = self.store.enqueue(self.algorithm.as_mut(), &self.space, target)? {
            self.exhausted = true;
        }
        debug!(
            pipeline = %self.pipeline.id(),
            pass = self.pass,
            passes = self.policy.passes,
            "Optimization pass"
        );
        Ok(Some(e * (self.pass - 1)..target))
    }

    /// Move to the next pass with work, replaying already finished trials.
    fn advance(&mut self, completions: &mut Vec<Completion>) -> CsResult<Vec<Job>> {
        loop {
            if self.finished.is_some() {
                return Ok(Vec::new());
            }
            let Some(range) = self.next_pass()? else {
                return Ok(Vec::new());
            };

            let end = range.end.min(self.store.len());
            let mut pending = Vec::new();
            for trial in &self.store.trials()[range.start.min(end)..end] {
                if trial.is_finished() {
                    observe(self.index, trial, &mut self.consecutive_failures, completions);
                } else {
                    pending.push(trial.id);
                }
            }
            self.check_policies()?;
            if self.finished.is_some() {
                return Ok(Vec::new());
            }

            if pending.is_empty() {
                if self.exhausted {
                    self.finished = Some(FinishReason::Exhausted);
                }
                continue;
            }

            self.store.mark_running(&pending)?;
            let jobs = pending
                .iter()
                .filter_map(|id| self.store.get(*id))
                .map(|trial| Job {
                    session: self.index,
                    trial_id: trial.id,
                    parameters: trial.parameters.clone(),
                    objective: self.objective.clone(),
                    cancel: self.cancel.clone(),
                })
                .collect();
            self.in_flight.extend(pending);
            return Ok(jobs);
        }
    }

    fn check_policies(&mut self) -> CsResult<()> {
        if self.finished.is_some() {
            return Ok(());
        }

        if let Some((check_after, max_loss)) = self.policy.early_abort {
            let finished = self
                .store
                .trials()
                .iter()
                .filter(|t| t.is_finished() && !t.is_placeholder())
                .count();
            let best = self.best_loss();
            if finished >= check_after && best > max_loss {
                info!(
                    pipeline = %self.pipeline.id(),
                    finished,
                    best_loss = best,
                    max_loss,
                    "Best loss still above threshold, aborting pipeline"
                );
                return self.abandon(FinishReason::EarlyAbort);
            }
        }

        if let Some(limit) = self.policy.max_consecutive_failures {
            if self.consecutive_failures >= limit {
                warn!(
                    pipeline = %self.pipeline.id(),
                    failures = self.consecutive_failures,
                    "Too many consecutive failed evaluations"
                );
                return self.abandon(FinishReason::TooManyFailures);
            }
        }

        if let (Some(limit), Some(started)) = (self.policy.time_limit, self.started) {
            if started.elapsed() >= limit {
                warn!(pipeline = %self.pipeline.id(), ?limit, "Pipeline time limit reached");
                return self.abandon(FinishReason::TimeLimit);
            }
        }
        Ok(())
    }

    /// Stop outstanding work and fill the remaining budget with the best loss.
    fn abandon(&mut self, reason: FinishReason) -> CsResult<()> {
        self.cancel.cancel();
        let best = self.best_loss();
        let filled = self.store.fill_placeholders(self.policy.budget(), best)?;
        debug!(pipeline = %self.pipeline.id(), filled, reason = %reason, "Filled remaining budget");
        self.finished = Some(reason);
        Ok(())
    }
}

/// Count a finished trial towards the failure streak and report successes.
fn observe(session: usize, trial: &Trial, consecutive_failures: &mut usize, completions: &mut Vec<Completion>) {
    if trial.is_placeholder() {
        return;
    }
    if trial.is_successful() {
        *consecutive_failures = 0;
        if let Some(loss) = trial.loss() {
            completions.push(Completion {
                session,
                trial_id: trial.id,
                loss,
                parameters: trial.parameters.clone(),
            });
        }
    } else {
        *consecutive_failures += 1;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::evaluation::EvaluationRequest;
    use crate::pool::WorkerPool;
    use crate::search::RandomSearch;
    use cs_engine::{NodeRole, PipelineNode};
    use cs_types::{EvaluationError, NodeSpec, ParameterDef, ParameterKind};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    /// `Src -> Filter(order, ratio) -> Sink`
    pub(crate) fn fixture_pipeline(input_path: &str) -> Arc<Pipeline> {
        let space = SearchSpace::new()
            .add(ParameterDef::new("Filter", "order", ParameterKind::QUniform { low: 1.0, high: 9.0, q: 1.0 }))
            .add(ParameterDef::new("Filter", "ratio", ParameterKind::Uniform { low: 0.0, high: 1.0 }));
        Arc::new(Pipeline::new(
            vec![
                PipelineNode::new(NodeSpec::new("Src", "source"), NodeRole::Source, SearchSpace::new(), BTreeMap::new()),
                PipelineNode::new(NodeSpec::new("Filter", "filter"), NodeRole::Intermediate, space, BTreeMap::new()),
                PipelineNode::new(NodeSpec::new("Sink", "sink"), NodeRole::Sink, SearchSpace::new(), BTreeMap::new()),
            ],
            input_path,
        ))
    }

    /// Deterministic loss `|order - 4| + ratio`.
    pub(crate) struct QuadraticObjective;

    impl Objective for QuadraticObjective {
        fn evaluate(&self, request: &EvaluationRequest) -> Result<TrialResult, EvaluationError> {
            let order = request.parameters["Filter_order"].as_f64().unwrap_or(0.0);
            let ratio = request.parameters["Filter_ratio"].as_f64().unwrap_or(0.0);
            Ok(TrialResult::ok((order - 4.0).abs() + ratio))
        }
    }

    /// Always the same loss.
    pub(crate) struct ConstantObjective(pub f64);

    impl Objective for ConstantObjective {
        fn evaluate(&self, _request: &EvaluationRequest) -> Result<TrialResult, EvaluationError> {
            Ok(TrialResult::ok(self.0))
        }
    }

    struct FailingObjective;

    impl Objective for FailingObjective {
        fn evaluate(&self, _request: &EvaluationRequest) -> Result<TrialResult, EvaluationError> {
            Err(EvaluationError::BackendFailed {
                message: "exit status 1".into(),
            })
        }
    }

    fn policy(e: usize, passes: usize) -> SessionPolicy {
        SessionPolicy {
            evaluations_per_pass: e,
            passes,
            early_abort: None,
            max_consecutive_failures: None,
            time_limit: None,
        }
    }

    fn session(dir: &std::path::Path, objective: Arc<dyn Objective>, policy: SessionPolicy, cancel: CancelToken) -> PipelineSession {
        PipelineSession::new(
            0,
            fixture_pipeline("data"),
            TrialStore::open(dir, false).unwrap(),
            Box::new(RandomSearch::new(Some(42))),
            objective,
            policy,
            cancel,
        )
    }

    /// Drive one session through a pool until it is done.
    fn run_pooled(session: &mut PipelineSession, workers: usize) -> Vec<Completion> {
        let root = CancelToken::new();
        let mut pool = WorkerPool::new(workers, &root).unwrap();
        let mut completions = Vec::new();
        for job in session.begin(&mut completions).unwrap() {
            pool.submit(job).unwrap();
        }
        while !session.is_done() {
            if let Some(result) = pool.recv_timeout(Duration::from_secs(5)).unwrap() {
                for job in session.on_result(result, &mut completions).unwrap() {
                    pool.submit(job).unwrap();
                }
            }
        }
        pool.close(Duration::from_secs(5));
        completions
    }

    #[test]
    fn test_passes_fill_the_budget() {
        let dir = tempdir().unwrap();
        let mut session = session(dir.path(), Arc::new(QuadraticObjective), policy(3, 2), CancelToken::new());
        let completions = run_pooled(&mut session, 2);

        assert_eq!(completions.len(), 6);
        assert_eq!(session.finish_reason(), Some(&FinishReason::Completed));
        let summary = session.summary();
        assert_eq!((summary.evaluated, summary.failed, summary.skipped), (6, 0, 0));
        let ids: Vec<u64> = summary.losses.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_pool_size_does_not_change_results() {
        let run = |workers: usize| {
            let dir = tempdir().unwrap();
            let mut session = session(dir.path(), Arc::new(QuadraticObjective), policy(4, 2), CancelToken::new());
            run_pooled(&mut session, workers);
            let mut assignments: Vec<String> = session
                .store()
                .trials()
                .iter()
                .map(|t| serde_json::to_string(&t.parameters).unwrap())
                .collect();
            assignments.sort();
            (assignments, session.summary().best_loss)
        };

        let (serial_set, serial_best) = run(1);
        let (parallel_set, parallel_best) = run(4);
        assert_eq!(serial_set.len(), 8);
        assert_eq!(serial_set, parallel_set);
        assert_eq!(serial_best, parallel_best);
    }

    #[test]
    fn test_early_abort_fills_remaining_budget() {
        let dir = tempdir().unwrap();
        let mut policy = policy(5, 1);
        policy.early_abort = Some((2, 1.0));
        let mut session = session(dir.path(), Arc::new(ConstantObjective(10.0)), policy, CancelToken::new());
        run_pooled(&mut session, 1);

        assert_eq!(session.finish_reason(), Some(&FinishReason::EarlyAbort));
        let trials = session.store().trials();
        assert_eq!(trials.len(), 5);
        assert!(trials.iter().all(|t| t.is_finished()));
        assert!(trials.iter().all(|t| t.loss() == Some(10.0)));
        assert!(session.summary().skipped >= 1);
    }

    #[test]
    fn test_early_abort_in_serial_mode() {
        let dir = tempdir().unwrap();
        let mut policy = policy(2, 3);
        policy.early_abort = Some((2, 1.0));
        let mut session = session(dir.path(), Arc::new(ConstantObjective(10.0)), policy, CancelToken::new());
        let mut completions = Vec::new();
        session.run_serial(&mut completions).unwrap();

        assert_eq!(completions.len(), 2);
        let summary = session.summary();
        assert_eq!((summary.evaluated, summary.skipped), (2, 4));
        assert_eq!(summary.losses.len(), 6);
        assert!(summary.losses.iter().all(|(_, loss)| *loss == 10.0));
    }

    #[test]
    fn test_consecutive_failures_abandon_pipeline() {
        let dir = tempdir().unwrap();
        let mut policy = policy(3, 2);
        policy.max_consecutive_failures = Some(3);
        let mut session = session(dir.path(), Arc::new(FailingObjective), policy, CancelToken::new());
        let completions = run_pooled(&mut session, 1);

        assert!(completions.is_empty());
        assert_eq!(session.finish_reason(), Some(&FinishReason::TooManyFailures));
        let summary = session.summary();
        assert_eq!(summary.failed, 3);
        assert_eq!(summary.skipped, 3);
        assert!(!summary.is_usable());
    }

    #[test]
    fn test_resumed_session_replays_finished_trials() {
        let dir = tempdir().unwrap();
        let first_best = {
            let mut first = session(dir.path(), Arc::new(QuadraticObjective), policy(3, 1), CancelToken::new());
            run_pooled(&mut first, 2);
            first.summary().best_loss
        };

        // Same budget again: nothing to evaluate, finished trials are replayed
        let mut resumed = session(dir.path(), Arc::new(FailingObjective), policy(3, 1), CancelToken::new());
        let completions = run_pooled(&mut resumed, 2);
        assert_eq!(completions.len(), 3);
        assert_eq!(resumed.summary().best_loss, first_best);
        assert_eq!(resumed.summary().failed, 0);
    }

    #[test]
    fn test_moving_average() {
        let summary = PipelineSummary {
            pipeline_id: Uuid::nil(),
            description: String::new(),
            evaluated: 4,
            failed: 0,
            skipped: 0,
            best_loss: 1.0,
            losses: vec![(0, 4.0), (1, 2.0), (2, 3.0), (3, 1.0)],
            finish_reason: None,
        };
        assert_eq!(summary.moving_average(2), vec![3.0, 2.5, 2.0]);
        assert!(summary.moving_average(5).is_empty());
    }
}
