//! Top-level search over generated pipelines and their parameters.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{after, bounded, select};
use cs_data::{PipelineDescriptor, StorageManager};
use cs_engine::{Pipeline, PipelineGenerator, Task};
use cs_types::{CancelToken, CsResult, StoreError};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::RunConfig;
use crate::evaluation::ObjectiveFactory;
use crate::optimization::{Completion, PipelineSession, PipelineSummary, SessionPolicy};
use crate::pool::{Job, WorkerPool};
use crate::search::build_algorithm;
use crate::trial::TrialStore;

/// Lowest loss seen so far and the operation that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BestResult {
    pub loss: f64,
    /// `[A, B, C]@input_path`
    pub pipeline: String,
    /// Resolved node parameter values.
    pub parameters: BTreeMap<String, Value>,
    /// Operation file text handed to the backend.
    pub base_file: String,
}

/// Keeps the best result and persists it on every improvement.
#[derive(Debug)]
pub struct BestTracker {
    path: PathBuf,
    best: Option<BestResult>,
}

impl BestTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            best: None,
        }
    }

    pub fn best(&self) -> Option<&BestResult> {
        self.best.as_ref()
    }

    pub fn into_best(self) -> Option<BestResult> {
        self.best
    }

    /// Take `completion` if its loss is strictly lower than the current best.
    pub fn offer(&mut self, pipeline: &Pipeline, completion: &Completion) -> CsResult<bool> {
        let current = self.best.as_ref().map_or(f64::INFINITY, |b| b.loss);
        if completion.loss.is_nan() || completion.loss >= current {
            return Ok(false);
        }

        let parameters = pipeline.parameter_space().resolve(&completion.parameters)?;
        let spec = pipeline.operation_spec(std::slice::from_ref(&parameters));
        cs_data::write_atomic(&self.path, spec.base_file.as_bytes()).map_err(|source| StoreError::Write {
            path: self.path.display().to_string(),
            source,
        })?;

        info!(
            loss = completion.loss,
            pipeline = %pipeline.describe(),
            trial = completion.trial_id,
            "New best result"
        );
        self.best = Some(BestResult {
            loss: completion.loss,
            pipeline: pipeline.describe(),
            parameters,
            base_file: spec.base_file,
        });
        Ok(true)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Best(BestResult),
    /// The generator produced no pipeline for the input type.
    NoPipelineFound { input_type: String, max_length: usize },
    /// Pipelines were evaluated but none succeeded.
    NoUsableResult,
}

/// Why the run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Every generated pipeline was optimized.
    Exhausted,
    /// The overall evaluation time limit expired.
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizationReport {
    pub outcome: Outcome,
    pub termination: Termination,
    pub pipelines: Vec<PipelineSummary>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl OptimizationReport {
    pub fn best(&self) -> Option<&BestResult> {
        match &self.outcome {
            Outcome::Best(best) => Some(best),
            _ => None,
        }
    }
}

/// Mutable state of one run, owned by the coordinator thread.
struct RunState {
    generator: PipelineGenerator,
    generator_done: bool,
    generated: usize,
    best: BestTracker,
    summaries: Vec<PipelineSummary>,
}

impl RunState {
    fn next_chain(&mut self) -> Option<Vec<String>> {
        if self.generator_done {
            return None;
        }
        let chain = self.generator.next();
        match chain {
            Some(_) => self.generated += 1,
            None => {
                debug!(generated = self.generated, "Pipeline generator exhausted");
                self.generator_done = true;
            }
        }
        chain
    }

    fn record(&mut self, pipeline: &Pipeline, completions: Vec<Completion>) {
        for completion in &completions {
            if let Err(e) = self.best.offer(pipeline, completion) {
                error!(pipeline = %pipeline.id(), trial = completion.trial_id, error = %e, "Failed to record best result");
            }
        }
    }

    fn retire(&mut self, session: &PipelineSession) {
        let summary = session.summary();
        info!(
            pipeline = %summary.description,
            evaluated = summary.evaluated,
            failed = summary.failed,
            skipped = summary.skipped,
            best_loss = summary.best_loss,
            reason = %session.finish_reason().map(ToString::to_string).unwrap_or_default(),
            "Finished pipeline"
        );
        self.summaries.push(summary);
    }
}

/// Searches the pipelines of a task for the lowest loss.
pub struct Optimizer {
    task: Task,
    factory: Arc<dyn ObjectiveFactory>,
    config: RunConfig,
    storage: StorageManager,
    cancel: CancelToken,
}

impl Optimizer {
    pub fn new(task: Task, factory: Arc<dyn ObjectiveFactory>, config: RunConfig) -> CsResult<Self> {
        // The pooled loop needs at least one active pipeline
        let active = config.max_active_pipelines;
        let config = config.with_max_active_pipelines(active);
        let storage = StorageManager::new(&config.results_dir)?;
        Ok(Self {
            task,
            factory,
            config,
            storage,
            cancel: CancelToken::new(),
        })
    }

    /// Cancelling this token stops the run; the best result so far is kept.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    fn best_result_path(&self) -> PathBuf {
        self.config
            .best_result_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(self.task.config().default_best_result_file()))
    }

    /// Optimize pipelines until the generator is exhausted, the evaluation
    /// time limit expires or the run is cancelled.
    pub fn do_optimization(&self) -> CsResult<OptimizationReport> {
        let started_at = Utc::now();
        let config = self.task.config();
        info!(
            task = %config,
            workers = self.config.workers,
            algorithm = %config.suggestion_algorithm,
            budget = config.total_evaluations(),
            "Starting optimization"
        );

        let mut state = RunState {
            generator: PipelineGenerator::from_task(&self.task),
            generator_done: false,
            generated: 0,
            best: BestTracker::new(self.best_result_path()),
            summaries: Vec::new(),
        };

        let termination = if self.config.workers == 0 {
            self.run_serial(&mut state)?
        } else {
            self.run_pooled(&mut state)?
        };

        let outcome = if state.generator_done && state.generated == 0 {
            warn!(
                input_type = %config.data_set_type,
                max_length = config.max_pipeline_length,
                "No pipeline could be constructed"
            );
            Outcome::NoPipelineFound {
                input_type: config.data_set_type.clone(),
                max_length: config.max_pipeline_length,
            }
        } else {
            match state.best.into_best() {
                Some(best) => Outcome::Best(best),
                None => Outcome::NoUsableResult,
            }
        };

        info!(pipelines = state.summaries.len(), termination = ?termination, "Optimization finished");
        Ok(OptimizationReport {
            outcome,
            termination,
            pipelines: state.summaries,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Build the session of one node chain. Store failures skip the pipeline.
    fn open_session(&self, index: usize, chain: &[String], cancel: CancelToken) -> CsResult<Option<PipelineSession>> {
        let config = self.task.config();
        let nodes = chain
            .iter()
            .map(|name| self.task.create_node(name))
            .collect::<Result<Vec<_>, _>>()?;
        let pipeline = Arc::new(Pipeline::new(nodes, config.input_path.as_str()));

        let descriptor = PipelineDescriptor {
            id: pipeline.dir_name(),
            nodes: pipeline.node_names(),
            input_path: config.input_path.clone(),
            created_at: Utc::now(),
        };
        let opened = self
            .storage
            .ensure_pipeline_dir(&descriptor)
            .and_then(|dir| Ok((TrialStore::open(&dir, config.restart_evaluation)?, dir)));
        let (store, dir) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                error!(pipeline = %pipeline.describe(), error = %e, "Cannot open trial store, skipping pipeline");
                return Ok(None);
            }
        };

        let objective = self.factory.objective(pipeline.clone(), &dir);
        Ok(Some(PipelineSession::new(
            index,
            pipeline,
            store,
            build_algorithm(config.suggestion_algorithm, config.seed),
            objective,
            SessionPolicy::from_config(config),
            cancel,
        )))
    }

    fn run_pooled(&self, state: &mut RunState) -> CsResult<Termination> {
        let deadline = self.task.config().max_eval_duration().map(|limit| Instant::now() + limit);
        let mut pool = WorkerPool::new(self.config.workers, &self.cancel)?;
        let mut sessions: BTreeMap<usize, PipelineSession> = BTreeMap::new();
        let mut next_index = 0;

        let termination = loop {
            if self.cancel.is_cancelled() {
                break Termination::Cancelled;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!("Evaluation time limit reached, terminating workers");
                break Termination::Timeout;
            }

            while sessions.len() < self.config.max_active_pipelines {
                let Some(chain) = state.next_chain() else {
                    break;
                };
                let index = next_index;
                next_index += 1;
                let Some(mut session) = self.open_session(index, &chain, pool.token().child())? else {
                    continue;
                };
                let mut completions = Vec::new();
                match session.begin(&mut completions) {
                    Ok(jobs) => submit(&mut pool, jobs)?,
                    Err(e) => session.fail(e.to_string()),
                }
                state.record(session.pipeline(), completions);
                sessions.insert(index, session);
            }

            let done: Vec<usize> = sessions.iter().filter(|(_, s)| s.is_done()).map(|(i, _)| *i).collect();
            for index in done {
                if let Some(session) = sessions.remove(&index) {
                    state.retire(&session);
                }
            }
            if sessions.is_empty() {
                if state.generator_done {
                    break Termination::Exhausted;
                }
                continue;
            }

            match pool.recv_timeout(self.config.poll_interval)? {
                Some(result) => {
                    let Some(session) = sessions.get_mut(&result.session) else {
                        warn!(session = result.session, trial = result.trial_id, "Result for unknown session");
                        continue;
                    };
                    debug!(
                        pipeline = %session.pipeline().id(),
                        trial = result.trial_id,
                        worker = result.worker,
                        elapsed = ?result.elapsed,
                        "Received result"
                    );
                    let mut completions = Vec::new();
                    match session.on_result(result, &mut completions) {
                        Ok(jobs) => submit(&mut pool, jobs)?,
                        Err(e) => session.fail(e.to_string()),
                    }
                    state.record(session.pipeline(), completions);
                }
                None => {
                    for session in sessions.values_mut() {
                        if let Err(e) = session.poll() {
                            session.fail(e.to_string());
                        }
                    }
                }
            }
        };

        match termination {
            Termination::Exhausted => pool.close(self.config.shutdown_grace),
            Termination::Timeout | Termination::Cancelled => {
                pool.terminate(self.config.shutdown_grace);
                for mut session in sessions.into_values() {
                    session.cancel();
                    state.retire(&session);
                }
            }
        }
        Ok(termination)
    }

    fn run_serial(&self, state: &mut RunState) -> CsResult<Termination> {
        let run_token = self.cancel.child();
        let watchdog = match self.task.config().max_eval_duration() {
            Some(limit) => Some(spawn_watchdog(limit, run_token.clone())?),
            None => None,
        };

        let mut index = 0;
        while !run_token.is_cancelled() {
            let Some(chain) = state.next_chain() else {
                break;
            };
            let Some(mut session) = self.open_session(index, &chain, run_token.child())? else {
                index += 1;
                continue;
            };
            index += 1;

            let mut completions = Vec::new();
            if let Err(e) = session.run_serial(&mut completions) {
                session.fail(e.to_string());
            }
            state.record(session.pipeline(), completions);
            state.retire(&session);
        }

        if let Some((stop, handle)) = watchdog {
            drop(stop);
            if handle.join().is_err() {
                error!("Watchdog thread panicked");
            }
        }

        Ok(if self.cancel.is_cancelled() {
            Termination::Cancelled
        } else if run_token.is_cancelled() {
            Termination::Timeout
        } else {
            Termination::Exhausted
        })
    }
}

fn submit(pool: &mut WorkerPool, jobs: Vec<Job>) -> CsResult<()> {
    for job in jobs {
        pool.submit(job)?;
    }
    Ok(())
}

/// Cancel `token` after `limit` unless the returned sender is dropped first.
fn spawn_watchdog(
    limit: Duration,
    token: CancelToken,
) -> CsResult<(crossbeam_channel::Sender<()>, thread::JoinHandle<()>)> {
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let handle = thread::Builder::new().name("cs-watchdog".into()).spawn(move || {
        select! {
            recv(stop_rx) -> _ => {}
            recv(after(limit)) -> _ => {
                warn!(?limit, "Evaluation time limit reached, cancelling evaluations");
                token.cancel();
            }
        }
    })?;
    Ok((stop_tx, handle))
}
