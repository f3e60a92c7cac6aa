//! # cs-optimizer
//!
//! Hyperparameter search over generated node pipelines for chainsearch.
//!
//! Provides suggestion algorithms (random, grid, Bayesian), the persistent
//! per-pipeline trial store, the worker pool evaluating trials and the
//! top-level optimizer that keeps the best result.

pub mod config;
pub mod evaluation;
pub mod optimization;
pub mod optimizer;
pub mod pool;
pub mod search;
pub mod trial;

pub use config::{BackendConfig, RunConfig, TaskFile, RESULTS_DIR_ENV};
pub use evaluation::{BackendObjectiveFactory, EvaluationRequest, Objective, ObjectiveFactory, PipelineObjective};
pub use optimization::{Completion, FinishReason, PipelineSession, PipelineSummary, SessionPolicy};
pub use optimizer::{BestResult, BestTracker, OptimizationReport, Optimizer, Outcome, Termination};
pub use pool::{Job, JobOutcome, JobResult, WorkerPool};
pub use search::{build_algorithm, BayesianSearch, GridSearch, RandomSearch, Suggestion, SuggestionAlgorithm};
pub use trial::{EnqueueOutcome, StateCounts, Trial, TrialResult, TrialState, TrialStatus, TrialStore};
