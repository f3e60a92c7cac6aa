//! Objective functions turning a parameter assignment into a loss.

use std::any::Any;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cs_data::MetricSummary;
use cs_engine::{Backend, BackendRequest, InvocationThrottle, Pipeline, Task};
use cs_types::{Assignment, CancelToken, EvaluationError, SearchSpace};
use tracing::{debug, info, warn};

use crate::trial::TrialResult;

/// What an objective receives for one trial.
#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    pub trial_id: u64,
    pub parameters: Assignment,
    pub cancel: CancelToken,
}

/// Scores one parameter assignment. Implementations are called from worker
/// threads and must tolerate concurrent calls.
pub trait Objective: Send + Sync {
    fn evaluate(&self, request: &EvaluationRequest) -> Result<TrialResult, EvaluationError>;
}

/// Builds the objective of each pipeline the optimizer visits.
pub trait ObjectiveFactory: Send + Sync {
    /// `pipeline_dir` is the pipeline's directory below the results root.
    fn objective(&self, pipeline: Arc<Pipeline>, pipeline_dir: &Path) -> Arc<dyn Objective>;
}

/// Runs a pipeline through a backend and reads its metric summary.
pub struct PipelineObjective {
    pipeline: Arc<Pipeline>,
    space: SearchSpace,
    backend: Arc<dyn Backend>,
    base_result_dir: PathBuf,
    metric: String,
    is_performance_metric: bool,
    throttle: InvocationThrottle,
    keep_results: bool,
}

impl PipelineObjective {
    pub fn new(
        pipeline: Arc<Pipeline>,
        backend: Arc<dyn Backend>,
        base_result_dir: impl Into<PathBuf>,
        metric: impl Into<String>,
        is_performance_metric: bool,
    ) -> Self {
        let space = pipeline.parameter_space();
        Self {
            pipeline,
            space,
            backend,
            base_result_dir: base_result_dir.into(),
            metric: metric.into(),
            is_performance_metric,
            throttle: InvocationThrottle::new(std::time::Duration::ZERO),
            keep_results: false,
        }
    }

    /// Minimum interval between two backend invocations of this pipeline.
    pub fn with_throttle(mut self, throttle: InvocationThrottle) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_keep_results(mut self, keep: bool) -> Self {
        self.keep_results = keep;
        self
    }

    /// Loss from the output directory; a missing `results.csv` is a failed run.
    fn read_loss(&self, output_dir: &Path) -> Result<TrialResult, EvaluationError> {
        if !output_dir.join(cs_data::RESULTS_FILE).is_file() {
            info!(
                pipeline = %self.pipeline.id(),
                output = %output_dir.display(),
                "No results found, returning infinite loss"
            );
            return Ok(TrialResult::failed());
        }

        let mean = MetricSummary::from_output_dir(output_dir)?.mean(&self.metric)?;
        if !mean.is_finite() {
            warn!(
                pipeline = %self.pipeline.id(),
                metric = %self.metric,
                "Metric mean is {}, returning infinite loss", mean
            );
            return Ok(TrialResult::failed());
        }
        let loss = if self.is_performance_metric { -mean } else { mean };
        Ok(TrialResult::ok(loss))
    }
}

impl Objective for PipelineObjective {
    fn evaluate(&self, request: &EvaluationRequest) -> Result<TrialResult, EvaluationError> {
        let settings = self.space.resolve(&request.parameters)?;

        self.throttle.wait();
        if request.cancel.is_cancelled() {
            return Err(EvaluationError::Cancelled);
        }

        let backend_request = BackendRequest {
            base_result_dir: self.base_result_dir.clone(),
            trial_id: request.trial_id,
            cancel: request.cancel.clone(),
        };
        let output_dir = self
            .pipeline
            .execute(self.backend.as_ref(), &[settings], &backend_request)?;

        let result = self.read_loss(&output_dir);
        if !self.keep_results {
            if let Err(e) = fs::remove_dir_all(&output_dir) {
                warn!(output = %output_dir.display(), "Error while deleting the result dir: {}", e);
            }
        }

        if let Ok(result) = &result {
            debug!(pipeline = %self.pipeline.id(), trial = request.trial_id, loss = result.loss, "Evaluated trial");
        }
        result
    }
}

/// Creates a [`PipelineObjective`] per pipeline, sharing one backend.
pub struct BackendObjectiveFactory {
    backend: Arc<dyn Backend>,
    metric: String,
    is_performance_metric: bool,
    spacing: std::time::Duration,
    keep_results: bool,
}

impl BackendObjectiveFactory {
    pub fn new(task: &Task, backend: Arc<dyn Backend>) -> Self {
        let config = task.config();
        Self {
            backend,
            metric: config.metric.clone(),
            is_performance_metric: config.is_performance_metric,
            spacing: config.min_invocation_spacing(),
            keep_results: config.keep_results,
        }
    }
}

impl ObjectiveFactory for BackendObjectiveFactory {
    fn objective(&self, pipeline: Arc<Pipeline>, pipeline_dir: &Path) -> Arc<dyn Objective> {
        Arc::new(
            PipelineObjective::new(
                pipeline,
                self.backend.clone(),
                pipeline_dir,
                self.metric.clone(),
                self.is_performance_metric,
            )
            .with_throttle(InvocationThrottle::new(self.spacing))
            .with_keep_results(self.keep_results),
        )
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
