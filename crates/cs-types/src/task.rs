use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::SearchError;
use crate::parameters::ParameterKind;

/// Which suggestion algorithm proposes new parameter points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    #[default]
    Random,
    Grid,
    Bayesian,
}

impl FromStr for SuggestionKind {
    type Err = SearchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "random" => Ok(Self::Random),
            "grid" => Ok(Self::Grid),
            "bayesian" | "tpe" => Ok(Self::Bayesian),
            _ => Err(SearchError::UnknownAlgorithm { name: s.to_string() }),
        }
    }
}

impl fmt::Display for SuggestionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Random => "random",
            Self::Grid => "grid",
            Self::Bayesian => "bayesian",
        };
        f.write_str(name)
    }
}

/// Task-level override of a node parameter's search range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RangeSpec {
    /// Full distribution, e.g. `{"type": "uniform", "low": 0, "high": 1}`.
    Distribution(ParameterKind),
    /// List of values to choose from.
    Values(Vec<Value>),
    /// A single literal; never optimized.
    Value(Value),
}

impl RangeSpec {
    pub fn to_kind(&self) -> ParameterKind {
        match self {
            Self::Distribution(kind) => kind.clone(),
            Self::Values(values) => ParameterKind::Choice {
                choices: values.clone(),
            },
            Self::Value(value) => ParameterKind::Fixed {
                value: value.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRange {
    pub node: String,
    pub parameters: BTreeMap<String, RangeSpec>,
}

/// User-facing task description. Validated once into an immutable task
/// before the search starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub input_path: String,
    /// Type tag of the input data set, e.g. `TimeSeries`.
    pub data_set_type: String,
    pub class_labels: Vec<String>,
    pub main_class: String,
    #[serde(default = "default_max_pipeline_length")]
    pub max_pipeline_length: usize,
    #[serde(default = "default_metric")]
    pub metric: String,
    /// Higher metric values are better; the loss is the negated mean.
    #[serde(default)]
    pub is_performance_metric: bool,
    #[serde(default)]
    pub source_node: Option<String>,
    #[serde(default = "default_sink_node")]
    pub sink_node: String,
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub blacklist: Vec<String>,
    #[serde(default)]
    pub force_list: Vec<String>,
    /// Node categories that must occur in every pipeline.
    #[serde(default)]
    pub required_node_types: Vec<String>,
    #[serde(default)]
    pub node_weights: BTreeMap<String, f64>,
    #[serde(default)]
    pub parameter_ranges: Vec<ParameterRange>,
    #[serde(default = "default_evaluations_per_pass")]
    pub evaluations_per_pass: usize,
    #[serde(default = "default_passes")]
    pub passes: usize,
    #[serde(default)]
    pub suggestion_algorithm: SuggestionKind,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Discard stored trials of every pipeline before evaluating it.
    #[serde(default)]
    pub restart_evaluation: bool,
    #[serde(default)]
    pub check_after: Option<usize>,
    #[serde(default)]
    pub max_loss: Option<f64>,
    /// Wall-clock limit of the whole run in seconds.
    #[serde(default)]
    pub max_eval_time: Option<f64>,
    /// Wall-clock limit of a single pipeline in seconds.
    #[serde(default)]
    pub max_pipeline_time: Option<f64>,
    #[serde(default)]
    pub max_consecutive_failures: Option<usize>,
    #[serde(default = "default_min_invocation_spacing_ms")]
    pub min_invocation_spacing_ms: u64,
    /// Keep backend output directories after the metric has been read.
    #[serde(default)]
    pub keep_results: bool,
}

fn default_max_pipeline_length() -> usize {
    3
}

fn default_metric() -> String {
    "Percent_incorrect".to_string()
}

fn default_sink_node() -> String {
    "PerformanceSinkNode".to_string()
}

fn default_evaluations_per_pass() -> usize {
    10
}

fn default_passes() -> usize {
    1
}

fn default_min_invocation_spacing_ms() -> u64 {
    1000
}

impl TaskConfig {
    pub fn new(
        input_path: impl Into<String>,
        data_set_type: impl Into<String>,
        class_labels: Vec<String>,
        main_class: impl Into<String>,
    ) -> Self {
        Self {
            input_path: input_path.into(),
            data_set_type: data_set_type.into(),
            class_labels,
            main_class: main_class.into(),
            max_pipeline_length: default_max_pipeline_length(),
            metric: default_metric(),
            is_performance_metric: false,
            source_node: None,
            sink_node: default_sink_node(),
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            force_list: Vec::new(),
            required_node_types: Vec::new(),
            node_weights: BTreeMap::new(),
            parameter_ranges: Vec::new(),
            evaluations_per_pass: default_evaluations_per_pass(),
            passes: default_passes(),
            suggestion_algorithm: SuggestionKind::default(),
            seed: None,
            restart_evaluation: false,
            check_after: None,
            max_loss: None,
            max_eval_time: None,
            max_pipeline_time: None,
            max_consecutive_failures: None,
            min_invocation_spacing_ms: default_min_invocation_spacing_ms(),
            keep_results: false,
        }
    }

    pub fn with_max_pipeline_length(mut self, length: usize) -> Self {
        self.max_pipeline_length = length;
        self
    }

    pub fn with_metric(mut self, metric: impl Into<String>, is_performance_metric: bool) -> Self {
        self.metric = metric.into();
        self.is_performance_metric = is_performance_metric;
        self
    }

    pub fn with_source_node(mut self, node: impl Into<String>) -> Self {
        self.source_node = Some(node.into());
        self
    }

    pub fn with_sink_node(mut self, node: impl Into<String>) -> Self {
        self.sink_node = node.into();
        self
    }

    pub fn with_whitelist(mut self, nodes: Vec<String>) -> Self {
        self.whitelist = nodes;
        self
    }

    pub fn with_blacklist(mut self, nodes: Vec<String>) -> Self {
        self.blacklist = nodes;
        self
    }

    pub fn with_force_list(mut self, nodes: Vec<String>) -> Self {
        self.force_list = nodes;
        self
    }

    pub fn with_required_node_types(mut self, types: Vec<String>) -> Self {
        self.required_node_types = types;
        self
    }

    pub fn with_node_weight(mut self, node: impl Into<String>, weight: f64) -> Self {
        self.node_weights.insert(node.into(), weight);
        self
    }

    pub fn with_parameter_range(
        mut self,
        node: impl Into<String>,
        parameter: impl Into<String>,
        range: RangeSpec,
    ) -> Self {
        let node = node.into();
        match self.parameter_ranges.iter_mut().find(|r| r.node == node) {
            Some(existing) => {
                existing.parameters.insert(parameter.into(), range);
            }
            None => self.parameter_ranges.push(ParameterRange {
                node,
                parameters: BTreeMap::from([(parameter.into(), range)]),
            }),
        }
        self
    }

    pub fn with_evaluations(mut self, evaluations_per_pass: usize, passes: usize) -> Self {
        self.evaluations_per_pass = evaluations_per_pass;
        self.passes = passes;
        self
    }

    pub fn with_suggestion(mut self, kind: SuggestionKind, seed: Option<u64>) -> Self {
        self.suggestion_algorithm = kind;
        self.seed = seed;
        self
    }

    pub fn with_restart_evaluation(mut self, restart: bool) -> Self {
        self.restart_evaluation = restart;
        self
    }

    pub fn with_early_abort(mut self, check_after: usize, max_loss: f64) -> Self {
        self.check_after = Some(check_after);
        self.max_loss = Some(max_loss);
        self
    }

    pub fn with_max_eval_time(mut self, limit: Duration) -> Self {
        self.max_eval_time = Some(limit.as_secs_f64());
        self
    }

    pub fn with_max_pipeline_time(mut self, limit: Duration) -> Self {
        self.max_pipeline_time = Some(limit.as_secs_f64());
        self
    }

    pub fn with_max_consecutive_failures(mut self, failures: usize) -> Self {
        self.max_consecutive_failures = Some(failures);
        self
    }

    pub fn with_min_invocation_spacing(mut self, spacing: Duration) -> Self {
        self.min_invocation_spacing_ms = spacing.as_millis() as u64;
        self
    }

    pub fn with_keep_results(mut self, keep: bool) -> Self {
        self.keep_results = keep;
        self
    }

    /// Total trial budget of one pipeline.
    pub fn total_evaluations(&self) -> usize {
        self.evaluations_per_pass * self.passes
    }

    /// `(check_after, max_loss)` when early abort is configured.
    pub fn early_abort(&self) -> Option<(usize, f64)> {
        Some((self.check_after?, self.max_loss?))
    }

    pub fn max_eval_duration(&self) -> Option<Duration> {
        self.max_eval_time
            .filter(|secs| *secs > 0.0)
            .map(Duration::from_secs_f64)
    }

    pub fn pipeline_time_limit(&self) -> Option<Duration> {
        self.max_pipeline_time
            .filter(|secs| *secs > 0.0)
            .map(Duration::from_secs_f64)
    }

    pub fn min_invocation_spacing(&self) -> Duration {
        Duration::from_millis(self.min_invocation_spacing_ms)
    }

    /// Where the best operation spec is written unless overridden.
    pub fn default_best_result_file(&self) -> String {
        format!("{}_best.yaml", self.input_path)
    }

    pub fn parameter_range(&self, node: &str) -> Option<&BTreeMap<String, RangeSpec>> {
        self.parameter_ranges
            .iter()
            .find(|r| r.node == node)
            .map(|r| &r.parameters)
    }
}

impl fmt::Display for TaskConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task<{}>", self.input_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn minimal_json_uses_defaults() {
        let config: TaskConfig = serde_json::from_value(json!({
            "input_path": "example_summary_split",
            "data_set_type": "TimeSeries",
            "class_labels": ["Standard", "Target"],
            "main_class": "Target"
        }))
        .unwrap();

        assert_eq!(config.max_pipeline_length, 3);
        assert_eq!(config.metric, "Percent_incorrect");
        assert_eq!(config.sink_node, "PerformanceSinkNode");
        assert_eq!(config.total_evaluations(), 10);
        assert_eq!(config.suggestion_algorithm, SuggestionKind::Random);
        assert_eq!(config.min_invocation_spacing(), Duration::from_secs(1));
        assert_eq!(config.early_abort(), None);
        assert_eq!(config.max_eval_duration(), None);
        assert_eq!(config.default_best_result_file(), "example_summary_split_best.yaml");
    }

    #[test]
    fn parameter_ranges_parse_all_shapes() {
        let config: TaskConfig = serde_json::from_value(json!({
            "input_path": "data",
            "data_set_type": "FeatureVector",
            "class_labels": ["a", "b"],
            "main_class": "a",
            "parameter_ranges": [{
                "node": "SorSvmNode",
                "parameters": {
                    "complexity": {"type": "log_uniform", "low": 0.01, "high": 10.0},
                    "kernel_type": ["LINEAR", "RBF"],
                    "max_iterations": 100
                }
            }]
        }))
        .unwrap();

        let ranges = config.parameter_range("SorSvmNode").unwrap();
        assert_eq!(
            ranges["complexity"].to_kind(),
            ParameterKind::LogUniform { low: 0.01, high: 10.0 }
        );
        assert_eq!(
            ranges["kernel_type"].to_kind(),
            ParameterKind::Choice { choices: vec![json!("LINEAR"), json!("RBF")] }
        );
        assert_eq!(
            ranges["max_iterations"].to_kind(),
            ParameterKind::Fixed { value: json!(100) }
        );
        assert!(config.parameter_range("Other").is_none());
    }

    #[test]
    fn builders_compose() {
        let config = TaskConfig::new("data", "TimeSeries", vec!["a".into(), "b".into()], "a")
            .with_evaluations(5, 3)
            .with_early_abort(2, 1.0)
            .with_max_eval_time(Duration::from_secs(60))
            .with_parameter_range("N", "x", RangeSpec::Value(json!(1)))
            .with_parameter_range("N", "y", RangeSpec::Value(json!(2)));

        assert_eq!(config.total_evaluations(), 15);
        assert_eq!(config.early_abort(), Some((2, 1.0)));
        assert_eq!(config.max_eval_duration(), Some(Duration::from_secs(60)));
        assert_eq!(config.parameter_ranges.len(), 1);
        assert_eq!(config.parameter_range("N").map(BTreeMap::len), Some(2));
    }

    #[test]
    fn suggestion_kind_parses_names() {
        assert_eq!("grid".parse::<SuggestionKind>().unwrap(), SuggestionKind::Grid);
        assert_eq!("TPE".parse::<SuggestionKind>().unwrap(), SuggestionKind::Bayesian);
        assert!(matches!(
            "anneal".parse::<SuggestionKind>(),
            Err(SearchError::UnknownAlgorithm { .. })
        ));
    }
}
