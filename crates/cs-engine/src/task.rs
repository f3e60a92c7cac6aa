use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use cs_types::{
    config_error, ConfigError, NodeRegistry, NodeSpec, ParameterDef, ParameterKind, RangeSpec,
    SearchSpace, TaskConfig,
};
use serde_json::Value;
use tracing::debug;

use crate::pipeline::{NodeRole, PipelineNode};

/// Node categories that never take part in generated pipelines.
pub const EXCLUDED_CATEGORIES: [&str; 5] = ["data_selection", "debug", "meta", "splitter", "visualization"];

/// A validated, immutable task together with the registry it was checked against.
#[derive(Clone)]
pub struct Task {
    config: TaskConfig,
    registry: Arc<dyn NodeRegistry>,
    nodes: BTreeSet<String>,
    nodes_by_input_type: BTreeMap<String, Vec<String>>,
}

impl Task {
    /// Validate `config` against the registry. All configuration errors are
    /// reported here, before any search or evaluation starts.
    pub fn new(config: TaskConfig, registry: Arc<dyn NodeRegistry>) -> Result<Self, ConfigError> {
        Self::validate(&config, registry.as_ref())?;

        let nodes = Self::select_nodes(&config, registry.as_ref());
        Self::validate_schemas(&config, registry.as_ref(), &nodes)?;
        let mut nodes_by_input_type: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for name in &nodes {
            for input_type in registry.get_input_types(name) {
                nodes_by_input_type.entry(input_type).or_default().push(name.clone());
            }
        }

        let task = Self {
            config,
            registry,
            nodes,
            nodes_by_input_type,
        };
        debug!(
            task = %task.config,
            nodes = task.nodes.len(),
            input_types = task.nodes_by_input_type.len(),
            "Task validated"
        );
        Ok(task)
    }

    fn validate(config: &TaskConfig, registry: &dyn NodeRegistry) -> Result<(), ConfigError> {
        if config.max_pipeline_length < 2 {
            return Err(config_error!(
                "max_pipeline_length",
                "must be at least 2, got {}",
                config.max_pipeline_length
            ));
        }
        if config.evaluations_per_pass == 0 {
            return Err(config_error!("evaluations_per_pass", "must be at least 1"));
        }
        if config.passes == 0 {
            return Err(config_error!("passes", "must be at least 1"));
        }
        if config.check_after == Some(0) {
            return Err(config_error!("check_after", "must be at least 1"));
        }
        if let Some(max_loss) = config.max_loss {
            if max_loss.is_nan() {
                return Err(config_error!("max_loss", "must be a number"));
            }
        }
        if config.metric.is_empty() {
            return Err(config_error!("metric", "must not be empty"));
        }

        for (list, names) in [
            ("white list", &config.whitelist),
            ("black list", &config.blacklist),
            ("force list", &config.force_list),
        ] {
            if let Some(node) = names.iter().find(|node| !registry.contains(node)) {
                return Err(ConfigError::UnknownNode {
                    node: node.clone(),
                    list: list.to_string(),
                });
            }
        }

        for (node, weight) in &config.node_weights {
            if !registry.contains(node) {
                return Err(ConfigError::UnknownNode {
                    node: node.clone(),
                    list: "weight dict".to_string(),
                });
            }
            if !weight.is_finite() || *weight < 0.0 {
                return Err(ConfigError::InvalidWeight {
                    node: node.clone(),
                    weight: *weight,
                });
            }
        }

        for range in &config.parameter_ranges {
            if !registry.contains(&range.node) {
                return Err(ConfigError::UnknownNode {
                    node: range.node.clone(),
                    list: "parameter ranges".to_string(),
                });
            }
            for (parameter, spec) in &range.parameters {
                spec.to_kind()
                    .validate()
                    .map_err(|message| ConfigError::InvalidParameterRange {
                        node: range.node.clone(),
                        parameter: parameter.clone(),
                        message,
                    })?;
            }
        }

        if config.class_labels.is_empty() {
            return Err(ConfigError::NoClassLabels);
        }
        if !config.class_labels.contains(&config.main_class) {
            return Err(ConfigError::MainClassNotLabel {
                main_class: config.main_class.clone(),
            });
        }

        if let Some(source) = &config.source_node {
            let valid = registry
                .lookup(source)
                .is_some_and(|spec| spec.is_source() && spec.accepts(&config.data_set_type));
            if !valid {
                return Err(ConfigError::InvalidSourceNode {
                    node: source.clone(),
                    data_type: config.data_set_type.clone(),
                });
            }
        }

        match registry.lookup(&config.sink_node) {
            Some(spec) if spec.is_sink() => {
                if spec.input_types.is_empty() {
                    return Err(ConfigError::SinkAcceptsNothing {
                        node: config.sink_node.clone(),
                    });
                }
            }
            _ => {
                return Err(ConfigError::InvalidSinkNode {
                    node: config.sink_node.clone(),
                })
            }
        }

        if let Some(node) = config.force_list.iter().find(|n| config.blacklist.contains(n)) {
            return Err(ConfigError::ForcedAndBlacklisted { node: node.clone() });
        }
        if config.blacklist.contains(&config.sink_node) {
            return Err(config_error!("blacklist", "must not contain the sink node '{}'", config.sink_node));
        }
        if let Some(source) = config.source_node.as_ref().filter(|s| config.blacklist.contains(s)) {
            return Err(config_error!("blacklist", "must not contain the source node '{}'", source));
        }

        Ok(())
    }

    /// Registry schemas of the usable intermediate nodes must be sampleable.
    /// Parameters replaced by a task range are checked with the task range.
    fn validate_schemas(
        config: &TaskConfig,
        registry: &dyn NodeRegistry,
        nodes: &BTreeSet<String>,
    ) -> Result<(), ConfigError> {
        for name in nodes {
            let Some(spec) = registry.lookup(name) else {
                continue;
            };
            if spec.is_source() || spec.is_sink() || *name == config.sink_node {
                continue;
            }
            let overrides = config.parameter_range(name);
            for parameter in spec.effective_schema() {
                if overrides.is_some_and(|o| o.contains_key(&parameter.name)) {
                    continue;
                }
                parameter
                    .kind
                    .validate()
                    .map_err(|message| ConfigError::InvalidParameterRange {
                        node: name.clone(),
                        parameter: parameter.name.clone(),
                        message,
                    })?;
            }
        }
        Ok(())
    }

    fn is_valid_category(spec: &NodeSpec) -> bool {
        !EXCLUDED_CATEGORIES.contains(&spec.category.as_str())
    }

    /// Nodes usable in pipelines of this task.
    ///
    /// With a white list only the listed nodes plus the sink and the source
    /// node(s) are used. Black-listed nodes are always removed; forced nodes
    /// are always kept.
    fn select_nodes(config: &TaskConfig, registry: &dyn NodeRegistry) -> BTreeSet<String> {
        let valid = |name: &String| registry.lookup(name).is_some_and(Self::is_valid_category);

        let mut nodes: BTreeSet<String> = if config.whitelist.is_empty() {
            registry.names().into_iter().filter(valid).collect()
        } else {
            let mut nodes: BTreeSet<String> = config.whitelist.iter().filter(|n| valid(*n)).cloned().collect();
            nodes.insert(config.sink_node.clone());
            match &config.source_node {
                Some(source) => {
                    nodes.insert(source.clone());
                }
                None => nodes.extend(
                    registry
                        .names()
                        .into_iter()
                        .filter(|n| registry.lookup(n).is_some_and(NodeSpec::is_source)),
                ),
            }
            nodes
        };

        nodes.extend(config.force_list.iter().cloned());
        nodes.retain(|n| !config.blacklist.contains(n));
        nodes
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<dyn NodeRegistry> {
        &self.registry
    }

    pub fn available_nodes(&self) -> &BTreeSet<String> {
        &self.nodes
    }

    pub fn nodes_by_input_type(&self) -> &BTreeMap<String, Vec<String>> {
        &self.nodes_by_input_type
    }

    pub fn required_nodes(&self) -> BTreeSet<String> {
        self.config.force_list.iter().cloned().collect()
    }

    /// Configured weight, or `1 / n` where `n` counts the usable nodes that
    /// share an input type with `node`. Rare input types get higher weights.
    pub fn node_weight(&self, node: &str) -> f64 {
        if let Some(weight) = self.config.node_weights.get(node) {
            return *weight;
        }
        let count: usize = self
            .registry
            .get_input_types(node)
            .iter()
            .map(|t| self.nodes_by_input_type.get(t).map_or(0, Vec::len))
            .sum();
        if count == 0 {
            0.0
        } else {
            1.0 / count as f64
        }
    }

    /// Nodes per input type, highest weight first, ties broken by name.
    pub fn weighted_nodes_by_input_type(&self) -> BTreeMap<String, Vec<String>> {
        self.nodes_by_input_type
            .iter()
            .map(|(input_type, nodes)| {
                let mut weighted: Vec<(f64, String)> =
                    nodes.iter().map(|n| (self.node_weight(n), n.clone())).collect();
                weighted.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
                (input_type.clone(), weighted.into_iter().map(|(_, n)| n).collect())
            })
            .collect()
    }

    /// Materialize a registry node for use in a pipeline of this task.
    pub fn create_node(&self, name: &str) -> Result<PipelineNode, ConfigError> {
        let spec = self
            .registry
            .lookup(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownNode {
                node: name.to_string(),
                list: "pipeline".to_string(),
            })?;

        let role = if name == self.config.sink_node || spec.is_sink() {
            NodeRole::Sink
        } else if spec.is_source() {
            NodeRole::Source
        } else {
            NodeRole::Intermediate
        };

        let overrides = self.config.parameter_range(name);
        let mut space = SearchSpace::new();
        let mut fixed = BTreeMap::new();

        match role {
            NodeRole::Source | NodeRole::Sink => {
                // Only task-provided literals; these nodes are never optimized.
                for (parameter, range) in overrides.into_iter().flatten() {
                    let value = match range {
                        RangeSpec::Value(value) => value.clone(),
                        RangeSpec::Values(values) if values.len() == 1 => values[0].clone(),
                        _ => {
                            return Err(ConfigError::InvalidParameterRange {
                                node: name.to_string(),
                                parameter: parameter.clone(),
                                message: "source and sink nodes only accept fixed values".to_string(),
                            })
                        }
                    };
                    fixed.insert(parameter.clone(), value);
                }
                if role == NodeRole::Sink {
                    fixed.insert("ir_class".to_string(), Value::from(self.config.main_class.clone()));
                    fixed.insert(
                        "classes_names".to_string(),
                        Value::from(self.config.class_labels.clone()),
                    );
                }
            }
            NodeRole::Intermediate => {
                let mut kinds: BTreeMap<String, ParameterKind> = spec
                    .effective_schema()
                    .into_iter()
                    .map(|p| (p.name, p.kind))
                    .collect();
                for (parameter, range) in overrides.into_iter().flatten() {
                    kinds.insert(parameter.clone(), range.to_kind());
                }
                if spec.has_parameter("class_labels") {
                    kinds.insert(
                        "class_labels".to_string(),
                        ParameterKind::Fixed {
                            value: Value::from(self.config.class_labels.clone()),
                        },
                    );
                }

                for (parameter, kind) in kinds {
                    match kind {
                        ParameterKind::Fixed { value } => {
                            fixed.insert(parameter, value);
                        }
                        kind => space.insert(ParameterDef::new(name, &parameter, kind)),
                    }
                }
            }
        }

        Ok(PipelineNode::new(spec, role, space, fixed))
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("config", &self.config)
            .field("nodes", &self.nodes)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.config, f)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use cs_types::{DefaultValue, NodeSpec, OutputRule, StaticRegistry, SINK_CATEGORY, SOURCE_CATEGORY};
    use serde_json::json;

    pub(crate) fn eeg_registry() -> StaticRegistry {
        StaticRegistry::new()
            .with_node(NodeSpec::new("TimeSeriesSourceNode", SOURCE_CATEGORY).with_inputs(["TimeSeries"]))
            .with_node(
                NodeSpec::new("FeatureVectorSourceNode", SOURCE_CATEGORY).with_inputs(["FeatureVector"]),
            )
            .with_node(
                NodeSpec::new("DecimationNode", "preprocessing")
                    .with_inputs(["TimeSeries"])
                    .with_default("target_frequency", DefaultValue::Float(25.0))
                    .with_default("debug", DefaultValue::Bool(false)),
            )
            .with_node(
                NodeSpec::new("TimeDomainFeaturesNode", "feature_generation")
                    .with_inputs(["TimeSeries"])
                    .with_output(OutputRule::Fixed("FeatureVector".into()))
                    .with_default("datapoints", DefaultValue::List(vec![json!([1, 2]), json!([3])])),
            )
            .with_node(
                NodeSpec::new("SorSvmNode", "classification")
                    .with_inputs(["FeatureVector"])
                    .with_output(OutputRule::Fixed("PredictionVector".into()))
                    .with_default("complexity", DefaultValue::Float(1.0))
                    .with_default("class_labels", DefaultValue::Other(Value::Null)),
            )
            .with_node(
                NodeSpec::new("CrossValidationSplitterNode", "splitter").with_inputs(["TimeSeries"]),
            )
            .with_node(
                NodeSpec::new("PerformanceSinkNode", SINK_CATEGORY).with_inputs(["PredictionVector"]),
            )
    }

    pub(crate) fn eeg_config() -> TaskConfig {
        TaskConfig::new(
            "example_summary_split",
            "TimeSeries",
            vec!["Standard".into(), "Target".into()],
            "Target",
        )
    }

    fn task(config: TaskConfig) -> Result<Task, ConfigError> {
        Task::new(config, Arc::new(eeg_registry()))
    }

    #[test]
    fn test_valid_task_excludes_invalid_categories() {
        let task = task(eeg_config()).unwrap();
        assert!(!task.available_nodes().contains("CrossValidationSplitterNode"));
        assert!(task.available_nodes().contains("DecimationNode"));
        assert_eq!(
            task.nodes_by_input_type()["TimeSeries"],
            vec!["DecimationNode", "TimeDomainFeaturesNode", "TimeSeriesSourceNode"]
        );
    }

    #[test]
    fn test_configuration_errors() {
        assert!(matches!(
            task(eeg_config().with_whitelist(vec!["NoSuchNode".into()])),
            Err(ConfigError::UnknownNode { ref list, .. }) if list == "white list"
        ));
        assert!(matches!(
            task(eeg_config().with_node_weight("NoSuchNode", 1.0)),
            Err(ConfigError::UnknownNode { ref list, .. }) if list == "weight dict"
        ));
        assert!(matches!(
            task(eeg_config().with_node_weight("SorSvmNode", -1.0)),
            Err(ConfigError::InvalidWeight { .. })
        ));

        let mut no_labels = eeg_config();
        no_labels.class_labels.clear();
        assert_eq!(task(no_labels).unwrap_err(), ConfigError::NoClassLabels);

        let mut wrong_main = eeg_config();
        wrong_main.main_class = "Other".into();
        assert!(matches!(task(wrong_main), Err(ConfigError::MainClassNotLabel { .. })));

        assert!(matches!(
            task(eeg_config().with_source_node("FeatureVectorSourceNode")),
            Err(ConfigError::InvalidSourceNode { .. })
        ));
        assert!(matches!(
            task(eeg_config().with_source_node("DecimationNode")),
            Err(ConfigError::InvalidSourceNode { .. })
        ));
        assert!(matches!(
            task(eeg_config().with_sink_node("SorSvmNode")),
            Err(ConfigError::InvalidSinkNode { .. })
        ));
        assert!(matches!(
            task(eeg_config()
                .with_force_list(vec!["DecimationNode".into()])
                .with_blacklist(vec!["DecimationNode".into()])),
            Err(ConfigError::ForcedAndBlacklisted { .. })
        ));
        assert!(matches!(
            task(eeg_config().with_max_pipeline_length(1)),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "max_pipeline_length"
        ));
        assert!(matches!(
            task(eeg_config().with_parameter_range(
                "SorSvmNode",
                "complexity",
                RangeSpec::Distribution(ParameterKind::Uniform { low: 1.0, high: 0.0 })
            )),
            Err(ConfigError::InvalidParameterRange { .. })
        ));
    }

    #[test]
    fn test_invalid_registry_schema_is_rejected() {
        let registry = eeg_registry().with_node(
            NodeSpec::new("BandPassFilterNode", "preprocessing")
                .with_inputs(["TimeSeries"])
                .with_parameter("cutoff", ParameterKind::LogUniform { low: 0.0, high: 10.0 }),
        );
        let result = Task::new(eeg_config(), Arc::new(registry.clone()));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidParameterRange { ref node, ref parameter, .. })
                if node == "BandPassFilterNode" && parameter == "cutoff"
        ));

        // A task range replaces the broken entry
        let fixed = eeg_config().with_parameter_range(
            "BandPassFilterNode",
            "cutoff",
            RangeSpec::Distribution(ParameterKind::LogUniform { low: 0.1, high: 10.0 }),
        );
        assert!(Task::new(fixed, Arc::new(registry.clone())).is_ok());

        // Black-listed nodes are never sampled
        let without = eeg_config().with_blacklist(vec!["BandPassFilterNode".into()]);
        assert!(Task::new(without, Arc::new(registry)).is_ok());

        let reversed = eeg_registry().with_node(
            NodeSpec::new("ScaleNode", "preprocessing")
                .with_inputs(["TimeSeries"])
                .with_parameter("factor", ParameterKind::Uniform { low: 2.0, high: 1.0 }),
        );
        assert!(matches!(
            Task::new(eeg_config(), Arc::new(reversed)),
            Err(ConfigError::InvalidParameterRange { .. })
        ));
    }

    #[test]
    fn test_empty_registry_choice_is_rejected() {
        let registry = eeg_registry().with_node(
            NodeSpec::new("WindowNode", "preprocessing")
                .with_inputs(["TimeSeries"])
                .with_parameter("shape", ParameterKind::Choice { choices: vec![] }),
        );
        let result = Task::new(eeg_config(), Arc::new(registry));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidParameterRange { ref message, .. }) if message.contains("without choices")
        ));
    }

    #[test]
    fn test_sink_without_inputs_is_rejected() {
        let registry = eeg_registry().with_node(NodeSpec::new("DeafSinkNode", SINK_CATEGORY));
        let result = Task::new(eeg_config().with_sink_node("DeafSinkNode"), Arc::new(registry));
        assert!(matches!(result, Err(ConfigError::SinkAcceptsNothing { .. })));
    }

    #[test]
    fn test_whitelist_keeps_sink_and_sources() {
        let task = task(eeg_config().with_whitelist(vec!["SorSvmNode".into()])).unwrap();
        let nodes: Vec<&str> = task.available_nodes().iter().map(String::as_str).collect();
        assert_eq!(
            nodes,
            vec!["FeatureVectorSourceNode", "PerformanceSinkNode", "SorSvmNode", "TimeSeriesSourceNode"]
        );

        let with_source = task_with_source();
        assert!(!with_source.available_nodes().contains("FeatureVectorSourceNode"));
    }

    fn task_with_source() -> Task {
        task(eeg_config()
            .with_whitelist(vec!["SorSvmNode".into()])
            .with_source_node("TimeSeriesSourceNode"))
        .unwrap()
    }

    #[test]
    fn test_blacklist_removes_nodes() {
        let task = task(eeg_config().with_blacklist(vec!["DecimationNode".into()])).unwrap();
        assert!(!task.available_nodes().contains("DecimationNode"));
    }

    #[test]
    fn test_node_weights_and_ordering() {
        let task = task(eeg_config().with_node_weight("TimeSeriesSourceNode", 5.0)).unwrap();
        // Three usable nodes accept TimeSeries
        assert!((task.node_weight("DecimationNode") - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(task.node_weight("TimeSeriesSourceNode"), 5.0);

        let weighted = task.weighted_nodes_by_input_type();
        assert_eq!(
            weighted["TimeSeries"],
            vec!["TimeSeriesSourceNode", "DecimationNode", "TimeDomainFeaturesNode"]
        );
    }

    #[test]
    fn test_create_node_roles_and_parameters() {
        let task = task(eeg_config().with_parameter_range(
            "SorSvmNode",
            "complexity",
            RangeSpec::Values(vec![json!(0.1), json!(1.0)]),
        ))
        .unwrap();

        let svm = task.create_node("SorSvmNode").unwrap();
        assert_eq!(svm.role(), NodeRole::Intermediate);
        assert_eq!(
            svm.space().get("SorSvmNode_complexity").map(|p| &p.kind),
            Some(&ParameterKind::Choice { choices: vec![json!(0.1), json!(1.0)] })
        );
        assert_eq!(svm.fixed().get("class_labels"), Some(&json!(["Standard", "Target"])));

        let decimation = task.create_node("DecimationNode").unwrap();
        assert_eq!(decimation.space().len(), 1);
        assert!(decimation.space().get("DecimationNode_debug").is_none());

        let sink = task.create_node("PerformanceSinkNode").unwrap();
        assert_eq!(sink.role(), NodeRole::Sink);
        assert!(sink.space().is_empty());
        assert_eq!(sink.fixed().get("ir_class"), Some(&json!("Target")));

        let source = task.create_node("TimeSeriesSourceNode").unwrap();
        assert_eq!(source.role(), NodeRole::Source);
        assert!(source.fixed().is_empty());

        assert!(task.create_node("Missing").is_err());
    }
}
