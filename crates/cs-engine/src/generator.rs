//! Depth-first enumeration of type-compatible node chains.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use cs_types::NodeRegistry;
use tracing::{debug, warn};

use crate::task::Task;

/// Constraints every generated chain must satisfy.
#[derive(Debug, Clone, Default)]
pub struct ChainConstraints {
    /// Node names that must appear in every chain.
    pub required_nodes: BTreeSet<String>,
    /// Node categories that must appear in every chain.
    pub required_types: BTreeSet<String>,
    /// Fixed first node; otherwise any source-category node may start a chain.
    pub source: Option<String>,
    /// Last node of every chain.
    pub sink: String,
}

/// One depth of the search: the candidates for slot `index`.
#[derive(Debug)]
struct Frame {
    input_type: String,
    candidates: Vec<String>,
    cursor: usize,
    index: usize,
    first: bool,
}

/// Lazily yields every valid node chain (sink included).
///
/// Each chain has at most `max_length` entries, starts with a source node,
/// ends with the sink and never repeats a node. Chains are produced in
/// candidate weight order. A chain that can be terminated by the sink is
/// yielded and then also extended further.
pub struct PipelineGenerator {
    registry: Arc<dyn NodeRegistry>,
    nodes_by_type: BTreeMap<String, Vec<String>>,
    max_length: usize,
    constraints: ChainConstraints,
    sink_inputs: BTreeSet<String>,
    stack: Vec<Frame>,
    buffer: Vec<String>,
}

impl PipelineGenerator {
    /// `nodes_by_type` maps an input type to the usable nodes accepting it,
    /// already in search order.
    pub fn new(
        registry: Arc<dyn NodeRegistry>,
        input_type: &str,
        nodes_by_type: BTreeMap<String, Vec<String>>,
        max_length: usize,
        constraints: ChainConstraints,
    ) -> Self {
        let sink_inputs = registry.get_input_types(&constraints.sink);
        let mut generator = Self {
            registry,
            nodes_by_type,
            max_length,
            constraints,
            sink_inputs,
            stack: Vec::new(),
            buffer: Vec::new(),
        };

        if generator.sink_inputs.is_empty() {
            warn!(
                sink = %generator.constraints.sink,
                "Sink node accepts no input type, no pipeline can be completed"
            );
            return generator;
        }

        match generator.constraints.source.clone() {
            Some(source) => match generator.registry.get_output_type(&source, input_type) {
                Some(output) => {
                    debug!(source = %source, input_type = %output, "Using fixed source node");
                    generator.buffer.push(source);
                    if let Some(frame) = generator.open_frame(output, 1, false) {
                        generator.stack.push(frame);
                    }
                }
                None => warn!(source = %source, input_type, "Source node cannot process the input type"),
            },
            None => {
                if let Some(frame) = generator.open_frame(input_type.to_string(), 0, true) {
                    generator.stack.push(frame);
                }
            }
        }
        generator
    }

    /// Generator over the usable nodes of a validated task.
    pub fn from_task(task: &Task) -> Self {
        let config = task.config();
        Self::new(
            task.registry().clone(),
            &config.data_set_type,
            task.weighted_nodes_by_input_type(),
            config.max_pipeline_length,
            ChainConstraints {
                required_nodes: task.required_nodes(),
                required_types: config.required_node_types.iter().cloned().collect(),
                source: config.source_node.clone(),
                sink: config.sink_node.clone(),
            },
        )
    }

    /// Candidates for slot `index`, or `None` when the subtree is pruned.
    fn open_frame(&self, input_type: String, index: usize, first: bool) -> Option<Frame> {
        // A node in slot `index` needs the sink in slot `index + 1`.
        if index + 2 > self.max_length {
            return None;
        }

        // Required nodes need slots of their own; optional nodes may only fill the rest.
        let required_slots = self
            .constraints
            .required_nodes
            .iter()
            .filter(|n| **n != self.constraints.sink)
            .count();
        let optional_slots = self.max_length.saturating_sub(1).saturating_sub(required_slots);
        let optional_nodes = self
            .buffer
            .iter()
            .filter(|n| !self.constraints.required_nodes.contains(*n))
            .count();
        if optional_nodes > optional_slots {
            debug!(index, "Too many optional nodes, pruning");
            return None;
        }

        let candidates = self.nodes_by_type.get(&input_type)?.clone();
        Some(Frame {
            input_type,
            candidates,
            cursor: 0,
            index,
            first,
        })
    }

    fn eligible(&self, node: &str, first: bool) -> bool {
        let Some(spec) = self.registry.lookup(node) else {
            return false;
        };
        if first {
            spec.is_source()
        } else {
            node != self.constraints.sink && !spec.is_sink() && !spec.is_source()
        }
    }

    fn satisfies_requirements(&self, chain: &[String]) -> bool {
        let names_ok = self
            .constraints
            .required_nodes
            .iter()
            .all(|required| chain.contains(required));
        let types_ok = self.constraints.required_types.iter().all(|required| {
            chain
                .iter()
                .filter_map(|n| self.registry.lookup(n))
                .any(|spec| &spec.category == required)
        });
        names_ok && types_ok
    }
}

impl Iterator for PipelineGenerator {
    type Item = Vec<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let frame = self.stack.last_mut()?;
            if frame.cursor >= frame.candidates.len() {
                self.stack.pop();
                continue;
            }

            let node = frame.candidates[frame.cursor].clone();
            frame.cursor += 1;
            let index = frame.index;
            let first = frame.first;
            let input_type = frame.input_type.clone();

            // Drop whatever the previous sibling's subtree left behind.
            self.buffer.truncate(index);
            if self.buffer.contains(&node) || !self.eligible(&node, first) {
                continue;
            }
            let Some(output) = self.registry.get_output_type(&node, &input_type) else {
                debug!(node = %node, input_type = %input_type, "Skipping node without output type");
                continue;
            };

            self.buffer.push(node);
            if let Some(child) = self.open_frame(output.clone(), index + 1, false) {
                self.stack.push(child);
            }

            if self.sink_inputs.contains(&output) {
                let mut chain = self.buffer.clone();
                chain.push(self.constraints.sink.clone());
                if self.satisfies_requirements(&chain) {
                    debug!(chain = ?chain, "Valid node chain found");
                    return Some(chain);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::tests::{eeg_config, eeg_registry};
    use cs_types::{NodeSpec, OutputRule, StaticRegistry, TaskConfig, SINK_CATEGORY, SOURCE_CATEGORY};

    fn fixed(name: &str, category: &str, input: &str, output: &str) -> NodeSpec {
        NodeSpec::new(name, category)
            .with_inputs([input])
            .with_output(OutputRule::Fixed(output.to_string()))
    }

    fn fixture_config() -> TaskConfig {
        TaskConfig::new("data", "A", vec!["yes".into(), "no".into()], "yes").with_sink_node("Sink")
    }

    fn linear_registry() -> StaticRegistry {
        StaticRegistry::new()
            .with_node(fixed("X", SOURCE_CATEGORY, "A", "B"))
            .with_node(fixed("Y", "transformation", "B", "C"))
            .with_node(NodeSpec::new("Sink", SINK_CATEGORY).with_inputs(["C"]))
    }

    fn branching_registry() -> StaticRegistry {
        StaticRegistry::new()
            .with_node(fixed("X1", SOURCE_CATEGORY, "A", "B"))
            .with_node(fixed("X2", SOURCE_CATEGORY, "A", "B"))
            .with_node(fixed("Y", "transformation", "B", "C"))
            .with_node(NodeSpec::new("Sink", SINK_CATEGORY).with_inputs(["C"]))
    }

    fn generate(registry: StaticRegistry, config: TaskConfig) -> Vec<Vec<String>> {
        let task = Task::new(config, Arc::new(registry)).unwrap();
        PipelineGenerator::from_task(&task).collect()
    }

    fn chain(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_linear_fixture_yields_single_chain() {
        let chains = generate(linear_registry(), fixture_config());
        assert_eq!(chains, vec![chain(&["X", "Y", "Sink"])]);
    }

    #[test]
    fn test_branching_fixture_yields_both_chains() {
        let mut chains = generate(branching_registry(), fixture_config());
        chains.sort();
        assert_eq!(chains, vec![chain(&["X1", "Y", "Sink"]), chain(&["X2", "Y", "Sink"])]);
    }

    #[test]
    fn test_forced_node_restricts_chains() {
        let chains = generate(
            branching_registry(),
            fixture_config().with_force_list(vec!["X2".into()]),
        );
        assert_eq!(chains, vec![chain(&["X2", "Y", "Sink"])]);
    }

    #[test]
    fn test_length_ceiling() {
        let chains = generate(linear_registry(), fixture_config().with_max_pipeline_length(2));
        assert!(chains.is_empty());
    }

    #[test]
    fn test_no_consumer_for_input_type() {
        let mut config = fixture_config();
        config.data_set_type = "Z".into();
        assert!(generate(linear_registry(), config).is_empty());
    }

    #[test]
    fn test_sink_without_inputs_yields_nothing() {
        let registry: Arc<dyn NodeRegistry> = Arc::new(
            linear_registry().with_node(NodeSpec::new("Sink", SINK_CATEGORY)),
        );
        let mut by_type = BTreeMap::new();
        by_type.insert("A".to_string(), vec!["X".to_string()]);
        by_type.insert("B".to_string(), vec!["Y".to_string()]);
        let generator = PipelineGenerator::new(
            registry,
            "A",
            by_type,
            3,
            ChainConstraints {
                sink: "Sink".into(),
                ..Default::default()
            },
        );
        assert_eq!(generator.count(), 0);
    }

    #[test]
    fn test_required_node_type() {
        let registry = linear_registry()
            .with_node(fixed("Z", "classification", "B", "C"))
            .with_node(fixed("W", "filtering", "B", "B"));
        let config = fixture_config()
            .with_max_pipeline_length(4)
            .with_required_node_types(vec!["filtering".into()]);
        let mut chains = generate(registry, config);
        chains.sort();
        assert_eq!(
            chains,
            vec![chain(&["X", "W", "Y", "Sink"]), chain(&["X", "W", "Z", "Sink"])]
        );
    }

    #[test]
    fn test_terminating_node_also_continues() {
        // Y can end a chain and can also feed Z
        let registry = linear_registry()
            .with_node(fixed("Z", "postprocessing", "C", "C"));
        let mut chains = generate(registry, fixture_config().with_max_pipeline_length(4));
        chains.sort();
        assert_eq!(chains, vec![chain(&["X", "Y", "Sink"]), chain(&["X", "Y", "Z", "Sink"])]);
    }

    #[test]
    fn test_fixed_source_node() {
        let task = Task::new(
            eeg_config().with_source_node("TimeSeriesSourceNode"),
            Arc::new(eeg_registry()),
        )
        .unwrap();
        // Source, feature generation, classifier and sink need four slots
        assert_eq!(PipelineGenerator::from_task(&task).count(), 0);

        let task = Task::new(
            eeg_config()
                .with_source_node("TimeSeriesSourceNode")
                .with_max_pipeline_length(4),
            Arc::new(eeg_registry()),
        )
        .unwrap();
        let chains: Vec<Vec<String>> = PipelineGenerator::from_task(&task).collect();
        assert_eq!(
            chains,
            vec![chain(&["TimeSeriesSourceNode", "TimeDomainFeaturesNode", "SorSvmNode", "PerformanceSinkNode"])]
        );
    }

    #[test]
    fn test_generated_chains_are_valid() {
        let registry = eeg_registry()
            .with_node(fixed("PcaNode", "spatial_filtering", "TimeSeries", "TimeSeries"))
            .with_node(fixed("NormalizationNode", "feature_normalization", "FeatureVector", "FeatureVector"))
            .with_node(fixed("ThresholdNode", "postprocessing", "PredictionVector", "PredictionVector"));
        let registry = Arc::new(registry);
        let max_length = 6;
        let task = Task::new(eeg_config().with_max_pipeline_length(max_length), registry.clone()).unwrap();
        let chains: Vec<Vec<String>> = PipelineGenerator::from_task(&task).collect();
        assert!(!chains.is_empty());

        let mut unique = BTreeSet::new();
        for chain in &chains {
            assert!(chain.len() <= max_length);
            assert!(registry.lookup(&chain[0]).is_some_and(NodeSpec::is_source));
            assert_eq!(chain.last().map(String::as_str), Some("PerformanceSinkNode"));

            let distinct: BTreeSet<&String> = chain.iter().collect();
            assert_eq!(distinct.len(), chain.len(), "repeated node in {:?}", chain);

            let mut current = "TimeSeries".to_string();
            for node in &chain[..chain.len() - 1] {
                current = registry
                    .get_output_type(node, &current)
                    .unwrap_or_else(|| panic!("{} cannot process {} in {:?}", node, current, chain));
            }
            assert!(registry.get_input_types("PerformanceSinkNode").contains(&current));
            assert!(unique.insert(chain.clone()), "duplicate chain {:?}", chain);
        }
    }
}
