use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use cs_types::{EvaluationError, NodeSpec, SearchSpace};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::backend::{Backend, BackendRequest};
use crate::spec_text;

/// Namespace of pipeline identities. Changing it orphans every stored trial.
const PIPELINE_NAMESPACE: Uuid = Uuid::from_u128(0x6c1f_3a52_9d0e_4b7c_8a41_52e3_f0b9_77d1);

/// Position of a node inside a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Source,
    Intermediate,
    Sink,
}

/// One occurrence of a registry node inside a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineNode {
    spec: NodeSpec,
    role: NodeRole,
    space: SearchSpace,
    fixed: BTreeMap<String, Value>,
}

impl PipelineNode {
    pub fn new(spec: NodeSpec, role: NodeRole, space: SearchSpace, fixed: BTreeMap<String, Value>) -> Self {
        Self {
            spec,
            role,
            space,
            fixed,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// Optimizable parameters, keyed `{node}_{parameter}`.
    pub fn space(&self) -> &SearchSpace {
        &self.space
    }

    /// Literal parameter values that are never optimized.
    pub fn fixed(&self) -> &BTreeMap<String, Value> {
        &self.fixed
    }

    /// `{node, parameters}` entry of the node chain. Optimized parameters are
    /// template references `${key}` resolved by the backend.
    fn as_chain_entry(&self) -> Value {
        let mut entry = Map::new();
        entry.insert("node".to_string(), Value::from(self.name()));

        let mut parameters = Map::new();
        for def in &self.space.parameters {
            parameters.insert(def.parameter.clone(), Value::from(format!("${{{}}}", def.key)));
        }
        for (name, value) in &self.fixed {
            parameters.insert(name.clone(), value.clone());
        }
        if !parameters.is_empty() {
            entry.insert("parameters".to_string(), Value::Object(parameters));
        }
        Value::Object(entry)
    }
}

/// Backend-consumable description of one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationSpec {
    /// `{type, input_path, node_chain, parameter_settings}`.
    pub document: Value,
    /// Text form handed to the backend.
    pub base_file: String,
}

impl OperationSpec {
    pub fn node_chain(&self) -> &[Value] {
        self.document["node_chain"]
            .as_array()
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// An ordered node chain applied to one input data set.
#[derive(Debug, Clone)]
pub struct Pipeline {
    nodes: Vec<PipelineNode>,
    input_path: String,
    id: Uuid,
}

impl Pipeline {
    pub fn new(nodes: Vec<PipelineNode>, input_path: impl Into<String>) -> Self {
        let input_path = input_path.into();
        let names: Vec<&str> = nodes.iter().map(PipelineNode::name).collect();
        let id = Self::identity(&names, &input_path);
        Self {
            nodes,
            input_path,
            id,
        }
    }

    /// Stable identity of a node sequence applied to an input path.
    pub fn identity(node_names: &[&str], input_path: &str) -> Uuid {
        let mut key = node_names.join("\u{1f}");
        key.push('\u{1e}');
        key.push_str(input_path);
        Uuid::new_v5(&PIPELINE_NAMESPACE, key.as_bytes())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Directory name of this pipeline below the results root.
    pub fn dir_name(&self) -> String {
        self.id.simple().to_string()
    }

    pub fn nodes(&self) -> &[PipelineNode] {
        &self.nodes
    }

    pub fn node_names(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.name().to_string()).collect()
    }

    pub fn input_path(&self) -> &str {
        &self.input_path
    }

    /// Union of the intermediate nodes' spaces. The first and last node are
    /// source and sink and are never optimized.
    pub fn parameter_space(&self) -> SearchSpace {
        let mut space = SearchSpace::new();
        if self.nodes.len() > 2 {
            for node in &self.nodes[1..self.nodes.len() - 1] {
                space.merge(node.space());
            }
        }
        space
    }

    /// Render the operation for the given resolved parameter settings.
    pub fn operation_spec(&self, parameter_settings: &[BTreeMap<String, Value>]) -> OperationSpec {
        let node_chain: Vec<Value> = self.nodes.iter().map(PipelineNode::as_chain_entry).collect();
        let settings: Vec<Value> = parameter_settings
            .iter()
            .map(|s| Value::Object(s.iter().map(|(k, v)| (k.clone(), v.clone())).collect()))
            .collect();

        let document = json!({
            "type": "node_chain",
            "input_path": self.input_path,
            "node_chain": node_chain,
            "parameter_settings": settings,
        });
        let base_file = spec_text::render_base_file(&document);
        OperationSpec { document, base_file }
    }

    /// Submit the operation to the backend and return its output directory.
    pub fn execute(
        &self,
        backend: &dyn Backend,
        parameter_settings: &[BTreeMap<String, Value>],
        request: &BackendRequest,
    ) -> Result<PathBuf, EvaluationError> {
        let spec = self.operation_spec(parameter_settings);
        tracing::debug!(pipeline = %self.id, trial = request.trial_id, "Submitting operation to backend");
        backend.execute(&spec, request)
    }

    /// `[A, B, C]@input_path`
    pub fn describe(&self) -> String {
        format!("[{}]@{}", self.node_names().join(", "), self.input_path)
    }
}

impl PartialEq for Pipeline {
    fn eq(&self, other: &Self) -> bool {
        self.input_path == other.input_path
            && self.nodes.len() == other.nodes.len()
            && self.nodes.iter().zip(&other.nodes).all(|(a, b)| a.name() == b.name())
    }
}

impl Eq for Pipeline {}

impl Hash for Pipeline {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pipeline<{}>", self.id.simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::tests::{eeg_config, eeg_registry};
    use crate::task::Task;
    use cs_types::ParameterValue;
    use std::collections::hash_map::DefaultHasher;
    use std::sync::Arc;

    fn build(task: &Task, names: &[&str]) -> Pipeline {
        let nodes = names.iter().map(|n| task.create_node(n).unwrap()).collect();
        Pipeline::new(nodes, task.config().input_path.clone())
    }

    fn hash_of(pipeline: &Pipeline) -> u64 {
        let mut hasher = DefaultHasher::new();
        pipeline.hash(&mut hasher);
        hasher.finish()
    }

    const CHAIN: [&str; 4] = ["TimeSeriesSourceNode", "TimeDomainFeaturesNode", "SorSvmNode", "PerformanceSinkNode"];

    #[test]
    fn test_identity_equality_and_hash() {
        let task = Task::new(eeg_config(), Arc::new(eeg_registry())).unwrap();
        let first = build(&task, &CHAIN);
        let second = build(&task, &CHAIN);
        assert_eq!(first, second);
        assert_eq!(first.id(), second.id());
        assert_eq!(hash_of(&first), hash_of(&second));

        let other = build(
            &task,
            &["TimeSeriesSourceNode", "DecimationNode", "SorSvmNode", "PerformanceSinkNode"],
        );
        assert_ne!(first, other);
        assert_ne!(first.id(), other.id());

        let moved = Pipeline::new(first.nodes().to_vec(), "other_input");
        assert_ne!(first, moved);
        assert_ne!(first.dir_name(), moved.dir_name());
    }

    #[test]
    fn test_identity_is_stable() {
        let id = Pipeline::identity(&["A", "B"], "data");
        assert_eq!(id, Pipeline::identity(&["A", "B"], "data"));
        assert_eq!(id.get_version_num(), 5);
        // Joining must not make different splits collide
        assert_ne!(id, Pipeline::identity(&["AB"], "data"));
        assert_ne!(Pipeline::identity(&["A"], "Bdata"), Pipeline::identity(&["A", "B"], "data"));
    }

    #[test]
    fn test_parameter_space_excludes_source_and_sink() {
        let task = Task::new(eeg_config(), Arc::new(eeg_registry())).unwrap();
        let pipeline = build(&task, &CHAIN);
        let space = pipeline.parameter_space();
        let keys: Vec<&str> = space.keys().collect();
        assert_eq!(keys, vec!["SorSvmNode_complexity", "TimeDomainFeaturesNode_datapoints"]);
    }

    #[test]
    fn test_operation_spec_document() {
        let task = Task::new(eeg_config(), Arc::new(eeg_registry())).unwrap();
        let pipeline = build(&task, &CHAIN);

        let mut assignment = cs_types::Assignment::new();
        assignment.insert("SorSvmNode_complexity".into(), ParameterValue::Float(0.5));
        assignment.insert("TimeDomainFeaturesNode_datapoints".into(), ParameterValue::Index(1));
        let settings = pipeline.parameter_space().resolve(&assignment).unwrap();

        let spec = pipeline.operation_spec(&[settings]);
        assert_eq!(spec.document["type"], "node_chain");
        assert_eq!(spec.document["input_path"], "example_summary_split");
        assert_eq!(spec.node_chain().len(), 4);
        assert_eq!(spec.node_chain()[0], json!({"node": "TimeSeriesSourceNode"}));
        assert_eq!(
            spec.node_chain()[2]["parameters"]["complexity"],
            json!("${SorSvmNode_complexity}")
        );
        assert_eq!(spec.node_chain()[3]["parameters"]["ir_class"], json!("Target"));
        assert_eq!(
            spec.document["parameter_settings"][0]["TimeDomainFeaturesNode_datapoints"],
            json!([3])
        );
        assert!(spec.base_file.starts_with("input_path: example_summary_split\nnode_chain:\n    -   node: TimeSeriesSourceNode\n"));
        assert_eq!(
            pipeline.describe(),
            "[TimeSeriesSourceNode, TimeDomainFeaturesNode, SorSvmNode, PerformanceSinkNode]@example_summary_split"
        );
    }
}
