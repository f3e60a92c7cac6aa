//! Declarative node registry: which data types a node consumes and produces,
//! and which constructor parameters it exposes for optimization.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use crate::errors::ConfigError;
use crate::parameters::{DefaultValue, ParameterKind, ParameterSchema};

pub const SOURCE_CATEGORY: &str = "source";
pub const SINK_CATEGORY: &str = "sink";

/// How a node maps an accepted input type to its output type.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputRule {
    /// Output type equals the input type.
    #[default]
    Same,
    /// Every accepted input produces this type.
    Fixed(String),
    /// Explicit input → output table.
    Map(BTreeMap<String, String>),
}

/// Immutable registry entry of a processing node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub input_types: BTreeSet<String>,
    #[serde(default)]
    pub output: OutputRule,
    #[serde(default)]
    pub defaults: BTreeMap<String, DefaultValue>,
    #[serde(default)]
    pub schema: Vec<ParameterSchema>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            input_types: BTreeSet::new(),
            output: OutputRule::Same,
            defaults: BTreeMap::new(),
            schema: Vec::new(),
        }
    }

    pub fn with_inputs<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_types.extend(types.into_iter().map(Into::into));
        self
    }

    pub fn with_output(mut self, output: OutputRule) -> Self {
        self.output = output;
        self
    }

    pub fn with_default(mut self, name: impl Into<String>, value: DefaultValue) -> Self {
        self.defaults.insert(name.into(), value);
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, kind: ParameterKind) -> Self {
        self.schema.push(ParameterSchema::new(name, kind));
        self
    }

    pub fn accepts(&self, input_type: &str) -> bool {
        self.input_types.contains(input_type)
    }

    /// Output type for the given input, or `None` when the input is unsupported.
    pub fn output_type(&self, input_type: &str) -> Option<String> {
        if !self.accepts(input_type) {
            return None;
        }
        match &self.output {
            OutputRule::Same => Some(input_type.to_string()),
            OutputRule::Fixed(output) => Some(output.clone()),
            OutputRule::Map(table) => table.get(input_type).cloned(),
        }
    }

    pub fn is_source(&self) -> bool {
        self.category == SOURCE_CATEGORY
    }

    pub fn is_sink(&self) -> bool {
        self.category == SINK_CATEGORY
    }

    pub fn has_parameter(&self, name: &str) -> bool {
        self.defaults.contains_key(name) || self.schema.iter().any(|p| p.name == name)
    }

    /// Parameters that take part in the search.
    ///
    /// The declared schema is used when it holds at least one optimizable
    /// entry. Otherwise the schema is inferred from the constructor defaults.
    /// Diagnostic parameters are dropped in both cases.
    pub fn effective_schema(&self) -> Vec<ParameterSchema> {
        let declared = self.schema.iter().any(|p| p.kind.is_optimizable());
        let schema: Vec<ParameterSchema> = if declared {
            self.schema.clone()
        } else {
            self.defaults
                .iter()
                .filter_map(|(name, default)| ParameterSchema::from_default(name, default))
                .collect()
        };
        schema
            .into_iter()
            .filter(|p| !ParameterSchema::is_diagnostic(&p.name))
            .collect()
    }
}

impl fmt::Display for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.category)
    }
}

/// Read-only lookup of node metadata by name.
pub trait NodeRegistry: Send + Sync {
    fn lookup(&self, name: &str) -> Option<&NodeSpec>;

    /// All registered node names in a stable order.
    fn names(&self) -> Vec<String>;

    fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    fn get_input_types(&self, name: &str) -> BTreeSet<String> {
        self.lookup(name)
            .map(|spec| spec.input_types.clone())
            .unwrap_or_default()
    }

    fn get_output_type(&self, name: &str, input_type: &str) -> Option<String> {
        self.lookup(name)?.output_type(input_type)
    }

    fn get_constructor_defaults(&self, name: &str) -> BTreeMap<String, DefaultValue> {
        self.lookup(name)
            .map(|spec| spec.defaults.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    nodes: Vec<NodeSpec>,
}

/// In-memory registry, built in code or loaded from a JSON file.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    nodes: BTreeMap<String, NodeSpec>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(mut self, spec: NodeSpec) -> Self {
        self.insert(spec);
        self
    }

    pub fn insert(&mut self, spec: NodeSpec) {
        self.nodes.insert(spec.name.clone(), spec);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Parse `{"nodes": [...]}`.
    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        let file: RegistryFile = serde_json::from_str(text)?;
        Ok(file.nodes.into_iter().fold(Self::new(), Self::with_node))
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let load_error = |message: String| ConfigError::Load {
            what: "node registry".to_string(),
            path: path.display().to_string(),
            message,
        };
        let text = std::fs::read_to_string(path).map_err(|e| load_error(e.to_string()))?;
        Self::from_json_str(&text).map_err(|e| load_error(e.to_string()))
    }
}

impl NodeRegistry for StaticRegistry {
    fn lookup(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.get(name)
    }

    fn names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }
}
