//! Hyperparameter distributions, sampled values and search spaces.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::errors::EvaluationError;

/// A parameter assignment of one trial, keyed by globally unique parameter key.
pub type Assignment = BTreeMap<String, ParameterValue>;

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParameterKind {
    /// Choice between `true` (index 0) and `false` (index 1).
    Boolean,
    /// Categorical choices; sampled as an index into `choices`.
    Choice { choices: Vec<Value> },
    /// Continuous uniform range [low, high].
    Uniform { low: f64, high: f64 },
    /// Uniform range rounded to multiples of `q`.
    QUniform { low: f64, high: f64, q: f64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
    /// Log-uniform range rounded to multiples of `q`.
    QLogUniform { low: f64, high: f64, q: f64 },
    Normal { mu: f64, sigma: f64 },
    QNormal { mu: f64, sigma: f64, q: f64 },
    /// `exp` of a normal variate.
    LogNormal { mu: f64, sigma: f64 },
    QLogNormal { mu: f64, sigma: f64, q: f64 },
    /// Never optimized; the value is passed through as-is.
    Fixed { value: Value },
}

impl ParameterKind {
    /// Check the distribution bounds, returning a human-readable reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        let check_q = |q: f64| {
            if q.is_finite() && q > 0.0 {
                Ok(())
            } else {
                Err(format!("q must be a positive number, got {q}"))
            }
        };
        let check_sigma = |sigma: f64| {
            if sigma.is_finite() && sigma > 0.0 {
                Ok(())
            } else {
                Err(format!("sigma must be a positive number, got {sigma}"))
            }
        };
        let check_range = |low: f64, high: f64| {
            if low.is_finite() && high.is_finite() && low <= high {
                Ok(())
            } else {
                Err(format!("invalid range [{low}, {high}]"))
            }
        };

        match self {
            Self::Boolean | Self::Fixed { .. } => Ok(()),
            Self::Choice { choices } if choices.is_empty() => {
                Err("choice parameter without choices".to_string())
            }
            Self::Choice { .. } => Ok(()),
            Self::Uniform { low, high } => check_range(*low, *high),
            Self::QUniform { low, high, q } => {
                check_range(*low, *high)?;
                check_q(*q)
            }
            Self::LogUniform { low, high } => {
                check_range(*low, *high)?;
                if *low <= 0.0 {
                    return Err(format!("log-uniform lower bound must be positive, got {low}"));
                }
                Ok(())
            }
            Self::QLogUniform { low, high, q } => {
                check_range(*low, *high)?;
                if *low <= 0.0 {
                    return Err(format!("log-uniform lower bound must be positive, got {low}"));
                }
                check_q(*q)
            }
            Self::Normal { sigma, .. } | Self::LogNormal { sigma, .. } => check_sigma(*sigma),
            Self::QNormal { sigma, q, .. } | Self::QLogNormal { sigma, q, .. } => {
                check_sigma(*sigma)?;
                check_q(*q)
            }
        }
    }

    pub fn is_optimizable(&self) -> bool {
        !matches!(self, Self::Fixed { .. })
    }

    /// Number of discrete options for categorical kinds.
    pub fn choice_count(&self) -> Option<usize> {
        match self {
            Self::Boolean => Some(2),
            Self::Choice { choices } => Some(choices.len()),
            _ => None,
        }
    }

    /// Turn a sampled value into the concrete value handed to the backend.
    pub fn resolve(&self, value: &ParameterValue) -> Result<Value, String> {
        match (self, value) {
            (Self::Boolean, ParameterValue::Index(i)) => match i {
                0 => Ok(Value::Bool(true)),
                1 => Ok(Value::Bool(false)),
                _ => Err(format!("boolean index {i} out of range")),
            },
            (Self::Choice { choices }, ParameterValue::Index(i)) => choices
                .get(*i)
                .cloned()
                .ok_or_else(|| format!("choice index {i} out of range ({} choices)", choices.len())),
            (Self::Fixed { value }, _) => Ok(value.clone()),
            (_, ParameterValue::Index(i)) => {
                Err(format!("index {i} given for a non-categorical parameter"))
            }
            (_, other) => other.to_json(),
        }
    }
}

/// Default value of a node constructor parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DefaultValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    List(Vec<Value>),
    Other(Value),
}

/// Declarative schema entry of a node parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    pub name: String,
    pub kind: ParameterKind,
}

impl ParameterSchema {
    pub fn new(name: impl Into<String>, kind: ParameterKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    /// Infer a search distribution from a constructor default.
    ///
    /// Booleans become a boolean choice, floats a normal distribution around
    /// the default, integers a q-normal with `q = 1`, lists a choice over their
    /// elements. Anything else has no sensible distribution and yields `None`.
    pub fn from_default(name: &str, default: &DefaultValue) -> Option<Self> {
        let kind = match default {
            DefaultValue::Bool(_) => ParameterKind::Boolean,
            DefaultValue::Float(mu) => ParameterKind::Normal {
                mu: *mu,
                sigma: 1.0,
            },
            DefaultValue::Int(mu) => ParameterKind::QNormal {
                mu: *mu as f64,
                sigma: 1.0,
                q: 1.0,
            },
            DefaultValue::List(values) if !values.is_empty() => ParameterKind::Choice {
                choices: values.clone(),
            },
            _ => return None,
        };
        Some(Self::new(name, kind))
    }

    /// Parameters that only toggle diagnostics are never optimized.
    pub fn is_diagnostic(name: &str) -> bool {
        let lower = name.to_lowercase();
        lower.contains("debug") || lower.contains("warn")
    }
}

/// A concrete parameter value produced by a suggestion algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Index into the declared choices of a categorical parameter.
    Index(usize),
}

impl ParameterValue {
    fn to_json(&self) -> Result<Value, String> {
        match self {
            Self::Bool(v) => Ok(Value::Bool(*v)),
            Self::Int(v) => Ok(Value::from(*v)),
            Self::Float(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .ok_or_else(|| format!("non-finite value {v}")),
            Self::Index(v) => Ok(Value::from(*v)),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Index(v) => write!(f, "#{v}"),
        }
    }
}

/// A single dimension of a pipeline's search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Globally unique key, `{node}_{parameter}`.
    pub key: String,
    /// Name of the node the parameter belongs to.
    pub node: String,
    /// Constructor parameter name inside the node.
    pub parameter: String,
    pub kind: ParameterKind,
}

impl ParameterDef {
    pub fn new(node: &str, parameter: &str, kind: ParameterKind) -> Self {
        Self {
            key: Self::make_key(node, parameter),
            node: node.to_string(),
            parameter: parameter.to_string(),
            kind,
        }
    }

    pub fn make_key(node: &str, parameter: &str) -> String {
        format!("{node}_{parameter}")
    }
}

/// The full search space: parameter definitions ordered by key.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a definition, replacing any existing one with the same key.
    pub fn add(mut self, def: ParameterDef) -> Self {
        self.insert(def);
        self
    }

    pub fn insert(&mut self, def: ParameterDef) {
        match self.parameters.binary_search_by(|p| p.key.cmp(&def.key)) {
            Ok(pos) => self.parameters[pos] = def,
            Err(pos) => self.parameters.insert(pos, def),
        }
    }

    /// Union with another space; entries of `other` win on key collisions.
    pub fn merge(&mut self, other: &SearchSpace) {
        for def in &other.parameters {
            self.insert(def.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&ParameterDef> {
        self.parameters
            .binary_search_by(|p| p.key.as_str().cmp(key))
            .ok()
            .map(|pos| &self.parameters[pos])
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.parameters.iter().map(|p| p.key.as_str())
    }

    /// Total number of grid points (returns `None` if any parameter is
    /// continuous without a natural grid).
    pub fn grid_size(&self) -> Option<usize> {
        let mut total: usize = 1;
        for param in &self.parameters {
            let dim_size = match &param.kind {
                ParameterKind::Fixed { .. } => 1,
                kind => kind.choice_count()?,
            };
            total = total.checked_mul(dim_size)?;
        }
        Some(total)
    }

    /// Resolve categorical indices into the declared choices.
    ///
    /// Keys of the assignment that are not part of this space are rejected;
    /// parameters of the space missing from the assignment are skipped.
    pub fn resolve(&self, assignment: &Assignment) -> Result<BTreeMap<String, Value>, EvaluationError> {
        let mut resolved = BTreeMap::new();
        for (key, value) in assignment {
            let def = self.get(key).ok_or_else(|| EvaluationError::Parameter {
                key: key.clone(),
                message: "not part of the search space".to_string(),
            })?;
            let concrete = def.kind.resolve(value).map_err(|message| EvaluationError::Parameter {
                key: key.clone(),
                message,
            })?;
            resolved.insert(key.clone(), concrete);
        }
        Ok(resolved)
    }
}
