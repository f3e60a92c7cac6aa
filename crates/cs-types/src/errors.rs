use thiserror::Error;

/// Main error type for the chainsearch system
#[derive(Error, Debug)]
pub enum CsError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Trial store error: {0}")]
    Store(#[from] StoreError),

    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Task configuration errors, raised before any search or evaluation begins
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("'{node}' from {list} is not a node")]
    UnknownNode { node: String, list: String },

    #[error("Weight of node '{node}' from weight dict is not a positive number: {weight}")]
    InvalidWeight { node: String, weight: f64 },

    #[error("Class labels must be a non-empty list of names")]
    NoClassLabels,

    #[error("The main class '{main_class}' is not defined as a class label")]
    MainClassNotLabel { main_class: String },

    #[error("'{node}' is either not a source node or is not able to emit data type '{data_type}'")]
    InvalidSourceNode { node: String, data_type: String },

    #[error("The node '{node}' is not a sink node")]
    InvalidSinkNode { node: String },

    #[error("The sink node '{node}' does not accept any input type")]
    SinkAcceptsNothing { node: String },

    #[error("Node '{node}' is both forced and blacklisted")]
    ForcedAndBlacklisted { node: String },

    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Invalid parameter range for '{node}.{parameter}': {message}")]
    InvalidParameterRange {
        node: String,
        parameter: String,
        message: String,
    },

    #[error("Failed to load {what} from {path}: {message}")]
    Load {
        what: String,
        path: String,
        message: String,
    },
}

/// Persistent trial store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Trial store at {path} is corrupt: {message}")]
    Corrupt { path: String, message: String },

    #[error("Failed to write trial store at {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read trial store at {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Trial not found: {trial_id}")]
    UnknownTrial { trial_id: u64 },

    #[error("Trial {trial_id} is already finished")]
    AlreadyFinished { trial_id: u64 },
}

/// Errors of a single evaluation; always recovered into a failed trial
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("Backend setup failed: {message}")]
    Setup { message: String },

    #[error("Backend exited unsuccessfully: {message}")]
    BackendFailed { message: String },

    #[error("Metric '{metric}' not found in result data set {path}")]
    MissingMetric { metric: String, path: String },

    #[error("Result file {path} could not be read: {message}")]
    UnreadableResult { path: String, message: String },

    #[error("Parameter '{key}' could not be resolved: {message}")]
    Parameter { key: String, message: String },

    #[error("Evaluation cancelled")]
    Cancelled,

    #[error("Evaluation panicked: {message}")]
    Panicked { message: String },
}

/// Suggestion algorithm errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SearchError {
    #[error("Unknown suggestion algorithm: {name}")]
    UnknownAlgorithm { name: String },

    #[error("Invalid distribution for '{key}': {message}")]
    InvalidDistribution { key: String, message: String },

    #[error("Algorithm returned {returned} points for {requested} trial ids")]
    TooManyPoints { returned: usize, requested: usize },
}

/// Result type alias for chainsearch operations
pub type CsResult<T> = Result<T, CsError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::CsError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::CsError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors on a named field
#[macro_export]
macro_rules! config_error {
    ($field:expr, $($arg:tt)*) => {
        $crate::ConfigError::InvalidValue {
            field: $field.to_string(),
            message: format!($($arg)*),
        }
    };
}
