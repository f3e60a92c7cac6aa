//! Run settings and the task file read by the command line.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use cs_engine::CommandBackend;
use cs_types::{ConfigError, TaskConfig};
use serde::{Deserialize, Serialize};

/// Overrides the default results directory.
pub const RESULTS_DIR_ENV: &str = "CHAINSEARCH_RESULTS_DIR";

/// How an optimization run is executed. Unlike [`TaskConfig`] none of this
/// changes which pipelines or parameters are evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Root of the per-pipeline directories.
    pub results_dir: PathBuf,
    /// Where the best operation is written; defaults to `<input_path>_best.yaml`.
    pub best_result_file: Option<PathBuf>,
    /// Pool size. `0` evaluates every trial on the calling thread.
    pub workers: usize,
    /// Pipelines optimized at the same time.
    pub max_active_pipelines: usize,
    /// Longest time the coordinator blocks waiting for a result.
    pub poll_interval: Duration,
    /// How long terminated workers get to stop before they are detached.
    pub shutdown_grace: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        let results_dir = std::env::var_os(RESULTS_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(cs_data::default_results_root);
        Self {
            results_dir,
            best_result_file: None,
            workers: thread::available_parallelism().map_or(1, |n| n.get()),
            max_active_pipelines: 2,
            poll_interval: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl RunConfig {
    pub fn with_results_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.results_dir = dir.into();
        self
    }

    pub fn with_best_result_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.best_result_file = Some(path.into());
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_active_pipelines(mut self, pipelines: usize) -> Self {
        self.max_active_pipelines = pipelines.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// External program evaluating one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Kill the program after this many seconds.
    #[serde(default)]
    pub timeout_secs: Option<f64>,
}

impl BackendConfig {
    pub fn build(&self) -> CommandBackend {
        CommandBackend::new(&self.program)
            .with_args(self.args.clone())
            .with_timeout(
                self.timeout_secs
                    .filter(|secs| *secs > 0.0)
                    .map(Duration::from_secs_f64),
            )
    }
}

/// Everything the command line needs besides its flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFile {
    pub task: TaskConfig,
    /// Node registry file; relative paths are resolved against the task file.
    #[serde(default)]
    pub registry: Option<PathBuf>,
    #[serde(default)]
    pub backend: Option<BackendConfig>,
}

impl TaskFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let load_error = |message: String| ConfigError::Load {
            what: "task file".to_string(),
            path: path.display().to_string(),
            message,
        };
        let text = std::fs::read_to_string(path).map_err(|e| load_error(e.to_string()))?;
        let mut file: Self = serde_json::from_str(&text).map_err(|e| load_error(e.to_string()))?;

        if let (Some(registry), Some(base)) = (&file.registry, path.parent()) {
            if registry.is_relative() {
                file.registry = Some(base.join(registry));
            }
        }
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_task_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("task.json");
        std::fs::write(
            &path,
            r#"{
                "task": {
                    "input_path": "example_summary_split",
                    "data_set_type": "TimeSeries",
                    "class_labels": ["Standard", "Target"],
                    "main_class": "Target",
                    "evaluations_per_pass": 4,
                    "check_after": 2,
                    "max_loss": 40.0
                },
                "registry": "nodes.json",
                "backend": {"program": "run-operation", "args": ["{spec}", "{output}"]}
            }"#,
        )
        .unwrap();

        let file = TaskFile::load(&path).unwrap();
        assert_eq!(file.task.evaluations_per_pass, 4);
        assert_eq!(file.task.passes, 1);
        assert_eq!(file.task.early_abort(), Some((2, 40.0)));
        assert_eq!(file.registry, Some(dir.path().join("nodes.json")));

        let backend = file.backend.unwrap();
        assert_eq!(backend.args, vec!["{spec}", "{output}"]);
        assert_eq!(backend.build().program(), "run-operation");
    }

    #[test]
    fn test_invalid_task_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("task.json");
        std::fs::write(&path, r#"{"task": {"input_path": "x"}}"#).unwrap();
        assert!(matches!(TaskFile::load(&path), Err(ConfigError::Load { .. })));
        assert!(matches!(
            TaskFile::load(&dir.path().join("missing.json")),
            Err(ConfigError::Load { .. })
        ));
    }

    #[test]
    fn test_run_config_builders() {
        let config = RunConfig::default()
            .with_results_dir("/tmp/cs")
            .with_workers(0)
            .with_max_active_pipelines(0);
        assert_eq!(config.results_dir, PathBuf::from("/tmp/cs"));
        assert_eq!(config.workers, 0);
        assert_eq!(config.max_active_pipelines, 1);
        assert!(config.workers < RunConfig::default().workers);
    }
}
