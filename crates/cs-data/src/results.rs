//! Reading the metric summary the execution backend leaves in its output
//! directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use cs_types::EvaluationError;

/// Well-known name of the backend's result table.
pub const RESULTS_FILE: &str = "results.csv";

/// Columns of a `results.csv`, one row per inner repetition (split, run).
#[derive(Debug, Clone)]
pub struct MetricSummary {
    path: PathBuf,
    columns: BTreeMap<String, Vec<String>>,
    rows: usize,
}

impl MetricSummary {
    pub fn from_csv<P: AsRef<Path>>(file_path: P) -> Result<Self, EvaluationError> {
        use csv::ReaderBuilder;

        let path = file_path.as_ref();
        let unreadable = |message: String| EvaluationError::UnreadableResult {
            path: path.display().to_string(),
            message,
        };

        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|e| unreadable(e.to_string()))?;

        let headers = rdr.headers().map_err(|e| unreadable(e.to_string()))?.clone();
        let mut columns: BTreeMap<String, Vec<String>> = headers
            .iter()
            .map(|name| (name.to_string(), Vec::new()))
            .collect();

        let mut rows = 0;
        for (line_num, result) in rdr.records().enumerate() {
            let record = result
                .map_err(|e| unreadable(format!("record at line {}: {}", line_num + 2, e)))?;
            for (name, value) in headers.iter().zip(record.iter()) {
                if let Some(column) = columns.get_mut(name) {
                    column.push(value.to_string());
                }
            }
            rows += 1;
        }

        tracing::debug!("Read {} result rows from {}", rows, path.display());
        Ok(Self {
            path: path.to_path_buf(),
            columns,
            rows,
        })
    }

    /// Summary of the `results.csv` inside a backend output directory.
    pub fn from_output_dir<P: AsRef<Path>>(dir: P) -> Result<Self, EvaluationError> {
        Self::from_csv(dir.as_ref().join(RESULTS_FILE))
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn has_metric(&self, metric: &str) -> bool {
        self.columns.contains_key(metric)
    }

    pub fn metrics(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn values(&self, metric: &str) -> Result<Vec<f64>, EvaluationError> {
        let column = self
            .columns
            .get(metric)
            .ok_or_else(|| EvaluationError::MissingMetric {
                metric: metric.to_string(),
                path: self.path.display().to_string(),
            })?;

        column
            .iter()
            .map(|raw| {
                raw.parse::<f64>().map_err(|e| EvaluationError::UnreadableResult {
                    path: self.path.display().to_string(),
                    message: format!("value '{}' of metric '{}' is not a number: {}", raw, metric, e),
                })
            })
            .collect()
    }

    /// Mean of the metric over all rows.
    pub fn mean(&self, metric: &str) -> Result<f64, EvaluationError> {
        let values = self.values(metric)?;
        if values.is_empty() {
            return Err(EvaluationError::UnreadableResult {
                path: self.path.display().to_string(),
                message: format!("no rows for metric '{}'", metric),
            });
        }
        Ok(values.iter().sum::<f64>() / values.len() as f64)
    }
}
