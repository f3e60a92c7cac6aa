//! Trials and the per-pipeline persistent trial store.

use std::fs;
use std::io;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use cs_types::{Assignment, CancelToken, CsResult, EvaluationError, SearchError, SearchSpace, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::evaluation::{panic_message, EvaluationRequest, Objective};
use crate::search::{Suggestion, SuggestionAlgorithm};

/// File name of the trial store inside a pipeline directory.
pub const STORAGE_NAME: &str = "trials.json";

const FORMAT_VERSION: u32 = 1;

/// Lifecycle of a trial. `Done` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialState {
    New,
    Running,
    Done,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Ok,
    Failed,
    /// Placeholder filled in after the pipeline was abandoned.
    Skipped,
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    #[serde(with = "loss_format")]
    pub loss: f64,
    pub status: TrialStatus,
}

impl TrialResult {
    pub fn ok(loss: f64) -> Self {
        Self {
            loss,
            status: TrialStatus::Ok,
        }
    }

    pub fn failed() -> Self {
        Self {
            loss: f64::INFINITY,
            status: TrialStatus::Failed,
        }
    }

    pub fn skipped(loss: f64) -> Self {
        Self {
            loss,
            status: TrialStatus::Skipped,
        }
    }
}

/// One evaluation attempt of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: u64,
    pub state: TrialState,
    pub parameters: Assignment,
    pub result: Option<TrialResult>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Trial {
    pub fn new(id: u64, parameters: Assignment) -> Self {
        Self {
            id,
            state: TrialState::New,
            parameters,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, TrialState::Done | TrialState::Error)
    }

    pub fn loss(&self) -> Option<f64> {
        self.result.as_ref().map(|r| r.loss)
    }

    /// Finished with an `ok` result.
    pub fn is_successful(&self) -> bool {
        self.state == TrialState::Done
            && self.result.as_ref().is_some_and(|r| r.status == TrialStatus::Ok)
    }

    pub fn is_placeholder(&self) -> bool {
        self.result.as_ref().is_some_and(|r| r.status == TrialStatus::Skipped)
    }

    pub fn mark_running(&mut self) {
        self.state = TrialState::Running;
        self.started_at = Some(Utc::now());
    }

    /// A failed result moves the trial to `Error`, anything else to `Done`.
    pub fn mark_finished(&mut self, result: TrialResult) {
        self.state = match result.status {
            TrialStatus::Failed => TrialState::Error,
            TrialStatus::Ok | TrialStatus::Skipped => TrialState::Done,
        };
        self.finished_at = Some(Utc::now());
        self.result = Some(result);
    }

    pub fn mark_failed(&mut self, error: String) {
        self.state = TrialState::Error;
        self.finished_at = Some(Utc::now());
        self.result = Some(TrialResult::failed());
        self.error = Some(error);
    }

    fn reset(&mut self) {
        self.state = TrialState::New;
        self.started_at = None;
    }
}

/// Result of asking the suggestion algorithm for more trials.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    /// Ids of the trials that were added.
    Enqueued(Vec<u64>),
    /// The store already holds `max_evals` trials.
    Full,
    /// The algorithm has no further points to offer.
    Stopped,
}

/// Number of trials per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub new: usize,
    pub running: usize,
    pub done: usize,
    pub error: usize,
}

impl StateCounts {
    pub fn finished(&self) -> usize {
        self.done + self.error
    }
}

#[derive(Serialize, Deserialize)]
struct StoredTrials {
    version: u32,
    trials: Vec<Trial>,
}

/// Durable, resumable container of the trials of exactly one pipeline.
///
/// Every mutation rewrites the backing file before returning, so the file
/// always reflects the committed in-memory state. Only one owner may write a
/// given store.
#[derive(Debug)]
pub struct TrialStore {
    path: PathBuf,
    trials: Vec<Trial>,
    next_id: u64,
}

impl TrialStore {
    /// Load the store in `dir`, or start empty when no file exists yet.
    ///
    /// `recreate` discards stored trials first. Trials found `Running` were
    /// never recorded as finished and are reset to `New`.
    pub fn open<P: AsRef<Path>>(dir: P, recreate: bool) -> CsResult<Self> {
        let path = dir.as_ref().join(STORAGE_NAME);
        if recreate {
            remove_if_exists(&path)?;
            info!(store = %path.display(), "Discarded stored trials");
        }

        let mut trials = match fs::read(&path) {
            Ok(bytes) => {
                let stored: StoredTrials = serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;
                if stored.version != FORMAT_VERSION {
                    return Err(StoreError::Corrupt {
                        path: path.display().to_string(),
                        message: format!("unsupported format version {}", stored.version),
                    }
                    .into());
                }
                stored.trials
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(source) => {
                return Err(StoreError::Read {
                    path: path.display().to_string(),
                    source,
                }
                .into())
            }
        };

        trials.sort_by_key(|t| t.id);
        let mut interrupted = 0;
        for trial in trials.iter_mut().filter(|t| t.state == TrialState::Running) {
            trial.reset();
            interrupted += 1;
        }
        if interrupted > 0 {
            warn!(store = %path.display(), interrupted, "Resetting interrupted trials");
        }

        let next_id = trials.last().map_or(0, |t| t.id + 1);
        debug!(store = %path.display(), trials = trials.len(), "Opened trial store");
        Ok(Self { path, trials, next_id })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Trials ordered by id.
    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&Trial> {
        self.position(id).ok().map(|pos| &self.trials[pos])
    }

    fn position(&self, id: u64) -> Result<usize, StoreError> {
        self.trials
            .binary_search_by_key(&id, |t| t.id)
            .map_err(|_| StoreError::UnknownTrial { trial_id: id })
    }

    /// Serialize every trial and atomically replace the backing file.
    pub fn refresh(&self) -> CsResult<()> {
        let stored = StoredTrials {
            version: FORMAT_VERSION,
            trials: self.trials.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&stored)?;
        cs_data::write_atomic(&self.path, &bytes).map_err(|source| StoreError::Write {
            path: self.path.display().to_string(),
            source,
        })?;
        Ok(())
    }

    /// Top the store up to `max_evals` trials with points from `algorithm`.
    pub fn enqueue(
        &mut self,
        algorithm: &mut dyn SuggestionAlgorithm,
        space: &SearchSpace,
        max_evals: usize,
    ) -> CsResult<EnqueueOutcome> {
        if self.trials.len() >= max_evals {
            return Ok(EnqueueOutcome::Full);
        }

        let missing = (max_evals - self.trials.len()) as u64;
        let new_ids: Vec<u64> = (self.next_id..self.next_id + missing).collect();
        let points = match algorithm.suggest(space, &self.trials, &new_ids) {
            Suggestion::Points(points) if !points.is_empty() => points,
            Suggestion::Points(_) | Suggestion::Stop => {
                debug!(algorithm = algorithm.name(), "Suggestion algorithm stopped");
                return Ok(EnqueueOutcome::Stopped);
            }
        };
        if points.len() > new_ids.len() {
            return Err(SearchError::TooManyPoints {
                returned: points.len(),
                requested: new_ids.len(),
            }
            .into());
        }

        let ids: Vec<u64> = new_ids.into_iter().take(points.len()).collect();
        for (id, parameters) in ids.iter().zip(points) {
            self.trials.push(Trial::new(*id, parameters));
        }
        self.next_id += ids.len() as u64;
        self.refresh()?;
        debug!(algorithm = algorithm.name(), count = ids.len(), "Enqueued trials");
        Ok(EnqueueOutcome::Enqueued(ids))
    }

    /// Evaluate every `New` trial whose index lies in `range`, one at a time.
    ///
    /// Finished trials are left untouched, so calling this again without new
    /// trials does nothing. Evaluation errors and panics become `Error`
    /// trials. A cancelled evaluation leaves its trial `New` and stops the
    /// loop. Returns the number of trials evaluated.
    pub fn evaluate_pending(
        &mut self,
        range: Range<usize>,
        objective: &dyn Objective,
        cancel: &CancelToken,
    ) -> CsResult<usize> {
        let end = range.end.min(self.trials.len());
        let mut evaluated = 0;

        for index in range.start..end {
            if self.trials[index].state != TrialState::New {
                continue;
            }
            if cancel.is_cancelled() {
                break;
            }

            self.trials[index].mark_running();
            self.refresh()?;

            let request = EvaluationRequest {
                trial_id: self.trials[index].id,
                parameters: self.trials[index].parameters.clone(),
                cancel: cancel.clone(),
            };
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| objective.evaluate(&request)))
                .unwrap_or_else(|payload| {
                    Err(EvaluationError::Panicked {
                        message: panic_message(payload.as_ref()),
                    })
                });

            let trial = &mut self.trials[index];
            match outcome {
                Ok(result) => trial.mark_finished(result),
                Err(EvaluationError::Cancelled) => {
                    trial.reset();
                    self.refresh()?;
                    break;
                }
                Err(e) => {
                    warn!(trial = trial.id, error = %e, "Trial evaluation failed");
                    trial.mark_failed(e.to_string());
                }
            }
            self.refresh()?;
            evaluated += 1;
        }
        Ok(evaluated)
    }

    /// Mark dispatched trials as running.
    pub fn mark_running(&mut self, ids: &[u64]) -> CsResult<()> {
        for id in ids {
            let pos = self.position(*id)?;
            let trial = &mut self.trials[pos];
            if trial.is_finished() {
                return Err(StoreError::AlreadyFinished { trial_id: *id }.into());
            }
            trial.mark_running();
        }
        self.refresh()
    }

    pub fn complete(&mut self, id: u64, result: TrialResult) -> CsResult<()> {
        let pos = self.position(id)?;
        let trial = &mut self.trials[pos];
        if trial.is_finished() {
            return Err(StoreError::AlreadyFinished { trial_id: id }.into());
        }
        trial.mark_finished(result);
        self.refresh()
    }

    pub fn fail(&mut self, id: u64, message: impl Into<String>) -> CsResult<()> {
        let pos = self.position(id)?;
        let trial = &mut self.trials[pos];
        if trial.is_finished() {
            return Err(StoreError::AlreadyFinished { trial_id: id }.into());
        }
        trial.mark_failed(message.into());
        self.refresh()
    }

    /// Close out an abandoned pipeline: every `New` trial and every missing
    /// slot up to `budget` becomes a skipped placeholder carrying `loss`.
    /// Running trials are left to finish. Returns the number of placeholders.
    pub fn fill_placeholders(&mut self, budget: usize, loss: f64) -> CsResult<usize> {
        let mut filled = 0;
        for trial in self.trials.iter_mut().filter(|t| t.state == TrialState::New) {
            trial.mark_finished(TrialResult::skipped(loss));
            filled += 1;
        }
        while self.trials.len() < budget {
            let mut trial = Trial::new(self.next_id, Assignment::new());
            trial.mark_finished(TrialResult::skipped(loss));
            self.trials.push(trial);
            self.next_id += 1;
            filled += 1;
        }
        if filled > 0 {
            self.refresh()?;
        }
        Ok(filled)
    }

    /// Lowest-loss successful trial.
    pub fn best(&self) -> Option<&Trial> {
        self.trials
            .iter()
            .filter(|t| t.is_successful())
            .min_by(|a, b| {
                let (a, b) = (a.loss().unwrap_or(f64::INFINITY), b.loss().unwrap_or(f64::INFINITY));
                a.total_cmp(&b)
            })
    }

    /// Forget every trial, in memory and on disk.
    pub fn delete_all(&mut self) -> CsResult<()> {
        self.trials.clear();
        self.next_id = 0;
        remove_if_exists(&self.path)
    }

    pub fn count_by_state(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for trial in &self.trials {
            match trial.state {
                TrialState::New => counts.new += 1,
                TrialState::Running => counts.running += 1,
                TrialState::Done => counts.done += 1,
                TrialState::Error => counts.error += 1,
            }
        }
        counts
    }

    /// `(trial id, loss)` of every finished trial, in id order.
    pub fn loss_series(&self) -> Vec<(u64, f64)> {
        self.trials
            .iter()
            .filter(|t| t.is_finished())
            .filter_map(|t| Some((t.id, t.loss()?)))
            .collect()
    }
}

fn remove_if_exists(path: &Path) -> CsResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StoreError::Write {
            path: path.display().to_string(),
            source,
        }
        .into()),
    }
}

/// Losses as JSON numbers; non-finite values as `"inf"`, `"-inf"`, `"nan"`.
mod loss_format {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(loss: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if loss.is_nan() {
            serializer.serialize_str("nan")
        } else if loss.is_infinite() {
            serializer.serialize_str(if *loss > 0.0 { "inf" } else { "-inf" })
        } else {
            serializer.serialize_f64(*loss)
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Number(v) => Ok(v),
            Raw::Text(text) => match text.as_str() {
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                "nan" => Ok(f64::NAN),
                other => Err(D::Error::custom(format!("invalid loss '{other}'"))),
            },
        }
    }
}
