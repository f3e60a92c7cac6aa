//! Suggestion algorithms proposing parameter points for new trials.

use std::f64::consts::PI;

use cs_types::{Assignment, ParameterKind, ParameterValue, SearchSpace, SuggestionKind};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::trial::Trial;

/// Answer of a suggestion algorithm.
#[derive(Debug, Clone, PartialEq)]
pub enum Suggestion {
    /// At most one point per requested trial id, in id order.
    Points(Vec<Assignment>),
    /// No further useful points exist.
    Stop,
}

/// Common trait for all suggestion algorithms.
pub trait SuggestionAlgorithm: Send {
    /// Propose points for the trials `new_ids`, given every trial stored so
    /// far (ordered by id) as history.
    fn suggest(&mut self, space: &SearchSpace, history: &[Trial], new_ids: &[u64]) -> Suggestion;

    /// Human-readable algorithm name.
    fn name(&self) -> &str;
}

/// Build the algorithm selected in the task configuration.
pub fn build_algorithm(kind: SuggestionKind, seed: Option<u64>) -> Box<dyn SuggestionAlgorithm> {
    match kind {
        SuggestionKind::Random => Box::new(RandomSearch::new(seed)),
        SuggestionKind::Grid => Box::new(GridSearch::new(GridSearch::DEFAULT_STEPS)),
        SuggestionKind::Bayesian => Box::new(BayesianSearch::new(seed, BayesianSearch::DEFAULT_EXPLORATION)),
    }
}

/// Deterministic generator for one trial, independent of scheduling order.
fn trial_rng(seed: u64, trial_id: u64) -> StdRng {
    StdRng::seed_from_u64(seed ^ trial_id.wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

fn standard_normal(rng: &mut StdRng) -> f64 {
    // Box-Muller; u1 must stay away from zero for the logarithm
    let u1: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.random();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

/// Round to a multiple of `q`; integral steps produce integers.
fn quantize(value: f64, q: f64) -> ParameterValue {
    let rounded = (value / q).round() * q;
    if q.fract() == 0.0 && rounded.abs() < i64::MAX as f64 {
        ParameterValue::Int(rounded as i64)
    } else {
        ParameterValue::Float(rounded)
    }
}

/// Draw one value. `Fixed` parameters are never sampled.
fn sample(kind: &ParameterKind, rng: &mut StdRng) -> Option<ParameterValue> {
    let value = match kind {
        ParameterKind::Fixed { .. } => return None,
        ParameterKind::Boolean => ParameterValue::Index(rng.random_range(0..2)),
        ParameterKind::Choice { choices } => ParameterValue::Index(rng.random_range(0..choices.len().max(1))),
        ParameterKind::Uniform { low, high } => ParameterValue::Float(rng.random_range(*low..=*high)),
        ParameterKind::QUniform { low, high, q } => quantize(rng.random_range(*low..=*high), *q),
        ParameterKind::LogUniform { low, high } => {
            ParameterValue::Float(rng.random_range(low.ln()..=high.ln()).exp())
        }
        ParameterKind::QLogUniform { low, high, q } => {
            quantize(rng.random_range(low.ln()..=high.ln()).exp(), *q)
        }
        ParameterKind::Normal { mu, sigma } => ParameterValue::Float(mu + sigma * standard_normal(rng)),
        ParameterKind::QNormal { mu, sigma, q } => quantize(mu + sigma * standard_normal(rng), *q),
        ParameterKind::LogNormal { mu, sigma } => {
            ParameterValue::Float((mu + sigma * standard_normal(rng)).exp())
        }
        ParameterKind::QLogNormal { mu, sigma, q } => {
            quantize((mu + sigma * standard_normal(rng)).exp(), *q)
        }
    };
    Some(value)
}

/// Relative perturbation in [-0.1, 0.1).
fn jitter(rng: &mut StdRng) -> f64 {
    rng.random_range(-0.1..0.1)
}

fn sample_point(space: &SearchSpace, rng: &mut StdRng) -> Assignment {
    space
        .parameters
        .iter()
        .filter_map(|def| Some((def.key.clone(), sample(&def.kind, rng)?)))
        .collect()
}

// ---- Random search ----

/// Independent random sampling across the search space.
///
/// The point of a trial depends only on the seed and the trial id.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    seed: u64,
}

impl RandomSearch {
    /// Without a seed one is drawn from the thread generator.
    pub fn new(seed: Option<u64>) -> Self {
        Self {
            seed: seed.unwrap_or_else(|| rand::rng().random()),
        }
    }
}

impl SuggestionAlgorithm for RandomSearch {
    fn suggest(&mut self, space: &SearchSpace, _history: &[Trial], new_ids: &[u64]) -> Suggestion {
        Suggestion::Points(
            new_ids
                .iter()
                .map(|id| sample_point(space, &mut trial_rng(self.seed, *id)))
                .collect(),
        )
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Grid search ----

/// Exhaustive grid search.
///
/// Categorical dimensions contribute each choice, quantized uniform ranges
/// every step, other continuous dimensions `steps` evenly spaced points
/// (normal kinds within two standard deviations). The grid position is the
/// number of stored trials, so a resumed search continues where it stopped.
#[derive(Debug, Clone)]
pub struct GridSearch {
    steps: usize,
}

impl GridSearch {
    pub const DEFAULT_STEPS: usize = 5;

    /// Largest number of points per quantized dimension.
    const MAX_AXIS: usize = 1000;

    pub fn new(steps: usize) -> Self {
        Self { steps: steps.max(2) }
    }

    fn spaced(&self, low: f64, high: f64) -> Vec<f64> {
        if low == high {
            return vec![low];
        }
        (0..self.steps)
            .map(|i| low + (high - low) * i as f64 / (self.steps - 1) as f64)
            .collect()
    }

    fn axis(&self, kind: &ParameterKind) -> Vec<ParameterValue> {
        let floats = |values: Vec<f64>| -> Vec<ParameterValue> { values.into_iter().map(ParameterValue::Float).collect() };
        let quantized = |values: Vec<f64>, q: f64| {
            let mut axis: Vec<ParameterValue> = Vec::new();
            for value in values.into_iter().map(|v| quantize(v, q)) {
                if axis.last() != Some(&value) {
                    axis.push(value);
                }
            }
            axis
        };

        match kind {
            ParameterKind::Fixed { .. } => Vec::new(),
            ParameterKind::Boolean | ParameterKind::Choice { .. } => {
                (0..kind.choice_count().unwrap_or(0)).map(ParameterValue::Index).collect()
            }
            ParameterKind::Uniform { low, high } => floats(self.spaced(*low, *high)),
            ParameterKind::QUniform { low, high, q } => {
                let first = (low / q).ceil();
                let last = (high / q).floor();
                let count = ((last - first).max(-1.0) + 1.0) as usize;
                if count == 0 || count > Self::MAX_AXIS {
                    quantized(self.spaced(*low, *high), *q)
                } else {
                    quantized((0..count).map(|i| (first + i as f64) * q).collect(), *q)
                }
            }
            ParameterKind::LogUniform { low, high } => {
                floats(self.spaced(low.ln(), high.ln()).into_iter().map(f64::exp).collect())
            }
            ParameterKind::QLogUniform { low, high, q } => quantized(
                self.spaced(low.ln(), high.ln()).into_iter().map(f64::exp).collect(),
                *q,
            ),
            ParameterKind::Normal { mu, sigma } => floats(self.spaced(mu - 2.0 * sigma, mu + 2.0 * sigma)),
            ParameterKind::QNormal { mu, sigma, q } => {
                quantized(self.spaced(mu - 2.0 * sigma, mu + 2.0 * sigma), *q)
            }
            ParameterKind::LogNormal { mu, sigma } => floats(
                self.spaced(mu - 2.0 * sigma, mu + 2.0 * sigma)
                    .into_iter()
                    .map(f64::exp)
                    .collect(),
            ),
            ParameterKind::QLogNormal { mu, sigma, q } => quantized(
                self.spaced(mu - 2.0 * sigma, mu + 2.0 * sigma)
                    .into_iter()
                    .map(f64::exp)
                    .collect(),
                *q,
            ),
        }
    }

    /// Grid point `index` in mixed radix, last key varying fastest.
    fn point(axes: &[(&str, Vec<ParameterValue>)], mut index: usize) -> Assignment {
        let mut point = Assignment::new();
        for (key, values) in axes.iter().rev() {
            point.insert(key.to_string(), values[index % values.len()].clone());
            index /= values.len();
        }
        point
    }
}

impl SuggestionAlgorithm for GridSearch {
    fn suggest(&mut self, space: &SearchSpace, history: &[Trial], new_ids: &[u64]) -> Suggestion {
        let axes: Vec<(&str, Vec<ParameterValue>)> = space
            .parameters
            .iter()
            .map(|def| (def.key.as_str(), self.axis(&def.kind)))
            .filter(|(_, values)| !values.is_empty())
            .collect();
        let total = axes
            .iter()
            .try_fold(1usize, |acc, (_, values)| acc.checked_mul(values.len()))
            .unwrap_or(usize::MAX);

        let cursor = history.len();
        if cursor >= total {
            return Suggestion::Stop;
        }
        let end = (cursor + new_ids.len()).min(total);
        Suggestion::Points((cursor..end).map(|i| Self::point(&axes, i)).collect())
    }

    fn name(&self) -> &str {
        "grid"
    }
}

// ---- Bayesian search ----

/// Sequential model-based search with an explore/exploit heuristic.
///
/// Each new trial either explores (a fresh random point) or exploits by
/// perturbing the best successful trial in the history. Sampling is seeded
/// per trial id.
#[derive(Debug, Clone)]
pub struct BayesianSearch {
    seed: u64,
    exploration_weight: f64,
}

impl BayesianSearch {
    pub const DEFAULT_EXPLORATION: f64 = 0.3;

    pub fn new(seed: Option<u64>, exploration_weight: f64) -> Self {
        Self {
            seed: seed.unwrap_or_else(|| rand::rng().random()),
            exploration_weight: exploration_weight.clamp(0.0, 1.0),
        }
    }

    fn perturb(kind: &ParameterKind, base: Option<&ParameterValue>, rng: &mut StdRng) -> Option<ParameterValue> {
        let base_value = base.and_then(ParameterValue::as_f64);
        let value = match (kind, base_value) {
            (ParameterKind::Boolean | ParameterKind::Choice { .. }, _) => match base {
                Some(ParameterValue::Index(i)) if rng.random::<f64>() < 0.8 => ParameterValue::Index(*i),
                _ => return sample(kind, rng),
            },
            (ParameterKind::Uniform { low, high }, Some(v)) => {
                ParameterValue::Float((v + jitter(rng) * (high - low)).clamp(*low, *high))
            }
            (ParameterKind::QUniform { low, high, q }, Some(v)) => {
                quantize((v + jitter(rng) * (high - low)).clamp(*low, *high), *q)
            }
            (ParameterKind::LogUniform { low, high }, Some(v)) if v > 0.0 => {
                let noise = jitter(rng) * (high.ln() - low.ln());
                ParameterValue::Float((v.ln() + noise).exp().clamp(*low, *high))
            }
            (ParameterKind::QLogUniform { low, high, q }, Some(v)) if v > 0.0 => {
                let noise = jitter(rng) * (high.ln() - low.ln());
                quantize((v.ln() + noise).exp().clamp(*low, *high), *q)
            }
            (ParameterKind::Normal { sigma, .. }, Some(v)) => {
                ParameterValue::Float(v + 0.25 * sigma * standard_normal(rng))
            }
            (ParameterKind::QNormal { sigma, q, .. }, Some(v)) => {
                quantize(v + (0.25 * sigma).max(*q) * standard_normal(rng), *q)
            }
            (ParameterKind::LogNormal { sigma, .. }, Some(v)) if v > 0.0 => {
                ParameterValue::Float((v.ln() + 0.25 * sigma * standard_normal(rng)).exp())
            }
            (ParameterKind::QLogNormal { sigma, q, .. }, Some(v)) if v > 0.0 => {
                quantize((v.ln() + 0.25 * sigma * standard_normal(rng)).exp(), *q)
            }
            // Missing or unusable base value
            _ => return sample(kind, rng),
        };
        Some(value)
    }
}

impl SuggestionAlgorithm for BayesianSearch {
    fn suggest(&mut self, space: &SearchSpace, history: &[Trial], new_ids: &[u64]) -> Suggestion {
        let best = history
            .iter()
            .filter(|t| t.is_successful())
            .min_by(|a, b| {
                let (a, b) = (a.loss().unwrap_or(f64::INFINITY), b.loss().unwrap_or(f64::INFINITY));
                a.total_cmp(&b)
            });

        let points = new_ids
            .iter()
            .map(|id| {
                let mut rng = trial_rng(self.seed, *id);
                match best {
                    Some(best) if rng.random::<f64>() >= self.exploration_weight => space
                        .parameters
                        .iter()
                        .filter_map(|def| {
                            let value = Self::perturb(&def.kind, best.parameters.get(&def.key), &mut rng)?;
                            Some((def.key.clone(), value))
                        })
                        .collect(),
                    _ => sample_point(space, &mut rng),
                }
            })
            .collect();
        Suggestion::Points(points)
    }

    fn name(&self) -> &str {
        "bayesian"
    }
}
