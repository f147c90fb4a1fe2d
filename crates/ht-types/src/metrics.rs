//! Metric directions, objectives and per-metric bookkeeping.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::errors::{HtError, HtResult};

/// Whether lower or higher values of a metric are better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Min,
    Max,
}

/// Name fragments of metrics where higher values are better.
const MAXIMIZED_METRICS: [&str; 5] = ["acc", "auc", "precision", "recall", "f1"];

impl Direction {
    /// Guess a direction from a metric name: accuracy-like metrics are
    /// maximized, everything else (losses, errors) is minimized.
    pub fn infer(metric_name: &str) -> Self {
        let name = metric_name.to_ascii_lowercase();
        if MAXIMIZED_METRICS.iter().any(|m| name.contains(m)) {
            Self::Max
        } else {
            Self::Min
        }
    }

    /// Map a raw value onto a "lower is better" scale.
    pub fn normalize(self, value: f64) -> f64 {
        match self {
            Self::Min => value,
            Self::Max => -value,
        }
    }

    /// True when `candidate` strictly improves on `current`.
    pub fn is_better(self, candidate: f64, current: f64) -> bool {
        match self {
            Self::Min => candidate < current,
            Self::Max => candidate > current,
        }
    }

    /// The better of two values. A finite value always beats a non-finite one.
    pub fn best_of(self, a: f64, b: f64) -> f64 {
        if !a.is_finite() || (b.is_finite() && self.is_better(b, a)) {
            b
        } else {
            a
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Min => "min",
            Self::Max => "max",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = HtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            other => Err(HtError::Validation(format!(
                "invalid metric direction '{other}': expected 'min' or 'max'"
            ))),
        }
    }
}

/// A named metric plus the direction used to rank trials by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Objective {
    pub name: String,
    pub direction: Direction,
}

impl Objective {
    pub fn new(name: impl Into<String>, direction: Direction) -> Self {
        Self {
            name: name.into(),
            direction,
        }
    }

    /// Objective whose direction is inferred from the metric name.
    pub fn inferred(name: impl Into<String>) -> Self {
        let name = name.into();
        let direction = Direction::infer(&name);
        Self { name, direction }
    }
}

impl fmt::Display for Objective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.direction)
    }
}

/// The objective as configured by the user.
///
/// Lists are accepted at the type level so that configuration files
/// requesting several objectives can be rejected with a clear error instead
/// of silently keeping the first one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObjectiveSpec {
    Name(String),
    Multi(Vec<ObjectiveSpec>),
    Single(Objective),
}

impl ObjectiveSpec {
    /// Resolve to exactly one objective.
    pub fn into_single(self) -> HtResult<Objective> {
        match self {
            Self::Name(name) => Ok(Objective::inferred(name)),
            Self::Single(objective) => Ok(objective),
            Self::Multi(objectives) => Err(HtError::MultiObjectiveUnsupported {
                objectives: format!("{objectives:?}"),
            }),
        }
    }
}

impl From<&str> for ObjectiveSpec {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<Objective> for ObjectiveSpec {
    fn from(objective: Objective) -> Self {
        Self::Single(objective)
    }
}

impl From<Vec<Objective>> for ObjectiveSpec {
    fn from(objectives: Vec<Objective>) -> Self {
        Self::Multi(objectives.into_iter().map(Self::Single).collect())
    }
}

/// One reported value of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricObservation {
    pub step: u64,
    pub value: f64,
}

/// Observations of a single metric, one per step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricHistory {
    pub direction: Direction,
    observations: Vec<MetricObservation>,
}

impl MetricHistory {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            observations: Vec::new(),
        }
    }

    /// Record `value` at `step`. A step reported twice keeps its best value.
    pub fn update(&mut self, value: f64, step: u64) {
        match self.observations.iter_mut().find(|o| o.step == step) {
            Some(existing) => existing.value = self.direction.best_of(existing.value, value),
            None => self.observations.push(MetricObservation { step, value }),
        }
    }

    pub fn observations(&self) -> &[MetricObservation] {
        &self.observations
    }

    /// Best finite observation; NaN and infinite values never win.
    pub fn best(&self) -> Option<MetricObservation> {
        self.observations
            .iter()
            .copied()
            .filter(|o| o.value.is_finite())
            .reduce(|best, o| {
                if self.direction.is_better(o.value, best.value) {
                    o
                } else {
                    best
                }
            })
    }

    pub fn last(&self) -> Option<MetricObservation> {
        self.observations.iter().copied().max_by_key(|o| o.step)
    }
}

/// Per-trial collection of metric histories keyed by metric name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsTracker {
    metrics: BTreeMap<String, MetricHistory>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a metric. Registering the same name twice is fine as long as
    /// the direction agrees.
    pub fn register(&mut self, name: &str, direction: Direction) -> HtResult<()> {
        match self.metrics.get(name) {
            Some(history) if history.direction != direction => Err(HtError::Validation(format!(
                "metric '{name}' already registered with direction '{}'",
                history.direction
            ))),
            Some(_) => Ok(()),
            None => {
                self.metrics
                    .insert(name.to_string(), MetricHistory::new(direction));
                Ok(())
            }
        }
    }

    /// Record an observation, registering unknown metrics with an inferred
    /// direction.
    pub fn update(&mut self, name: &str, value: f64, step: u64) {
        self.metrics
            .entry(name.to_string())
            .or_insert_with(|| MetricHistory::new(Direction::infer(name)))
            .update(value, step);
    }

    pub fn exists(&self, name: &str) -> bool {
        self.metrics.contains_key(name)
    }

    pub fn get_direction(&self, name: &str) -> Option<Direction> {
        self.metrics.get(name).map(|h| h.direction)
    }

    pub fn get_history(&self, name: &str) -> Option<&MetricHistory> {
        self.metrics.get(name)
    }

    pub fn get_best_value(&self, name: &str) -> Option<f64> {
        self.metrics.get(name)?.best().map(|o| o.value)
    }

    pub fn get_last_value(&self, name: &str) -> Option<f64> {
        self.metrics.get(name)?.last().map(|o| o.value)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.metrics.keys().map(String::as_str)
    }
}

/// Smallest and largest value a metric took during one execution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricRange {
    pub min: f64,
    pub max: f64,
}

impl MetricRange {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        let (first, rest) = values.split_first()?;
        Some(rest.iter().fold(
            Self {
                min: *first,
                max: *first,
            },
            |range, v| Self {
                min: range.min.min(*v),
                max: range.max.max(*v),
            },
        ))
    }

    pub fn get(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Min => self.min,
            Direction::Max => self.max,
        }
    }
}

/// Summary statistics over a non-empty sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
}

impl Aggregate {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);

        let n = sorted.len();
        let median = if n % 2 == 1 {
            sorted[n / 2]
        } else {
            (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
        };

        Some(Self {
            min: sorted[0],
            max: sorted[n - 1],
            mean: sorted.iter().sum::<f64>() / n as f64,
            median,
        })
    }
}

/// Best-so-far value of one tracked metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BestValue {
    pub direction: Direction,
    pub best: Option<f64>,
}

/// Registry of key metrics and the best value ever seen for each.
/// Values only move in the metric's direction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsRegistry {
    entries: BTreeMap<String, BestValue>,
}

impl MetricsRegistry {
    pub fn new(key_metrics: &[Objective]) -> Self {
        let entries = key_metrics
            .iter()
            .map(|m| {
                (
                    m.name.clone(),
                    BestValue {
                        direction: m.direction,
                        best: None,
                    },
                )
            })
            .collect();
        Self { entries }
    }

    /// Offer a new value; returns true when it became the new best.
    /// Unknown metrics and non-finite values are ignored.
    pub fn update(&mut self, name: &str, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        let Some(entry) = self.entries.get_mut(name) else {
            return false;
        };
        let improved = match entry.best {
            None => true,
            Some(best) => entry.direction.is_better(value, best),
        };
        if improved {
            entry.best = Some(value);
        }
        improved
    }

    pub fn best(&self, name: &str) -> Option<f64> {
        self.entries.get(name).and_then(|e| e.best)
    }

    pub fn direction(&self, name: &str) -> Option<Direction> {
        self.entries.get(name).map(|e| e.direction)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BestValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}
