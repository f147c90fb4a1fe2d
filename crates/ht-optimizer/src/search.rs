//! Search strategies that turn a hyperparameter space into proposals.

use ht_types::{config_error, HtResult, TunerConfig};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::hyperparameters::{
    Assignment, HyperParameter, HyperParameters, ParameterKind, ParameterValue,
};

/// Outcome of asking a strategy for the next configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum Population {
    /// A full assignment covering every tracked parameter.
    Assignment(Assignment),
    /// The strategy has nothing left to propose.
    Exhausted,
}

/// Common trait for all search strategies.
pub trait SearchStrategy: Send {
    /// Propose the next full configuration of `space`.
    fn populate_space(&mut self, space: &HyperParameters) -> Population;

    /// Report a finished configuration. `score` is normalized so that lower
    /// is better.
    fn result(&mut self, _score: f64, _values: &Assignment) {}

    /// Human-readable strategy name.
    fn name(&self) -> &str;

    /// Internal state to persist with the oracle, so a restored search
    /// continues where it stopped instead of replaying its proposals.
    fn snapshot(&self) -> Value {
        Value::Null
    }

    fn restore(&mut self, _snapshot: &Value) -> HtResult<()> {
        Ok(())
    }
}

impl<S: SearchStrategy + ?Sized> SearchStrategy for Box<S> {
    fn populate_space(&mut self, space: &HyperParameters) -> Population {
        (**self).populate_space(space)
    }

    fn result(&mut self, score: f64, values: &Assignment) {
        (**self).result(score, values)
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn snapshot(&self) -> Value {
        (**self).snapshot()
    }

    fn restore(&mut self, snapshot: &Value) -> HtResult<()> {
        (**self).restore(snapshot)
    }
}

/// Build the strategy named by `config.strategy`.
pub fn strategy_from_config(config: &TunerConfig) -> HtResult<Box<dyn SearchStrategy>> {
    match config.strategy.as_str() {
        "random" => Ok(Box::new(RandomSearch::new(config.seed))),
        "grid" => Ok(Box::new(GridSearch::new(config.grid_steps))),
        "local" => Ok(Box::new(LocalSearch::new(
            config.seed,
            config.exploration_weight,
        ))),
        other => Err(config_error!("unknown strategy '{other}'")),
    }
}

/// RNG for a strategy: seeded when a seed is configured, otherwise drawn
/// from the thread RNG.
pub fn seeded_rng(seed: Option<u64>) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed.unwrap_or_else(rand::random))
}

/// Position of a ChaCha stream, enough to resume it exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RngSnapshot {
    seed: [u8; 32],
    word_pos: u64,
}

impl RngSnapshot {
    fn capture(rng: &ChaCha8Rng) -> Self {
        Self {
            seed: rng.get_seed(),
            word_pos: rng.get_word_pos() as u64,
        }
    }

    fn rebuild(&self) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::from_seed(self.seed);
        rng.set_word_pos(u128::from(self.word_pos));
        rng
    }
}

fn snapshot_rng(rng: &ChaCha8Rng) -> Value {
    serde_json::to_value(RngSnapshot::capture(rng)).unwrap_or(Value::Null)
}

fn restore_rng(snapshot: &Value) -> HtResult<Option<ChaCha8Rng>> {
    if snapshot.is_null() {
        return Ok(None);
    }
    let state: RngSnapshot = serde_json::from_value(snapshot.clone())?;
    Ok(Some(state.rebuild()))
}

// ---- Random search ----

/// Independent random sampling across the search space.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    rng: ChaCha8Rng,
}

impl RandomSearch {
    pub fn new(seed: Option<u64>) -> Self {
        Self {
            rng: seeded_rng(seed),
        }
    }
}

impl Default for RandomSearch {
    fn default() -> Self {
        Self::new(None)
    }
}

impl SearchStrategy for RandomSearch {
    fn populate_space(&mut self, space: &HyperParameters) -> Population {
        Population::Assignment(space.sample(&mut self.rng))
    }

    fn name(&self) -> &str {
        "random"
    }

    fn snapshot(&self) -> Value {
        snapshot_rng(&self.rng)
    }

    fn restore(&mut self, snapshot: &Value) -> HtResult<()> {
        if let Some(rng) = restore_rng(snapshot)? {
            self.rng = rng;
        }
        Ok(())
    }
}

// ---- Grid search ----

/// Exhaustive grid search. Combinations are enumerated lazily in cartesian
/// order, last parameter varying fastest.
#[derive(Debug, Clone)]
pub struct GridSearch {
    /// Number of steps for continuous dimensions.
    float_steps: usize,
    axes: Vec<(String, Vec<ParameterValue>)>,
    cursor: usize,
    built: bool,
    /// Cursor restored from a snapshot, applied once the axes are built.
    resume_at: Option<usize>,
}

impl GridSearch {
    pub fn new(float_steps: usize) -> Self {
        Self {
            float_steps,
            axes: Vec::new(),
            cursor: 0,
            built: false,
            resume_at: None,
        }
    }

    /// Total number of grid points for the current axes.
    pub fn grid_size(&self) -> usize {
        self.axes
            .iter()
            .try_fold(1usize, |acc, (_, values)| acc.checked_mul(values.len()))
            .unwrap_or(usize::MAX)
    }

    pub fn remaining(&self) -> usize {
        self.grid_size().saturating_sub(self.cursor)
    }

    /// Rebuild the axes if the space gained parameters. Restarts the walk.
    fn sync_axes(&mut self, space: &HyperParameters) {
        let unchanged = self.axes.len() == space.len()
            && self
                .axes
                .iter()
                .zip(space.names())
                .all(|((name, _), other)| name == other);
        if unchanged && self.built {
            return;
        }
        self.axes = space
            .iter()
            .map(|p| (p.name.clone(), p.grid_values(self.float_steps)))
            .collect();
        self.cursor = if self.built {
            0
        } else {
            self.resume_at.take().unwrap_or(0)
        };
        self.built = true;
        debug!(points = self.grid_size(), "rebuilt search grid");
    }

    fn combination(&self, mut index: usize) -> Assignment {
        let mut combo = Assignment::new();
        for (name, values) in self.axes.iter().rev() {
            let radix = values.len();
            combo.insert(name.clone(), values[index % radix].clone());
            index /= radix;
        }
        combo
    }
}

impl SearchStrategy for GridSearch {
    fn populate_space(&mut self, space: &HyperParameters) -> Population {
        self.sync_axes(space);
        if self.cursor >= self.grid_size() {
            return Population::Exhausted;
        }
        let combo = self.combination(self.cursor);
        self.cursor += 1;
        Population::Assignment(combo)
    }

    fn name(&self) -> &str {
        "grid"
    }

    fn snapshot(&self) -> Value {
        serde_json::json!({ "cursor": self.cursor })
    }

    fn restore(&mut self, snapshot: &Value) -> HtResult<()> {
        if let Some(cursor) = snapshot.get("cursor").and_then(Value::as_u64) {
            self.built = false;
            self.resume_at = Some(cursor as usize);
        }
        Ok(())
    }
}

// ---- Local search ----

/// Explore-then-exploit search: samples uniformly until results come in,
/// then mostly perturbs the best configuration seen so far.
#[derive(Debug, Clone)]
pub struct LocalSearch {
    rng: ChaCha8Rng,
    observations: Vec<(Assignment, f64)>,
    exploration_weight: f64,
}

impl LocalSearch {
    pub fn new(seed: Option<u64>, exploration_weight: f64) -> Self {
        Self {
            rng: seeded_rng(seed),
            observations: Vec::new(),
            exploration_weight,
        }
    }

    fn best(&self) -> Option<&Assignment> {
        self.observations
            .iter()
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(values, _)| values)
    }

    /// Perturb one value around `base`, staying inside the domain.
    fn perturb(
        rng: &mut ChaCha8Rng,
        param: &HyperParameter,
        base: &ParameterValue,
    ) -> ParameterValue {
        match (&param.kind, base) {
            (ParameterKind::Int { min, max, step }, ParameterValue::Int(v)) => {
                let delta: i64 = rng.random_range(-2..=2);
                let top = min + (max - min) / step * step;
                ParameterValue::Int((v + delta * step).clamp(*min, top))
            }
            (ParameterKind::Float { min, max, step }, v) => {
                let Some(v) = v.as_f64() else {
                    return param.sample(rng);
                };
                let noise = rng.random_range(-0.1..0.1) * (max - min);
                let mut next = (v + noise).clamp(*min, *max);
                if let Some(step) = step {
                    next = (min + ((next - min) / step).round() * step).clamp(*min, *max);
                }
                ParameterValue::Float(next)
            }
            (ParameterKind::LogUniform { min, max }, ParameterValue::Float(v)) => {
                let log_range = max.ln() - min.ln();
                let noise = rng.random_range(-0.1..0.1) * log_range;
                ParameterValue::Float((v.ln() + noise).exp().clamp(*min, *max))
            }
            (ParameterKind::Fixed { value }, _) => value.clone(),
            // Categorical dimensions mostly keep their value.
            (_, v) if param.contains(v) && rng.random_bool(0.8) => v.clone(),
            _ => param.sample(rng),
        }
    }
}

impl SearchStrategy for LocalSearch {
    fn populate_space(&mut self, space: &HyperParameters) -> Population {
        let explore = self.rng.random::<f64>() < self.exploration_weight;
        let base = if explore { None } else { self.best().cloned() };
        let Some(base) = base else {
            return Population::Assignment(space.sample(&mut self.rng));
        };

        let mut next = Assignment::new();
        for param in space.iter() {
            let value = match base.get(&param.name) {
                Some(v) => Self::perturb(&mut self.rng, param, v),
                // Parameters added after the best result was recorded.
                None => param.sample(&mut self.rng),
            };
            next.insert(param.name.clone(), value);
        }
        Population::Assignment(next)
    }

    fn result(&mut self, score: f64, values: &Assignment) {
        if score.is_finite() {
            self.observations.push((values.clone(), score));
        }
    }

    fn name(&self) -> &str {
        "local"
    }

    /// Observations are not part of the snapshot; the oracle replays
    /// completed trials through [`SearchStrategy::result`] on restore.
    fn snapshot(&self) -> Value {
        snapshot_rng(&self.rng)
    }

    fn restore(&mut self, snapshot: &Value) -> HtResult<()> {
        if let Some(rng) = restore_rng(snapshot)? {
            self.rng = rng;
        }
        Ok(())
    }
}
