//! The oracle: owns the search space and every trial, proposes new
//! configurations through a [`SearchStrategy`] and ranks finished trials.

use ht_types::{validation_error, HtError, HtResult, Objective, TunerConfig};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::digest::compute_identity;
use crate::hyperparameters::{Assignment, HyperParameter, HyperParameters};
use crate::search::{GridSearch, LocalSearch, Population, RandomSearch, SearchStrategy};
use crate::trial::{Trial, TrialId, TrialStatus};

/// Persisted oracle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleState {
    pub objective: Objective,
    pub space: HyperParameters,
    pub strategy: String,
    /// Opaque strategy snapshot, see [`SearchStrategy::snapshot`].
    #[serde(default)]
    pub strategy_state: serde_json::Value,
    /// Trials in creation order.
    pub trials: Vec<Trial>,
    pub collisions: usize,
}

pub struct Oracle<S: SearchStrategy = RandomSearch> {
    space: HyperParameters,
    objective: Objective,
    strategy: S,
    trials: HashMap<TrialId, Trial>,
    /// Trial ids in creation order.
    order: Vec<TrialId>,
    best_trial: Option<TrialId>,
    max_trials: Option<usize>,
    max_collisions: usize,
    collisions: usize,
}

impl Oracle<RandomSearch> {
    pub fn random(config: &TunerConfig) -> HtResult<Self> {
        Self::new(config, RandomSearch::new(config.seed))
    }
}

impl Oracle<GridSearch> {
    pub fn grid(config: &TunerConfig) -> HtResult<Self> {
        Self::new(config, GridSearch::new(config.grid_steps))
    }
}

impl Oracle<LocalSearch> {
    pub fn local(config: &TunerConfig) -> HtResult<Self> {
        Self::new(
            config,
            LocalSearch::new(config.seed, config.exploration_weight),
        )
    }
}

impl<S: SearchStrategy> Oracle<S> {
    /// Fails with `MultiObjectiveUnsupported` when the configured objective
    /// is a list.
    pub fn new(config: &TunerConfig, strategy: S) -> HtResult<Self> {
        let objective = config.objective.clone().into_single()?;
        debug!(objective = %objective, strategy = strategy.name(), "oracle created");
        Ok(Self {
            space: HyperParameters::new(),
            objective,
            strategy,
            trials: HashMap::new(),
            order: Vec::new(),
            best_trial: None,
            max_trials: config.max_trials(),
            max_collisions: config.max_collisions,
            collisions: 0,
        })
    }

    pub fn objective(&self) -> &Objective {
        &self.objective
    }

    pub fn space(&self) -> &HyperParameters {
        &self.space
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Total proposals rejected because their configuration was known.
    pub fn collisions(&self) -> usize {
        self.collisions
    }

    /// Merge `params` into the tracked space; known names are ignored.
    pub fn update_space(
        &mut self,
        params: impl IntoIterator<Item = HyperParameter>,
    ) -> HtResult<usize> {
        let added = self.space.merge(params)?;
        if added > 0 {
            debug!(added, total = self.space.len(), "search space updated");
        }
        Ok(added)
    }

    /// Ask the strategy for a full configuration. Entries of `requested`
    /// pin parameters to the given values.
    pub fn populate_space(&mut self, requested: &Assignment) -> HtResult<Population> {
        self.space.validate(requested)?;
        self.space.validate_domains()?;
        match self.strategy.populate_space(&self.space) {
            Population::Assignment(sampled) => {
                let mut values = requested.clone();
                for (name, value) in sampled {
                    values.entry(name).or_insert(value);
                }
                Ok(Population::Assignment(self.space.resolve(&values)?))
            }
            Population::Exhausted => Ok(Population::Exhausted),
        }
    }

    /// Create and register a new trial.
    ///
    /// Returns `None` when the trial budget is spent, the strategy is
    /// exhausted or every configuration of a finite space has been tried.
    /// Fails with `ExhaustedSearchSpace` when `max_collisions` resamples in
    /// a row all hit known configurations.
    pub fn create_trial(&mut self, tuner_id: &str) -> HtResult<Option<Trial>> {
        if let Some(max) = self.max_trials {
            if self.trials.len() >= max {
                debug!(max, "trial budget reached");
                return Ok(None);
            }
        }
        if let Some(cardinality) = self.space.cardinality() {
            if self.trials.len() >= cardinality {
                info!(cardinality, "every configuration has been tried");
                return Ok(None);
            }
        }

        let attempts = self.max_collisions + 1;
        for _ in 0..attempts {
            let values = match self.populate_space(&Assignment::new())? {
                Population::Assignment(values) => values,
                Population::Exhausted => {
                    info!(strategy = self.strategy.name(), "search strategy exhausted");
                    return Ok(None);
                }
            };

            let trial_id = compute_identity(&values);
            if self.trials.contains_key(&trial_id) {
                self.collisions += 1;
                debug!(trial_id = trial_id.short(), "configuration already tried, resampling");
                continue;
            }

            let mut trial = Trial::new(self.order.len(), tuner_id, values);
            trial
                .metrics
                .register(&self.objective.name, self.objective.direction)?;
            info!(
                trial = trial.trial_number,
                trial_id = trial_id.short(),
                "created trial"
            );
            self.order.push(trial_id.clone());
            self.trials.insert(trial_id, trial.clone());
            return Ok(Some(trial));
        }

        warn!(attempts, "could not find an untried configuration");
        Err(HtError::ExhaustedSearchSpace { attempts })
    }

    /// Record metric values observed at `step` and refresh the trial score.
    pub fn update_trial(
        &mut self,
        trial_id: &TrialId,
        metrics: &BTreeMap<String, f64>,
        step: u64,
    ) -> HtResult<TrialStatus> {
        let objective = self.objective.clone();
        let trial = self.trial_mut(trial_id)?;
        if trial.is_finished() {
            return Err(validation_error!(
                "trial {} is already {:?}",
                trial_id,
                trial.status
            ));
        }
        for (name, value) in metrics {
            trial.metrics.update(name, *value, step);
        }
        trial.refresh_score(&objective);
        Ok(trial.status)
    }

    /// Close a trial. Completed trials are reported to the strategy and
    /// considered for the best-trial cache.
    pub fn end_trial(
        &mut self,
        trial_id: &TrialId,
        status: TrialStatus,
        error: Option<String>,
    ) -> HtResult<()> {
        let direction = self.objective.direction;
        let trial = self.trial_mut(trial_id)?;
        match status {
            TrialStatus::Running => {
                return Err(validation_error!("cannot end trial {trial_id} as running"))
            }
            TrialStatus::Completed => trial.mark_completed(),
            TrialStatus::Failed => trial.mark_failed(error.unwrap_or_default()),
            TrialStatus::Invalid => trial.mark_invalid(error.unwrap_or_default()),
        }

        if status == TrialStatus::Completed {
            if let Some(score) = trial.normalized_score(direction) {
                let values = trial.hyperparameters.clone();
                self.strategy.result(score, &values);
            }
            self.refresh_best();
        }
        Ok(())
    }

    /// Legacy single-value callback, forwarded to the strategy.
    pub fn result(&mut self, score: f64, values: &Assignment) {
        self.strategy.result(score, values);
    }

    pub fn get_trial(&self, trial_id: &TrialId) -> Option<&Trial> {
        self.trials.get(trial_id)
    }

    /// Trials in creation order.
    pub fn trials(&self) -> impl Iterator<Item = &Trial> {
        self.order.iter().filter_map(|id| self.trials.get(id))
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    pub fn count(&self, status: TrialStatus) -> usize {
        self.trials.values().filter(|t| t.status == status).count()
    }

    pub fn best_trial(&self) -> Option<&Trial> {
        self.best_trial.as_ref().and_then(|id| self.trials.get(id))
    }

    /// The `n` best completed trials, best first. Ties go to the earlier trial.
    /// Trials without a finite score are not ranked.
    pub fn get_best_trials(&self, n: usize) -> Vec<&Trial> {
        let direction = self.objective.direction;
        let mut ranked: Vec<(f64, &Trial)> = self
            .trials
            .values()
            .filter(|t| t.status == TrialStatus::Completed)
            .filter_map(|t| t.normalized_score(direction).map(|s| (s, t)))
            .filter(|(s, _)| s.is_finite())
            .collect();
        ranked.sort_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then(a.1.trial_number.cmp(&b.1.trial_number))
        });
        ranked.into_iter().take(n).map(|(_, t)| t).collect()
    }

    fn refresh_best(&mut self) {
        let best = self.get_best_trials(1).first().map(|t| t.trial_id.clone());
        self.best_trial = best;
    }

    fn trial_mut(&mut self, trial_id: &TrialId) -> HtResult<&mut Trial> {
        self.trials
            .get_mut(trial_id)
            .ok_or_else(|| HtError::TrialNotFound {
                trial_id: trial_id.to_string(),
            })
    }

    pub fn state(&self) -> OracleState {
        OracleState {
            objective: self.objective.clone(),
            space: self.space.clone(),
            strategy: self.strategy.name().to_string(),
            strategy_state: self.strategy.snapshot(),
            trials: self.trials().cloned().collect(),
            collisions: self.collisions,
        }
    }

    pub fn save_state(&self, path: impl AsRef<Path>) -> HtResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&self.state())?)?;
        debug!(path = %path.display(), trials = self.trials.len(), "saved oracle state");
        Ok(())
    }

    /// Load a snapshot written by [`Self::save_state`]. Trials that were
    /// still running are marked failed.
    pub fn restore_state(&mut self, path: impl AsRef<Path>) -> HtResult<()> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let state: OracleState = serde_json::from_str(&content)?;
        self.load_state(state)
    }

    pub fn load_state(&mut self, state: OracleState) -> HtResult<()> {
        if state.objective != self.objective {
            return Err(validation_error!(
                "saved objective {} does not match {}",
                state.objective,
                self.objective
            ));
        }
        self.update_space(state.space.iter().cloned())?;
        if state.strategy == self.strategy.name() {
            self.strategy.restore(&state.strategy_state)?;
        }

        let direction = self.objective.direction;
        let mut interrupted = 0;
        for mut trial in state.trials {
            if trial.status == TrialStatus::Running {
                trial.mark_failed("interrupted".to_string());
                interrupted += 1;
            }
            if trial.status == TrialStatus::Completed {
                if let Some(score) = trial.normalized_score(direction) {
                    self.strategy.result(score, &trial.hyperparameters);
                }
            }
            if !self.trials.contains_key(&trial.trial_id) {
                self.order.push(trial.trial_id.clone());
            }
            self.trials.insert(trial.trial_id.clone(), trial);
        }
        self.collisions = self.collisions.max(state.collisions);
        self.refresh_best();

        info!(
            trials = self.trials.len(),
            interrupted,
            "restored oracle state"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hyperparameters::ParameterValue;
    use ht_types::{Direction, ObjectiveSpec};
    use tempfile::tempdir;

    fn config() -> TunerConfig {
        TunerConfig::new("test", "loss").with_seed(1234).with_max_trials(50)
    }

    fn space() -> Vec<HyperParameter> {
        vec![
            HyperParameter::int("units", 8, 256, 8),
            HyperParameter::log_uniform("lr", 1e-4, 1e-1),
            HyperParameter::choice("activation", ["relu", "tanh"]),
        ]
    }

    fn metrics(entries: &[(&str, f64)]) -> BTreeMap<String, f64> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn complete(oracle: &mut Oracle, loss: f64) -> TrialId {
        let trial = oracle.create_trial("tuner").unwrap().unwrap();
        oracle
            .update_trial(&trial.trial_id, &metrics(&[("loss", loss)]), 0)
            .unwrap();
        oracle
            .end_trial(&trial.trial_id, TrialStatus::Completed, None)
            .unwrap();
        trial.trial_id
    }

    /// Always proposes the same continuous configuration.
    struct Stuck;

    impl SearchStrategy for Stuck {
        fn populate_space(&mut self, space: &HyperParameters) -> Population {
            Population::Assignment(space.defaults())
        }

        fn name(&self) -> &str {
            "stuck"
        }
    }

    #[test]
    fn seeded_trial_sequence_is_reproducible() {
        let mut a = Oracle::random(&config()).unwrap();
        let mut b = Oracle::random(&config()).unwrap();
        a.update_space(space()).unwrap();
        b.update_space(space()).unwrap();

        for _ in 0..10 {
            let ta = a.create_trial("x").unwrap().unwrap();
            let tb = b.create_trial("y").unwrap().unwrap();
            assert_eq!(ta.trial_id, tb.trial_id);
            assert_eq!(ta.hyperparameters, tb.hyperparameters);
        }
    }

    #[test]
    fn trials_are_numbered_in_creation_order() {
        let mut oracle = Oracle::random(&config()).unwrap();
        oracle.update_space(space()).unwrap();
        for _ in 0..3 {
            oracle.create_trial("t").unwrap().unwrap();
        }
        let numbers: Vec<usize> = oracle.trials().map(|t| t.trial_number).collect();
        assert_eq!(numbers, vec![0, 1, 2]);
        assert_eq!(oracle.count(TrialStatus::Running), 3);
    }

    #[test]
    fn max_trials_stops_creation() {
        let mut oracle = Oracle::random(&config().with_max_trials(2)).unwrap();
        oracle.update_space(space()).unwrap();
        assert!(oracle.create_trial("t").unwrap().is_some());
        assert!(oracle.create_trial("t").unwrap().is_some());
        assert!(oracle.create_trial("t").unwrap().is_none());
    }

    #[test]
    fn finite_space_runs_out_without_error() {
        let mut oracle = Oracle::random(&config()).unwrap();
        oracle
            .update_space(vec![HyperParameter::choice("opt", ["sgd", "adam"])])
            .unwrap();
        let mut seen = Vec::new();
        while let Some(trial) = oracle.create_trial("t").unwrap() {
            seen.push(trial.hyperparameters["opt"].clone());
        }
        assert_eq!(seen.len(), 2);
        assert_ne!(seen[0], seen[1]);
    }

    #[test]
    fn grid_oracle_exhausts() {
        let mut oracle = Oracle::grid(&config()).unwrap();
        oracle
            .update_space(vec![HyperParameter::int("layers", 1, 3, 1)])
            .unwrap();
        let mut count = 0;
        while oracle.create_trial("t").unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn repeated_collisions_exhaust_the_space() {
        let mut oracle = Oracle::new(&config().with_max_collisions(4), Stuck).unwrap();
        oracle
            .update_space(vec![HyperParameter::float("dropout", 0.0, 0.5)])
            .unwrap();
        assert!(oracle.create_trial("t").unwrap().is_some());

        let err = oracle.create_trial("t").unwrap_err();
        assert!(matches!(err, HtError::ExhaustedSearchSpace { attempts: 5 }));
        assert!(err.is_exhaustion());
        assert_eq!(oracle.collisions(), 5);
    }

    #[test]
    fn requested_values_are_pinned() {
        let mut oracle = Oracle::random(&config()).unwrap();
        oracle.update_space(space()).unwrap();
        let mut requested = Assignment::new();
        requested.insert("activation".into(), ParameterValue::Text("tanh".into()));

        for _ in 0..5 {
            match oracle.populate_space(&requested).unwrap() {
                Population::Assignment(values) => {
                    assert_eq!(values["activation"], ParameterValue::Text("tanh".into()));
                    assert_eq!(values.len(), 3);
                }
                Population::Exhausted => panic!("random search never exhausts"),
            }
        }
    }

    #[test]
    fn unknown_requested_parameter_fails() {
        let mut oracle = Oracle::random(&config()).unwrap();
        oracle.update_space(space()).unwrap();
        let mut requested = Assignment::new();
        requested.insert("depth".into(), ParameterValue::Int(3));
        assert!(matches!(
            oracle.populate_space(&requested),
            Err(HtError::UnknownParameter { .. })
        ));
    }

    #[test]
    fn multi_objective_fails_at_construction() {
        let mut config = config();
        config.objective = ObjectiveSpec::Multi(vec!["loss".into(), "acc".into()]);
        assert!(matches!(
            Oracle::random(&config),
            Err(HtError::MultiObjectiveUnsupported { .. })
        ));
    }

    #[test]
    fn best_trials_minimize() {
        let mut oracle = Oracle::random(&config()).unwrap();
        oracle.update_space(space()).unwrap();
        complete(&mut oracle, 0.9);
        let best = complete(&mut oracle, 0.2);
        complete(&mut oracle, 0.5);

        assert_eq!(oracle.best_trial().unwrap().trial_id, best);
        let top: Vec<f64> = oracle
            .get_best_trials(2)
            .iter()
            .map(|t| t.score.unwrap())
            .collect();
        assert_eq!(top, vec![0.2, 0.5]);
    }

    #[test]
    fn best_trials_maximize_and_ties() {
        let mut config = config().with_seed(99);
        config.objective = "val_acc".into();
        let mut oracle = Oracle::random(&config).unwrap();
        oracle.update_space(space()).unwrap();

        let mut ids = Vec::new();
        for acc in [0.7, 0.9, 0.9] {
            let trial = oracle.create_trial("t").unwrap().unwrap();
            assert_eq!(
                trial.metrics.get_direction("val_acc"),
                Some(Direction::Max)
            );
            oracle
                .update_trial(&trial.trial_id, &metrics(&[("val_acc", acc)]), 0)
                .unwrap();
            oracle
                .end_trial(&trial.trial_id, TrialStatus::Completed, None)
                .unwrap();
            ids.push(trial.trial_id);
        }

        let best = oracle.get_best_trials(3);
        assert_eq!(best[0].trial_id, ids[1]);
        assert_eq!(best[1].trial_id, ids[2]);
        assert_eq!(best[2].trial_id, ids[0]);
    }

    #[test]
    fn nan_objective_values_do_not_win() {
        let mut config = config().with_seed(5);
        config.objective = "val_acc".into();
        let mut oracle = Oracle::random(&config).unwrap();
        oracle.update_space(space()).unwrap();

        let first = oracle.create_trial("t").unwrap().unwrap();
        for (step, acc) in [(0, f64::NAN), (1, 0.5)] {
            oracle
                .update_trial(&first.trial_id, &metrics(&[("val_acc", acc)]), step)
                .unwrap();
        }
        oracle
            .end_trial(&first.trial_id, TrialStatus::Completed, None)
            .unwrap();

        let second = oracle.create_trial("t").unwrap().unwrap();
        oracle
            .update_trial(&second.trial_id, &metrics(&[("val_acc", 0.9)]), 0)
            .unwrap();
        oracle
            .end_trial(&second.trial_id, TrialStatus::Completed, None)
            .unwrap();

        let stored = oracle.get_trial(&first.trial_id).unwrap();
        assert_eq!(stored.score, Some(0.5));
        assert_eq!(stored.best_step, Some(1));
        assert_eq!(oracle.best_trial().unwrap().trial_id, second.trial_id);
        assert_eq!(oracle.get_best_trials(1)[0].score, Some(0.9));

        let only_nan = oracle.create_trial("t").unwrap().unwrap();
        oracle
            .update_trial(&only_nan.trial_id, &metrics(&[("val_acc", f64::NAN)]), 0)
            .unwrap();
        oracle
            .end_trial(&only_nan.trial_id, TrialStatus::Completed, None)
            .unwrap();
        assert_eq!(oracle.get_trial(&only_nan.trial_id).unwrap().score, None);
        assert_eq!(oracle.get_best_trials(5).len(), 2);
    }

    #[test]
    fn score_is_best_objective_value_across_steps() {
        let mut oracle = Oracle::random(&config()).unwrap();
        oracle.update_space(space()).unwrap();
        let trial = oracle.create_trial("t").unwrap().unwrap();
        for (step, loss) in [(0, 0.8), (1, 0.3), (2, 0.4)] {
            oracle
                .update_trial(&trial.trial_id, &metrics(&[("loss", loss), ("acc", 0.5)]), step)
                .unwrap();
        }
        let stored = oracle.get_trial(&trial.trial_id).unwrap();
        assert_eq!(stored.score, Some(0.3));
        assert_eq!(stored.best_step, Some(1));
        assert_eq!(stored.metrics.get_direction("acc"), Some(Direction::Max));
    }

    #[test]
    fn failed_trials_are_not_ranked() {
        let mut oracle = Oracle::random(&config()).unwrap();
        oracle.update_space(space()).unwrap();
        let trial = oracle.create_trial("t").unwrap().unwrap();
        oracle
            .update_trial(&trial.trial_id, &metrics(&[("loss", 0.01)]), 0)
            .unwrap();
        oracle
            .end_trial(&trial.trial_id, TrialStatus::Failed, Some("nan loss".into()))
            .unwrap();

        assert!(oracle.get_best_trials(1).is_empty());
        assert!(oracle.best_trial().is_none());
        assert!(oracle
            .update_trial(&trial.trial_id, &metrics(&[("loss", 0.5)]), 1)
            .is_err());
    }

    #[test]
    fn unknown_trial_is_reported() {
        let mut oracle = Oracle::random(&config()).unwrap();
        let missing = compute_identity(&Assignment::new());
        assert!(matches!(
            oracle.update_trial(&missing, &BTreeMap::new(), 0),
            Err(HtError::TrialNotFound { .. })
        ));
    }

    #[test]
    fn state_round_trip_avoids_known_configurations() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("oracle.json");

        let config = config().with_max_collisions(200);
        let mut oracle = Oracle::random(&config).unwrap();
        oracle
            .update_space(vec![HyperParameter::int("units", 1, 6, 1)])
            .unwrap();
        let best = complete(&mut oracle, 0.1);
        complete(&mut oracle, 0.4);
        let running = oracle.create_trial("t").unwrap().unwrap();
        oracle.save_state(&path).unwrap();

        let mut restored = Oracle::random(&config).unwrap();
        restored.restore_state(&path).unwrap();
        assert_eq!(restored.len(), 3);
        assert_eq!(restored.best_trial().unwrap().trial_id, best);
        assert_eq!(
            restored.get_trial(&running.trial_id).unwrap().status,
            TrialStatus::Failed
        );

        let mut seen: Vec<_> = restored.trials().map(|t| t.trial_id.clone()).collect();
        while let Some(trial) = restored.create_trial("t").unwrap() {
            assert!(!seen.contains(&trial.trial_id));
            seen.push(trial.trial_id);
        }
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn restore_rejects_other_objective() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("oracle.json");
        Oracle::random(&config()).unwrap().save_state(&path).unwrap();

        let mut config = config();
        config.objective = "val_acc".into();
        let mut other = Oracle::random(&config).unwrap();
        assert!(other.restore_state(&path).is_err());
    }
}
