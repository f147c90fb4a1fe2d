// Tuner - the search loop
// Asks the oracle for trials, trains every execution and records results

use chrono::{DateTime, Utc};
use ht_optimizer::{
    strategy_from_config, Assignment, Oracle, RandomSearch, SearchStrategy, Trial, TrialId,
    TrialStatus,
};
use ht_types::{Budget, HtError, HtResult, MetricsRegistry, Objective, TunerConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::callbacks::{early_stopping_on, TerminateOnNaN, TrainingCallback};
use crate::checkpoint::{purge, CheckpointTracker};
use crate::execution::average_histories;
use crate::instance::InstanceRegistry;
use crate::model::{FitOptions, HyperModel, TrainableModel};
use crate::results::load_all;
use crate::storage::ResultStore;

pub const SUMMARY_FILE: &str = "summary.json";

/// Produces a fresh callback for every execution.
pub type CallbackFactory = Box<dyn Fn() -> Box<dyn TrainingCallback>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunerState {
    Init,
    RequestTrial,
    BuildModel,
    Train,
    Record,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    BudgetExhausted,
    SearchSpaceExhausted,
    TooManyInvalidModels,
}

/// How a single trial ended, as seen by the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrialOutcome {
    Completed,
    Failed,
    Invalid,
    Duplicate,
    Oversized,
}

#[derive(Debug, Clone, Default)]
struct SearchStats {
    invalid_models: usize,
    oversized_models: usize,
    failed_trials: usize,
    /// Planned epochs charged against the budget.
    epochs_consumed: u64,
    /// Epochs actually trained; lower than planned when runs stop early.
    epochs_trained: u64,
}

/// Outcome of a search, also written to `summary.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSummary {
    pub project: String,
    pub tuner_id: String,
    pub strategy: String,
    pub trials_created: usize,
    pub trials_completed: usize,
    pub trials_failed: usize,
    pub invalid_models: usize,
    pub oversized_models: usize,
    /// Proposals rejected because their configuration was already tried.
    pub duplicate_configs: usize,
    /// Models discarded because an identical topology was already trained.
    pub duplicate_models: usize,
    pub epochs_consumed: u64,
    pub epochs_trained: u64,
    pub best_trial: Option<TrialId>,
    pub best_score: Option<f64>,
    pub best_hyperparameters: Option<Assignment>,
    /// Best value seen for every key metric.
    pub key_metrics: BTreeMap<String, f64>,
    pub termination: TerminationReason,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SearchSummary {
    pub fn load(path: impl AsRef<Path>) -> HtResult<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Runs a hyperparameter search over the models of `H`.
pub struct Tuner<H: HyperModel, S: SearchStrategy = RandomSearch> {
    config: TunerConfig,
    hypermodel: H,
    oracle: Oracle<S>,
    store: ResultStore,
    instances: InstanceRegistry,
    tuner_id: String,
    state: TunerState,
    /// Key metrics, including the objective.
    tracked: Vec<Objective>,
    registry: MetricsRegistry,
    last_metrics: BTreeMap<String, f64>,
    callbacks: Vec<CallbackFactory>,
    checkpoints: bool,
    stats: SearchStats,
}

impl<H: HyperModel> Tuner<H, RandomSearch> {
    /// Tuner backed by random search.
    pub fn new(config: TunerConfig, hypermodel: H) -> HtResult<Self> {
        config.validate()?;
        let oracle = Oracle::random(&config)?;
        Self::with_oracle(config, hypermodel, oracle)
    }
}

impl<H: HyperModel> Tuner<H, Box<dyn SearchStrategy>> {
    /// Tuner using the strategy named by `config.strategy`.
    pub fn from_config(config: TunerConfig, hypermodel: H) -> HtResult<Self> {
        config.validate()?;
        let oracle = Oracle::new(&config, strategy_from_config(&config)?)?;
        Self::with_oracle(config, hypermodel, oracle)
    }
}

impl<H: HyperModel, S: SearchStrategy> Tuner<H, S> {
    pub fn with_oracle(config: TunerConfig, hypermodel: H, mut oracle: Oracle<S>) -> HtResult<Self> {
        config.validate()?;
        oracle.update_space(hypermodel.space().iter().cloned())?;
        let store = ResultStore::from_config(&config)?;

        let mut tracked = config.key_metrics.clone();
        if !tracked.iter().any(|m| m.name == oracle.objective().name) {
            tracked.push(oracle.objective().clone());
        }
        let registry = MetricsRegistry::new(&tracked);

        Ok(Self {
            tuner_id: format!("tuner-{}", Uuid::new_v4()),
            config,
            hypermodel,
            oracle,
            store,
            instances: InstanceRegistry::new(),
            state: TunerState::Init,
            tracked,
            registry,
            last_metrics: BTreeMap::new(),
            callbacks: Vec::new(),
            checkpoints: false,
            stats: SearchStats::default(),
        })
    }

    /// Pick up a search saved under the project directory: restores the
    /// oracle and marks the models already trained as known.
    pub fn resume(mut self) -> HtResult<Self> {
        let path = self.config.oracle_state_path();
        if path.exists() {
            self.oracle.restore_state(&path)?;
        }
        for results in load_all(self.config.project_dir())? {
            for (name, value) in &results.key_metrics {
                self.registry.update(name, *value);
            }
            self.instances.remember(results.instance_id);
        }

        let trained =
            self.oracle.count(TrialStatus::Completed) + self.oracle.count(TrialStatus::Failed);
        self.stats.epochs_consumed = trained as u64 * self.config.epochs_per_trial();
        info!(
            "Resumed project {} with {} trials",
            self.config.project_name,
            self.oracle.len()
        );
        Ok(self)
    }

    pub fn add_callback<F>(&mut self, factory: F)
    where
        F: Fn() -> Box<dyn TrainingCallback> + 'static,
    {
        self.callbacks.push(Box::new(factory));
    }

    /// Stop an execution once the objective stalls for `patience` epochs.
    pub fn with_early_stopping(mut self, patience: usize) -> Self {
        let monitor = self.oracle.objective().clone();
        self.add_callback(move || -> Box<dyn TrainingCallback> {
            Box::new(early_stopping_on(&monitor, patience))
        });
        self
    }

    pub fn with_terminate_on_nan(mut self) -> Self {
        self.add_callback(|| -> Box<dyn TrainingCallback> { Box::new(TerminateOnNaN) });
        self
    }

    /// Keep the best-so-far weights of every trial under the checkpoint dir.
    pub fn with_checkpoints(mut self) -> Self {
        self.checkpoints = true;
        self
    }

    pub fn config(&self) -> &TunerConfig {
        &self.config
    }

    pub fn oracle(&self) -> &Oracle<S> {
        &self.oracle
    }

    pub fn instances(&self) -> &InstanceRegistry {
        &self.instances
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn state(&self) -> TunerState {
        self.state
    }

    pub fn tuner_id(&self) -> &str {
        &self.tuner_id
    }

    pub fn key_metrics(&self) -> &MetricsRegistry {
        &self.registry
    }

    /// Run trials until the budget is spent, the space is exhausted or too
    /// many models in a row are rejected.
    pub fn search(
        &mut self,
        data: &<H::Model as TrainableModel>::Data,
    ) -> HtResult<SearchSummary> {
        let started_at = Utc::now();
        self.state = TunerState::Init;
        self.store.clear_tmp()?;
        info!(
            "Starting search {} for project {}",
            self.tuner_id, self.config.project_name
        );
        info!(
            strategy = self.oracle.strategy().name(),
            objective = %self.oracle.objective(),
            parameters = self.oracle.space().len(),
            executions = self.config.executions_per_trial,
            epochs = self.config.epochs_per_execution,
            "search configuration"
        );

        let mut fail_streak = 0;
        let mut oversized_streak = 0;
        let termination = loop {
            if self.epoch_budget_spent() {
                break TerminationReason::BudgetExhausted;
            }

            self.state = TunerState::RequestTrial;
            let trial = match self.oracle.create_trial(&self.tuner_id) {
                Ok(Some(trial)) => trial,
                Ok(None) => break self.no_trial_reason(),
                Err(e) if e.is_exhaustion() => {
                    warn!("{}", e);
                    break TerminationReason::SearchSpaceExhausted;
                }
                Err(e) => return Err(e),
            };

            let outcome = self.run_trial(&trial, data)?;
            self.oracle.save_state(self.config.oracle_state_path())?;
            match outcome {
                TrialOutcome::Completed => {
                    fail_streak = 0;
                    oversized_streak = 0;
                }
                TrialOutcome::Oversized => {
                    oversized_streak += 1;
                    if oversized_streak > self.config.max_consecutive_oversized {
                        self.state = TunerState::Terminated;
                        return Err(HtError::TooManyOversizedModels {
                            count: oversized_streak,
                        });
                    }
                }
                TrialOutcome::Failed | TrialOutcome::Invalid | TrialOutcome::Duplicate => {
                    fail_streak += 1;
                    oversized_streak = 0;
                }
            }
            if fail_streak >= self.config.max_fail_streak {
                warn!("Giving up after {} rejected models in a row", fail_streak);
                break TerminationReason::TooManyInvalidModels;
            }
        };

        self.state = TunerState::Terminated;
        let summary = self.summary(termination, started_at);
        let path = self.config.project_dir().join(SUMMARY_FILE);
        fs::write(&path, serde_json::to_string_pretty(&summary)?)?;
        info!(
            "Search finished ({:?}): {} trials, {} completed, best score {:?}",
            summary.termination, summary.trials_created, summary.trials_completed, summary.best_score
        );
        Ok(summary)
    }

    fn epoch_budget_spent(&self) -> bool {
        match self.config.budget {
            Budget::EpochBudget(epochs) => self.stats.epochs_consumed >= epochs,
            Budget::MaxTrials(_) => false,
        }
    }

    fn no_trial_reason(&self) -> TerminationReason {
        match self.config.max_trials() {
            Some(max) if self.oracle.len() >= max => TerminationReason::BudgetExhausted,
            _ => TerminationReason::SearchSpaceExhausted,
        }
    }

    fn run_trial(
        &mut self,
        trial: &Trial,
        data: &<H::Model as TrainableModel>::Data,
    ) -> HtResult<TrialOutcome> {
        let trial_id = &trial.trial_id;
        let hp = &trial.hyperparameters;

        self.state = TunerState::BuildModel;
        let first = match self.hypermodel.build(hp) {
            Ok(model) => model,
            Err(reason) => {
                self.stats.invalid_models += 1;
                let error = HtError::InvalidModel { reason };
                debug!(trial = trial.trial_number, "{}", error);
                self.oracle
                    .end_trial(trial_id, TrialStatus::Invalid, Some(error.to_string()))?;
                return Ok(TrialOutcome::Invalid);
            }
        };

        let size = first.parameter_count();
        if let Some(limit) = self.config.max_model_size {
            if size > limit {
                self.stats.oversized_models += 1;
                let error = HtError::OversizedModel { size, limit };
                warn!(trial = trial.trial_number, "{}", error);
                self.oracle
                    .end_trial(trial_id, TrialStatus::Invalid, Some(error.to_string()))?;
                return Ok(TrialOutcome::Oversized);
            }
        }

        let Some(instance) = self.instances.get_or_create(trial_id, hp, &first) else {
            let error = HtError::DuplicateConfiguration {
                digest: trial_id.to_string(),
            };
            self.oracle
                .end_trial(trial_id, TrialStatus::Invalid, Some(error.to_string()))?;
            return Ok(TrialOutcome::Duplicate);
        };
        if self.checkpoints {
            let dir = self.config.checkpoint_dir();
            // leftovers of an interrupted run of the same configuration
            purge(&dir, trial_id, None)?;
            instance.checkpoint = Some(CheckpointTracker::new(
                dir,
                trial_id.clone(),
                self.oracle.objective().clone(),
            ));
        }

        self.state = TunerState::Train;
        let executions = self.config.executions_per_trial;
        let options = FitOptions::epochs(self.config.epochs_per_execution);
        let mut models = Vec::with_capacity(executions);
        let mut histories = Vec::with_capacity(executions);
        let mut pending = Some(first);
        let mut failure = None;
        for execution in 0..executions {
            let mut model = match pending.take() {
                Some(model) => model,
                None => match self.hypermodel.build(hp) {
                    Ok(model) => model,
                    Err(reason) => {
                        failure = Some(HtError::InvalidModel { reason }.to_string());
                        break;
                    }
                },
            };
            let mut callbacks: Vec<Box<dyn TrainingCallback>> =
                self.callbacks.iter().map(|factory| factory()).collect();
            match instance.fit(&mut model, data, false, &options, &mut callbacks) {
                Ok(run) => {
                    debug!(trial = trial.trial_number, execution, epochs = run.len(), "execution done");
                    histories.push(run);
                    models.push(model);
                }
                Err(e) if e.is_recoverable() => {
                    warn!("Trial {} execution {} failed: {}", trial.trial_number, execution, e);
                    failure = Some(e.to_string());
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        self.stats.epochs_consumed += self.config.epochs_per_trial();
        self.stats.epochs_trained += instance
            .executions
            .iter()
            .map(|e| e.num_epochs as u64)
            .sum::<u64>();

        if let Some(error) = failure {
            self.stats.failed_trials += 1;
            self.oracle
                .end_trial(trial_id, TrialStatus::Failed, Some(error))?;
            return Ok(TrialOutcome::Failed);
        }

        self.state = TunerState::Record;
        for (step, logs) in average_histories(&histories).iter().enumerate() {
            self.oracle.update_trial(trial_id, logs, step as u64)?;
        }
        self.oracle.end_trial(trial_id, TrialStatus::Completed, None)?;

        let results = instance.record_results(
            &models,
            &self.tracked,
            self.config.save_models,
            &self.store,
        )?;
        for (name, value) in &results.key_metrics {
            self.registry.update(name, *value);
        }
        self.last_metrics = results.key_metrics;

        let score = self.oracle.get_trial(trial_id).and_then(|t| t.score);
        info!(
            "Trial {} ({}) completed, score {:?}",
            trial.trial_number,
            trial_id.short(),
            score
        );
        self.log_key_metrics();
        Ok(TrialOutcome::Completed)
    }

    fn log_key_metrics(&self) {
        info!("{:<16} {:>12} {:>12}", "metric", "best", "last");
        for (name, entry) in self.registry.iter() {
            let best = entry.best.map_or_else(|| "-".to_string(), |v| format!("{v:.4}"));
            let last = self
                .last_metrics
                .get(name)
                .map_or_else(|| "-".to_string(), |v| format!("{v:.4}"));
            info!("{:<16} {:>12} {:>12}", name, best, last);
        }
    }

    fn summary(&self, termination: TerminationReason, started_at: DateTime<Utc>) -> SearchSummary {
        let best = self.oracle.best_trial();
        SearchSummary {
            project: self.config.project_name.clone(),
            tuner_id: self.tuner_id.clone(),
            strategy: self.oracle.strategy().name().to_string(),
            trials_created: self.oracle.len(),
            trials_completed: self.oracle.count(TrialStatus::Completed),
            trials_failed: self.stats.failed_trials,
            invalid_models: self.stats.invalid_models,
            oversized_models: self.stats.oversized_models,
            duplicate_configs: self.oracle.collisions(),
            duplicate_models: self.instances.collisions(),
            epochs_consumed: self.stats.epochs_consumed,
            epochs_trained: self.stats.epochs_trained,
            best_trial: best.map(|t| t.trial_id.clone()),
            best_score: best.and_then(|t| t.score),
            best_hyperparameters: best.map(|t| t.hyperparameters.clone()),
            key_metrics: self
                .registry
                .iter()
                .filter_map(|(name, entry)| entry.best.map(|v| (name.to_string(), v)))
                .collect(),
            termination,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Copy the config and weights of the `n` best trials to the export
    /// directory. For each trial the execution that reached the best
    /// objective value is exported.
    pub fn export_best_models(&self, n: usize) -> HtResult<Vec<PathBuf>> {
        fs::create_dir_all(&self.config.export_dir)?;
        let objective = self.oracle.objective();

        let mut exported = Vec::new();
        for (rank, trial) in self.oracle.get_best_trials(n).into_iter().enumerate() {
            let Some(instance) = self.instances.find_by_trial(&trial.trial_id) else {
                debug!(trial = trial.trial_number, "no instance in memory, skipping export");
                continue;
            };
            let execution = instance
                .executions
                .iter()
                .filter_map(|e| {
                    e.metrics
                        .get(&objective.name)
                        .map(|r| (e.index, objective.direction.normalize(r.get(objective.direction))))
                })
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .map_or(0, |(index, _)| index);

            let sources = [
                (self.store.config_path(&instance.instance_id, execution), "config.json"),
                (self.store.weights_path(&instance.instance_id, execution), "weights.bin"),
            ];
            for (source, suffix) in sources {
                if !source.exists() {
                    continue;
                }
                let target = self.config.export_dir.join(format!(
                    "{}-{}-{}",
                    self.config.project_name, rank, suffix
                ));
                fs::copy(&source, &target)?;
                exported.push(target);
            }
        }
        info!("Exported {} files to {}", exported.len(), self.config.export_dir.display());
        Ok(exported)
    }
}
