use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::HtResult;
use crate::metrics::{Direction, Objective, ObjectiveSpec};
use crate::{config_error, validation_error};

/// How much work a search may spend before it stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Budget {
    /// Stop after this many trials have been created.
    MaxTrials(usize),
    /// Stop once this many training epochs have been spent. Each trial costs
    /// `executions_per_trial * epochs_per_execution`.
    EpochBudget(u64),
}

impl Default for Budget {
    fn default() -> Self {
        Self::MaxTrials(10)
    }
}

/// Tuning run configuration.
///
/// Passed by reference to the oracle and the tuner; there is no ambient
/// global configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    /// Prefix for every persisted artifact.
    pub project_name: String,

    /// Where result documents, model configs and weights are written.
    pub results_dir: PathBuf,

    /// Scratch space, wiped when a tuner starts.
    pub tmp_dir: PathBuf,

    /// Where exported models end up.
    pub export_dir: PathBuf,

    /// Remote directory artifacts are mirrored to, if any.
    pub remote_dir: Option<String>,

    /// Metric to optimize. Must resolve to a single objective.
    pub objective: ObjectiveSpec,

    pub budget: Budget,

    /// Repeated trainings per trial; their final-epoch metrics are averaged.
    pub executions_per_trial: usize,

    pub epochs_per_execution: usize,

    /// Invalid models tolerated in a row before trial generation stops.
    pub max_fail_streak: usize,

    /// Resampling attempts when a proposal collides with a known trial.
    pub max_collisions: usize,

    /// Largest accepted parameter count.
    pub max_model_size: Option<u64>,

    /// Oversized models tolerated in a row before the search aborts.
    pub max_consecutive_oversized: usize,

    /// Metrics summarized at the top level of result documents.
    pub key_metrics: Vec<Objective>,

    /// Persist model weights alongside the result documents.
    pub save_models: bool,

    /// Search strategy: "random", "grid" or "local".
    pub strategy: String,

    /// Seed for reproducible proposals. `None` draws one from the OS.
    pub seed: Option<u64>,

    /// Number of steps per continuous dimension for grid search.
    pub grid_steps: usize,

    /// Probability of exploring rather than exploiting in local search.
    pub exploration_weight: f64,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            project_name: "hypertune".to_string(),
            results_dir: PathBuf::from("results"),
            tmp_dir: PathBuf::from("tmp"),
            export_dir: PathBuf::from("export"),
            remote_dir: None,
            objective: ObjectiveSpec::Name("loss".to_string()),
            budget: Budget::default(),
            executions_per_trial: 1,
            epochs_per_execution: 10,
            max_fail_streak: 20,
            max_collisions: 20,
            max_model_size: None,
            max_consecutive_oversized: 5,
            key_metrics: default_key_metrics(),
            save_models: true,
            strategy: "random".to_string(),
            seed: None,
            grid_steps: 5,
            exploration_weight: 0.3,
        }
    }
}

/// Search strategies understood by the optimizer.
pub const STRATEGIES: [&str; 3] = ["random", "grid", "local"];

/// `loss`/`val_loss` minimized, `acc`/`val_acc` maximized.
pub fn default_key_metrics() -> Vec<Objective> {
    vec![
        Objective::new("loss", Direction::Min),
        Objective::new("val_loss", Direction::Min),
        Objective::new("acc", Direction::Max),
        Objective::new("val_acc", Direction::Max),
    ]
}

impl TunerConfig {
    pub fn new(project_name: impl Into<String>, objective: impl Into<ObjectiveSpec>) -> Self {
        Self {
            project_name: project_name.into(),
            objective: objective.into(),
            ..Self::default()
        }
    }

    pub fn with_results_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.results_dir = dir.into();
        self
    }

    pub fn with_tmp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tmp_dir = dir.into();
        self
    }

    pub fn with_export_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.export_dir = dir.into();
        self
    }

    /// Put results, scratch and export directories under one root.
    pub fn with_root_dir(self, root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        self.with_results_dir(root.join("results"))
            .with_tmp_dir(root.join("tmp"))
            .with_export_dir(root.join("export"))
    }

    pub fn with_remote_dir(mut self, dir: impl Into<String>) -> Self {
        self.remote_dir = Some(dir.into());
        self
    }

    pub fn with_budget(mut self, budget: Budget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_max_trials(self, n: usize) -> Self {
        self.with_budget(Budget::MaxTrials(n))
    }

    pub fn with_epoch_budget(self, epochs: u64) -> Self {
        self.with_budget(Budget::EpochBudget(epochs))
    }

    pub fn with_executions(mut self, n: usize) -> Self {
        self.executions_per_trial = n;
        self
    }

    pub fn with_epochs(mut self, n: usize) -> Self {
        self.epochs_per_execution = n;
        self
    }

    pub fn with_max_fail_streak(mut self, n: usize) -> Self {
        self.max_fail_streak = n;
        self
    }

    pub fn with_max_collisions(mut self, n: usize) -> Self {
        self.max_collisions = n;
        self
    }

    pub fn with_max_model_size(mut self, size: u64) -> Self {
        self.max_model_size = Some(size);
        self
    }

    pub fn with_key_metrics(mut self, metrics: Vec<Objective>) -> Self {
        self.key_metrics = metrics;
        self
    }

    pub fn with_save_models(mut self, save: bool) -> Self {
        self.save_models = save;
        self
    }

    pub fn with_strategy(mut self, strategy: &str) -> Self {
        self.strategy = strategy.to_string();
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Trial cap, when the budget is expressed in trials.
    pub fn max_trials(&self) -> Option<usize> {
        match self.budget {
            Budget::MaxTrials(n) => Some(n),
            Budget::EpochBudget(_) => None,
        }
    }

    /// Epochs one trial consumes.
    pub fn epochs_per_trial(&self) -> u64 {
        (self.executions_per_trial * self.epochs_per_execution) as u64
    }

    /// `<results_dir>/<project_name>`
    pub fn project_dir(&self) -> PathBuf {
        self.results_dir.join(&self.project_name)
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.project_dir().join("checkpoints")
    }

    pub fn oracle_state_path(&self) -> PathBuf {
        self.project_dir().join("oracle.json")
    }

    pub fn validate(&self) -> HtResult<()> {
        if self.project_name.trim().is_empty() {
            return Err(config_error!("project_name must not be empty"));
        }
        // the tmp dir is wiped at the start of every search
        if self.results_dir.starts_with(&self.tmp_dir) || self.tmp_dir.starts_with(&self.results_dir)
        {
            return Err(config_error!(
                "results dir {} and tmp dir {} must not contain each other",
                self.results_dir.display(),
                self.tmp_dir.display()
            ));
        }
        if self.executions_per_trial == 0 {
            return Err(validation_error!("executions_per_trial must be positive"));
        }
        if self.epochs_per_execution == 0 {
            return Err(validation_error!("epochs_per_execution must be positive"));
        }
        if self.max_fail_streak == 0 {
            return Err(validation_error!("max_fail_streak must be positive"));
        }
        if !(0.0..=1.0).contains(&self.exploration_weight) {
            return Err(validation_error!(
                "exploration_weight must be in [0, 1], got {}",
                self.exploration_weight
            ));
        }
        if !STRATEGIES.contains(&self.strategy.as_str()) {
            return Err(config_error!(
                "unknown strategy '{}': expected one of {STRATEGIES:?}",
                self.strategy
            ));
        }
        self.objective.clone().into_single()?;
        Ok(())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> HtResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_file(&self, path: impl AsRef<Path>) -> HtResult<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
