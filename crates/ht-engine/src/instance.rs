//! Instances: one materialized model per trial.

use chrono::{DateTime, Utc};
use ht_optimizer::{Assignment, ConfigDigest, TrialId};
use ht_types::{HtResult, Objective};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tracing::{debug, info};

use crate::callbacks::TrainingCallback;
use crate::checkpoint::CheckpointTracker;
use crate::execution::Execution;
use crate::model::{FitOptions, Logs, TrainableModel, TrainingSet};
use crate::results::{aggregate_metrics, key_metric_values, ExecutionSummary, InstanceResults};
use crate::storage::ResultStore;

#[derive(Debug, Clone)]
pub struct Instance {
    /// Digest of the model descriptor.
    pub instance_id: ConfigDigest,
    pub trial_id: TrialId,
    pub hyperparameters: Assignment,
    pub descriptor: serde_json::Value,
    pub model_size: u64,
    pub training_size: usize,
    pub validation_size: usize,
    pub executions: Vec<Execution>,
    pub checkpoint: Option<CheckpointTracker>,
    pub created_at: DateTime<Utc>,
    pub results: Option<InstanceResults>,
}

impl Instance {
    pub fn new<M: TrainableModel + ?Sized>(
        trial_id: TrialId,
        hyperparameters: Assignment,
        model: &M,
    ) -> Self {
        let descriptor = model.descriptor();
        Self {
            instance_id: ConfigDigest::of_descriptor(&descriptor),
            trial_id,
            hyperparameters,
            descriptor,
            model_size: model.parameter_count(),
            training_size: 0,
            validation_size: 0,
            executions: Vec::new(),
            checkpoint: None,
            created_at: Utc::now(),
            results: None,
        }
    }

    /// Keep the best-so-far weights of this trial under `dir`, judged by `monitor`.
    pub fn with_checkpoints(mut self, dir: impl Into<PathBuf>, monitor: Objective) -> Self {
        self.checkpoint = Some(CheckpointTracker::new(dir, self.trial_id.clone(), monitor));
        self
    }

    /// Run one execution. With `resume` the last execution continues its
    /// epoch counter, otherwise a new execution is started.
    pub fn fit<M: TrainableModel>(
        &mut self,
        model: &mut M,
        data: &M::Data,
        resume: bool,
        options: &FitOptions,
        callbacks: &mut [Box<dyn TrainingCallback>],
    ) -> HtResult<Vec<Logs>> {
        self.training_size = data.training_size();
        self.validation_size = data.validation_size();

        let index = match self.executions.len() {
            n if resume && n > 0 => n - 1,
            n => {
                self.executions.push(Execution::new(n));
                n
            }
        };
        let execution = &mut self.executions[index];
        debug!(
            instance = %self.instance_id.short(),
            execution = execution.index,
            from_epoch = execution.num_epochs,
            "fitting"
        );
        execution.fit(model, data, options, callbacks, self.checkpoint.as_mut())
    }

    /// Aggregate the executions, persist every artifact and return the
    /// results document. `models[i]` holds the weights of execution `i`.
    pub fn record_results<M: TrainableModel>(
        &mut self,
        models: &[M],
        key_metrics: &[Objective],
        save_models: bool,
        store: &ResultStore,
    ) -> HtResult<InstanceResults> {
        for execution in &self.executions {
            store.save_config(&self.instance_id, execution.index, &self.descriptor)?;
            if save_models {
                if let Some(model) = models.get(execution.index) {
                    store.save_weights(&self.instance_id, execution.index, model)?;
                }
            }
        }

        let metrics = aggregate_metrics(&self.executions);
        let results = InstanceResults {
            project: store.project.clone(),
            instance_id: self.instance_id.clone(),
            trial_id: self.trial_id.clone(),
            created_at: self.created_at,
            updated_at: Utc::now(),
            training_size: self.training_size,
            validation_size: self.validation_size,
            num_executions: self.executions.len(),
            model_size: self.model_size,
            model: self.descriptor.clone(),
            hyperparameters: self.hyperparameters.clone(),
            executions: self.executions.iter().map(ExecutionSummary::from).collect(),
            best_checkpoint: self.checkpoint.as_ref().and_then(|c| c.best_path()),
            key_metrics: key_metric_values(&metrics, key_metrics),
            metrics,
        };
        let path = store.save_results(&results)?;
        info!(
            instance = %self.instance_id.short(),
            executions = results.num_executions,
            path = %path.display(),
            "instance results saved"
        );
        self.results = Some(results.clone());
        Ok(results)
    }
}

/// Instances keyed by model digest. Two trials whose models share a
/// descriptor are the same instance; the second is a collision.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: HashMap<ConfigDigest, Instance>,
    /// Digests seen in an earlier run, whose instances are not in memory.
    known: HashSet<ConfigDigest>,
    collisions: usize,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a digest as taken without holding its instance.
    pub fn remember(&mut self, instance_id: ConfigDigest) {
        self.known.insert(instance_id);
    }

    pub fn contains(&self, instance_id: &ConfigDigest) -> bool {
        self.instances.contains_key(instance_id) || self.known.contains(instance_id)
    }

    /// Register a new instance for `model`, or count a collision and return
    /// `None` when its descriptor was seen before.
    pub fn get_or_create<M: TrainableModel + ?Sized>(
        &mut self,
        trial_id: &TrialId,
        hyperparameters: &Assignment,
        model: &M,
    ) -> Option<&mut Instance> {
        let instance = Instance::new(trial_id.clone(), hyperparameters.clone(), model);
        let instance_id = instance.instance_id.clone();
        if self.contains(&instance_id) {
            self.collisions += 1;
            debug!(instance = %instance_id.short(), "duplicate model");
            return None;
        }
        Some(self.instances.entry(instance_id).or_insert(instance))
    }

    pub fn get(&self, instance_id: &ConfigDigest) -> Option<&Instance> {
        self.instances.get(instance_id)
    }

    pub fn get_mut(&mut self, instance_id: &ConfigDigest) -> Option<&mut Instance> {
        self.instances.get_mut(instance_id)
    }

    pub fn find_by_trial(&self, trial_id: &TrialId) -> Option<&Instance> {
        self.instances.values().find(|i| &i.trial_id == trial_id)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn collisions(&self) -> usize {
        self.collisions
    }
}
