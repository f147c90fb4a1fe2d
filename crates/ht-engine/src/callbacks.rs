//! Training callbacks: early stopping and divergence detection.

use ht_types::{Direction, Objective};
use tracing::{debug, warn};

use crate::model::Logs;

/// Action a callback can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
}

/// Trait for training callbacks.
pub trait TrainingCallback {
    /// Called at the end of each epoch with the epoch index and its logs.
    fn on_epoch_end(&mut self, epoch: usize, logs: &Logs) -> CallbackAction;
}

/// Stop when the monitored metric has not improved for `patience` epochs.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    pub monitor: Objective,
    pub patience: usize,
    pub min_delta: f64,
    counter: usize,
    best: Option<f64>,
}

impl EarlyStopping {
    pub fn new(monitor: Objective, patience: usize, min_delta: f64) -> Self {
        Self {
            monitor,
            patience,
            min_delta,
            counter: 0,
            best: None,
        }
    }

    /// Feed one value of the monitored metric.
    pub fn observe(&mut self, value: f64) -> CallbackAction {
        let normalized = self.monitor.direction.normalize(value);
        match self.best {
            None => {
                self.best = Some(normalized);
                CallbackAction::Continue
            }
            Some(best) if normalized < best - self.min_delta => {
                self.best = Some(normalized);
                self.counter = 0;
                CallbackAction::Continue
            }
            Some(_) => {
                self.counter += 1;
                if self.counter >= self.patience {
                    CallbackAction::Stop
                } else {
                    CallbackAction::Continue
                }
            }
        }
    }
}

impl TrainingCallback for EarlyStopping {
    fn on_epoch_end(&mut self, epoch: usize, logs: &Logs) -> CallbackAction {
        let Some(value) = logs.get(&self.monitor.name) else {
            return CallbackAction::Continue;
        };
        let action = self.observe(*value);
        if action == CallbackAction::Stop {
            debug!(epoch, metric = %self.monitor.name, "early stopping");
        }
        action
    }
}

/// Stop as soon as any logged metric is NaN or infinite.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminateOnNaN;

impl TrainingCallback for TerminateOnNaN {
    fn on_epoch_end(&mut self, epoch: usize, logs: &Logs) -> CallbackAction {
        match logs.iter().find(|(_, v)| !v.is_finite()) {
            Some((name, value)) => {
                warn!(epoch, metric = %name, value, "non-finite metric, stopping");
                CallbackAction::Stop
            }
            None => CallbackAction::Continue,
        }
    }
}

/// Early stopping on `monitor`, with its direction taken from the objective.
pub fn early_stopping_on(monitor: &Objective, patience: usize) -> EarlyStopping {
    EarlyStopping::new(monitor.clone(), patience, 0.0)
}

/// Whether `direction` prefers `candidate` over `current` by more than `min_delta`.
pub fn improves(direction: Direction, candidate: f64, current: f64, min_delta: f64) -> bool {
    direction.normalize(candidate) < direction.normalize(current) - min_delta
}
