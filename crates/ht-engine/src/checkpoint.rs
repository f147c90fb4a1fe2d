//! Best-so-far weight checkpoints.
//!
//! Layout: `<dir>/trial_<digest>/checkpoint_<step:06>.weights`. A tracker
//! keeps exactly one file per trial, the one for the best step seen so far.

use ht_optimizer::TrialId;
use ht_types::{HtResult, Objective};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::callbacks::improves;
use crate::model::{Logs, TrainableModel};

const PREFIX: &str = "checkpoint_";
const EXTENSION: &str = "weights";

/// Directory holding every checkpoint of one trial.
pub fn trial_dir(dir: &Path, trial_id: &TrialId) -> PathBuf {
    dir.join(format!("trial_{trial_id}"))
}

pub fn checkpoint_path(dir: &Path, trial_id: &TrialId, step: u64) -> PathBuf {
    trial_dir(dir, trial_id).join(format!("{PREFIX}{step:06}.{EXTENSION}"))
}

fn parse_step(path: &Path) -> Option<u64> {
    if path.extension()? != EXTENSION {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix(PREFIX)?
        .parse()
        .ok()
}

/// Checkpoints on disk for a trial, sorted by step.
pub fn list_checkpoints(dir: &Path, trial_id: &TrialId) -> HtResult<Vec<(u64, PathBuf)>> {
    let trial_dir = trial_dir(dir, trial_id);
    if !trial_dir.exists() {
        return Ok(Vec::new());
    }

    let mut checkpoints = Vec::new();
    for entry in fs::read_dir(&trial_dir)? {
        let path = entry?.path();
        if let Some(step) = parse_step(&path) {
            checkpoints.push((step, path));
        }
    }
    checkpoints.sort_by_key(|(step, _)| *step);
    Ok(checkpoints)
}

/// Delete every checkpoint of a trial except `keep`. Returns the number removed.
pub fn purge(dir: &Path, trial_id: &TrialId, keep: Option<u64>) -> HtResult<usize> {
    let mut removed = 0;
    for (step, path) in list_checkpoints(dir, trial_id)? {
        if Some(step) != keep {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Saves weights whenever the monitored metric improves and removes the
/// checkpoint it supersedes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointTracker {
    dir: PathBuf,
    trial_id: TrialId,
    monitor: Objective,
    best: Option<(u64, f64)>,
}

impl CheckpointTracker {
    pub fn new(dir: impl Into<PathBuf>, trial_id: TrialId, monitor: Objective) -> Self {
        Self {
            dir: dir.into(),
            trial_id,
            monitor,
            best: None,
        }
    }

    pub fn best_step(&self) -> Option<u64> {
        self.best.map(|(step, _)| step)
    }

    pub fn best_value(&self) -> Option<f64> {
        self.best.map(|(_, value)| value)
    }

    pub fn best_path(&self) -> Option<PathBuf> {
        self.best_step()
            .map(|step| checkpoint_path(&self.dir, &self.trial_id, step))
    }

    /// Returns true when a checkpoint was written for `step`.
    pub fn on_epoch_end<M: TrainableModel + ?Sized>(
        &mut self,
        model: &M,
        step: u64,
        logs: &Logs,
    ) -> HtResult<bool> {
        let Some(&value) = logs.get(&self.monitor.name) else {
            return Ok(false);
        };
        if !value.is_finite() {
            return Ok(false);
        }
        let improved = match self.best {
            None => true,
            Some((_, best)) => improves(self.monitor.direction, value, best, 0.0),
        };
        if !improved {
            return Ok(false);
        }

        let path = checkpoint_path(&self.dir, &self.trial_id, step);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        model.save_weights(&path)?;

        if let Some(previous) = self.best_path() {
            if previous != path && previous.exists() {
                fs::remove_file(&previous)?;
            }
        }
        debug!(
            trial = %self.trial_id.short(),
            step,
            metric = %self.monitor.name,
            value,
            "checkpoint saved"
        );
        self.best = Some((step, value));
        Ok(true)
    }
}
