//! Trial tracking.

use chrono::{DateTime, Utc};
use ht_types::{Direction, MetricsTracker, Objective};
use serde::{Deserialize, Serialize};

use crate::digest::{compute_identity, ConfigDigest};
use crate::hyperparameters::Assignment;

/// Identity of a trial: the digest of its resolved assignment.
pub type TrialId = ConfigDigest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Running,
    Completed,
    Failed,
    /// The model for this configuration could not be built or was rejected.
    Invalid,
}

/// A single evaluated configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub trial_id: TrialId,
    /// Creation order within the oracle, starting at 0.
    pub trial_number: usize,
    pub tuner_id: String,
    pub hyperparameters: Assignment,
    pub status: TrialStatus,
    /// Best raw value of the objective metric across reported steps.
    pub score: Option<f64>,
    pub best_step: Option<u64>,
    pub metrics: MetricsTracker,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Trial {
    pub fn new(trial_number: usize, tuner_id: impl Into<String>, hyperparameters: Assignment) -> Self {
        Self {
            trial_id: compute_identity(&hyperparameters),
            trial_number,
            tuner_id: tuner_id.into(),
            hyperparameters,
            status: TrialStatus::Running,
            score: None,
            best_step: None,
            metrics: MetricsTracker::new(),
            created_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    /// Recompute `score` and `best_step` from the objective's history.
    pub fn refresh_score(&mut self, objective: &Objective) {
        let best = self
            .metrics
            .get_history(&objective.name)
            .and_then(|history| history.best());
        self.score = best.map(|o| o.value);
        self.best_step = best.map(|o| o.step);
    }

    /// Score on a "lower is better" scale.
    pub fn normalized_score(&self, direction: Direction) -> Option<f64> {
        self.score.map(|s| direction.normalize(s))
    }

    pub fn mark_completed(&mut self) {
        self.status = TrialStatus::Completed;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = TrialStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }

    pub fn mark_invalid(&mut self, reason: String) {
        self.status = TrialStatus::Invalid;
        self.finished_at = Some(Utc::now());
        self.error = Some(reason);
    }

    pub fn is_finished(&self) -> bool {
        self.status != TrialStatus::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hyperparameters::ParameterValue;

    fn params(units: i64) -> Assignment {
        let mut params = Assignment::new();
        params.insert("units".into(), ParameterValue::Int(units));
        params
    }

    #[test]
    fn trial_lifecycle() {
        let mut trial = Trial::new(1, "tuner-0", params(10));
        assert_eq!(trial.status, TrialStatus::Running);
        assert!(!trial.is_finished());
        assert_eq!(trial.trial_id, compute_identity(&params(10)));

        trial.mark_completed();
        assert_eq!(trial.status, TrialStatus::Completed);
        assert!(trial.finished_at.is_some());
        assert!(trial.is_finished());
    }

    #[test]
    fn trial_failure() {
        let mut trial = Trial::new(0, "tuner-0", Assignment::new());
        trial.mark_failed("training diverged".into());
        assert_eq!(trial.status, TrialStatus::Failed);
        assert_eq!(trial.error.as_deref(), Some("training diverged"));

        let mut invalid = Trial::new(1, "tuner-0", params(3));
        invalid.mark_invalid("negative width".into());
        assert_eq!(invalid.status, TrialStatus::Invalid);
    }

    #[test]
    fn score_tracking_minimize() {
        let objective = Objective::new("val_loss", Direction::Min);
        let mut trial = Trial::new(0, "t", params(4));
        trial.metrics.register("val_loss", Direction::Min).unwrap();
        trial.metrics.update("val_loss", 0.15, 0);
        trial.metrics.update("val_loss", 0.05, 1);
        trial.metrics.update("val_loss", 0.09, 2);
        trial.refresh_score(&objective);

        assert_eq!(trial.score, Some(0.05));
        assert_eq!(trial.best_step, Some(1));
        assert_eq!(trial.normalized_score(Direction::Min), Some(0.05));
    }

    #[test]
    fn score_tracking_maximize() {
        let objective = Objective::new("val_acc", Direction::Max);
        let mut trial = Trial::new(0, "t", params(4));
        trial.metrics.register("val_acc", Direction::Max).unwrap();
        trial.metrics.update("val_acc", 1.5, 0);
        trial.metrics.update("val_acc", 2.0, 1);
        trial.metrics.update("val_acc", 1.0, 2);
        trial.refresh_score(&objective);

        assert_eq!(trial.score, Some(2.0));
        assert_eq!(trial.normalized_score(Direction::Max), Some(-2.0));
    }

    #[test]
    fn trial_without_objective_has_no_score() {
        let objective = Objective::inferred("loss");
        let mut trial = Trial::new(0, "t", params(1));
        trial.metrics.update("acc", 0.5, 0);
        trial.refresh_score(&objective);
        assert_eq!(trial.score, None);
        assert_eq!(trial.best_step, None);
    }

    #[test]
    fn trial_round_trips_through_json() {
        let mut trial = Trial::new(2, "t", params(8));
        trial.metrics.update("loss", 0.3, 0);
        let json = serde_json::to_string(&trial).unwrap();
        let back: Trial = serde_json::from_str(&json).unwrap();
        assert_eq!(back.trial_id, trial.trial_id);
        assert_eq!(back.metrics, trial.metrics);
    }
}
