// Execution - one training run of one model
// Epoch counters survive resumption; metric ranges cover the whole history

use chrono::{DateTime, Utc};
use ht_types::{HtResult, MetricRange};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::callbacks::{CallbackAction, TrainingCallback};
use crate::checkpoint::CheckpointTracker;
use crate::model::{FitOptions, Logs, TrainableModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

/// A single fit run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: Uuid,
    /// Position within the owning instance
    pub index: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Epochs trained so far, across every call to `fit`
    pub num_epochs: usize,
    pub history: Vec<Logs>,
    pub metrics: BTreeMap<String, MetricRange>,
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub stopped_early: bool,
}

impl Execution {
    pub fn new(index: usize) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            index,
            started_at: Utc::now(),
            finished_at: None,
            num_epochs: 0,
            history: Vec::new(),
            metrics: BTreeMap::new(),
            status: ExecutionStatus::Running,
            error: None,
            stopped_early: false,
        }
    }

    /// Train `options.epochs` more epochs and return the logs of this call.
    pub fn fit<M: TrainableModel>(
        &mut self,
        model: &mut M,
        data: &M::Data,
        options: &FitOptions,
        callbacks: &mut [Box<dyn TrainingCallback>],
        mut checkpoints: Option<&mut CheckpointTracker>,
    ) -> HtResult<Vec<Logs>> {
        self.status = ExecutionStatus::Running;
        self.finished_at = None;
        self.stopped_early = false;

        let mut run = Vec::with_capacity(options.epochs);
        for _ in 0..options.epochs {
            let epoch = self.num_epochs;
            let logs = match model.train_epoch(data, epoch, options) {
                Ok(logs) => logs,
                Err(e) => {
                    warn!(execution = self.index, epoch, error = %e, "epoch failed");
                    self.record_results(&run);
                    self.status = ExecutionStatus::Failed;
                    self.error = Some(e.to_string());
                    self.finished_at = Some(Utc::now());
                    return Err(e);
                }
            };
            self.num_epochs += 1;

            if let Some(tracker) = checkpoints.as_deref_mut() {
                tracker.on_epoch_end(&*model, epoch as u64, &logs)?;
            }

            let mut stop = false;
            for callback in callbacks.iter_mut() {
                if callback.on_epoch_end(epoch, &logs) == CallbackAction::Stop {
                    stop = true;
                }
            }
            run.push(logs);
            if stop {
                debug!(execution = self.index, epoch, "stopped by callback");
                self.stopped_early = true;
                break;
            }
        }

        self.record_results(&run);
        self.status = ExecutionStatus::Completed;
        self.finished_at = Some(Utc::now());
        Ok(run)
    }

    /// Append epoch logs and recompute the per-metric ranges.
    pub fn record_results(&mut self, history: &[Logs]) {
        self.history.extend_from_slice(history);

        let mut values: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
        for logs in &self.history {
            for (name, value) in logs {
                values.entry(name.as_str()).or_default().push(*value);
            }
        }
        self.metrics = values
            .into_iter()
            .filter_map(|(name, v)| MetricRange::from_values(&v).map(|r| (name.to_string(), r)))
            .collect();
    }

    pub fn last_logs(&self) -> Option<&Logs> {
        self.history.last()
    }

    pub fn is_finished(&self) -> bool {
        self.status != ExecutionStatus::Running
    }
}

/// Average epoch logs across runs, epoch by epoch.
///
/// Runs may differ in length when some stopped early; epoch `i` averages the
/// runs that reached it, metric by metric.
pub fn average_histories(histories: &[Vec<Logs>]) -> Vec<Logs> {
    let longest = histories.iter().map(Vec::len).max().unwrap_or(0);
    (0..longest)
        .map(|epoch| {
            let mut sums: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
            for logs in histories.iter().filter_map(|h| h.get(epoch)) {
                for (name, value) in logs {
                    let entry = sums.entry(name.as_str()).or_insert((0.0, 0));
                    entry.0 += value;
                    entry.1 += 1;
                }
            }
            sums.into_iter()
                .map(|(name, (sum, n))| (name.to_string(), sum / n as f64))
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::EarlyStopping;
    use ht_types::{Direction, HtError, Objective};
    use std::path::Path;

    /// Loss falls by one per epoch from `start`; fails at `fail_at`.
    struct Countdown {
        start: f64,
        seen: Vec<usize>,
        fail_at: Option<usize>,
    }

    impl Countdown {
        fn new(start: f64) -> Self {
            Self {
                start,
                seen: Vec::new(),
                fail_at: None,
            }
        }
    }

    impl TrainableModel for Countdown {
        type Data = ();

        fn descriptor(&self) -> serde_json::Value {
            serde_json::json!({ "start": self.start })
        }

        fn parameter_count(&self) -> u64 {
            1
        }

        fn train_epoch(&mut self, _: &(), epoch: usize, _: &FitOptions) -> HtResult<Logs> {
            if self.fail_at == Some(epoch) {
                return Err(HtError::Training("exploded".into()));
            }
            self.seen.push(epoch);
            Ok(Logs::from([("loss".to_string(), self.start - epoch as f64)]))
        }

        fn save_weights(&self, _: &Path) -> HtResult<()> {
            Ok(())
        }
    }

    fn logs(pairs: &[(&str, f64)]) -> Logs {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_fit_records_history_and_ranges() {
        let mut execution = Execution::new(0);
        let mut model = Countdown::new(10.0);
        let run = execution
            .fit(&mut model, &(), &FitOptions::epochs(3), &mut [], None)
            .unwrap();

        assert_eq!(run.len(), 3);
        assert_eq!(execution.num_epochs, 3);
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert!(execution.finished_at.is_some());
        assert_eq!(execution.metrics["loss"], MetricRange { min: 8.0, max: 10.0 });
    }

    #[test]
    fn test_resumed_execution_keeps_epoch_counter() {
        let mut execution = Execution::new(0);
        let mut model = Countdown::new(10.0);
        execution
            .fit(&mut model, &(), &FitOptions::epochs(3), &mut [], None)
            .unwrap();
        execution
            .fit(&mut model, &(), &FitOptions::epochs(2), &mut [], None)
            .unwrap();

        assert_eq!(model.seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(execution.num_epochs, 5);
        assert_eq!(execution.history.len(), 5);
        assert_eq!(execution.metrics["loss"].min, 6.0);
    }

    #[test]
    fn test_early_stopping_ends_run() {
        let mut execution = Execution::new(0);
        let mut model = Countdown::new(1.0);
        // Loss keeps improving, so watch an objective that goes the other way.
        let mut callbacks: Vec<Box<dyn TrainingCallback>> = vec![Box::new(EarlyStopping::new(
            Objective::new("loss", Direction::Max),
            2,
            0.0,
        ))];
        let run = execution
            .fit(&mut model, &(), &FitOptions::epochs(10), &mut callbacks, None)
            .unwrap();

        assert_eq!(run.len(), 3);
        assert!(execution.stopped_early);
        assert_eq!(execution.status, ExecutionStatus::Completed);
    }

    #[test]
    fn test_failed_epoch_marks_execution() {
        let mut execution = Execution::new(1);
        let mut model = Countdown::new(5.0);
        model.fail_at = Some(2);
        let err = execution
            .fit(&mut model, &(), &FitOptions::epochs(4), &mut [], None)
            .unwrap_err();

        assert!(matches!(err, HtError::Training(_)));
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.num_epochs, 2);
        assert_eq!(execution.history.len(), 2);
        assert_eq!(execution.error.as_deref(), Some("Training error: exploded"));
    }

    #[test]
    fn test_average_histories() {
        let a = vec![logs(&[("loss", 9.0)]), logs(&[("loss", 6.0)]), logs(&[("loss", 3.0)])];
        let b = vec![logs(&[("loss", 11.0)]), logs(&[("loss", 8.0)])];
        let avg = average_histories(&[a, b]);

        assert_eq!(avg.len(), 3);
        assert_eq!(avg[0]["loss"], 10.0);
        assert_eq!(avg[1]["loss"], 7.0);
        assert_eq!(avg[2]["loss"], 3.0);
        assert!(average_histories(&[]).is_empty());
    }
}
