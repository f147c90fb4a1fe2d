//! Instance results documents.
//!
//! One document per instance and training size, written as
//! `<project>-<instance>-<training_size>-instance-results.json`. The
//! `ht-report` binary reads these back.

use chrono::{DateTime, Utc};
use ht_optimizer::{Assignment, ConfigDigest, TrialId};
use ht_types::{Aggregate, Direction, HtResult, MetricRange, Objective};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

use crate::execution::{Execution, ExecutionStatus};

pub const RESULTS_SUFFIX: &str = "-instance-results.json";

pub fn results_file_name(project: &str, instance_id: &ConfigDigest, training_size: usize) -> String {
    format!("{project}-{instance_id}-{training_size}{RESULTS_SUFFIX}")
}

/// Aggregates over every execution's minimum and maximum of one metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricAggregate {
    pub min: Aggregate,
    pub max: Aggregate,
}

impl MetricAggregate {
    pub fn from_ranges(ranges: &[MetricRange]) -> Option<Self> {
        let mins: Vec<f64> = ranges.iter().map(|r| r.min).collect();
        let maxs: Vec<f64> = ranges.iter().map(|r| r.max).collect();
        Some(Self {
            min: Aggregate::from_values(&mins)?,
            max: Aggregate::from_values(&maxs)?,
        })
    }

    /// The aggregate matching the direction: per-execution minima for `Min`.
    pub fn get(&self, direction: Direction) -> &Aggregate {
        match direction {
            Direction::Min => &self.min,
            Direction::Max => &self.max,
        }
    }
}

/// Per-execution summary stored in the results document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: Uuid,
    pub index: usize,
    pub num_epochs: usize,
    pub status: ExecutionStatus,
    pub stopped_early: bool,
    pub metrics: BTreeMap<String, MetricRange>,
}

impl From<&Execution> for ExecutionSummary {
    fn from(execution: &Execution) -> Self {
        Self {
            execution_id: execution.execution_id,
            index: execution.index,
            num_epochs: execution.num_epochs,
            status: execution.status,
            stopped_early: execution.stopped_early,
            metrics: execution.metrics.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceResults {
    pub project: String,
    pub instance_id: ConfigDigest,
    pub trial_id: TrialId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub training_size: usize,
    pub validation_size: usize,
    pub num_executions: usize,
    pub model_size: u64,
    pub model: serde_json::Value,
    pub hyperparameters: Assignment,
    pub executions: Vec<ExecutionSummary>,
    /// Surviving best-so-far checkpoint, when checkpointing was enabled.
    pub best_checkpoint: Option<PathBuf>,
    pub metrics: BTreeMap<String, MetricAggregate>,
    /// Median of the direction-appropriate aggregate for each key metric.
    pub key_metrics: BTreeMap<String, f64>,
}

impl InstanceResults {
    pub fn file_name(&self) -> String {
        results_file_name(&self.project, &self.instance_id, self.training_size)
    }

    pub fn key_metric(&self, name: &str) -> Option<f64> {
        self.key_metrics.get(name).copied()
    }

    pub fn load(path: impl AsRef<Path>) -> HtResult<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn to_json(&self) -> HtResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Aggregate per-metric ranges across executions.
pub fn aggregate_metrics<'a>(
    executions: impl IntoIterator<Item = &'a Execution>,
) -> BTreeMap<String, MetricAggregate> {
    let mut ranges: BTreeMap<&str, Vec<MetricRange>> = BTreeMap::new();
    for execution in executions {
        for (name, range) in &execution.metrics {
            ranges.entry(name.as_str()).or_default().push(*range);
        }
    }
    ranges
        .into_iter()
        .filter_map(|(name, r)| MetricAggregate::from_ranges(&r).map(|a| (name.to_string(), a)))
        .collect()
}

/// Key metric values published for an instance.
pub fn key_metric_values(
    metrics: &BTreeMap<String, MetricAggregate>,
    key_metrics: &[Objective],
) -> BTreeMap<String, f64> {
    key_metrics
        .iter()
        .filter_map(|m| {
            metrics
                .get(&m.name)
                .map(|agg| (m.name.clone(), agg.get(m.direction).median))
        })
        .collect()
}

/// Every results document under `dir`, recursively. Unreadable files are
/// skipped with a warning.
pub fn load_all(dir: impl AsRef<Path>) -> HtResult<Vec<InstanceResults>> {
    fn scan(path: &Path, found: &mut Vec<PathBuf>) -> std::io::Result<()> {
        for entry in fs::read_dir(path)? {
            let path = entry?.path();
            if path.is_dir() {
                scan(&path, found)?;
            } else if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(RESULTS_SUFFIX))
            {
                found.push(path);
            }
        }
        Ok(())
    }

    let dir = dir.as_ref();
    let mut paths = Vec::new();
    if dir.exists() {
        scan(dir, &mut paths)?;
    }
    paths.sort();

    let mut results = Vec::with_capacity(paths.len());
    for path in paths {
        match InstanceResults::load(&path) {
            Ok(doc) => results.push(doc),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable results"),
        }
    }
    Ok(results)
}

/// Documents that report `metric`, best first.
pub fn rank<'a>(
    results: &'a [InstanceResults],
    metric: &str,
    direction: Direction,
) -> Vec<&'a InstanceResults> {
    let mut ranked: Vec<(&InstanceResults, f64)> = results
        .iter()
        .filter_map(|r| r.key_metric(metric).map(|v| (r, direction.normalize(v))))
        .filter(|(_, v)| !v.is_nan())
        .collect();
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
    ranked.into_iter().map(|(r, _)| r).collect()
}
