//! Contracts between the tuner and user models.
//!
//! The tuner never looks inside a model. It needs a canonical descriptor to
//! deduplicate topologies, a parameter count to enforce size limits, a way
//! to train one epoch at a time and a way to dump weights.

use ht_optimizer::{Assignment, HyperParameters};
use ht_types::HtResult;
use std::collections::BTreeMap;
use std::path::Path;

/// Metric values reported for one epoch, keyed by metric name.
pub type Logs = BTreeMap<String, f64>;

/// Options passed to every epoch of a fit.
#[derive(Debug, Clone, PartialEq)]
pub struct FitOptions {
    /// Epochs to train in this call.
    pub epochs: usize,
    pub batch_size: Option<usize>,
}

impl FitOptions {
    pub fn epochs(epochs: usize) -> Self {
        Self {
            epochs,
            batch_size: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }
}

/// Training data as seen by the tuner: only the sample counts matter.
pub trait TrainingSet {
    fn training_size(&self) -> usize;

    fn validation_size(&self) -> usize {
        0
    }
}

/// For models that carry their own data.
impl TrainingSet for () {
    fn training_size(&self) -> usize {
        0
    }
}

/// Sample counts without any data attached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleCounts {
    pub training: usize,
    pub validation: usize,
}

impl TrainingSet for SampleCounts {
    fn training_size(&self) -> usize {
        self.training
    }

    fn validation_size(&self) -> usize {
        self.validation
    }
}

impl<T> TrainingSet for [T] {
    fn training_size(&self) -> usize {
        self.len()
    }
}

impl<T> TrainingSet for Vec<T> {
    fn training_size(&self) -> usize {
        self.len()
    }
}

pub trait TrainableModel {
    type Data: TrainingSet + ?Sized;

    /// Canonical topology document; equal descriptors mean equal models.
    fn descriptor(&self) -> serde_json::Value;

    /// Number of trainable parameters.
    fn parameter_count(&self) -> u64;

    /// Train one epoch and return its metrics.
    fn train_epoch(
        &mut self,
        data: &Self::Data,
        epoch: usize,
        options: &FitOptions,
    ) -> HtResult<Logs>;

    fn save_weights(&self, path: &Path) -> HtResult<()>;
}

/// A model family parameterized by hyperparameters.
pub trait HyperModel {
    type Model: TrainableModel;

    /// Hyperparameters the builder reads.
    fn space(&self) -> HyperParameters;

    /// Build a model. `Err` carries the reason the configuration is invalid.
    fn build(&mut self, hp: &Assignment) -> Result<Self::Model, String>;
}

/// [`HyperModel`] backed by a closure.
pub struct HyperModelFn<F> {
    space: HyperParameters,
    build: F,
}

impl<F> HyperModelFn<F> {
    pub fn new(space: HyperParameters, build: F) -> Self {
        Self { space, build }
    }
}

impl<F, M> HyperModel for HyperModelFn<F>
where
    F: FnMut(&Assignment) -> Result<M, String>,
    M: TrainableModel,
{
    type Model = M;

    fn space(&self) -> HyperParameters {
        self.space.clone()
    }

    fn build(&mut self, hp: &Assignment) -> Result<M, String> {
        (self.build)(hp)
    }
}
