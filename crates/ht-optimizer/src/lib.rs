//! # ht-optimizer
//!
//! Hyperparameter search for Hypertune.
//!
//! Provides the hyperparameter space, configuration digests, search
//! strategies (random, grid, local perturbation), trial tracking and the
//! [`Oracle`] that ties them together.

mod digest;
mod hyperparameters;
mod oracle;
mod search;
mod trial;

pub use digest::{canonical_assignment, compute_identity, ConfigDigest, CANONICAL_VERSION};
pub use hyperparameters::{Assignment, HyperParameter, HyperParameters, ParameterKind, ParameterValue};
pub use oracle::{Oracle, OracleState};
pub use search::{
    seeded_rng, strategy_from_config, GridSearch, LocalSearch, Population, RandomSearch,
    SearchStrategy,
};
pub use trial::{Trial, TrialId, TrialStatus};
