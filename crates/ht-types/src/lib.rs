//! Core types shared across Hypertune: the error taxonomy, metric
//! directions and objectives, metric bookkeeping and the tuner configuration.

pub mod config;
pub mod errors;
pub mod metrics;

pub use config::*;
pub use errors::*;
pub use metrics::*;
