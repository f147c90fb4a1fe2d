//! Search polynomial degree and learning rate for a noisy quadratic.
//!
//! Run with `cargo run -p ht-engine --example quadratic_search`, then inspect
//! the results with `ht-report summary target/hypertune-demo/results/quadratic`.

use ht_engine::{FitOptions, HyperModel, Logs, TrainableModel, TrainingSet, Tuner};
use ht_optimizer::{Assignment, HyperParameter, HyperParameters};
use ht_types::{HtResult, Objective, TunerConfig};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::json;
use std::path::Path;
use tracing_subscriber::EnvFilter;

struct Dataset {
    train: Vec<(f64, f64)>,
    validation: Vec<(f64, f64)>,
}

impl Dataset {
    fn generate(n: usize, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut samples: Vec<(f64, f64)> = (0..n)
            .map(|_| {
                let x = rng.random_range(-1.0..1.0);
                let noise = rng.random_range(-0.05..0.05);
                (x, 3.0 * x * x - 2.0 * x + 1.0 + noise)
            })
            .collect();
        let validation = samples.split_off(n * 4 / 5);
        Self {
            train: samples,
            validation,
        }
    }
}

impl TrainingSet for Dataset {
    fn training_size(&self) -> usize {
        self.train.len()
    }

    fn validation_size(&self) -> usize {
        self.validation.len()
    }
}

/// Polynomial regression trained by full-batch gradient descent.
struct Polynomial {
    coefficients: Vec<f64>,
    learning_rate: f64,
}

impl Polynomial {
    fn predict(&self, x: f64) -> f64 {
        self.coefficients
            .iter()
            .rev()
            .fold(0.0, |acc, c| acc * x + c)
    }

    fn mse(&self, samples: &[(f64, f64)]) -> f64 {
        samples
            .iter()
            .map(|(x, y)| (self.predict(*x) - y).powi(2))
            .sum::<f64>()
            / samples.len().max(1) as f64
    }
}

impl TrainableModel for Polynomial {
    type Data = Dataset;

    fn descriptor(&self) -> serde_json::Value {
        json!({
            "kind": "polynomial",
            "degree": self.coefficients.len() - 1,
            "learning_rate": self.learning_rate,
        })
    }

    fn parameter_count(&self) -> u64 {
        self.coefficients.len() as u64
    }

    fn train_epoch(&mut self, data: &Dataset, _epoch: usize, _: &FitOptions) -> HtResult<Logs> {
        let n = data.train.len().max(1) as f64;
        let mut gradient = vec![0.0; self.coefficients.len()];
        for (x, y) in &data.train {
            let error = self.predict(*x) - y;
            let mut power = 1.0;
            for g in gradient.iter_mut() {
                *g += 2.0 * error * power / n;
                power *= x;
            }
        }
        for (c, g) in self.coefficients.iter_mut().zip(&gradient) {
            *c -= self.learning_rate * g;
        }

        Ok(Logs::from([
            ("loss".to_string(), self.mse(&data.train)),
            ("val_loss".to_string(), self.mse(&data.validation)),
        ]))
    }

    fn save_weights(&self, path: &Path) -> HtResult<()> {
        std::fs::write(path, serde_json::to_vec(&self.coefficients)?)?;
        Ok(())
    }
}

struct PolynomialFamily;

impl HyperModel for PolynomialFamily {
    type Model = Polynomial;

    fn space(&self) -> HyperParameters {
        HyperParameters::new()
            .add(HyperParameter::int("degree", 1, 4, 1))
            .add_log_uniform("learning_rate", 1e-3, 0.5)
    }

    fn build(&mut self, hp: &Assignment) -> Result<Polynomial, String> {
        let degree = hp["degree"].as_i64().ok_or("degree must be an integer")? as usize;
        let learning_rate = hp["learning_rate"]
            .as_f64()
            .ok_or("learning_rate must be numeric")?;
        if degree >= 3 && learning_rate > 0.2 {
            return Err(format!(
                "degree {degree} diverges with learning rate {learning_rate:.3}"
            ));
        }
        Ok(Polynomial {
            coefficients: vec![0.0; degree + 1],
            learning_rate,
        })
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = TunerConfig::new("quadratic", Objective::inferred("val_loss"))
        .with_root_dir("target/hypertune-demo")
        .with_max_trials(20)
        .with_executions(2)
        .with_epochs(200)
        .with_seed(42);

    let data = Dataset::generate(500, 7);
    let mut tuner = Tuner::new(config, PolynomialFamily)?
        .with_early_stopping(10)
        .with_terminate_on_nan()
        .with_checkpoints();
    let summary = tuner.search(&data)?;

    println!(
        "{} trials ({} completed), best val_loss {:?}",
        summary.trials_created, summary.trials_completed, summary.best_score
    );
    if let Some(hp) = &summary.best_hyperparameters {
        println!("best hyperparameters: {}", serde_json::to_string(hp)?);
    }
    for path in tuner.export_best_models(3)? {
        println!("exported {}", path.display());
    }
    Ok(())
}
