//! ht-report: read the results a tuning run left on disk.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use ht_engine::results::{load_all, rank};
use ht_engine::storage::storage_stats;
use ht_engine::tuner::{SearchSummary, SUMMARY_FILE};
use ht_types::Direction;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Summaries of hyperparameter search results
#[derive(Parser, Debug)]
#[command(name = "ht-report", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Best instances ranked by a key metric
    Summary {
        /// Project or results directory
        dir: PathBuf,

        /// Key metric to rank by
        #[arg(short, long, default_value = "loss")]
        metric: String,

        /// Number of instances to show
        #[arg(short, long, default_value_t = 10)]
        top: usize,

        /// min or max; inferred from the metric name when omitted
        #[arg(short, long)]
        direction: Option<Direction>,
    },
    /// Trial counts and storage usage
    Status {
        /// Project or results directory
        dir: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Summary {
            dir,
            metric,
            top,
            direction,
        } => summary(dir, &metric, top, direction),
        Commands::Status { dir } => status(dir),
    }
}

fn summary(
    dir: PathBuf,
    metric: &str,
    top: usize,
    direction: Option<Direction>,
) -> anyhow::Result<()> {
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }
    let results = load_all(&dir)
        .with_context(|| format!("reading results under {}", dir.display()))?;
    let direction = direction.unwrap_or_else(|| Direction::infer(metric));
    debug!(documents = results.len(), %direction, "loaded results");

    let ranked = rank(&results, metric, direction);
    if ranked.is_empty() {
        println!("No instance reports '{metric}' ({} documents read)", results.len());
        return Ok(());
    }

    println!(
        "{:<4} {:<10} {:>14} {:>6} {:>10}  hyperparameters",
        "rank", "instance", metric, "execs", "params"
    );
    for (i, doc) in ranked.iter().take(top).enumerate() {
        let hp = doc
            .hyperparameters
            .iter()
            .map(|(name, value)| format!("{name}={}", serde_json::to_string(value).unwrap_or_default()))
            .collect::<Vec<_>>()
            .join(" ");
        println!(
            "{:<4} {:<10} {:>14.6} {:>6} {:>10}  {}",
            i + 1,
            doc.instance_id.short(),
            doc.key_metric(metric).unwrap_or(f64::NAN),
            doc.num_executions,
            doc.model_size,
            hp
        );
    }
    Ok(())
}

fn status(dir: PathBuf) -> anyhow::Result<()> {
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }

    let summary_path = dir.join(SUMMARY_FILE);
    if summary_path.exists() {
        let summary = SearchSummary::load(&summary_path)
            .with_context(|| format!("reading {}", summary_path.display()))?;
        println!("project:          {}", summary.project);
        println!("strategy:         {}", summary.strategy);
        println!(
            "trials:           {} created, {} completed, {} failed",
            summary.trials_created, summary.trials_completed, summary.trials_failed
        );
        println!(
            "rejected models:  {} invalid, {} oversized, {} duplicate",
            summary.invalid_models, summary.oversized_models, summary.duplicate_models
        );
        println!("duplicate configs: {}", summary.duplicate_configs);
        println!(
            "epochs:           {} budgeted, {} trained",
            summary.epochs_consumed, summary.epochs_trained
        );
        match summary.best_score {
            Some(score) => println!("best score:       {score}"),
            None => println!("best score:       -"),
        }
        println!("termination:      {:?}", summary.termination);
    } else {
        let results = load_all(&dir)?;
        println!("instances:        {}", results.len());
    }

    let stats = storage_stats(&dir)?;
    println!(
        "storage:          {} files, {:.2} MB under {}",
        stats.total_files,
        stats.total_size_mb(),
        stats.data_root.display()
    );
    Ok(())
}
