//! DEEPKNN — Deep k-Nearest Neighbors credibility layer.
//!
//! CLI demo: builds the per-layer neighbor indices over a synthetic
//! training set, calibrates credibility on a held-out split, then compares
//! neighbor-vote accuracy against the model's own predictions on a test
//! set.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use deepknn::config;
use deepknn::engine::{DkNnConfig, DkNnEngine, VotePolicy};
use deepknn::index::IndexKind;
use deepknn::model::synthetic::{SyntheticConfig, SyntheticModel};

/// DEEPKNN inference CLI.
#[derive(Parser, Debug)]
#[command(
    name = "deepknn",
    about = "DEEPKNN — deep k-nearest-neighbor credibility over a classifier",
    version
)]
struct Cli {
    /// Use the approximate projection-hash index instead of the exact
    /// k-d tree.
    #[arg(long, default_value_t = false)]
    approximate: bool,

    /// Neighbors retrieved per layer per query.
    #[arg(short, long, default_value_t = config::K_NEIGHBORS)]
    k: usize,

    /// Batch size for build, calibration, and evaluation.
    #[arg(short, long, default_value_t = config::BATCH_SIZE)]
    batch_size: usize,

    /// Training examples to generate.
    #[arg(long, default_value_t = 2000)]
    train_size: usize,

    /// Calibration examples withheld from the training set when no split
    /// file is given.
    #[arg(long, default_value_t = 200)]
    calib_size: usize,

    /// Test examples to generate.
    #[arg(long, default_value_t = 500)]
    test_size: usize,

    /// JSON file holding the training-set indices withheld for
    /// calibration.
    #[arg(long)]
    calib_split: Option<PathBuf>,

    /// Vote with the deepest layer only instead of all monitored layers.
    #[arg(long, default_value_t = false)]
    last_layer_only: bool,

    /// Drop the last partial batch instead of processing it.
    #[arg(long, default_value_t = false)]
    drop_remainder: bool,

    /// Report calibrated credibility/confidence during evaluation.
    #[arg(long, default_value_t = false)]
    calibrated: bool,

    /// Number of classes in the synthetic task.
    #[arg(long, default_value_t = 4)]
    classes: usize,

    /// Input feature dimension of the synthetic task.
    #[arg(long, default_value_t = 32)]
    input_dim: usize,

    /// Hidden dimension of each monitored layer.
    #[arg(long, default_value_t = 64)]
    hidden_dim: usize,

    /// Number of monitored layers.
    #[arg(long, default_value_t = 2)]
    layers: usize,

    /// Seed for the synthetic task and the projection hyperplanes.
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

/// Read a calibration split: a JSON array of training-set indices.
fn load_calibration_split(path: &Path) -> Result<Vec<usize>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading calibration split {}", path.display()))?;
    let indices: Vec<usize> = serde_json::from_str(&text)
        .with_context(|| format!("parsing calibration split {}", path.display()))?;
    Ok(indices)
}

/// Split a dataset into (kept, withheld) by index set.
fn partition<T: Clone>(data: &[T], withheld: &[usize]) -> (Vec<T>, Vec<T>) {
    let marked: HashSet<usize> = withheld.iter().copied().collect();
    let mut kept = Vec::with_capacity(data.len().saturating_sub(marked.len()));
    let mut held = Vec::with_capacity(marked.len());
    for (i, item) in data.iter().enumerate() {
        if marked.contains(&i) {
            held.push(item.clone());
        } else {
            kept.push(item.clone());
        }
    }
    (kept, held)
}

fn main() -> Result<()> {
    // Initialise tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    tracing::info!("DEEPKNN v{}", env!("CARGO_PKG_VERSION"));

    let model = SyntheticModel::new(SyntheticConfig {
        n_classes: cli.classes,
        input_dim: cli.input_dim,
        hidden_dim: cli.hidden_dim,
        n_layers: cli.layers,
        seed: cli.seed,
        ..Default::default()
    })?;

    let all_train = model.generate(cli.train_size, cli.seed.wrapping_add(1));
    let test = model.generate(cli.test_size, cli.seed.wrapping_add(2));

    let (train, calibration) = match &cli.calib_split {
        Some(path) => {
            let indices = load_calibration_split(path)?;
            tracing::info!(
                "withholding {} calibration examples listed in {}",
                indices.len(),
                path.display()
            );
            partition(&all_train, &indices)
        }
        None => {
            let indices: Vec<usize> = (0..cli.calib_size.min(all_train.len())).collect();
            partition(&all_train, &indices)
        }
    };

    let index_kind = if cli.approximate {
        tracing::info!("using random binary projections for NN search");
        IndexKind::Approximate
    } else {
        tracing::info!("using a k-d tree for NN search");
        IndexKind::Exact
    };
    let vote_policy = if cli.last_layer_only {
        VotePolicy::LastLayerOnly
    } else {
        VotePolicy::AllLayers
    };

    let mut engine = DkNnEngine::new(
        model,
        DkNnConfig {
            k: cli.k,
            index_kind,
            vote_policy,
            drop_remainder: cli.drop_remainder,
            seed: cli.seed,
        },
    );

    engine.build(&train, cli.batch_size)?;
    engine.calibrate(&calibration, cli.batch_size)?;

    tracing::info!("running on {} evaluation examples", test.len());

    let mut total = 0usize;
    let mut knn_correct = 0usize;
    let mut baseline_correct = 0usize;
    let mut credibility_sum = 0.0f64;
    let mut confidence_sum = 0.0f64;

    for chunk in test.chunks(cli.batch_size) {
        let xs: Vec<_> = chunk.iter().map(|(x, _)| x.clone()).collect();
        let predictions = engine.predict(&xs, cli.calibrated)?;
        for (prediction, (_, label)) in predictions.iter().zip(chunk.iter()) {
            total += 1;
            if prediction.label == *label {
                knn_correct += 1;
            }
            if prediction.baseline_label == *label {
                baseline_correct += 1;
            }
            credibility_sum += prediction.credibility;
            confidence_sum += prediction.confidence;
        }
    }

    if total == 0 {
        tracing::warn!("no evaluation examples; nothing to report");
        return Ok(());
    }

    tracing::info!(
        "knn accuracy {:.4} ({}/{})",
        knn_correct as f64 / total as f64,
        knn_correct,
        total
    );
    tracing::info!(
        "model accuracy {:.4} ({}/{})",
        baseline_correct as f64 / total as f64,
        baseline_correct,
        total
    );
    tracing::info!(
        "mean credibility {:.4}, mean confidence {:.4}{}",
        credibility_sum / total as f64,
        confidence_sum / total as f64,
        if cli.calibrated { " (calibrated)" } else { "" }
    );

    let probe: Vec<_> = test.iter().take(16).map(|(x, _)| x.clone()).collect();
    let distances = engine.nearest_distance(&probe, None)?;
    let mean_distance = distances.iter().sum::<f32>() / distances.len() as f32;
    tracing::info!(
        "mean nearest-neighbor distance at the deepest layer: {:.4}",
        mean_distance
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_calibration_split() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let path = dir.path().join("calib.json");
        std::fs::write(&path, "[0, 5, 9]").expect("failed to write split file");

        let indices = load_calibration_split(&path).unwrap();
        assert_eq!(indices, vec![0, 5, 9]);
    }

    #[test]
    fn test_load_calibration_split_rejects_garbage() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let path = dir.path().join("calib.json");
        std::fs::write(&path, "{\"not\": \"a list\"}").expect("failed to write split file");
        assert!(load_calibration_split(&path).is_err());
    }

    #[test]
    fn test_partition() {
        let data = vec![10, 11, 12, 13, 14];
        let (kept, held) = partition(&data, &[1, 3]);
        assert_eq!(kept, vec![10, 12, 14]);
        assert_eq!(held, vec![11, 13]);
    }

    #[test]
    fn test_partition_ignores_out_of_range() {
        let data = vec![10, 11];
        let (kept, held) = partition(&data, &[7]);
        assert_eq!(kept, vec![10, 11]);
        assert!(held.is_empty());
    }
}
