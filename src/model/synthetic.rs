//! Synthetic Gaussian-blob classifier.
//!
//! A deterministic stand-in collaborator used by the CLI demo and the
//! integration tests: classes are isotropic Gaussian blobs, logits are
//! negative squared distances to the class centroids, and each monitored
//! layer is a fixed random projection of the input through a tanh.

use anyhow::{ensure, Result};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::model::{softmax, ModelCollaborator, ModelOutput};

/// Shape of the synthetic task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyntheticConfig {
    /// Number of classes.
    pub n_classes: usize,

    /// Input feature dimension.
    pub input_dim: usize,

    /// Hidden dimension of every monitored layer.
    pub hidden_dim: usize,

    /// Number of monitored layers.
    pub n_layers: usize,

    /// Standard deviation of the per-example noise around a centroid.
    pub noise_std: f32,

    /// Seed for centroids and layer weights.
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            n_classes: 4,
            input_dim: 32,
            hidden_dim: 64,
            n_layers: 2,
            noise_std: 0.35,
            seed: 0xB10B,
        }
    }
}

/// The synthetic collaborator.
pub struct SyntheticModel {
    config: SyntheticConfig,

    /// Class centroids, `[n_classes × input_dim]`.
    centroids: Array2<f32>,

    /// Per-layer projection weights, each `[hidden_dim × input_dim]`.
    layer_weights: Vec<Array2<f32>>,
}

impl SyntheticModel {
    /// Create a model with fixed centroids and layer weights derived from
    /// the config seed.
    pub fn new(config: SyntheticConfig) -> Result<Self> {
        ensure!(config.n_classes >= 2, "need at least two classes");
        ensure!(config.input_dim > 0, "input dimension must be positive");
        ensure!(config.hidden_dim > 0, "hidden dimension must be positive");
        ensure!(config.n_layers > 0, "need at least one monitored layer");

        let mut rng = StdRng::seed_from_u64(config.seed);

        // Centroids are spread at radius ~3 so blobs stay separable under
        // the default noise.
        let centroid_data: Vec<f32> = (0..config.n_classes * config.input_dim)
            .map(|_| {
                let v: f32 = StandardNormal.sample(&mut rng);
                v * 3.0
            })
            .collect();
        let centroids =
            Array2::from_shape_vec((config.n_classes, config.input_dim), centroid_data)?;

        let scale = 1.0 / (config.input_dim as f32).sqrt();
        let mut layer_weights = Vec::with_capacity(config.n_layers);
        for _ in 0..config.n_layers {
            let data: Vec<f32> = (0..config.hidden_dim * config.input_dim)
                .map(|_| {
                    let v: f32 = StandardNormal.sample(&mut rng);
                    v * scale
                })
                .collect();
            layer_weights.push(Array2::from_shape_vec(
                (config.hidden_dim, config.input_dim),
                data,
            )?);
        }

        Ok(Self {
            config,
            centroids,
            layer_weights,
        })
    }

    /// Sample a labelled dataset: examples cycle through the classes in
    /// round-robin order, each drawn around its class centroid.
    pub fn generate(&self, n: usize, seed: u64) -> Vec<(Array1<f32>, usize)> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|i| {
                let class = i % self.config.n_classes;
                let x: Array1<f32> = self.centroids.row(class).to_owned()
                    + Array1::from_iter((0..self.config.input_dim).map(|_| {
                        let v: f32 = StandardNormal.sample(&mut rng);
                        v * self.config.noise_std
                    }));
                (x, class)
            })
            .collect()
    }

    /// Task shape.
    pub fn config(&self) -> &SyntheticConfig {
        &self.config
    }
}

impl ModelCollaborator for SyntheticModel {
    type Input = Array1<f32>;

    fn num_classes(&self) -> usize {
        self.config.n_classes
    }

    fn monitored_layers(&self) -> usize {
        self.config.n_layers
    }

    fn predict(&self, xs: &[Array1<f32>], want_softmax: bool) -> Result<ModelOutput> {
        let batch = xs.len();
        for x in xs {
            ensure!(
                x.len() == self.config.input_dim,
                "input dimension {} does not match model input dimension {}",
                x.len(),
                self.config.input_dim
            );
        }

        let mut logits = Array2::zeros((batch, self.config.n_classes));
        for (j, x) in xs.iter().enumerate() {
            for c in 0..self.config.n_classes {
                let d2: f32 = x
                    .iter()
                    .zip(self.centroids.row(c).iter())
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum();
                logits[[j, c]] = -d2;
            }
            if want_softmax {
                let probs = softmax(logits.row(j));
                logits.row_mut(j).assign(&probs);
            }
        }

        let mut layers = Vec::with_capacity(self.config.n_layers);
        for w in &self.layer_weights {
            let mut acts = Array2::zeros((batch, self.config.hidden_dim));
            for (j, x) in xs.iter().enumerate() {
                let h = w.dot(x).mapv(f32::tanh);
                acts.row_mut(j).assign(&h);
            }
            layers.push(acts);
        }

        Ok(ModelOutput { logits, layers })
    }
}
