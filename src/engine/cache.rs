//! Activation cache.
//!
//! Collects, for every training example, one hidden vector per monitored
//! layer plus its ground-truth label. Entry `j` in every layer's
//! collection belongs to training example `j`, so the position doubles as
//! the dense example identifier shared across layers.

use anyhow::{ensure, Result};
use ndarray::{Array1, Array2};

/// One monitored layer's growing vector collection.
struct LayerStore {
    /// Dimensionality, fixed by the first observed vector.
    dim: Option<usize>,

    vectors: Vec<Array1<f32>>,
}

/// Per-layer activations plus the label table, assembled batch by batch.
pub struct ActivationCache {
    layers: Vec<LayerStore>,
    labels: Vec<usize>,
}

impl ActivationCache {
    /// An empty cache for `n_layers` monitored layers.
    pub fn new(n_layers: usize) -> Self {
        Self {
            layers: (0..n_layers)
                .map(|_| LayerStore {
                    dim: None,
                    vectors: Vec::new(),
                })
                .collect(),
            labels: Vec::new(),
        }
    }

    /// Append one batch: `layer_batches[i]` is the `[batch × hidden_i]`
    /// activation matrix of layer `i`, `labels` the batch's ground truth.
    ///
    /// Every layer's dimensionality is pinned by its first batch; a later
    /// mismatch is a fatal model/engine version skew.
    pub fn push_batch(&mut self, layer_batches: &[Array2<f32>], labels: &[usize]) -> Result<()> {
        ensure!(
            layer_batches.len() == self.layers.len(),
            "model returned {} monitored layers, cache expects {}",
            layer_batches.len(),
            self.layers.len()
        );
        for (i, batch) in layer_batches.iter().enumerate() {
            ensure!(
                batch.nrows() == labels.len(),
                "layer {} has {} rows for {} labels",
                i,
                batch.nrows(),
                labels.len()
            );
        }

        for (store, batch) in self.layers.iter_mut().zip(layer_batches.iter()) {
            let dim = *store.dim.get_or_insert(batch.ncols());
            ensure!(
                batch.ncols() == dim,
                "activation dimension {} does not match established layer dimension {}",
                batch.ncols(),
                dim
            );
            for row in batch.rows() {
                store.vectors.push(row.to_owned());
            }
        }
        self.labels.extend_from_slice(labels);
        Ok(())
    }

    /// Number of monitored layers.
    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Number of cached examples.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Is the cache empty?
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// One layer's cached vectors, in example-id order.
    pub fn layer_vectors(&self, layer: usize) -> &[Array1<f32>] {
        &self.layers[layer].vectors
    }

    /// Consume the cache, keeping only the label table.
    pub fn into_labels(self) -> Vec<usize> {
        self.labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(rows: usize, cols: usize, fill: f32) -> Array2<f32> {
        Array2::from_elem((rows, cols), fill)
    }

    #[test]
    fn test_layers_and_labels_stay_parallel() {
        let mut cache = ActivationCache::new(2);
        cache
            .push_batch(&[batch(4, 8, 0.0), batch(4, 16, 0.0)], &[0, 1, 0, 1])
            .unwrap();
        cache
            .push_batch(&[batch(3, 8, 1.0), batch(3, 16, 1.0)], &[1, 1, 0])
            .unwrap();

        assert_eq!(cache.len(), 7);
        for layer in 0..cache.n_layers() {
            assert_eq!(cache.layer_vectors(layer).len(), cache.len());
        }
    }

    #[test]
    fn test_example_order_is_insertion_order() {
        let mut cache = ActivationCache::new(1);
        cache.push_batch(&[batch(2, 4, 0.5)], &[3, 4]).unwrap();
        cache.push_batch(&[batch(1, 4, 2.5)], &[5]).unwrap();
        let labels = cache.into_labels();
        assert_eq!(labels, vec![3, 4, 5]);
    }

    #[test]
    fn test_layer_count_mismatch_rejected() {
        let mut cache = ActivationCache::new(2);
        let result = cache.push_batch(&[batch(4, 8, 0.0)], &[0, 1, 0, 1]);
        assert!(result.is_err());
    }

    #[test]
    fn test_dimension_skew_rejected() {
        let mut cache = ActivationCache::new(1);
        cache.push_batch(&[batch(2, 8, 0.0)], &[0, 1]).unwrap();
        let result = cache.push_batch(&[batch(2, 9, 0.0)], &[0, 1]);
        assert!(result.is_err());
    }

    #[test]
    fn test_row_label_mismatch_rejected() {
        let mut cache = ActivationCache::new(1);
        let result = cache.push_batch(&[batch(3, 8, 0.0)], &[0, 1]);
        assert!(result.is_err());
    }
}
