//! Model collaborator surface.
//!
//! The engine never touches the classifier's internals. It consumes a
//! single contract: given a batch of inputs, return the output logits and
//! one activation matrix per monitored layer, both already materialized as
//! host arrays.

pub mod synthetic;

use anyhow::Result;
use ndarray::{Array1, Array2, ArrayView1};

/// One forward pass over a batch.
#[derive(Clone, Debug)]
pub struct ModelOutput {
    /// Output scores, `[batch × num_classes]`. Softmaxed when the caller
    /// asked for probabilities, raw logits otherwise.
    pub logits: Array2<f32>,

    /// One activation matrix per monitored layer, each `[batch × hidden_i]`.
    /// The hidden dimension may differ between layers.
    pub layers: Vec<Array2<f32>>,
}

/// A trained classifier the engine can interrogate.
///
/// Implementations must return exactly `monitored_layers()` activation
/// matrices on every call; the engine treats any other count as a fatal
/// version skew.
pub trait ModelCollaborator {
    /// Input type for a single example.
    type Input: Clone;

    /// Number of output classes.
    fn num_classes(&self) -> usize;

    /// Number of monitored layers whose activations are exposed.
    fn monitored_layers(&self) -> usize;

    /// Forward a batch. `want_softmax` selects probabilities over raw
    /// logits in [`ModelOutput::logits`].
    fn predict(&self, xs: &[Self::Input], want_softmax: bool) -> Result<ModelOutput>;
}

/// Softmax a logits vector into probabilities.
pub fn softmax(logits: ArrayView1<f32>) -> Array1<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exp: Array1<f32> = logits.mapv(|v| (v - max).exp());
    let sum: f32 = exp.sum();
    if sum > 0.0 {
        exp / sum
    } else {
        Array1::from_vec(vec![1.0 / logits.len() as f32; logits.len()])
    }
}

/// Argmax of a vector.
pub fn argmax(v: ArrayView1<f32>) -> usize {
    v.iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Maximum element of a vector.
pub fn max_score(v: ArrayView1<f32>) -> f32 {
    v.iter().cloned().fold(f32::NEG_INFINITY, f32::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_softmax_sums_to_one() {
        let logits = array![1.0_f32, 2.0, 3.0];
        let probs = softmax(logits.view());
        let sum: f32 = probs.sum();
        assert!((sum - 1.0).abs() < 1e-6, "sum = {}", sum);
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    }

    #[test]
    fn test_softmax_degenerate() {
        let logits = array![f32::NEG_INFINITY, f32::NEG_INFINITY];
        let probs = softmax(logits.view());
        assert!((probs[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_argmax() {
        let v = array![0.1_f32, 0.7, 0.2];
        assert_eq!(argmax(v.view()), 1);
    }

    #[test]
    fn test_max_score() {
        let v = array![0.1_f32, 0.7, 0.2];
        assert!((max_score(v.view()) - 0.7).abs() < 1e-6);
    }
}
