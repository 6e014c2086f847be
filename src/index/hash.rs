//! Approximate retrieval via random binary projections.
//!
//! Every stored vector is hashed to a bit key: one bit per random
//! hyperplane, set when the projection is non-negative. A lookup walks the
//! implicit prefix tree of keys from the deepest level upwards and returns
//! every vector in the shallowest subtree that holds at least
//! `min_candidates` entries, with true Euclidean distances attached.
//!
//! The candidate set is an accuracy/speed trade-off: its size is
//! structure-determined (never the caller's `k`), it may omit true nearest
//! neighbors, and insertion order affects bucket contents but only recall,
//! never the correctness of the distances reported.

use anyhow::{bail, ensure, Result};
use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

use crate::index::{euclidean, Neighbor};

/// A random-binary-projection hash index over one layer's vectors.
pub struct ProjectionHashIndex {
    /// Projection hyperplanes, `[n_projections × dim]`.
    projections: Array2<f32>,

    /// Stored vectors, id = position.
    vectors: Vec<Array1<f32>>,

    /// Bit key per stored vector.
    keys: Vec<u128>,

    dim: usize,
    n_projections: usize,
    min_candidates: usize,
}

impl ProjectionHashIndex {
    /// Build the index: sample `n_projections` Gaussian hyperplanes from
    /// `seed`, then hash and store every vector.
    pub fn build(
        vectors: &[Array1<f32>],
        n_projections: usize,
        min_candidates: usize,
        seed: u64,
    ) -> Result<Self> {
        if vectors.is_empty() {
            bail!("cannot build a projection hash over zero vectors");
        }
        ensure!(
            n_projections >= 1 && n_projections <= 128,
            "projection count {} outside supported range 1..=128",
            n_projections
        );
        ensure!(min_candidates > 0, "minimum candidate count must be positive");

        let dim = vectors[0].len();
        ensure!(dim > 0, "cannot index zero-dimensional vectors");
        for (j, v) in vectors.iter().enumerate() {
            ensure!(
                v.len() == dim,
                "vector {} has dimension {}, layer dimension is {}",
                j,
                v.len(),
                dim
            );
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let data: Vec<f32> = (0..n_projections * dim)
            .map(|_| StandardNormal.sample(&mut rng))
            .collect();
        let projections = Array2::from_shape_vec((n_projections, dim), data)?;

        let mut index = Self {
            projections,
            vectors: Vec::with_capacity(vectors.len()),
            keys: Vec::with_capacity(vectors.len()),
            dim,
            n_projections,
            min_candidates,
        };
        for v in vectors {
            let key = index.hash_key(v.view());
            index.vectors.push(v.clone());
            index.keys.push(key);
        }
        Ok(index)
    }

    /// Candidate neighbors of `query`, ascending by true Euclidean
    /// distance. Variable length: every vector sharing the deepest key
    /// prefix whose subtree reaches `min_candidates` entries (all stored
    /// vectors when the store is smaller than that).
    pub fn query(&self, query: ArrayView1<f32>) -> Result<Vec<Neighbor>> {
        ensure!(
            query.len() == self.dim,
            "query dimension {} does not match index dimension {}",
            query.len(),
            self.dim
        );

        let qkey = self.hash_key(query);

        // Depth of the deepest shared prefix, per stored vector.
        let mut by_prefix: Vec<(usize, usize)> = self
            .keys
            .iter()
            .enumerate()
            .map(|(id, &key)| (self.common_prefix(qkey, key), id))
            .collect();
        by_prefix.sort_unstable_by(|a, b| b.0.cmp(&a.0));

        let mut cut = by_prefix.len();
        if by_prefix.len() > self.min_candidates {
            let floor = by_prefix[self.min_candidates - 1].0;
            cut = by_prefix
                .iter()
                .position(|&(depth, _)| depth < floor)
                .unwrap_or(by_prefix.len());
        }

        let mut candidates: Vec<Neighbor> = by_prefix[..cut]
            .iter()
            .map(|&(_, id)| Neighbor {
                id,
                distance: euclidean(query, self.vectors[id].view()),
            })
            .collect();
        candidates.sort_unstable_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(candidates)
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    /// Is the index empty?
    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Stored vector dimensionality.
    pub fn dim(&self) -> usize {
        self.dim
    }

    fn hash_key(&self, v: ArrayView1<f32>) -> u128 {
        let mut key = 0u128;
        for p in 0..self.n_projections {
            key <<= 1;
            if self.projections.row(p).dot(&v) >= 0.0 {
                key |= 1;
            }
        }
        key
    }

    /// Shared leading bit count of two keys, in `0..=n_projections`.
    fn common_prefix(&self, a: u128, b: u128) -> usize {
        let shifted = (a ^ b) << (128 - self.n_projections as u32);
        (shifted.leading_zeros() as usize).min(self.n_projections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Array1<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| Array1::from_iter((0..dim).map(|_| rng.gen_range(-1.0_f32..1.0))))
            .collect()
    }

    #[test]
    fn test_identical_vector_is_candidate_at_zero() {
        let vectors = random_vectors(50, 16, 1);
        let index = ProjectionHashIndex::build(&vectors, 32, 10, 7).unwrap();
        let hits = index.query(vectors[13].view()).unwrap();
        // An identical vector shares the full key, so it lands in every
        // subtree the query lands in.
        assert_eq!(hits[0].id, 13);
        assert!(hits[0].distance.abs() < 1e-6);
    }

    #[test]
    fn test_candidate_count_meets_minimum() {
        let vectors = random_vectors(200, 16, 2);
        let index = ProjectionHashIndex::build(&vectors, 32, 20, 7).unwrap();
        let hits = index.query(vectors[0].view()).unwrap();
        assert!(hits.len() >= 20, "got {} candidates", hits.len());
    }

    #[test]
    fn test_small_store_returns_everything() {
        let vectors = random_vectors(5, 8, 3);
        let index = ProjectionHashIndex::build(&vectors, 16, 75, 7).unwrap();
        let hits = index.query(vectors[0].view()).unwrap();
        assert_eq!(hits.len(), 5);
    }

    #[test]
    fn test_distances_ascending() {
        let vectors = random_vectors(100, 8, 4);
        let index = ProjectionHashIndex::build(&vectors, 24, 30, 7).unwrap();
        let hits = index.query(vectors[42].view()).unwrap();
        for pair in hits.windows(2) {
            assert!(pair[0].distance <= pair[1].distance);
        }
    }

    #[test]
    fn test_same_seed_same_candidates() {
        let vectors = random_vectors(80, 8, 5);
        let a = ProjectionHashIndex::build(&vectors, 24, 10, 11).unwrap();
        let b = ProjectionHashIndex::build(&vectors, 24, 10, 11).unwrap();
        let ha = a.query(vectors[7].view()).unwrap();
        let hb = b.query(vectors[7].view()).unwrap();
        assert_eq!(ha.len(), hb.len());
        for (x, y) in ha.iter().zip(hb.iter()) {
            assert_eq!(x.id, y.id);
        }
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let vectors = random_vectors(10, 8, 6);
        let index = ProjectionHashIndex::build(&vectors, 16, 5, 7).unwrap();
        let bad = Array1::zeros(4);
        assert!(index.query(bad.view()).is_err());
    }

    #[test]
    fn test_too_many_projections_rejected() {
        let vectors = random_vectors(10, 8, 6);
        assert!(ProjectionHashIndex::build(&vectors, 129, 5, 7).is_err());
    }
}
