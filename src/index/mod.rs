//! Per-layer nearest-neighbor index structures.
//!
//! Two interchangeable variants behind one call site:
//! - **Exact** — a k-d tree; `query(v, k)` returns exactly the k nearest
//!   training vectors by Euclidean distance
//! - **Approximate** — a random-binary-projection hash; `query` returns a
//!   structure-determined candidate set (variable length, possibly empty
//!   of true neighbors) and ignores `k`
//!
//! Both are built once over a layer's training vectors and are read-only
//! afterwards.

pub mod exact;
pub mod hash;

use anyhow::Result;
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::index::exact::KdTree;
use crate::index::hash::ProjectionHashIndex;

/// Which index variant to build.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    /// k-d tree, exact k-nearest retrieval.
    Exact,

    /// Random-binary-projection hash, approximate candidate retrieval.
    Approximate,
}

/// One retrieved neighbor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Neighbor {
    /// Dense training-example identifier (insertion order at build time).
    pub id: usize,

    /// Euclidean distance from the query vector.
    pub distance: f32,
}

/// A built per-layer index.
pub enum NeighborIndex {
    Exact(KdTree),
    Approximate(ProjectionHashIndex),
}

impl NeighborIndex {
    /// Build an index of the requested kind over a layer's training
    /// vectors. Vector `j` is stored under identifier `j`.
    pub fn build(kind: IndexKind, vectors: &[Array1<f32>], seed: u64) -> Result<Self> {
        match kind {
            IndexKind::Exact => Ok(Self::Exact(KdTree::build(vectors)?)),
            IndexKind::Approximate => Ok(Self::Approximate(ProjectionHashIndex::build(
                vectors,
                crate::config::N_PROJECTIONS,
                crate::config::MIN_CANDIDATES,
                seed,
            )?)),
        }
    }

    /// Query for neighbors of `query`, ordered by ascending distance.
    ///
    /// The exact variant returns exactly `k` results (or every stored
    /// vector when fewer exist); the approximate variant ignores `k` and
    /// returns its candidate set, whose size the structure determines.
    pub fn query(&self, query: ArrayView1<f32>, k: usize) -> Result<Vec<Neighbor>> {
        match self {
            Self::Exact(tree) => tree.query(query, k),
            Self::Approximate(hash) => hash.query(query),
        }
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        match self {
            Self::Exact(tree) => tree.len(),
            Self::Approximate(hash) => hash.len(),
        }
    }

    /// Is the index empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored vector dimensionality.
    pub fn dim(&self) -> usize {
        match self {
            Self::Exact(tree) => tree.dim(),
            Self::Approximate(hash) => hash.dim(),
        }
    }

    /// Which variant this is.
    pub fn kind(&self) -> IndexKind {
        match self {
            Self::Exact(_) => IndexKind::Exact,
            Self::Approximate(_) => IndexKind::Approximate,
        }
    }
}

/// Euclidean distance between two vectors of equal length.
pub(crate) fn euclidean(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn grid_vectors() -> Vec<Array1<f32>> {
        (0..10).map(|i| array![i as f32, 0.0]).collect()
    }

    #[test]
    fn test_build_exact_kind() {
        let idx = NeighborIndex::build(IndexKind::Exact, &grid_vectors(), 0).unwrap();
        assert_eq!(idx.kind(), IndexKind::Exact);
        assert_eq!(idx.len(), 10);
        assert_eq!(idx.dim(), 2);
    }

    #[test]
    fn test_build_approximate_kind() {
        let idx = NeighborIndex::build(IndexKind::Approximate, &grid_vectors(), 0).unwrap();
        assert_eq!(idx.kind(), IndexKind::Approximate);
        assert_eq!(idx.len(), 10);
    }

    #[test]
    fn test_exact_query_through_wrapper() {
        let idx = NeighborIndex::build(IndexKind::Exact, &grid_vectors(), 0).unwrap();
        let hits = idx.query(array![3.1_f32, 0.0].view(), 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, 3);
    }

    #[test]
    fn test_euclidean() {
        let a = array![0.0_f32, 3.0];
        let b = array![4.0_f32, 0.0];
        assert!((euclidean(a.view(), b.view()) - 5.0).abs() < 1e-6);
    }
}
