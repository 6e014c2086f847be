//! Exact k-nearest retrieval via a k-d tree.
//!
//! Built once over a layer's training vectors by recursive median split;
//! queries keep the k best candidates in a bounded max-heap and prune
//! subtrees by splitting-plane distance. Deterministic for a fixed input
//! order. Equal-distance ties fall in traversal order, which is not part
//! of the contract.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use anyhow::{bail, ensure, Result};
use ndarray::{Array1, ArrayView1};

use crate::index::{euclidean, Neighbor};

struct KdNode {
    /// Index into `points` (doubles as the training-example id).
    point: usize,

    /// Splitting axis at this depth.
    axis: usize,

    left: Option<usize>,
    right: Option<usize>,
}

/// A static k-d tree over one layer's training vectors.
pub struct KdTree {
    points: Vec<Array1<f32>>,
    nodes: Vec<KdNode>,
    root: Option<usize>,
    dim: usize,
}

impl KdTree {
    /// Build a balanced tree. Vector `j` in `vectors` is stored under
    /// identifier `j`.
    pub fn build(vectors: &[Array1<f32>]) -> Result<Self> {
        if vectors.is_empty() {
            bail!("cannot build a k-d tree over zero vectors");
        }
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

        let points: Vec<Array1<f32>> = vectors.to_vec();
        let mut ids: Vec<usize> = (0..points.len()).collect();
        let mut nodes = Vec::with_capacity(points.len());
        let root = build_recursive(&points, &mut ids, 0, dim, &mut nodes);

        Ok(Self {
            points,
            nodes,
            root,
            dim,
        })
    }

    /// The k nearest stored vectors to `query`, ascending by Euclidean
    /// distance. Returns fewer than `k` only when fewer vectors exist.
    pub fn query(&self, query: ArrayView1<f32>, k: usize) -> Result<Vec<Neighbor>> {
        ensure!(k > 0, "neighbor count k must be positive");
        ensure!(
            query.len() == self.dim,
            "query dimension {} does not match index dimension {}",
            query.len(),
            self.dim
        );

        let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::with_capacity(k + 1);
        self.search(self.root, query, k, &mut heap);

        Ok(heap
            .into_sorted_vec()
            .into_iter()
            .map(|e| Neighbor {
                id: e.id,
                distance: e.distance,
            })
            .collect())
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Is the tree empty?
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Stored vector dimensionality.
    pub fn dim(&self) -> usize {
        self.dim
    }

    fn search(
        &self,
        node: Option<usize>,
        query: ArrayView1<f32>,
        k: usize,
        heap: &mut BinaryHeap<HeapEntry>,
    ) {
        let Some(idx) = node else {
            return;
        };
        let node = &self.nodes[idx];
        let point = &self.points[node.point];

        let distance = euclidean(query, point.view());
        heap.push(HeapEntry {
            distance,
            id: node.point,
        });
        if heap.len() > k {
            heap.pop();
        }

        let delta = query[node.axis] - point[node.axis];
        let (near, far) = if delta < 0.0 {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };

        self.search(near, query, k, heap);

        // The far subtree can only matter if the splitting plane is closer
        // than the current k-th best.
        let worst = heap.peek().map(|e| e.distance).unwrap_or(f32::INFINITY);
        if heap.len() < k || delta.abs() < worst {
            self.search(far, query, k, heap);
        }
    }
}

fn build_recursive(
    points: &[Array1<f32>],
    ids: &mut [usize],
    depth: usize,
    dim: usize,
    nodes: &mut Vec<KdNode>,
) -> Option<usize> {
    if ids.is_empty() {
        return None;
    }
    let axis = depth % dim;
    ids.sort_unstable_by(|&a, &b| {
        points[a][axis]
            .partial_cmp(&points[b][axis])
            .unwrap_or(Ordering::Equal)
    });
    let mid = ids.len() / 2;
    let point = ids[mid];

    let slot = nodes.len();
    nodes.push(KdNode {
        point,
        axis,
        left: None,
        right: None,
    });

    let (lo, rest) = ids.split_at_mut(mid);
    let hi = &mut rest[1..];
    let left = build_recursive(points, lo, depth + 1, dim, nodes);
    let right = build_recursive(points, hi, depth + 1, dim, nodes);
    nodes[slot].left = left;
    nodes[slot].right = right;
    Some(slot)
}

/// Max-heap entry ordered by distance, so the worst candidate sits on top.
struct HeapEntry {
    distance: f32,
    id: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn line_points(n: usize) -> Vec<Array1<f32>> {
        (0..n).map(|i| array![i as f32, 0.0, 0.0]).collect()
    }

    #[test]
    fn test_query_returns_exactly_k_sorted() {
        let tree = KdTree::build(&line_points(20)).unwrap();
        let hits = tree.query(array![7.2_f32, 0.0, 0.0].view(), 5).unwrap();
        assert_eq!(hits.len(), 5);
        for pair in hits.windows(2) {
            assert!(pair[0].distance <= pair[1].distance);
        }
        for h in &hits {
            assert!(h.id < 20);
        }
        assert_eq!(hits[0].id, 7);
    }

    #[test]
    fn test_exact_match_at_distance_zero() {
        let tree = KdTree::build(&line_points(10)).unwrap();
        let hits = tree.query(array![4.0_f32, 0.0, 0.0].view(), 1).unwrap();
        assert_eq!(hits[0].id, 4);
        assert!(hits[0].distance.abs() < 1e-6);
    }

    #[test]
    fn test_k_larger_than_store() {
        let tree = KdTree::build(&line_points(3)).unwrap();
        let hits = tree.query(array![0.0_f32, 0.0, 0.0].view(), 10).unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn test_matches_brute_force() {
        // Pruned tree search must agree with a linear scan.
        let mut rng = StdRng::seed_from_u64(99);
        let points: Vec<Array1<f32>> = (0..200)
            .map(|_| Array1::from_iter((0..8).map(|_| rng.gen_range(-1.0_f32..1.0))))
            .collect();
        let tree = KdTree::build(&points).unwrap();

        let query = Array1::from_iter((0..8).map(|_| rng.gen_range(-1.0_f32..1.0)));
        let hits = tree.query(query.view(), 10).unwrap();

        let mut brute: Vec<(f32, usize)> = points
            .iter()
            .enumerate()
            .map(|(j, p)| (euclidean(query.view(), p.view()), j))
            .collect();
        brute.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());

        for (hit, (dist, _)) in hits.iter().zip(brute.iter()) {
            assert!((hit.distance - dist).abs() < 1e-5);
        }
    }

    #[test]
    fn test_empty_build_rejected() {
        assert!(KdTree::build(&[]).is_err());
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let tree = KdTree::build(&line_points(5)).unwrap();
        assert!(tree.query(array![1.0_f32, 2.0].view(), 1).is_err());
    }

    #[test]
    fn test_ragged_vectors_rejected() {
        let vectors = vec![array![1.0_f32, 2.0], array![1.0_f32, 2.0, 3.0]];
        assert!(KdTree::build(&vectors).is_err());
    }
}
