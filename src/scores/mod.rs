//! Vote calculus.
//!
//! Pure functions from a neighbor-label vote multiset to raw scores.
//! Calibrated variants live with the calibration reference in
//! [`crate::engine::calibrator`].

use std::collections::HashMap;
use std::collections::HashSet;

use anyhow::{bail, ensure, Result};

/// Summary of one example's vote multiset.
#[derive(Clone, Debug, PartialEq)]
pub struct VoteSummary {
    /// Most-voted label. Ties break in counting order, which is not
    /// guaranteed stable.
    pub label: usize,

    /// Vote share of the most-voted label, in [0,1]. This is the raw
    /// credibility of the prediction.
    pub top_share: f64,

    /// Vote share of the runner-up label, in [0,1]. Zero when only one
    /// distinct label appears. Raw confidence is one minus this.
    pub runner_up_share: f64,

    /// Total votes cast.
    pub total: usize,
}

/// Count votes per label, most common first. Labels with equal counts
/// appear in an unspecified order.
pub fn count_votes(votes: &[usize]) -> Vec<(usize, usize)> {
    let mut counts: HashMap<usize, usize> = HashMap::new();
    for &label in votes {
        *counts.entry(label).or_insert(0) += 1;
    }
    let mut counted: Vec<(usize, usize)> = counts.into_iter().collect();
    counted.sort_unstable_by(|a, b| b.1.cmp(&a.1));
    counted
}

/// Reduce a vote multiset to its top-two summary.
pub fn summarize(votes: &[usize]) -> Result<VoteSummary> {
    if votes.is_empty() {
        bail!("empty vote multiset: no neighbors were retrieved");
    }
    let counted = count_votes(votes);
    let total = votes.len();
    let (label, top) = counted[0];
    let runner_up = counted.get(1).map(|&(_, c)| c).unwrap_or(0);

    Ok(VoteSummary {
        label,
        top_share: top as f64 / total as f64,
        runner_up_share: runner_up as f64 / total as f64,
        total,
    })
}

/// Vote share of one specific class, in [0,1].
pub fn class_share(votes: &[usize], class: usize) -> Result<f64> {
    if votes.is_empty() {
        bail!("empty vote multiset: no neighbors were retrieved");
    }
    let agree = votes.iter().filter(|&&v| v == class).count();
    Ok(agree as f64 / votes.len() as f64)
}

/// Fraction of `perturbed` identifiers also present in `original`.
///
/// Quantifies representation stability under input perturbation; 1.0 means
/// the neighborhood did not move at all.
pub fn overlap_ratio(perturbed: &[usize], original: &[usize]) -> Result<f64> {
    ensure!(
        !perturbed.is_empty(),
        "no neighbors retrieved for the perturbed input"
    );
    let reference: HashSet<usize> = original.iter().copied().collect();
    let shared = perturbed.iter().filter(|id| reference.contains(id)).count();
    Ok(shared as f64 / perturbed.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vote_summary_five_three() {
        // {A:5, B:3} over 8 votes.
        let votes = vec![0, 0, 0, 0, 0, 1, 1, 1];
        let s = summarize(&votes).unwrap();
        assert_eq!(s.label, 0);
        assert!((s.top_share - 0.625).abs() < 1e-12);
        assert!((1.0 - s.runner_up_share - 0.625).abs() < 1e-12);
        assert_eq!(s.total, 8);
    }

    #[test]
    fn test_single_class_confidence_is_one() {
        let votes = vec![2, 2, 2, 2];
        let s = summarize(&votes).unwrap();
        assert_eq!(s.label, 2);
        assert!((s.top_share - 1.0).abs() < 1e-12);
        assert_eq!(s.runner_up_share, 0.0);
    }

    #[test]
    fn test_empty_votes_rejected() {
        assert!(summarize(&[]).is_err());
        assert!(class_share(&[], 0).is_err());
    }

    #[test]
    fn test_class_share() {
        let votes = vec![0, 1, 1, 1];
        assert!((class_share(&votes, 1).unwrap() - 0.75).abs() < 1e-12);
        assert!((class_share(&votes, 5).unwrap() - 0.0).abs() < 1e-12);
    }

    #[test]
    fn test_count_votes_ordering() {
        let votes = vec![3, 3, 3, 1, 1, 7];
        let counted = count_votes(&votes);
        assert_eq!(counted[0], (3, 3));
        assert_eq!(counted[1], (1, 2));
        assert_eq!(counted[2], (7, 1));
    }

    #[test]
    fn test_overlap_ratio() {
        let original = vec![1, 2, 3, 4];
        let perturbed = vec![3, 4, 5, 6];
        assert!((overlap_ratio(&perturbed, &original).unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_overlap_ratio_identical_sets() {
        let ids = vec![9, 8, 7];
        assert!((overlap_ratio(&ids, &ids).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_overlap_ratio_empty_perturbed_rejected() {
        assert!(overlap_ratio(&[], &[1, 2]).is_err());
    }
}
