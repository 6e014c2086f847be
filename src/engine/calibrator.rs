//! Conformal calibration reference.
//!
//! One non-conformity score per calibration example: the fraction of that
//! example's retrieved-neighbor votes agreeing with its true label. The
//! collected distribution turns a raw vote share into an empirical
//! p-value.
//!
//! Two lookup formulas coexist. The class-conditional credibility path
//! counts reference values strictly below the observed share (higher raw
//! agreement can only raise the result); the prediction path counts
//! values at or above it, the conformal p-value proper. The two are exact
//! complements, so swapping one call path onto the other formula would
//! invert every reported score.

use anyhow::{bail, ensure, Result};
use serde::{Deserialize, Serialize};

/// Ordered collection of non-conformity scores, each in [0,1].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CalibrationReference {
    scores: Vec<f64>,
}

impl CalibrationReference {
    /// Wrap a collected score list, rejecting values outside [0,1].
    pub fn from_scores(scores: Vec<f64>) -> Result<Self> {
        for (i, &s) in scores.iter().enumerate() {
            ensure!(
                (0.0..=1.0).contains(&s) && s.is_finite(),
                "calibration score {} at position {} lies outside [0,1]",
                s,
                i
            );
        }
        Ok(Self { scores })
    }

    /// Number of calibration examples.
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    /// Is the reference empty?
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// The raw score list, in calibration order.
    pub fn scores(&self) -> &[f64] {
        &self.scores
    }

    /// Fraction of reference values strictly less than `p`.
    ///
    /// Monotone non-decreasing in `p`; used to calibrate the credibility
    /// of a caller-chosen class.
    pub fn calibrate_strict_less(&self, p: f64) -> Result<f64> {
        if self.scores.is_empty() {
            bail!("calibration reference is empty");
        }
        let below = self.scores.iter().filter(|&&s| s < p).count();
        Ok(below as f64 / self.scores.len() as f64)
    }

    /// Fraction of reference values at or above `p`.
    ///
    /// Used by the prediction path for both the top and runner-up vote
    /// shares.
    pub fn calibrate_geq(&self, p: f64) -> Result<f64> {
        if self.scores.is_empty() {
            bail!("calibration reference is empty");
        }
        let at_or_above = self.scores.iter().filter(|&&s| s >= p).count();
        Ok(at_or_above as f64 / self.scores.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> CalibrationReference {
        CalibrationReference::from_scores(vec![0.2, 0.4, 0.4, 0.8, 1.0]).unwrap()
    }

    #[test]
    fn test_strict_less_hand_computed() {
        let r = reference();
        assert!((r.calibrate_strict_less(0.5).unwrap() - 0.6).abs() < 1e-12);
        assert!((r.calibrate_strict_less(0.4).unwrap() - 0.2).abs() < 1e-12);
        assert!((r.calibrate_strict_less(0.0).unwrap() - 0.0).abs() < 1e-12);
        assert!((r.calibrate_strict_less(1.1).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_geq_hand_computed() {
        let r = reference();
        assert!((r.calibrate_geq(0.5).unwrap() - 0.4).abs() < 1e-12);
        assert!((r.calibrate_geq(0.4).unwrap() - 0.8).abs() < 1e-12);
        assert!((r.calibrate_geq(0.0).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_formulas_are_complements() {
        // Strictly-below and at-or-above counts partition the reference,
        // so the two lookups always sum to one and run in opposite
        // directions.
        let r = reference();
        for step in 0..=10 {
            let p = step as f64 / 10.0;
            let less = r.calibrate_strict_less(p).unwrap();
            let geq = r.calibrate_geq(p).unwrap();
            assert!((less + geq - 1.0).abs() < 1e-12, "at p = {}", p);
        }
        assert!(r.calibrate_geq(0.9).unwrap() <= r.calibrate_geq(0.1).unwrap());
    }

    #[test]
    fn test_strict_less_is_monotone() {
        let r = reference();
        let mut previous = 0.0;
        for step in 0..=20 {
            let p = step as f64 / 20.0;
            let calibrated = r.calibrate_strict_less(p).unwrap();
            assert!(calibrated + 1e-12 >= previous, "dropped at p = {}", p);
            assert!((0.0..=1.0).contains(&calibrated));
            previous = calibrated;
        }
    }

    #[test]
    fn test_empty_reference_rejected() {
        let r = CalibrationReference::default();
        assert!(r.calibrate_strict_less(0.5).is_err());
        assert!(r.calibrate_geq(0.5).is_err());
    }

    #[test]
    fn test_out_of_range_scores_rejected() {
        assert!(CalibrationReference::from_scores(vec![0.5, 1.2]).is_err());
        assert!(CalibrationReference::from_scores(vec![-0.1]).is_err());
        assert!(CalibrationReference::from_scores(vec![f64::NAN]).is_err());
    }
}
