//! # DEEPKNN
//!
//! **Deep k-Nearest Neighbors** — a post-hoc credibility layer that augments
//! a trained neural classifier with a non-parametric, per-layer
//! nearest-neighbor vote, calibrated into conformal credibility and
//! confidence scores.
//!
//! ## Components
//!
//! 1. **Activation cache** — per-layer hidden vectors of the training set,
//!    plus a label table, collected batch by batch
//! 2. **Neighbor index** — one lookup structure per monitored layer; either
//!    an exact k-d tree or an approximate random-binary-projection hash
//! 3. **Calibrator** — non-conformity reference distribution from a
//!    held-out split
//! 4. **Engine** — retrieval, cross-layer vote aggregation, prediction
//! 5. **Score calculus** — pure vote-to-score functions
//!
//! ## Flow
//!
//! - `build`: training set → model activations → per-layer index
//! - `calibrate`: held-out set → per-example true-label vote share
//! - `predict`: test input → neighbor vote → {class, credibility,
//!   confidence} alongside the model's own softmax prediction

pub mod engine;
pub mod index;
pub mod model;
pub mod scores;

/// Engine-wide constants.
pub mod config {
    /// Neighbors retrieved per layer for voting.
    pub const K_NEIGHBORS: usize = 75;

    /// Neighbors retrieved for the nearest-distance diagnostic.
    pub const K_DIAGNOSTIC: usize = 1;

    /// Random binary projections per hash index.
    pub const N_PROJECTIONS: usize = 75;

    /// Minimum candidate count targeted by a hash-index lookup.
    pub const MIN_CANDIDATES: usize = 75;

    /// Default batch size for build, calibration, and evaluation.
    pub const BATCH_SIZE: usize = 64;

    /// Default seed for projection hyperplanes.
    pub const PROJECTION_SEED: u64 = 0x5EED_CAFE;
}
