//! DkNN engine.
//!
//! Owns the model collaborator, the per-layer neighbor indices, the label
//! table, and the calibration reference. State is written exactly once:
//! `build` populates the indices and labels, `calibrate` the reference;
//! every query entry point checks the built flag first and fails fast
//! when it is unset. Execution is single-threaded and batch-sequential.

pub mod cache;
pub mod calibrator;

use anyhow::{anyhow, bail, ensure, Result};
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

use crate::config;
use crate::engine::cache::ActivationCache;
use crate::engine::calibrator::CalibrationReference;
use crate::index::{IndexKind, NeighborIndex};
use crate::model::{argmax, max_score, ModelCollaborator, ModelOutput};
use crate::scores;

/// How per-layer neighbor sets combine into one vote multiset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VotePolicy {
    /// Accumulate every monitored layer's neighbor labels.
    AllLayers,

    /// Keep only the deepest layer's neighbors, discarding the rest.
    LastLayerOnly,
}

/// Engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DkNnConfig {
    /// Neighbors requested per layer per query. The approximate index
    /// substitutes its own structure-determined candidate count.
    pub k: usize,

    /// Index variant built for every layer.
    pub index_kind: IndexKind,

    /// Cross-layer vote aggregation policy.
    pub vote_policy: VotePolicy,

    /// Drop the last partial batch during build and calibration instead
    /// of processing it.
    pub drop_remainder: bool,

    /// Base seed for the approximate index's projection hyperplanes;
    /// layer `i` uses `seed + i`.
    pub seed: u64,
}

impl Default for DkNnConfig {
    fn default() -> Self {
        Self {
            k: config::K_NEIGHBORS,
            index_kind: IndexKind::Exact,
            vote_policy: VotePolicy::AllLayers,
            drop_remainder: false,
            seed: config::PROJECTION_SEED,
        }
    }
}

/// One example's prediction, neighbor-vote and baseline side by side.
#[derive(Clone, Debug)]
pub struct Prediction {
    /// Most-voted neighbor label.
    pub label: usize,

    /// Credibility of `label`: top vote share, calibrated on request.
    pub credibility: f64,

    /// Confidence in `label`: one minus the runner-up share, calibrated
    /// on request.
    pub confidence: f64,

    /// The model's own argmax class.
    pub baseline_label: usize,

    /// The model's own softmax mass at `baseline_label`.
    pub baseline_confidence: f32,
}

/// Index and label state produced by `build`, immutable afterwards.
struct BuiltState {
    /// One index per monitored layer.
    indices: Vec<NeighborIndex>,

    /// Ground-truth label per dense training-example id.
    labels: Vec<usize>,

    n_layers: usize,
}

/// The DkNN engine.
pub struct DkNnEngine<M: ModelCollaborator> {
    model: M,
    config: DkNnConfig,
    state: Option<BuiltState>,
    reference: Option<CalibrationReference>,
}

impl<M: ModelCollaborator> DkNnEngine<M> {
    /// Wrap a model collaborator. Nothing is queryable until [`build`]
    /// has run.
    ///
    /// [`build`]: DkNnEngine::build
    pub fn new(model: M, config: DkNnConfig) -> Self {
        Self {
            model,
            config,
            state: None,
            reference: None,
        }
    }

    /// The wrapped collaborator.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Engine configuration.
    pub fn config(&self) -> &DkNnConfig {
        &self.config
    }

    /// Has `build` completed?
    pub fn is_built(&self) -> bool {
        self.state.is_some()
    }

    /// The calibration reference, once `calibrate` has run.
    pub fn reference(&self) -> Option<&CalibrationReference> {
        self.reference.as_ref()
    }

    /// Cache the training set's per-layer activations and construct one
    /// neighbor index per monitored layer.
    ///
    /// Iteration order becomes the dense example-id order shared by every
    /// layer and the label table. Fails on a layer-count mismatch from the
    /// collaborator, on activation-shape skew, and on an empty effective
    /// training set.
    pub fn build(&mut self, training: &[(M::Input, usize)], batch_size: usize) -> Result<()> {
        ensure!(batch_size > 0, "batch size must be positive");
        let n_layers = self.model.monitored_layers();
        ensure!(n_layers > 0, "model exposes no monitored layers");

        let usable = self.usable_len(training.len(), batch_size);
        ensure!(
            usable > 0,
            "training set of {} examples yields no full batch of {}",
            training.len(),
            batch_size
        );

        tracing::info!("caching activations for {} training examples", usable);
        let mut cache = ActivationCache::new(n_layers);
        for chunk in training[..usable].chunks(batch_size) {
            let xs: Vec<M::Input> = chunk.iter().map(|(x, _)| x.clone()).collect();
            let labels: Vec<usize> = chunk.iter().map(|(_, y)| *y).collect();

            let out = self.model.predict(&xs, false)?;
            ensure!(
                out.layers.len() == n_layers,
                "model returned {} monitored layers, engine expects {}",
                out.layers.len(),
                n_layers
            );
            cache.push_batch(&out.layers, &labels)?;
        }

        let mut indices = Vec::with_capacity(n_layers);
        for layer in 0..n_layers {
            let vectors = cache.layer_vectors(layer);
            tracing::info!(
                "building {:?} index for layer {} ({} vectors, dim {})",
                self.config.index_kind,
                layer,
                vectors.len(),
                vectors.first().map(|v| v.len()).unwrap_or(0)
            );
            indices.push(NeighborIndex::build(
                self.config.index_kind,
                vectors,
                self.config.seed.wrapping_add(layer as u64),
            )?);
        }

        let labels = cache.into_labels();
        self.state = Some(BuiltState {
            indices,
            labels,
            n_layers,
        });
        Ok(())
    }

    /// Record, for every calibration example, the fraction of its neighbor
    /// votes that agree with its true label. The collected distribution
    /// becomes the calibration reference for later scoring.
    pub fn calibrate(&mut self, calibration: &[(M::Input, usize)], batch_size: usize) -> Result<()> {
        self.built()?;
        ensure!(batch_size > 0, "batch size must be positive");
        ensure!(!calibration.is_empty(), "calibration set is empty");

        let usable = self.usable_len(calibration.len(), batch_size);
        ensure!(
            usable > 0,
            "calibration set of {} examples yields no full batch of {}",
            calibration.len(),
            batch_size
        );

        tracing::info!("calibrating credibility on {} examples", usable);
        let mut collected = Vec::with_capacity(usable);
        for chunk in calibration[..usable].chunks(batch_size) {
            let xs: Vec<M::Input> = chunk.iter().map(|(x, _)| x.clone()).collect();
            let (_, votes) = self.batch_votes(&xs, false)?;
            for (vote, &(_, label)) in votes.iter().zip(chunk.iter()) {
                collected.push(scores::class_share(vote, label)?);
            }
        }

        self.reference = Some(CalibrationReference::from_scores(collected)?);
        Ok(())
    }

    /// Neighbor example identifiers for one example's per-layer
    /// activations, combined under the configured vote policy.
    pub fn neighbor_ids(&self, per_layer: &[ArrayView1<f32>]) -> Result<Vec<usize>> {
        let state = self.built()?;
        ensure!(
            per_layer.len() == state.n_layers,
            "got activations for {} layers, engine monitors {}",
            per_layer.len(),
            state.n_layers
        );

        let mut ids = Vec::new();
        for (layer, activation) in per_layer.iter().enumerate() {
            let neighbors = state.indices[layer].query(*activation, self.config.k)?;
            if self.config.vote_policy == VotePolicy::LastLayerOnly {
                ids.clear();
            }
            ids.extend(neighbors.iter().map(|n| n.id));
        }
        Ok(ids)
    }

    /// The vote multiset for one example: neighbor identifiers mapped to
    /// their training labels.
    pub fn query_all_layers(&self, per_layer: &[ArrayView1<f32>]) -> Result<Vec<usize>> {
        let state = self.built()?;
        let ids = self.neighbor_ids(per_layer)?;
        ids.into_iter()
            .map(|id| {
                state
                    .labels
                    .get(id)
                    .copied()
                    .ok_or_else(|| anyhow!("neighbor id {} outside label table", id))
            })
            .collect()
    }

    /// Predict a batch: neighbor vote plus the model's own prediction.
    ///
    /// With `calibrated` set, both vote shares pass through the
    /// at-or-above reference lookup; calling it before `calibrate` is an
    /// error.
    pub fn predict(&self, xs: &[M::Input], calibrated: bool) -> Result<Vec<Prediction>> {
        self.built()?;
        let reference = self.scoring_reference(calibrated)?;

        let (out, votes) = self.batch_votes(xs, true)?;
        let mut predictions = Vec::with_capacity(xs.len());
        for (j, vote) in votes.iter().enumerate() {
            let summary = scores::summarize(vote)?;
            let (credibility, confidence) = match reference {
                Some(r) => (
                    r.calibrate_geq(summary.top_share)?,
                    1.0 - r.calibrate_geq(summary.runner_up_share)?,
                ),
                None => (summary.top_share, 1.0 - summary.runner_up_share),
            };

            let row = out.logits.row(j);
            predictions.push(Prediction {
                label: summary.label,
                credibility,
                confidence,
                baseline_label: argmax(row),
                baseline_confidence: max_score(row),
            });
        }
        Ok(predictions)
    }

    /// Credibility of a caller-chosen class per example.
    ///
    /// The calibrated path uses the strictly-less reference lookup, so
    /// higher raw agreement can only raise the calibrated value.
    pub fn credibility_for(
        &self,
        xs: &[M::Input],
        ys: &[usize],
        calibrated: bool,
    ) -> Result<Vec<f64>> {
        self.built()?;
        ensure!(
            xs.len() == ys.len(),
            "{} inputs for {} labels",
            xs.len(),
            ys.len()
        );
        let reference = self.scoring_reference(calibrated)?;

        let (_, votes) = self.batch_votes(xs, false)?;
        votes
            .iter()
            .zip(ys.iter())
            .map(|(vote, &y)| {
                let share = scores::class_share(vote, y)?;
                match reference {
                    Some(r) => r.calibrate_strict_less(share),
                    None => Ok(share),
                }
            })
            .collect()
    }

    /// The model's own softmax mass per example: at the given labels when
    /// provided, at the per-example maximum otherwise.
    pub fn baseline_confidence(&self, xs: &[M::Input], ys: Option<&[usize]>) -> Result<Vec<f32>> {
        self.built()?;
        let out = self.model.predict(xs, true)?;
        ensure!(
            out.logits.nrows() == xs.len(),
            "model returned {} logit rows for {} inputs",
            out.logits.nrows(),
            xs.len()
        );

        match ys {
            Some(ys) => {
                ensure!(
                    ys.len() == xs.len(),
                    "{} inputs for {} labels",
                    xs.len(),
                    ys.len()
                );
                ys.iter()
                    .enumerate()
                    .map(|(j, &y)| {
                        ensure!(
                            y < out.logits.ncols(),
                            "label {} outside the model's {} classes",
                            y,
                            out.logits.ncols()
                        );
                        Ok(out.logits[[j, y]])
                    })
                    .collect()
            }
            None => Ok((0..xs.len()).map(|j| max_score(out.logits.row(j))).collect()),
        }
    }

    /// Distance to the single nearest training neighbor per example, at
    /// one monitored layer (the deepest when `layer` is `None`).
    ///
    /// Under the approximate index this is the nearest *candidate*, and an
    /// empty candidate set is an error.
    pub fn nearest_distance(&self, xs: &[M::Input], layer: Option<usize>) -> Result<Vec<f32>> {
        let state = self.built()?;
        let layer = layer.unwrap_or(state.n_layers - 1);
        ensure!(
            layer < state.n_layers,
            "layer {} outside the {} monitored layers",
            layer,
            state.n_layers
        );

        let out = self.model.predict(xs, true)?;
        self.check_output(&out, xs.len())?;

        let mut distances = Vec::with_capacity(xs.len());
        for j in 0..xs.len() {
            let neighbors =
                state.indices[layer].query(out.layers[layer].row(j), config::K_DIAGNOSTIC)?;
            let nearest = neighbors
                .first()
                .ok_or_else(|| anyhow!("no candidates retrieved for nearest-distance query"))?;
            distances.push(nearest.distance);
        }
        Ok(distances)
    }

    /// Fraction of the perturbed input's neighbors also retrieved for the
    /// original input, in [0,1]. Independent of calibration.
    pub fn neighbor_change(&self, perturbed: &M::Input, original: &M::Input) -> Result<f64> {
        let original_ids = self.single_neighbor_ids(original)?;
        let perturbed_ids = self.single_neighbor_ids(perturbed)?;
        scores::overlap_ratio(&perturbed_ids, &original_ids)
    }

    // ── internals ───────────────────────────────────────────────

    fn built(&self) -> Result<&BuiltState> {
        self.state
            .as_ref()
            .ok_or_else(|| anyhow!("engine not built: call build() before querying"))
    }

    fn scoring_reference(&self, calibrated: bool) -> Result<Option<&CalibrationReference>> {
        if !calibrated {
            return Ok(None);
        }
        match self.reference.as_ref() {
            Some(r) if !r.is_empty() => Ok(Some(r)),
            Some(_) => bail!("calibration reference is empty"),
            None => bail!("no calibration reference: call calibrate() before calibrated scoring"),
        }
    }

    fn usable_len(&self, len: usize, batch_size: usize) -> usize {
        if self.config.drop_remainder {
            (len / batch_size) * batch_size
        } else {
            len
        }
    }

    /// One collaborator call for a batch, then the vote multiset per
    /// example.
    fn batch_votes(
        &self,
        xs: &[M::Input],
        want_softmax: bool,
    ) -> Result<(ModelOutput, Vec<Vec<usize>>)> {
        let state = self.built()?;
        let out = self.model.predict(xs, want_softmax)?;
        self.check_output(&out, xs.len())?;

        let mut votes = Vec::with_capacity(xs.len());
        for j in 0..xs.len() {
            let per_layer: Vec<ArrayView1<f32>> = out.layers.iter().map(|m| m.row(j)).collect();
            let ids = self.neighbor_ids(&per_layer)?;
            votes.push(
                ids.into_iter()
                    .map(|id| {
                        state
                            .labels
                            .get(id)
                            .copied()
                            .ok_or_else(|| anyhow!("neighbor id {} outside label table", id))
                    })
                    .collect::<Result<Vec<usize>>>()?,
            );
        }
        Ok((out, votes))
    }

    fn check_output(&self, out: &ModelOutput, batch: usize) -> Result<()> {
        let state = self.built()?;
        ensure!(
            out.layers.len() == state.n_layers,
            "model returned {} monitored layers, engine expects {}",
            out.layers.len(),
            state.n_layers
        );
        for (i, layer) in out.layers.iter().enumerate() {
            ensure!(
                layer.nrows() == batch,
                "layer {} has {} rows for a batch of {}",
                i,
                layer.nrows(),
                batch
            );
        }
        Ok(())
    }

    fn single_neighbor_ids(&self, x: &M::Input) -> Result<Vec<usize>> {
        let out = self.model.predict(std::slice::from_ref(x), true)?;
        self.check_output(&out, 1)?;
        let per_layer: Vec<ArrayView1<f32>> = out.layers.iter().map(|m| m.row(0)).collect();
        self.neighbor_ids(&per_layer)
    }
}
