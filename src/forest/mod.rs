//! Isolation-Forest anomaly model: training, scoring, persistence.
//!
//! Training z-score-normalizes the dataset, then builds `num_trees` trees on
//! random subsamples (with replacement). Tree construction is parallelized
//! with rayon; each tree derives its RNG from the master seed and its own
//! index, so a fixed seed yields bit-identical models regardless of thread
//! scheduling.
//!
//! Scoring is read-only over the frozen tree set. `SharedModel` wraps the
//! trained forest in an `ArcSwapOption` so pipeline workers score lock-free
//! while a retrain swaps the model atomically.
//!
//! Labels in the training set are used only for the post-hoc quality report,
//! never for tree construction.

mod tree;

pub use tree::{average_path_length, build_tree, path_length, TreeNode};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::ModelConfig;
use crate::types::{AnomalyScore, FeatureVector};

/// Version tag of the serialized model schema.
pub const MODEL_SCHEMA_VERSION: u32 = 1;

/// Floor applied to per-feature σ so constant features normalize to 0
/// instead of dividing by zero.
const SIGMA_FLOOR: f64 = 1e-8;

/// Splitmix-style stream constant for deriving per-tree seeds.
const SEED_STREAM: u64 = 0x9E37_79B9_7F4A_7C15;

/// Errors raised by the anomaly model.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model has not been trained yet")]
    ModelNotReady,

    #[error("Training dataset is empty")]
    NoTrainingData,

    #[error("Unsupported model schema version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("Model blob is inconsistent: {0}")]
    SchemaMismatch(String),

    #[error("Model serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Ground-truth label attached to a training row (post-hoc metrics only).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Normal,
    Anomaly,
}

/// One labeled training row, values aligned to the set's feature order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSample {
    pub values: Vec<f64>,
    pub label: Label,
}

/// A labeled training dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSet {
    pub features: Vec<String>,
    pub samples: Vec<TrainingSample>,
}

impl TrainingSet {
    /// Build a training set from engineered feature vectors using the
    /// canonical model feature schema.
    pub fn from_feature_vectors(rows: &[(FeatureVector, Label)]) -> Self {
        let features = crate::types::MODEL_FEATURE_NAMES
            .iter()
            .map(|s| (*s).to_string())
            .collect();
        let samples = rows
            .iter()
            .map(|(fv, label)| TrainingSample {
                values: fv.model_features().iter().map(|(_, v)| *v).collect(),
                label: *label,
            })
            .collect();
        Self { features, samples }
    }
}

/// Post-training quality report. Labels never influence the trees; they are
/// only compared against the model's own calls here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReport {
    pub samples: usize,
    pub features: usize,
    /// Fraction of training rows labeled anomalous.
    pub anomaly_fraction: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// Mean anomaly score over the training set.
    pub score_mean: f64,
    /// Sample standard deviation of training scores.
    pub score_std: f64,
    /// Seed the forest was actually trained with (recorded so a run without
    /// an explicit seed can still be reproduced).
    pub seed: u64,
}

/// A trained Isolation Forest.
#[derive(Debug, Clone)]
pub struct IsolationForest {
    features: Vec<String>,
    mu: Vec<f64>,
    sigma: Vec<f64>,
    num_trees: usize,
    subsample: usize,
    trees: Vec<TreeNode>,
}

impl IsolationForest {
    /// Train a forest on a labeled dataset.
    ///
    /// With `cfg.seed = Some(s)` training is fully deterministic; otherwise a
    /// random seed is drawn and recorded in the report.
    pub fn train(
        dataset: &TrainingSet,
        cfg: &ModelConfig,
    ) -> Result<(Self, TrainingReport), ModelError> {
        if dataset.samples.is_empty() {
            return Err(ModelError::NoTrainingData);
        }
        let n_features = dataset.features.len();
        if n_features == 0 {
            return Err(ModelError::SchemaMismatch("no features".to_string()));
        }
        for (i, sample) in dataset.samples.iter().enumerate() {
            if sample.values.len() != n_features {
                return Err(ModelError::SchemaMismatch(format!(
                    "row {i} has {} values, expected {n_features}",
                    sample.values.len()
                )));
            }
        }

        let n = dataset.samples.len();
        let seed = cfg.seed.unwrap_or_else(rand::random);

        // Per-feature normalization parameters (population σ with floor).
        let mut mu = vec![0.0_f64; n_features];
        for sample in &dataset.samples {
            for (m, v) in mu.iter_mut().zip(&sample.values) {
                *m += v;
            }
        }
        for m in &mut mu {
            *m /= n as f64;
        }
        let mut sigma = vec![0.0_f64; n_features];
        for sample in &dataset.samples {
            for ((s, v), m) in sigma.iter_mut().zip(&sample.values).zip(&mu) {
                *s += (v - m).powi(2);
            }
        }
        for s in &mut sigma {
            *s = (*s / n as f64).sqrt().max(SIGMA_FLOOR);
        }

        let matrix: Vec<Vec<f64>> = dataset
            .samples
            .iter()
            .map(|sample| {
                sample
                    .values
                    .iter()
                    .zip(mu.iter().zip(&sigma))
                    .map(|(v, (m, s))| (v - m) / s)
                    .collect()
            })
            .collect();

        // Each tree owns a seed derived from (master seed, tree index), so the
        // rayon schedule cannot perturb the result.
        let trees: Vec<TreeNode> = (0..cfg.num_trees)
            .into_par_iter()
            .map(|i| {
                let mut rng =
                    StdRng::seed_from_u64(seed.wrapping_add((i as u64).wrapping_mul(SEED_STREAM)));
                let rows: Vec<usize> =
                    (0..cfg.subsample).map(|_| rng.gen_range(0..n)).collect();
                build_tree(&matrix, &rows, &mut rng)
            })
            .collect();

        let forest = Self {
            features: dataset.features.clone(),
            mu,
            sigma,
            num_trees: cfg.num_trees,
            subsample: cfg.subsample,
            trees,
        };

        let report = forest.quality_report(dataset, &matrix, seed);
        info!(
            samples = report.samples,
            trees = forest.num_trees,
            subsample = forest.subsample,
            precision = report.precision,
            recall = report.recall,
            seed,
            "Isolation forest trained"
        );

        Ok((forest, report))
    }

    fn quality_report(
        &self,
        dataset: &TrainingSet,
        normalized: &[Vec<f64>],
        seed: u64,
    ) -> TrainingReport {
        let scores: Vec<f64> = normalized.iter().map(|row| self.score_row(row)).collect();

        let mut tp = 0_u32;
        let mut fp = 0_u32;
        let mut fn_ = 0_u32;
        let mut anomalies = 0_usize;
        for (score, sample) in scores.iter().zip(&dataset.samples) {
            let predicted = *score > 0.5;
            let actual = sample.label == Label::Anomaly;
            if actual {
                anomalies += 1;
            }
            match (predicted, actual) {
                (true, true) => tp += 1,
                (true, false) => fp += 1,
                (false, true) => fn_ += 1,
                (false, false) => {}
            }
        }
        let precision = if tp + fp > 0 {
            f64::from(tp) / f64::from(tp + fp)
        } else {
            0.0
        };
        let recall = if tp + fn_ > 0 {
            f64::from(tp) / f64::from(tp + fn_)
        } else {
            0.0
        };
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };

        TrainingReport {
            samples: dataset.samples.len(),
            features: self.features.len(),
            anomaly_fraction: anomalies as f64 / dataset.samples.len() as f64,
            precision,
            recall,
            f1,
            score_mean: Statistics::mean(&scores),
            score_std: Statistics::std_dev(&scores),
            seed,
        }
    }

    /// Anomaly score of an already-normalized row.
    fn score_row(&self, normalized: &[f64]) -> f64 {
        let total: f64 = self
            .trees
            .iter()
            .map(|tree| path_length(tree, normalized))
            .sum();
        let mean_path = total / self.trees.len() as f64;
        let c = average_path_length(self.subsample);
        if c <= 0.0 {
            return 0.0;
        }
        2.0_f64.powf(-mean_path / c)
    }

    /// Score a query given as (name, value) pairs.
    ///
    /// Schema features missing from the query are imputed as normalized 0;
    /// the number of such imputations is returned alongside the score.
    pub fn score_named(&self, named: &[(&str, f64)]) -> (AnomalyScore, usize) {
        let mut row = vec![0.0_f64; self.features.len()];
        let mut missing = 0_usize;
        for (i, feature) in self.features.iter().enumerate() {
            match named.iter().find(|(name, _)| *name == feature.as_str()) {
                Some((_, value)) => row[i] = (value - self.mu[i]) / self.sigma[i],
                None => {
                    missing += 1;
                    debug!(feature = %feature, "Query missing schema feature, imputing 0");
                }
            }
        }
        (AnomalyScore::from_score(self.score_row(&row)), missing)
    }

    /// Score an engineered feature vector.
    pub fn score(&self, features: &FeatureVector) -> (AnomalyScore, usize) {
        self.score_named(&features.model_features())
    }

    pub fn features(&self) -> &[String] {
        &self.features
    }

    pub fn num_trees(&self) -> usize {
        self.num_trees
    }

    pub fn subsample(&self) -> usize {
        self.subsample
    }

    // === Persistence ===

    /// Serialize to the schema-versioned JSON blob.
    pub fn to_json(&self) -> Result<String, ModelError> {
        let blob = ModelBlob {
            version: MODEL_SCHEMA_VERSION,
            features: self.features.clone(),
            mu: self
                .features
                .iter()
                .cloned()
                .zip(self.mu.iter().copied())
                .collect(),
            sigma: self
                .features
                .iter()
                .cloned()
                .zip(self.sigma.iter().copied())
                .collect(),
            num_trees: self.num_trees,
            subsample_size: self.subsample,
            trees: self.trees.clone(),
        };
        Ok(serde_json::to_string(&blob)?)
    }

    /// Restore a forest from a JSON blob; prediction is deterministic given
    /// the blob.
    pub fn from_json(json: &str) -> Result<Self, ModelError> {
        let blob: ModelBlob = serde_json::from_str(json)?;
        if blob.version != MODEL_SCHEMA_VERSION {
            return Err(ModelError::UnsupportedVersion {
                found: blob.version,
                expected: MODEL_SCHEMA_VERSION,
            });
        }
        let mut mu = Vec::with_capacity(blob.features.len());
        let mut sigma = Vec::with_capacity(blob.features.len());
        for feature in &blob.features {
            let m = blob
                .mu
                .get(feature)
                .ok_or_else(|| ModelError::SchemaMismatch(format!("mu missing {feature}")))?;
            let s = blob
                .sigma
                .get(feature)
                .ok_or_else(|| ModelError::SchemaMismatch(format!("sigma missing {feature}")))?;
            mu.push(*m);
            sigma.push(*s);
        }
        if blob.trees.len() != blob.num_trees {
            return Err(ModelError::SchemaMismatch(format!(
                "blob declares {} trees but carries {}",
                blob.num_trees,
                blob.trees.len()
            )));
        }
        Ok(Self {
            features: blob.features,
            mu,
            sigma,
            num_trees: blob.num_trees,
            subsample: blob.subsample_size,
            trees: blob.trees,
        })
    }
}

/// External model schema (wire-stable field names).
#[derive(Debug, Serialize, Deserialize)]
struct ModelBlob {
    version: u32,
    features: Vec<String>,
    mu: BTreeMap<String, f64>,
    sigma: BTreeMap<String, f64>,
    #[serde(rename = "numTrees")]
    num_trees: usize,
    #[serde(rename = "subsampleSize")]
    subsample_size: usize,
    trees: Vec<TreeNode>,
}

/// Shared handle for lock-free scoring with atomic train-time swaps.
#[derive(Default)]
pub struct SharedModel {
    inner: ArcSwapOption<IsolationForest>,
    unknown_feature_hits: AtomicU64,
}

impl SharedModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically replace the active model.
    pub fn install(&self, forest: IsolationForest) {
        self.inner.store(Some(Arc::new(forest)));
    }

    pub fn is_ready(&self) -> bool {
        self.inner.load().is_some()
    }

    /// Snapshot of the active model, if any.
    pub fn current(&self) -> Option<Arc<IsolationForest>> {
        self.inner.load_full()
    }

    /// Score a feature vector against the active model.
    pub fn predict(&self, features: &FeatureVector) -> Result<AnomalyScore, ModelError> {
        let model = self.inner.load_full().ok_or(ModelError::ModelNotReady)?;
        let (score, missing) = model.score(features);
        if missing > 0 {
            self.unknown_feature_hits
                .fetch_add(missing as u64, Ordering::Relaxed);
        }
        Ok(score)
    }

    /// Total schema features imputed as 0 across all predictions.
    pub fn unknown_feature_hits(&self) -> u64 {
        self.unknown_feature_hits.load(Ordering::Relaxed)
    }
}
