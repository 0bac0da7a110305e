//! # Global Statistics
//!
//! Weighted feature and label moments over all partitions, gathered in two aggregation
//! passes: raw sums first, then second moments centered on the global means. Centering on
//! the exact means before squaring keeps the variance free of the cancellation a one-pass
//! `E[x²] − E[x]²` suffers on large-offset features.
//!
//! The [`FeatureTransform`] derived from the statistics defines the space the solver works
//! in: `z_j = (x_j − shift_j) · scale_j`.

use crate::config::RegularizationSpec;
use crate::partition::{ColumnStore, Element, Partition, StagedFeatures};
use ndarray::Array1;

/// Features whose population standard deviation falls below this are treated as constant.
pub const CONSTANT_FEATURE_STD: f64 = 1.0e-12;

/// Statistics over every row of every partition, identical on each rank.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalStatistics {
    pub total_weight: f64,
    pub num_rows: usize,
    pub feature_means: Array1<f64>,
    /// Weighted population standard deviation, `sqrt(Σ w (x − μ)² / W)`.
    pub feature_stds: Array1<f64>,
    pub label_mean: f64,
    pub label_std: f64,
}

/// Length of the first-pass buffer: `[W, n, Σ w y, Σ w x_0 … Σ w x_{p−1}]`.
pub fn first_pass_len(num_features: usize) -> usize {
    num_features + 3
}

/// Local contribution to the first pass.
pub fn local_sums(partition: &Partition) -> Vec<f64> {
    let weights = partition.weights();
    let labels = partition.labels();
    let mut out = Vec::with_capacity(first_pass_len(partition.ncols()));
    out.push(weights.sum());
    out.push(partition.nrows() as f64);
    out.push(weights.dot(labels));
    match partition.features() {
        StagedFeatures::Single(store) => extend_column_sums(store, weights, &mut out),
        StagedFeatures::Double(store) => extend_column_sums(store, weights, &mut out),
    }
    out
}

fn extend_column_sums<E: Element>(store: &ColumnStore<E>, weights: &Array1<f64>, out: &mut Vec<f64>) {
    for j in 0..store.ncols() {
        let sum = store
            .column_entries(j)
            .fold(0.0, |acc, (row, x)| acc + weights[row] * x.to_f64());
        out.push(sum);
    }
}

/// Means after the first pass has been all-reduced.
#[derive(Debug, Clone, PartialEq)]
pub struct FirstPass {
    pub total_weight: f64,
    pub num_rows: usize,
    pub label_mean: f64,
    pub feature_means: Array1<f64>,
}

impl FirstPass {
    /// Interprets a reduced first-pass buffer. Returns `None` when the total weight is not
    /// positive, since no mean is defined then.
    pub fn from_reduced(buffer: &[f64]) -> Option<Self> {
        let (&total_weight, rest) = buffer.split_first()?;
        let (&num_rows, rest) = rest.split_first()?;
        let (&weighted_label, feature_sums) = rest.split_first()?;
        if !(total_weight > 0.0) {
            return None;
        }
        Some(Self {
            total_weight,
            num_rows: num_rows.round() as usize,
            label_mean: weighted_label / total_weight,
            feature_means: feature_sums.iter().map(|s| s / total_weight).collect(),
        })
    }
}

/// Local contribution to the second pass: `[Σ w (y − ȳ)², Σ w (x_j − μ_j)² …]`.
///
/// Sparse columns only visit their stored entries; the implicit zeros contribute
/// `μ_j² · (W_local − Σ_stored w)`, which is exact.
pub fn local_centered_sums(partition: &Partition, first: &FirstPass) -> Vec<f64> {
    let weights = partition.weights();
    let labels = partition.labels();
    let local_weight = weights.sum();
    let mut out = Vec::with_capacity(partition.ncols() + 1);
    let label_ss = weights
        .iter()
        .zip(labels.iter())
        .fold(0.0, |acc, (w, y)| {
            let d = y - first.label_mean;
            acc + w * d * d
        });
    out.push(label_ss);
    match partition.features() {
        StagedFeatures::Single(store) => {
            extend_centered_sums(store, weights, local_weight, &first.feature_means, &mut out)
        }
        StagedFeatures::Double(store) => {
            extend_centered_sums(store, weights, local_weight, &first.feature_means, &mut out)
        }
    }
    out
}

fn extend_centered_sums<E: Element>(
    store: &ColumnStore<E>,
    weights: &Array1<f64>,
    local_weight: f64,
    means: &Array1<f64>,
    out: &mut Vec<f64>,
) {
    for j in 0..store.ncols() {
        let mu = means[j];
        let (stored, visited_weight) =
            store
                .column_entries(j)
                .fold((0.0, 0.0), |(acc, seen), (row, x)| {
                    let w = weights[row];
                    let d = x.to_f64() - mu;
                    (acc + w * d * d, seen + w)
                });
        let implicit = (local_weight - visited_weight).max(0.0) * mu * mu;
        out.push(stored + implicit);
    }
}

impl GlobalStatistics {
    pub fn from_passes(first: FirstPass, centered: &[f64]) -> Self {
        let w = first.total_weight;
        let label_std = centered.first().map_or(0.0, |ss| (ss.max(0.0) / w).sqrt());
        let feature_stds = centered
            .iter()
            .skip(1)
            .map(|ss| (ss.max(0.0) / w).sqrt())
            .collect();
        Self {
            total_weight: w,
            num_rows: first.num_rows,
            feature_means: first.feature_means,
            feature_stds,
            label_mean: first.label_mean,
            label_std,
        }
    }
}

/// Affine map from original features to the solver's working space.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTransform {
    /// Subtracted before scaling: the means when fitting an intercept, else zero.
    pub shift: Array1<f64>,
    /// `1/σ` when standardizing, else one; zero for constant features.
    pub scale: Array1<f64>,
    /// Subtracted from the label: its mean when fitting an intercept, else zero.
    pub label_shift: f64,
    /// Indices of the features the solver updates, ascending.
    pub active: Vec<usize>,
}

impl FeatureTransform {
    /// Identity transform used when no statistics were gathered.
    pub fn identity(num_features: usize) -> Self {
        Self {
            shift: Array1::zeros(num_features),
            scale: Array1::ones(num_features),
            label_shift: 0.0,
            active: (0..num_features).collect(),
        }
    }

    pub fn from_statistics(stats: &GlobalStatistics, spec: &RegularizationSpec) -> Self {
        let p = stats.feature_means.len();
        let mut shift = Array1::zeros(p);
        let mut scale = Array1::ones(p);
        let mut active = Vec::with_capacity(p);
        for j in 0..p {
            let sd = stats.feature_stds[j];
            if sd <= CONSTANT_FEATURE_STD {
                scale[j] = 0.0;
                continue;
            }
            if spec.standardization {
                scale[j] = 1.0 / sd;
            }
            if spec.fit_intercept {
                shift[j] = stats.feature_means[j];
            }
            active.push(j);
        }
        let dropped = p - active.len();
        if dropped > 0 {
            log::info!("{dropped} constant feature(s) are held at a zero coefficient");
        }
        Self {
            shift,
            scale,
            label_shift: if spec.fit_intercept { stats.label_mean } else { 0.0 },
            active,
        }
    }

    pub fn num_features(&self) -> usize {
        self.scale.len()
    }
}
