//! # Local Normal-Equation and Gradient Builder
//!
//! Everything a rank computes from its own partition. The direct path needs the weighted
//! Gram matrix and cross-product of the transformed features; coordinate descent needs,
//! per coordinate, the partial gradient and curvature against the rank's residuals.
//!
//! Zero-weight rows drop out through the multiplication by their weight; no kernel
//! branches on individual rows.

use crate::config::AccumulationPrecision;
use crate::partition::{Accumulator, ColumnStore, Element, Partition, StagedFeatures};
use crate::stats::FeatureTransform;
use itertools::izip;
use ndarray::{Array1, Array2, ArrayView1};
use rayon::prelude::*;

/// Weighted, centered and scaled normal equations of one partition, or their sum over
/// all partitions after aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalEquations {
    /// `Σ w z zᵀ`, symmetric.
    pub gram: Array2<f64>,
    /// `Σ w z (y − ȳ)`.
    pub cross: Array1<f64>,
    /// `Σ w (y − ȳ)²`.
    pub label_ss: f64,
    pub total_weight: f64,
    pub num_rows: f64,
}

impl NormalEquations {
    /// Flat length for `p` features: packed upper triangle, cross-products, three scalars.
    pub fn buffer_len(p: usize) -> usize {
        p * (p + 1) / 2 + p + 3
    }

    /// Packs into the buffer that is summed by the collective.
    pub fn to_buffer(&self) -> Vec<f64> {
        let p = self.cross.len();
        let mut out = Vec::with_capacity(Self::buffer_len(p));
        for j in 0..p {
            for k in j..p {
                out.push(self.gram[(j, k)]);
            }
        }
        out.extend(self.cross.iter().copied());
        out.push(self.label_ss);
        out.push(self.total_weight);
        out.push(self.num_rows);
        out
    }

    /// Inverse of [`to_buffer`](Self::to_buffer). Returns `None` when the length does
    /// not match `p`.
    pub fn from_buffer(p: usize, buffer: &[f64]) -> Option<Self> {
        if buffer.len() != Self::buffer_len(p) {
            return None;
        }
        let mut gram = Array2::zeros((p, p));
        let mut values = buffer.iter().copied();
        for j in 0..p {
            for k in j..p {
                let v = values.next()?;
                gram[(j, k)] = v;
                gram[(k, j)] = v;
            }
        }
        let cross: Array1<f64> = values.by_ref().take(p).collect();
        let label_ss = values.next()?;
        let total_weight = values.next()?;
        let num_rows = values.next()?;
        Some(Self {
            gram,
            cross,
            label_ss,
            total_weight,
            num_rows,
        })
    }

    /// Weighted sum of squared residuals `Σ w (y − ȳ − zᵀβ)²` expressed through the
    /// aggregated moments.
    pub fn residual_sum_of_squares(&self, beta: ArrayView1<f64>) -> f64 {
        let fitted = self.gram.dot(&beta);
        (self.label_ss - 2.0 * self.cross.dot(&beta) + beta.dot(&fitted)).max(0.0)
    }
}

/// Builds this partition's normal equations in the working space of `transform`.
///
/// Dense columns are centered explicitly before multiplying. Sparse columns accumulate
/// raw moments over their stored entries and are centered algebraically afterwards, so
/// the implicit zeros are never materialized. Gram rows are distributed over rayon; each
/// entry is a sequential sum, which keeps the result independent of thread scheduling.
pub fn local_normal_equations(
    partition: &Partition,
    transform: &FeatureTransform,
    accumulation: AccumulationPrecision,
) -> NormalEquations {
    match (partition.features(), accumulation) {
        (StagedFeatures::Single(store), AccumulationPrecision::Working) => {
            build::<f32, f32>(store, partition, transform)
        }
        (StagedFeatures::Single(store), AccumulationPrecision::Double) => {
            build::<f32, f64>(store, partition, transform)
        }
        (StagedFeatures::Double(store), _) => build::<f64, f64>(store, partition, transform),
    }
}

fn build<E: Element, A: Accumulator>(
    store: &ColumnStore<E>,
    partition: &Partition,
    transform: &FeatureTransform,
) -> NormalEquations {
    let weights = partition.weights();
    let centered_labels: Array1<f64> = partition.labels().mapv(|y| y - transform.label_shift);
    let p = store.ncols();

    let (gram_rows, cross): (Vec<Vec<f64>>, Vec<f64>) = match store {
        ColumnStore::Dense(matrix) => (0..p)
            .into_par_iter()
            .map(|j| {
                let xj = matrix.column(j);
                let sj = transform.shift[j];
                let row = (j..p)
                    .map(|k| {
                        let xk = matrix.column(k);
                        let sk = transform.shift[k];
                        let sum = izip!(xj.iter(), xk.iter(), weights.iter()).fold(
                            A::ZERO,
                            |acc, (&a, &b, &w)| {
                                acc + A::from_f64(w)
                                    * (A::load(a) - A::from_f64(sj))
                                    * (A::load(b) - A::from_f64(sk))
                            },
                        );
                        sum.to_f64() * transform.scale[j] * transform.scale[k]
                    })
                    .collect();
                let cross = izip!(xj.iter(), centered_labels.iter(), weights.iter()).fold(
                    A::ZERO,
                    |acc, (&a, &r, &w)| acc + A::from_f64(w) * (A::load(a) - A::from_f64(sj)) * A::from_f64(r),
                );
                (row, cross.to_f64() * transform.scale[j])
            })
            .unzip(),
        ColumnStore::Sparse(_) => {
            let local_weight = weights.sum();
            let weighted_label_sum = weights.dot(&centered_labels);
            let column_sums: Vec<f64> = (0..p)
                .map(|j| {
                    store
                        .column_entries(j)
                        .fold(A::ZERO, |acc, (row, x)| acc + A::from_f64(weights[row]) * A::load(x))
                        .to_f64()
                })
                .collect();
            (0..p)
                .into_par_iter()
                .map(|j| {
                    // Scatter column j once, then walk the stored entries of every k ≥ j.
                    let mut dense_j = vec![A::ZERO; store.nrows()];
                    for (row, x) in store.column_entries(j) {
                        dense_j[row] = A::load(x);
                    }
                    let (sj, cj) = (transform.shift[j], column_sums[j]);
                    let row = (j..p)
                        .map(|k| {
                            let raw = store
                                .column_entries(k)
                                .fold(A::ZERO, |acc, (r, x)| {
                                    acc + A::from_f64(weights[r]) * dense_j[r] * A::load(x)
                                })
                                .to_f64();
                            let sk = transform.shift[k];
                            let centered =
                                raw - sk * cj - sj * column_sums[k] + sj * sk * local_weight;
                            centered * transform.scale[j] * transform.scale[k]
                        })
                        .collect();
                    let raw_cross = store
                        .column_entries(j)
                        .fold(A::ZERO, |acc, (r, x)| {
                            acc + A::from_f64(weights[r] * centered_labels[r]) * A::load(x)
                        })
                        .to_f64();
                    let cross = (raw_cross - sj * weighted_label_sum) * transform.scale[j];
                    (row, cross)
                })
                .unzip()
        }
    };

    let mut gram = Array2::zeros((p, p));
    for (j, row) in gram_rows.into_iter().enumerate() {
        for (offset, value) in row.into_iter().enumerate() {
            let k = j + offset;
            gram[(j, k)] = value;
            gram[(k, j)] = value;
        }
    }
    let label_ss = izip!(centered_labels.iter(), weights.iter())
        .fold(0.0, |acc, (&r, &w)| acc + w * r * r);

    NormalEquations {
        gram,
        cross: Array1::from(cross),
        label_ss,
        total_weight: weights.sum(),
        num_rows: partition.nrows() as f64,
    }
}

/// Per-rank residual state for distributed coordinate descent.
///
/// With `z_j = (x_j − μ_j) s_j`, the true residual is `r_i + c`: the vector `r` only
/// absorbs updates along the stored entries `x_ij`, while the shared offset
/// `c = Σ_j μ_j s_j β_j` carries the centering. Sparse columns therefore update in
/// `O(nnz_j)` instead of `O(rows)`.
#[derive(Debug, Clone)]
pub struct CoordinateState {
    residuals: Array1<f64>,
    offset: f64,
    weighted_residual_sum: f64,
    local_weight: f64,
    /// `Σ w x_j` over this partition.
    column_sums: Array1<f64>,
    /// `s_j² Σ w (x_j − μ_j)²` over this partition; constant for the whole fit.
    curvature: Array1<f64>,
    shift: Array1<f64>,
    scale: Array1<f64>,
}

impl CoordinateState {
    /// State for all coefficients at zero: `r = y − ȳ`, `c = 0`.
    pub fn new(partition: &Partition, transform: &FeatureTransform) -> Self {
        let weights = partition.weights();
        let residuals = partition.labels().mapv(|y| y - transform.label_shift);
        let local_weight = weights.sum();
        let (column_sums, curvature) = match partition.features() {
            StagedFeatures::Single(store) => column_moments(store, weights, local_weight, transform),
            StagedFeatures::Double(store) => column_moments(store, weights, local_weight, transform),
        };
        Self {
            weighted_residual_sum: weights.dot(&residuals),
            residuals,
            offset: 0.0,
            local_weight,
            column_sums,
            curvature,
            shift: transform.shift.clone(),
            scale: transform.scale.clone(),
        }
    }

    /// This partition's `[Σ w z_j r, Σ w z_j²]` for coordinate `j`, with `r` the residual
    /// of the current coefficients.
    pub fn coordinate_terms(&self, partition: &Partition, j: usize) -> [f64; 2] {
        let scale = self.scale[j];
        if scale == 0.0 {
            return [0.0, 0.0];
        }
        let weights = partition.weights();
        let raw = match partition.features() {
            StagedFeatures::Single(store) => weighted_dot(store, j, weights, &self.residuals),
            StagedFeatures::Double(store) => weighted_dot(store, j, weights, &self.residuals),
        };
        let mu = self.shift[j];
        let gradient = scale
            * (raw + self.offset * self.column_sums[j]
                - mu * (self.weighted_residual_sum + self.offset * self.local_weight));
        [gradient, self.curvature[j]]
    }

    /// Applies `β_j ← β_j + delta` to the residuals.
    pub fn apply_coordinate(&mut self, partition: &Partition, j: usize, delta: f64) {
        let step = self.scale[j] * delta;
        if step == 0.0 {
            return;
        }
        match partition.features() {
            StagedFeatures::Single(store) => axpy_column(store, j, -step, &mut self.residuals),
            StagedFeatures::Double(store) => axpy_column(store, j, -step, &mut self.residuals),
        }
        self.weighted_residual_sum -= step * self.column_sums[j];
        self.offset += step * self.shift[j];
    }

    /// `Σ w (r + c)²` over this partition.
    pub fn weighted_loss(&self, partition: &Partition) -> f64 {
        let c = self.offset;
        izip!(self.residuals.iter(), partition.weights().iter())
            .fold(0.0, |acc, (&r, &w)| acc + w * (r + c) * (r + c))
    }
}

fn column_moments<E: Element>(
    store: &ColumnStore<E>,
    weights: &Array1<f64>,
    local_weight: f64,
    transform: &FeatureTransform,
) -> (Array1<f64>, Array1<f64>) {
    let p = store.ncols();
    let mut sums = Array1::zeros(p);
    let mut curvature = Array1::zeros(p);
    for j in 0..p {
        let mu = transform.shift[j];
        let (sum, centered, seen) =
            store
                .column_entries(j)
                .fold((0.0, 0.0, 0.0), |(s, c, seen), (row, x)| {
                    let w = weights[row];
                    let x = x.to_f64();
                    (s + w * x, c + w * (x - mu) * (x - mu), seen + w)
                });
        let implicit = (local_weight - seen).max(0.0) * mu * mu;
        sums[j] = sum;
        curvature[j] = transform.scale[j] * transform.scale[j] * (centered + implicit);
    }
    (sums, curvature)
}

fn weighted_dot<E: Element>(
    store: &ColumnStore<E>,
    j: usize,
    weights: &Array1<f64>,
    residuals: &Array1<f64>,
) -> f64 {
    store
        .column_entries(j)
        .fold(0.0, |acc, (row, x)| acc + weights[row] * x.to_f64() * residuals[row])
}

fn axpy_column<E: Element>(store: &ColumnStore<E>, j: usize, alpha: f64, target: &mut Array1<f64>) {
    for (row, x) in store.column_entries(j) {
        target[row] += alpha * x.to_f64();
    }
}
