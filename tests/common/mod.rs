#![allow(unused)]

use ndarray::{Array1, Array2, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use shardfit::{CsrMatrix, HostPartition};

/// Rows drawn from independent standard normal features with `y = X β + b + noise`.
pub struct Synthetic {
    pub features: Array2<f64>,
    pub labels: Array1<f64>,
    pub coefficients: Array1<f64>,
    pub intercept: f64,
}

pub fn synthetic(rows: usize, coefficients: &[f64], intercept: f64, noise: f64, seed: u64) -> Synthetic {
    let mut rng = StdRng::seed_from_u64(seed);
    let standard = Normal::new(0.0, 1.0).unwrap();
    let cols = coefficients.len();
    let features = Array2::from_shape_fn((rows, cols), |_| standard.sample(&mut rng));
    let coefficients = Array1::from(coefficients.to_vec());
    let labels = features.dot(&coefficients)
        + intercept
        + Array1::from_shape_fn(rows, |_| noise * standard.sample(&mut rng));
    Synthetic {
        features,
        labels,
        coefficients,
        intercept,
    }
}

/// Coefficients with magnitude in `[0.5, 2]` and random sign.
pub fn random_coefficients(count: usize, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let magnitude = rng.gen_range(0.5..2.0);
            if rng.gen_range(0.0..1.0) < 0.5 {
                -magnitude
            } else {
                magnitude
            }
        })
        .collect()
}

/// Zeroes out roughly `1 − density` of the entries, keeping the shape.
pub fn sparsify(features: &Array2<f64>, density: f64, seed: u64) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    features.mapv(|v| if rng.gen_range(0.0..1.0) < density { v } else { 0.0 })
}

/// Contiguous dense partitions cut at `boundaries`.
pub fn split_dense(
    features: &Array2<f64>,
    labels: &Array1<f64>,
    weights: Option<&Array1<f64>>,
    boundaries: &[usize],
) -> Vec<HostPartition> {
    cuts(labels.len(), boundaries)
        .into_iter()
        .map(|(start, stop)| {
            let part = HostPartition::dense(
                features.slice(s![start..stop, ..]).to_owned(),
                labels.slice(s![start..stop]).to_owned(),
            );
            match weights {
                Some(w) => part.with_weights(w.slice(s![start..stop]).to_owned()),
                None => part,
            }
        })
        .collect()
}

/// Contiguous CSR partitions cut at `boundaries`.
pub fn split_sparse(features: &Array2<f64>, labels: &Array1<f64>, boundaries: &[usize]) -> Vec<HostPartition> {
    cuts(labels.len(), boundaries)
        .into_iter()
        .map(|(start, stop)| {
            let block = features.slice(s![start..stop, ..]).to_owned();
            HostPartition::sparse(
                CsrMatrix::from_dense(&block),
                labels.slice(s![start..stop]).to_owned(),
            )
        })
        .collect()
}

/// Boundaries for `parts` near-equal contiguous ranges over `rows`.
pub fn even_boundaries(rows: usize, parts: usize) -> Vec<usize> {
    (1..parts).map(|k| k * rows / parts).collect()
}

fn cuts(rows: usize, boundaries: &[usize]) -> Vec<(usize, usize)> {
    let mut edges = vec![0];
    edges.extend_from_slice(boundaries);
    edges.push(rows);
    edges.windows(2).map(|pair| (pair[0], pair[1])).collect()
}

/// Dense Gaussian elimination with partial pivoting, independent of the crate's solver.
pub fn solve_dense(mut a: Array2<f64>, mut b: Array1<f64>) -> Array1<f64> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &k| a[(i, col)].abs().total_cmp(&a[(k, col)].abs()))
            .unwrap();
        if pivot != col {
            for k in 0..n {
                a.swap((col, k), (pivot, k));
            }
            b.swap(col, pivot);
        }
        for row in col + 1..n {
            let factor = a[(row, col)] / a[(col, col)];
            for k in col..n {
                a[(row, k)] -= factor * a[(col, k)];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = Array1::zeros(n);
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[(row, k)] * x[k]).sum();
        x[row] = (b[row] - tail) / a[(row, row)];
    }
    x
}

pub fn max_abs_diff(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .fold(0.0_f64, |acc, (x, y)| acc.max((x - y).abs()))
}
