//! # Partition Staging
//!
//! Upstream compute tasks hand over one row partition each: a row-major dense matrix
//! or a CSR sparse matrix, a label vector and optional row weights. Staging validates the
//! partition, reserves its footprint on the rank's device and converts the features into
//! the solver's working layout: column-major dense or CSC sparse, in `f32` or `f64`.
//!
//! The staged [`Partition`] is immutable. Every local pass of the fit only reads it.

use crate::config::StoragePrecision;
use crate::device::{DeviceAllocation, DeviceId, DeviceMemoryPool};
use crate::error::FitError;
use ndarray::{Array1, Array2, ShapeBuilder};
use std::fmt::Debug;
use std::ops::{Add, Mul, Sub};
use std::sync::Arc;

/// Scalar types the feature matrix can be stored in.
pub trait Element: Copy + Send + Sync + Debug + PartialEq + 'static {
    const BYTES: u64;
    fn from_f64(value: f64) -> Self;
    fn to_f32(self) -> f32;
    fn to_f64(self) -> f64;
}

impl Element for f32 {
    const BYTES: u64 = 4;
    #[inline]
    fn from_f64(value: f64) -> Self {
        value as f32
    }
    #[inline]
    fn to_f32(self) -> f32 {
        self
    }
    #[inline]
    fn to_f64(self) -> f64 {
        f64::from(self)
    }
}

impl Element for f64 {
    const BYTES: u64 = 8;
    #[inline]
    fn from_f64(value: f64) -> Self {
        value
    }
    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }
    #[inline]
    fn to_f64(self) -> f64 {
        self
    }
}

/// Scalar types local sums are carried in.
pub trait Accumulator:
    Copy + Send + Sync + Add<Output = Self> + Sub<Output = Self> + Mul<Output = Self> + 'static
{
    const ZERO: Self;
    fn from_f64(value: f64) -> Self;
    fn load<E: Element>(value: E) -> Self;
    fn to_f64(self) -> f64;
}

impl Accumulator for f32 {
    const ZERO: Self = 0.0;
    #[inline]
    fn from_f64(value: f64) -> Self {
        value as f32
    }
    #[inline]
    fn load<E: Element>(value: E) -> Self {
        value.to_f32()
    }
    #[inline]
    fn to_f64(self) -> f64 {
        f64::from(self)
    }
}

impl Accumulator for f64 {
    const ZERO: Self = 0.0;
    #[inline]
    fn from_f64(value: f64) -> Self {
        value
    }
    #[inline]
    fn load<E: Element>(value: E) -> Self {
        value.to_f64()
    }
    #[inline]
    fn to_f64(self) -> f64 {
        self
    }
}

/// Compressed sparse row matrix as produced upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix {
    pub nrows: usize,
    pub ncols: usize,
    pub indptr: Vec<usize>,
    pub indices: Vec<usize>,
    pub values: Vec<f64>,
}

impl CsrMatrix {
    /// Builds a CSR matrix from a dense one, keeping only non-zero entries.
    pub fn from_dense(dense: &Array2<f64>) -> Self {
        let (nrows, ncols) = dense.dim();
        let mut indptr = Vec::with_capacity(nrows + 1);
        let mut indices = Vec::new();
        let mut values = Vec::new();
        indptr.push(0);
        for row in dense.rows() {
            for (col, &value) in row.iter().enumerate() {
                if value != 0.0 {
                    indices.push(col);
                    values.push(value);
                }
            }
            indptr.push(indices.len());
        }
        Self {
            nrows,
            ncols,
            indptr,
            indices,
            values,
        }
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    fn validate(&self) -> Result<(), String> {
        if self.indptr.len() != self.nrows + 1 {
            return Err(format!(
                "indptr has {} entries, expected {}",
                self.indptr.len(),
                self.nrows + 1
            ));
        }
        if self.indices.len() != self.values.len() {
            return Err("indices and values differ in length".to_string());
        }
        if self.indptr.first() != Some(&0) || self.indptr.last() != Some(&self.values.len()) {
            return Err("indptr must start at 0 and end at nnz".to_string());
        }
        for (row, window) in self.indptr.windows(2).enumerate() {
            if window[0] > window[1] {
                return Err(format!("indptr decreases at row {row}"));
            }
            let cols = &self.indices[window[0]..window[1]];
            if cols.iter().any(|&c| c >= self.ncols) {
                return Err(format!("row {row} has a column index out of range"));
            }
            if cols.windows(2).any(|pair| pair[0] >= pair[1]) {
                return Err(format!("row {row} has unsorted or duplicate column indices"));
            }
        }
        Ok(())
    }
}

/// Feature rows of one upstream partition.
#[derive(Debug, Clone)]
pub enum HostMatrix {
    /// Row-major dense rows.
    Dense(Array2<f64>),
    Sparse(CsrMatrix),
}

impl HostMatrix {
    pub fn nrows(&self) -> usize {
        match self {
            HostMatrix::Dense(m) => m.nrows(),
            HostMatrix::Sparse(m) => m.nrows,
        }
    }

    pub fn ncols(&self) -> usize {
        match self {
            HostMatrix::Dense(m) => m.ncols(),
            HostMatrix::Sparse(m) => m.ncols,
        }
    }
}

/// One row partition as delivered by the upstream engine.
#[derive(Debug, Clone)]
pub struct HostPartition {
    pub features: HostMatrix,
    pub labels: Array1<f64>,
    pub weights: Option<Array1<f64>>,
}

impl HostPartition {
    pub fn dense(features: Array2<f64>, labels: Array1<f64>) -> Self {
        Self {
            features: HostMatrix::Dense(features),
            labels,
            weights: None,
        }
    }

    pub fn sparse(features: CsrMatrix, labels: Array1<f64>) -> Self {
        Self {
            features: HostMatrix::Sparse(features),
            labels,
            weights: None,
        }
    }

    pub fn with_weights(mut self, weights: Array1<f64>) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn nrows(&self) -> usize {
        self.features.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.features.ncols()
    }

    /// Checks the upstream data contract: aligned lengths, at least one row, finite
    /// values, non-negative weights.
    pub fn validate(&self, rank: usize) -> Result<(), FitError> {
        let invalid = |reason: String| FitError::InvalidPartition { rank, reason };
        let rows = self.nrows();
        if rows == 0 {
            return Err(invalid("partition has no rows".to_string()));
        }
        if self.labels.len() != rows {
            return Err(invalid(format!(
                "{} labels for {rows} feature rows",
                self.labels.len()
            )));
        }
        if self.labels.iter().any(|v| !v.is_finite()) {
            return Err(invalid("labels contain non-finite values".to_string()));
        }
        if let Some(weights) = &self.weights {
            if weights.len() != rows {
                return Err(invalid(format!(
                    "{} weights for {rows} feature rows",
                    weights.len()
                )));
            }
            if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
                return Err(invalid(
                    "weights must be finite and non-negative".to_string(),
                ));
            }
        }
        match &self.features {
            HostMatrix::Dense(m) => {
                if m.iter().any(|v| !v.is_finite()) {
                    return Err(invalid("features contain non-finite values".to_string()));
                }
            }
            HostMatrix::Sparse(m) => {
                m.validate().map_err(invalid)?;
                if m.values.iter().any(|v| !v.is_finite()) {
                    return Err(invalid("features contain non-finite values".to_string()));
                }
            }
        }
        Ok(())
    }
}

/// Compressed sparse column storage on the device.
#[derive(Debug, Clone)]
pub struct CscMatrix<E: Element> {
    nrows: usize,
    ncols: usize,
    indptr: Vec<usize>,
    indices: Vec<u32>,
    values: Vec<E>,
}

impl<E: Element> CscMatrix<E> {
    fn from_csr(csr: &CsrMatrix) -> Self {
        let mut counts = vec![0usize; csr.ncols + 1];
        for &col in &csr.indices {
            counts[col + 1] += 1;
        }
        for col in 0..csr.ncols {
            counts[col + 1] += counts[col];
        }
        let indptr = counts.clone();
        let mut cursor = counts;
        let mut indices = vec![0u32; csr.nnz()];
        let mut values = vec![E::from_f64(0.0); csr.nnz()];
        // Rows are visited in ascending order, so each column ends up row-sorted.
        for row in 0..csr.nrows {
            for idx in csr.indptr[row]..csr.indptr[row + 1] {
                let col = csr.indices[idx];
                let slot = cursor[col];
                indices[slot] = row as u32;
                values[slot] = E::from_f64(csr.values[idx]);
                cursor[col] += 1;
            }
        }
        Self {
            nrows: csr.nrows,
            ncols: csr.ncols,
            indptr,
            indices,
            values,
        }
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Row indices and values of column `j`, rows ascending.
    #[inline]
    pub fn column(&self, j: usize) -> (&[u32], &[E]) {
        let range = self.indptr[j]..self.indptr[j + 1];
        (&self.indices[range.clone()], &self.values[range])
    }
}

/// Feature storage in one precision.
#[derive(Debug, Clone)]
pub enum ColumnStore<E: Element> {
    /// Column-major `(rows, cols)` array; every column is contiguous.
    Dense(Array2<E>),
    Sparse(CscMatrix<E>),
}

impl<E: Element> ColumnStore<E> {
    fn from_host(host: &HostMatrix) -> Self {
        match host {
            HostMatrix::Dense(m) => {
                let (rows, cols) = m.dim();
                ColumnStore::Dense(Array2::from_shape_fn((rows, cols).f(), |(i, j)| {
                    E::from_f64(m[(i, j)])
                }))
            }
            HostMatrix::Sparse(m) => ColumnStore::Sparse(CscMatrix::from_csr(m)),
        }
    }

    pub fn nrows(&self) -> usize {
        match self {
            ColumnStore::Dense(m) => m.nrows(),
            ColumnStore::Sparse(m) => m.nrows,
        }
    }

    pub fn ncols(&self) -> usize {
        match self {
            ColumnStore::Dense(m) => m.ncols(),
            ColumnStore::Sparse(m) => m.ncols,
        }
    }

    /// Stored `(row, value)` entries of column `j`: every row for dense storage, only
    /// the structural non-zeros for sparse storage.
    pub fn column_entries(&self, j: usize) -> ColumnEntries<'_, E> {
        match self {
            ColumnStore::Dense(m) => ColumnEntries::Dense(m.column(j).into_iter().enumerate()),
            ColumnStore::Sparse(m) => {
                let (rows, values) = m.column(j);
                ColumnEntries::Sparse(rows.iter().zip(values.iter()))
            }
        }
    }
}

pub enum ColumnEntries<'a, E: Element> {
    Dense(std::iter::Enumerate<ndarray::iter::Iter<'a, E, ndarray::Ix1>>),
    Sparse(std::iter::Zip<std::slice::Iter<'a, u32>, std::slice::Iter<'a, E>>),
}

impl<E: Element> Iterator for ColumnEntries<'_, E> {
    type Item = (usize, E);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        match self {
            ColumnEntries::Dense(iter) => iter.next().map(|(row, value)| (row, *value)),
            ColumnEntries::Sparse(iter) => iter.next().map(|(row, value)| (*row as usize, *value)),
        }
    }
}

/// Staged features in the configured precision.
#[derive(Debug, Clone)]
pub enum StagedFeatures {
    Single(ColumnStore<f32>),
    Double(ColumnStore<f64>),
}

impl StagedFeatures {
    pub fn nrows(&self) -> usize {
        match self {
            StagedFeatures::Single(s) => s.nrows(),
            StagedFeatures::Double(s) => s.nrows(),
        }
    }

    pub fn ncols(&self) -> usize {
        match self {
            StagedFeatures::Single(s) => s.ncols(),
            StagedFeatures::Double(s) => s.ncols(),
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(
            self,
            StagedFeatures::Single(ColumnStore::Sparse(_))
                | StagedFeatures::Double(ColumnStore::Sparse(_))
        )
    }
}

/// What the stager needs to know beyond the data itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingPlan {
    pub precision: StoragePrecision,
    /// Reserve room for one `f64` residual per row (coordinate descent).
    pub reserve_residuals: bool,
}

/// Device-resident, read-only partition owned by one rank for the duration of a fit.
#[derive(Debug)]
pub struct Partition {
    rank: usize,
    features: StagedFeatures,
    labels: Array1<f64>,
    weights: Array1<f64>,
    allocation: DeviceAllocation,
}

impl Partition {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn device(&self) -> DeviceId {
        self.allocation.device()
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.allocation.bytes()
    }

    pub fn features(&self) -> &StagedFeatures {
        &self.features
    }

    pub fn labels(&self) -> &Array1<f64> {
        &self.labels
    }

    /// Row weights; all ones when the upstream partition carried none.
    pub fn weights(&self) -> &Array1<f64> {
        &self.weights
    }

    pub fn nrows(&self) -> usize {
        self.features.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.features.ncols()
    }
}

/// Bytes a partition occupies once staged under `plan`.
pub fn staged_footprint(host: &HostPartition, plan: &StagingPlan) -> u64 {
    let rows = host.nrows() as u64;
    let cols = host.ncols() as u64;
    let element = match plan.precision {
        StoragePrecision::Single => f32::BYTES,
        StoragePrecision::Double => f64::BYTES,
    };
    let features = match &host.features {
        HostMatrix::Dense(_) => rows * cols * element,
        HostMatrix::Sparse(m) => {
            m.nnz() as u64 * (element + 4) + (cols + 1) * std::mem::size_of::<usize>() as u64
        }
    };
    // Labels and weights are always staged in f64.
    let vectors = 2 * rows * f64::BYTES;
    let residuals = if plan.reserve_residuals {
        rows * f64::BYTES
    } else {
        0
    };
    features + vectors + residuals
}

/// Validates `host`, reserves its footprint on `pool` and converts it to the working
/// layout. Fails with `AllocationError` when the device cannot hold it.
pub fn stage(
    host: &HostPartition,
    rank: usize,
    pool: &Arc<DeviceMemoryPool>,
    plan: &StagingPlan,
) -> Result<Partition, FitError> {
    host.validate(rank)?;
    if host.nrows() > u32::MAX as usize {
        return Err(FitError::InvalidPartition {
            rank,
            reason: format!("{} rows exceed the per-partition limit", host.nrows()),
        });
    }
    let bytes = staged_footprint(host, plan);
    let allocation = pool.try_reserve(bytes, rank)?;

    let features = match plan.precision {
        StoragePrecision::Single => StagedFeatures::Single(ColumnStore::from_host(&host.features)),
        StoragePrecision::Double => StagedFeatures::Double(ColumnStore::from_host(&host.features)),
    };
    let weights = host
        .weights
        .clone()
        .unwrap_or_else(|| Array1::ones(host.nrows()));

    log::debug!(
        "Rank {rank} staged {} rows x {} features ({}) on {}: {bytes} bytes",
        host.nrows(),
        host.ncols(),
        if features.is_sparse() { "sparse" } else { "dense" },
        pool.id()
    );

    Ok(Partition {
        rank,
        features,
        labels: host.labels.clone(),
        weights,
        allocation,
    })
}
