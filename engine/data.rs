//! # Tabular Input
//!
//! Reads delimited text files (CSV, or TSV for `.tsv`/`.tab` files) into `ndarray`
//! structures and cuts them into row partitions, standing in for the upstream engine that
//! normally hands partitions to the fit.
//!
//! Every column is treated as a feature except the label and the optional weight
//! column. Failures are assumed to be user-input errors and say which column or row is at
//! fault.

use crate::partition::{CsrMatrix, HostPartition};
use ndarray::{Array1, Array2, s};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Failed to read delimited input: {0}")]
    CsvError(#[from] csv::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error("Row {row} of column '{column}' holds '{value}', which is not a number.")]
    NonNumericValue {
        column: String,
        row: usize,
        value: String,
    },
    #[error(
        "Non-finite values (NaN or Infinity) were found in column '{0}'. All data must be finite."
    )]
    NonFiniteValuesFound(String),
    #[error("The input file contains no data rows.")]
    NoRows,
    #[error("The input file has no feature columns besides the label and weights.")]
    NoFeatures,
    #[error("Cannot split {rows} rows into {partitions} non-empty partitions.")]
    InvalidPartitioning { rows: usize, partitions: usize },
}

/// Labelled training rows.
#[derive(Debug, Clone)]
pub struct TrainingTable {
    pub label_name: String,
    pub feature_names: Vec<String>,
    /// Row-major, `[rows, features]`.
    pub features: Array2<f64>,
    pub labels: Array1<f64>,
    pub weights: Option<Array1<f64>>,
}

/// How partitions carry their features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatrixLayout {
    #[default]
    Dense,
    /// CSR, keeping only non-zero entries.
    Sparse,
}

fn delimiter_for(path: &Path) -> u8 {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("tsv") | Some("tab") => b'\t',
        _ => b',',
    }
}

fn read_columns(path: &Path, wanted: &[String]) -> Result<(Vec<Vec<f64>>, usize), DataError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter_for(path))
        .trim(csv::Trim::All)
        .from_path(path)?;
    let headers = reader.headers()?.clone();
    let indices = wanted
        .iter()
        .map(|name| {
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| DataError::ColumnNotFound(name.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut columns = vec![Vec::new(); wanted.len()];
    let mut rows = 0;
    for record in reader.records() {
        let record = record?;
        for ((column, &idx), name) in columns.iter_mut().zip(&indices).zip(wanted) {
            let raw = record.get(idx).unwrap_or("");
            let value: f64 = raw.parse().map_err(|_| DataError::NonNumericValue {
                column: name.clone(),
                row: rows + 1,
                value: raw.to_string(),
            })?;
            if !value.is_finite() {
                return Err(DataError::NonFiniteValuesFound(name.clone()));
            }
            column.push(value);
        }
        rows += 1;
    }
    if rows == 0 {
        return Err(DataError::NoRows);
    }
    Ok((columns, rows))
}

fn header_names(path: &Path) -> Result<Vec<String>, DataError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter_for(path))
        .trim(csv::Trim::All)
        .from_path(path)?;
    Ok(reader.headers()?.iter().map(str::to_string).collect())
}

fn to_matrix(columns: &[Vec<f64>], rows: usize) -> Array2<f64> {
    Array2::from_shape_fn((rows, columns.len()), |(i, j)| columns[j][i])
}

/// Loads training rows. `label` is required; `weight`, when given, must exist.
pub fn load_training_table(
    path: &Path,
    label: &str,
    weight: Option<&str>,
) -> Result<TrainingTable, DataError> {
    let headers = header_names(path)?;
    if !headers.iter().any(|h| h == label) {
        return Err(DataError::ColumnNotFound(label.to_string()));
    }
    if let Some(weight) = weight {
        if !headers.iter().any(|h| h == weight) {
            return Err(DataError::ColumnNotFound(weight.to_string()));
        }
    }
    let feature_names: Vec<String> = headers
        .iter()
        .filter(|h| h.as_str() != label && Some(h.as_str()) != weight)
        .cloned()
        .collect();
    if feature_names.is_empty() {
        return Err(DataError::NoFeatures);
    }

    let mut wanted = feature_names.clone();
    wanted.push(label.to_string());
    if let Some(weight) = weight {
        wanted.push(weight.to_string());
    }
    let (mut columns, rows) = read_columns(path, &wanted)?;
    let weights = weight.and_then(|_| columns.pop()).map(Array1::from);
    let labels = columns.pop().map(Array1::from).ok_or(DataError::NoRows)?;
    let features = to_matrix(&columns, rows);
    log::info!(
        "Loaded {rows} rows with {} features from {}",
        feature_names.len(),
        path.display()
    );

    Ok(TrainingTable {
        label_name: label.to_string(),
        feature_names,
        features,
        labels,
        weights,
    })
}

/// Loads the named feature columns, in the given order, for prediction.
pub fn load_feature_table(path: &Path, feature_names: &[String]) -> Result<Array2<f64>, DataError> {
    let (columns, rows) = read_columns(path, feature_names)?;
    Ok(to_matrix(&columns, rows))
}

/// Cuts the table into `num_partitions` contiguous, near-equal row ranges.
pub fn split_into_partitions(
    table: &TrainingTable,
    num_partitions: usize,
    layout: MatrixLayout,
) -> Result<Vec<HostPartition>, DataError> {
    let rows = table.labels.len();
    if num_partitions == 0 || num_partitions > rows {
        return Err(DataError::InvalidPartitioning {
            rows,
            partitions: num_partitions,
        });
    }
    let base = rows / num_partitions;
    let extra = rows % num_partitions;
    let mut boundaries = Vec::with_capacity(num_partitions - 1);
    let mut end = 0;
    for idx in 0..num_partitions - 1 {
        end += base + usize::from(idx < extra);
        boundaries.push(end);
    }
    split_at_boundaries(table, &boundaries, layout)
}

/// Cuts the table at the given ascending row boundaries; `k` boundaries give `k + 1`
/// partitions, each of which must be non-empty.
pub fn split_at_boundaries(
    table: &TrainingTable,
    boundaries: &[usize],
    layout: MatrixLayout,
) -> Result<Vec<HostPartition>, DataError> {
    let rows = table.labels.len();
    let mut cuts = Vec::with_capacity(boundaries.len() + 2);
    cuts.push(0);
    cuts.extend_from_slice(boundaries);
    cuts.push(rows);
    if cuts.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err(DataError::InvalidPartitioning {
            rows,
            partitions: boundaries.len() + 1,
        });
    }

    Ok(cuts
        .windows(2)
        .map(|pair| {
            let (start, stop) = (pair[0], pair[1]);
            let features = table.features.slice(s![start..stop, ..]).to_owned();
            let labels = table.labels.slice(s![start..stop]).to_owned();
            let partition = match layout {
                MatrixLayout::Dense => HostPartition::dense(features, labels),
                MatrixLayout::Sparse => {
                    HostPartition::sparse(CsrMatrix::from_dense(&features), labels)
                }
            };
            match &table.weights {
                Some(weights) => partition.with_weights(weights.slice(s![start..stop]).to_owned()),
                None => partition,
            }
        })
        .collect())
}
