//! # Model Extraction and Persistence
//!
//! Turns the working-space coefficients into a model over the original features and
//! stores it as a human-readable TOML artifact.

use crate::config::{Algorithm, RegularizationSpec};
use crate::controller::FitStatus;
use crate::error::FitWarning;
use crate::fit::FitOutcome;
use crate::partition::CsrMatrix;
use crate::stats::FeatureTransform;
use ndarray::{Array1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Custom error type for model loading, saving, and prediction.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Prediction data has {found} feature columns, but the model was trained on {expected}.")]
    MismatchedFeatureCount { found: usize, expected: usize },
    #[error("Model file lists {names} feature names for {coefficients} coefficients.")]
    InconsistentArtifact { names: usize, coefficients: usize },
}

/// Linear model over the original feature scale and order. Immutable once extracted.
#[derive(Debug, Clone, PartialEq)]
pub struct FittedModel {
    coefficients: Array1<f64>,
    intercept: f64,
    iterations: usize,
}

impl FittedModel {
    pub fn new(coefficients: Array1<f64>, intercept: f64, iterations: usize) -> Self {
        Self {
            coefficients,
            intercept,
            iterations,
        }
    }

    pub fn coefficients(&self) -> &Array1<f64> {
        &self.coefficients
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn num_features(&self) -> usize {
        self.coefficients.len()
    }

    /// Coefficients that are not exactly zero.
    pub fn num_nonzero(&self) -> usize {
        self.coefficients.iter().filter(|b| **b != 0.0).count()
    }

    /// `X β + intercept` for row-major dense rows.
    pub fn predict(&self, features: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        if features.ncols() != self.num_features() {
            return Err(ModelError::MismatchedFeatureCount {
                found: features.ncols(),
                expected: self.num_features(),
            });
        }
        Ok(features.dot(&self.coefficients) + self.intercept)
    }

    /// `X β + intercept` for CSR rows, touching only the stored entries.
    pub fn predict_sparse(&self, features: &CsrMatrix) -> Result<Array1<f64>, ModelError> {
        if features.ncols != self.num_features() {
            return Err(ModelError::MismatchedFeatureCount {
                found: features.ncols,
                expected: self.num_features(),
            });
        }
        let predictions = features
            .indptr
            .windows(2)
            .map(|row| {
                (row[0]..row[1]).fold(self.intercept, |acc, idx| {
                    acc + features.values[idx] * self.coefficients[features.indices[idx]]
                })
            })
            .collect();
        Ok(predictions)
    }
}

/// Maps working-space coefficients back to the original features.
///
/// `β_j = β'_j · scale_j`; with an intercept, `b = ȳ − Σ_j shift_j β_j`, otherwise `0`.
pub fn extract_model(
    working: &Array1<f64>,
    transform: &FeatureTransform,
    fit_intercept: bool,
    iterations: usize,
) -> FittedModel {
    let coefficients = working * &transform.scale;
    let intercept = if fit_intercept {
        transform.label_shift - transform.shift.dot(&coefficients)
    } else {
        0.0
    };
    FittedModel::new(coefficients, intercept, iterations)
}

/// The on-disk form of a fitted model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedModel {
    pub label: String,
    pub feature_names: Vec<String>,
    pub intercept: f64,
    pub coefficients: Vec<f64>,
    pub iterations: usize,
    pub status: FitStatus,
    pub algorithm: Algorithm,
    pub regularization: RegularizationSpec,
    #[serde(default)]
    pub warnings: Vec<FitWarning>,
    #[serde(default)]
    pub objective_history: Vec<f64>,
}

impl SavedModel {
    pub fn from_outcome(
        outcome: &FitOutcome,
        regularization: RegularizationSpec,
        label: String,
        feature_names: Vec<String>,
    ) -> Self {
        Self {
            label,
            feature_names,
            intercept: outcome.model.intercept(),
            coefficients: outcome.model.coefficients().to_vec(),
            iterations: outcome.model.iterations(),
            status: outcome.status,
            algorithm: outcome.summary.algorithm,
            regularization,
            warnings: outcome.warnings.clone(),
            objective_history: outcome.summary.objective_history.clone(),
        }
    }

    pub fn model(&self) -> FittedModel {
        FittedModel::new(
            Array1::from(self.coefficients.clone()),
            self.intercept,
            self.iterations,
        )
    }

    /// Saves the model to a file in a human-readable TOML format.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a model from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model: SavedModel = toml::from_str(&toml_string)?;
        if model.feature_names.len() != model.coefficients.len() {
            return Err(ModelError::InconsistentArtifact {
                names: model.feature_names.len(),
                coefficients: model.coefficients.len(),
            });
        }
        Ok(model)
    }
}
