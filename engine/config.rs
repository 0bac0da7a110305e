//! # Training Configuration
//!
//! The immutable inputs of a fit: the regularization spec (`reg_param`,
//! `elastic_net_param` and friends) and the execution options (devices, numeric
//! precision, time limit). Both deserialize from TOML so a run can be reproduced from a
//! single file.

use crate::error::FitError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Condition-number estimate above which the direct path abandons Cholesky.
pub const DEFAULT_CONDITION_LIMIT: f64 = 1.0e12;

/// Elastic-net regularization and stopping parameters.
///
/// The objective is `1/(2W) Σ wᵢ rᵢ² + λ (α‖β‖₁ + (1−α)/2 ‖β‖²)` where `λ = reg_param`
/// and `α = elastic_net_param`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegularizationSpec {
    /// Mixing parameter α: 0 is pure L2 (ridge), 1 is pure L1 (Lasso).
    pub elastic_net_param: f64,
    /// Overall regularization strength λ.
    pub reg_param: f64,
    /// Solve in the space of unit-variance features.
    pub standardization: bool,
    /// Fit an unpenalized intercept by centering features and label.
    pub fit_intercept: bool,
    /// Relative coefficient change at which coordinate descent stops.
    pub tolerance: f64,
    /// Maximum number of coordinate-descent sweeps.
    pub max_iter: usize,
}

impl Default for RegularizationSpec {
    fn default() -> Self {
        Self {
            elastic_net_param: 0.0,
            reg_param: 0.0,
            standardization: true,
            fit_intercept: true,
            tolerance: 1.0e-6,
            max_iter: 100,
        }
    }
}

impl RegularizationSpec {
    pub fn validate(&self) -> Result<(), FitError> {
        if !self.reg_param.is_finite() || self.reg_param < 0.0 {
            return Err(FitError::InvalidConfig(format!(
                "reg_param must be a finite value >= 0, got {}",
                self.reg_param
            )));
        }
        if !(0.0..=1.0).contains(&self.elastic_net_param) {
            return Err(FitError::InvalidConfig(format!(
                "elastic_net_param must lie in [0, 1], got {}",
                self.elastic_net_param
            )));
        }
        if !self.tolerance.is_finite() || self.tolerance <= 0.0 {
            return Err(FitError::InvalidConfig(format!(
                "tolerance must be a finite value > 0, got {}",
                self.tolerance
            )));
        }
        if self.max_iter == 0 {
            return Err(FitError::InvalidConfig(
                "max_iter must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Strength of the L1 term, `λα`.
    pub fn l1_strength(&self) -> f64 {
        self.reg_param * self.elastic_net_param
    }

    /// Strength of the L2 term, `λ(1−α)`.
    pub fn l2_strength(&self) -> f64 {
        self.reg_param * (1.0 - self.elastic_net_param)
    }

    /// Global statistics are needed for centering (intercept) and for scaling.
    pub fn needs_statistics(&self) -> bool {
        self.standardization || self.fit_intercept
    }

    /// The algorithm is chosen once from the spec and never revisited mid-fit.
    pub fn algorithm(&self) -> Algorithm {
        if self.elastic_net_param == 0.0 {
            Algorithm::DirectSolve
        } else {
            Algorithm::CoordinateDescent
        }
    }
}

/// Solver family selected at `Init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    /// One aggregation of the normal equations and a factorization (OLS and ridge).
    DirectSolve,
    /// Distributed cyclic coordinate descent (Lasso and elastic net).
    CoordinateDescent,
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Algorithm::DirectSolve => f.write_str("direct solve"),
            Algorithm::CoordinateDescent => f.write_str("coordinate descent"),
        }
    }
}

/// Numeric type the staged feature matrix is stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoragePrecision {
    /// Narrow features to `f32`; halves device memory.
    Single,
    #[default]
    Double,
}

/// Numeric type local sums are accumulated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccumulationPrecision {
    /// Accumulate in the storage type. With `f32` storage the Gram entries carry roughly
    /// seven significant digits, which loses accuracy on poorly conditioned data.
    Working,
    /// Always accumulate in `f64`.
    #[default]
    Double,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecisionConfig {
    pub storage: StoragePrecision,
    pub accumulation: AccumulationPrecision,
}

/// Devices that ranks are placed on. Rank `r` runs on device `r % num_devices`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceLayout {
    pub num_devices: usize,
    /// Bytes each device may hold; `None` splits the host's available memory evenly.
    pub memory_per_device: Option<u64>,
}

impl Default for DeviceLayout {
    fn default() -> Self {
        Self {
            num_devices: 1,
            memory_per_device: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitOptions {
    pub devices: DeviceLayout,
    pub precision: PrecisionConfig,
    /// Wall-clock budget; checked only between iterations.
    pub max_wall_time_secs: Option<f64>,
    pub condition_limit: f64,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            devices: DeviceLayout::default(),
            precision: PrecisionConfig::default(),
            max_wall_time_secs: None,
            condition_limit: DEFAULT_CONDITION_LIMIT,
        }
    }
}

impl FitOptions {
    pub fn validate(&self) -> Result<(), FitError> {
        if self.devices.num_devices == 0 {
            return Err(FitError::InvalidConfig(
                "at least one device is required".to_string(),
            ));
        }
        if self.devices.memory_per_device == Some(0) {
            return Err(FitError::InvalidConfig(
                "memory_per_device must be positive".to_string(),
            ));
        }
        if let Some(secs) = self.max_wall_time_secs {
            if !secs.is_finite() || secs <= 0.0 {
                return Err(FitError::InvalidConfig(format!(
                    "max_wall_time_secs must be a finite value > 0, got {secs}"
                )));
            }
        }
        if !self.condition_limit.is_finite() || self.condition_limit <= 1.0 {
            return Err(FitError::InvalidConfig(format!(
                "condition_limit must be a finite value > 1, got {}",
                self.condition_limit
            )));
        }
        Ok(())
    }

    pub fn max_wall_time(&self) -> Option<Duration> {
        self.max_wall_time_secs.map(Duration::from_secs_f64)
    }
}

/// Error type for reading a configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
}

/// Everything a fit needs besides the data.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub regularization: RegularizationSpec,
    pub options: FitOptions,
}

impl TrainingConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_toml_path(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}
