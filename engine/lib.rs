#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

//! Distributed training engine for OLS, ridge, Lasso and elastic-net linear regression
//! over row-partitioned data.
//!
//! Each upstream partition is owned by one rank. Ranks stage their partition onto a
//! device, compute local normal equations or coordinate terms, and combine them through
//! a deterministic all-reduce; rank 0 drives convergence and extracts the model.

pub mod builder;
pub mod collective;
pub mod config;
pub mod controller;
pub mod data;
pub mod device;
pub mod error;
pub mod fit;
pub mod linalg;
pub mod model;
pub mod partition;
pub mod progress;
pub mod stats;

pub use config::{
    AccumulationPrecision, Algorithm, DeviceLayout, FitOptions, PrecisionConfig,
    RegularizationSpec, StoragePrecision, TrainingConfig,
};
pub use controller::{CancellationToken, ConvergenceController, FitState, FitStatus};
pub use error::{FitError, FitWarning};
pub use fit::{FitOutcome, TrainingSummary, fit};
pub use model::{FittedModel, SavedModel, extract_model};
pub use partition::{CsrMatrix, HostPartition};
