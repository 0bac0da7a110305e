use crate::linalg::FaerLinalgError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every way a distributed fit can fail.
///
/// Validation variants (`InvalidConfig`, `InvalidPartition`) are raised before any
/// thread or collective call starts. The remaining variants are raised mid-flight and are
/// never retried by this crate.
#[derive(Error, Debug)]
pub enum FitError {
    #[error("Invalid regularization configuration: {0}")]
    InvalidConfig(String),

    #[error("Partition for rank {rank} is invalid: {reason}")]
    InvalidPartition { rank: usize, reason: String },

    #[error(
        "Device {device} cannot hold the partition of rank {rank}: requested {requested} bytes, {available} bytes free."
    )]
    AllocationError {
        rank: usize,
        device: usize,
        requested: u64,
        available: u64,
    },

    #[error("Collective operation failed on rank {rank}: {reason}")]
    CollectiveFailure { rank: usize, reason: String },

    #[error("The fit was cancelled after {completed_iterations} completed iterations.")]
    Cancelled { completed_iterations: usize },

    #[error("The fallback factorization failed: {0}")]
    LinalgError(#[from] FaerLinalgError),

    #[error("The worker thread for rank {rank} panicked.")]
    RankPanicked { rank: usize },
}

impl FitError {
    /// Secondary failures are the `CollectiveFailure`s that surviving ranks observe after
    /// a peer has already failed for its own reason.
    pub fn is_secondary(&self) -> bool {
        matches!(self, FitError::CollectiveFailure { .. })
    }
}

/// Recoverable conditions reported next to a usable result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FitWarning {
    /// The regularized normal equations were near-singular; the solution came from the
    /// eigendecomposition pseudo-inverse instead of Cholesky.
    IllConditionedSystem { condition_number: f64 },
}

impl std::fmt::Display for FitWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FitWarning::IllConditionedSystem { condition_number } => write!(
                f,
                "normal equations are ill-conditioned (condition estimate {condition_number:.3e}); solved with the pseudo-inverse fallback"
            ),
        }
    }
}

/// Picks the error to surface when several ranks failed.
///
/// A rank that fails for its own reason (say, `AllocationError`) tears down the
/// collective, so every other rank reports `CollectiveFailure`. The root cause is the
/// lowest-ranked non-secondary error; only when every failure is secondary is the
/// lowest-ranked `CollectiveFailure` returned.
pub fn root_cause(mut failures: Vec<(usize, FitError)>) -> Option<FitError> {
    failures.sort_by_key(|(rank, _)| *rank);
    let primary = failures.iter().position(|(_, err)| !err.is_secondary());
    match primary {
        Some(index) => Some(failures.swap_remove(index).1),
        None => failures.into_iter().next().map(|(_, err)| err),
    }
}
