//! Thin adapters between `ndarray` and `faer`, plus the symmetric solve used by the
//! direct path.

use faer::diag::DiagRef;
use faer::linalg::solvers::{self, Solve};
use faer::{Mat, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Ix2};
use thiserror::Error;

/// Eigenvalues below `λ_max` times this are treated as zero by the pseudo-inverse.
pub const PSEUDO_INVERSE_RTOL: f64 = 1.0e-12;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("Self-adjoint eigendecomposition failed: {0:?}")]
    SelfAdjointEigen(solvers::EvdError),
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
    #[error("Dimension mismatch: matrix is {rows}x{cols}, right-hand side has {rhs} entries")]
    DimensionMismatch { rows: usize, cols: usize, rhs: usize },
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    Array1::from_shape_fn(mat.nrows(), |i| mat[(i, 0)])
}

enum FaerStorage<'a> {
    Borrowed(MatRef<'a, f64>),
    Owned(Mat<f64>),
}

impl<'a> FaerStorage<'a> {
    #[inline]
    fn as_ref(&self) -> MatRef<'_, f64> {
        match self {
            FaerStorage::Borrowed(view) => *view,
            FaerStorage::Owned(mat) => mat.as_ref(),
        }
    }
}

/// Zero-copy `faer` view of a 2-D array whenever its memory is contiguous.
pub struct FaerArrayView<'a> {
    storage: FaerStorage<'a>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let storage = if let Some(slice) = array.as_slice_memory_order() {
            if array.is_standard_layout() {
                FaerStorage::Borrowed(MatRef::from_row_major_slice(
                    slice,
                    array.nrows(),
                    array.ncols(),
                ))
            } else if array.t().is_standard_layout() {
                FaerStorage::Borrowed(MatRef::from_column_major_slice(
                    slice,
                    array.nrows(),
                    array.ncols(),
                ))
            } else {
                let (rows, cols) = array.dim();
                FaerStorage::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)]))
            }
        } else {
            let (rows, cols) = array.dim();
            FaerStorage::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)]))
        };
        Self { storage }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        self.storage.as_ref()
    }
}

pub struct FaerColView<'a> {
    storage: FaerStorage<'a>,
}

impl<'a> FaerColView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix1>) -> Self {
        let len = array.len();
        let storage = if let Some(slice) = array.as_slice() {
            FaerStorage::Borrowed(MatRef::from_row_major_slice(slice, len, 1))
        } else {
            FaerStorage::Owned(Mat::from_fn(len, 1, |i, _| array[i]))
        };
        Self { storage }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        self.storage.as_ref()
    }
}

pub trait FaerEigh {
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerEigh for ArrayBase<S, Ix2> {
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError> {
        let faer_view = FaerArrayView::new(self);
        let eigen = faer_view
            .as_ref()
            .self_adjoint_eigen(side)
            .map_err(FaerLinalgError::SelfAdjointEigen)?;
        let values = diag_to_array(eigen.S());
        let vectors = mat_to_array(eigen.U());
        Ok((values, vectors))
    }
}

pub struct FaerCholeskyFactor {
    factor: solvers::Llt<f64>,
}

impl FaerCholeskyFactor {
    pub fn solve_vec(&self, rhs: &Array1<f64>) -> Array1<f64> {
        let rhs_view = FaerColView::new(rhs);
        let sol = self.factor.solve(rhs_view.as_ref());
        Array1::from_shape_fn(rhs.len(), |i| sol[(i, 0)])
    }

    pub fn diag(&self) -> Array1<f64> {
        diag_to_array(self.factor.L().diagonal())
    }
}

pub trait FaerCholesky {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError> {
        let faer_view = FaerArrayView::new(self);
        let factor = faer_view
            .as_ref()
            .llt(side)
            .map_err(FaerLinalgError::Cholesky)?;
        Ok(FaerCholeskyFactor { factor })
    }
}

/// Which factorization produced a [`SymmetricSolution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveMethod {
    Cholesky,
    EigenPseudoInverse,
}

#[derive(Debug, Clone)]
pub struct SymmetricSolution {
    pub solution: Array1<f64>,
    pub condition_estimate: f64,
    pub method: SolveMethod,
}

/// Solves `A x = b` for a symmetric positive semi-definite `A`.
///
/// Cholesky is tried first. Its condition estimate is `(max Lᵢᵢ / min Lᵢᵢ)²`, a lower
/// bound on the true 2-norm condition number. When the factorization fails or the
/// estimate exceeds `condition_limit`, the system is solved through the eigendecomposition
/// instead, discarding eigenvalues below `λ_max · max(PSEUDO_INVERSE_RTOL, n · ε)`. That
/// fallback yields the minimum-norm least-squares solution for singular systems.
pub fn solve_symmetric(
    matrix: &Array2<f64>,
    rhs: &Array1<f64>,
    condition_limit: f64,
) -> Result<SymmetricSolution, FaerLinalgError> {
    let n = matrix.nrows();
    if matrix.ncols() != n || rhs.len() != n {
        return Err(FaerLinalgError::DimensionMismatch {
            rows: matrix.nrows(),
            cols: matrix.ncols(),
            rhs: rhs.len(),
        });
    }
    if n == 0 {
        return Ok(SymmetricSolution {
            solution: Array1::zeros(0),
            condition_estimate: 1.0,
            method: SolveMethod::Cholesky,
        });
    }

    match matrix.cholesky(Side::Lower) {
        Ok(factor) => {
            let diag = factor.diag();
            let max_pivot = diag.iter().fold(0.0_f64, |acc, &v| acc.max(v.abs()));
            let min_pivot = diag.iter().fold(f64::INFINITY, |acc, &v| acc.min(v.abs()));
            let estimate = if min_pivot > 0.0 {
                (max_pivot / min_pivot).powi(2)
            } else {
                f64::INFINITY
            };
            if estimate.is_finite() && estimate <= condition_limit {
                let solution = factor.solve_vec(rhs);
                if solution.iter().all(|v| v.is_finite()) {
                    return Ok(SymmetricSolution {
                        solution,
                        condition_estimate: estimate,
                        method: SolveMethod::Cholesky,
                    });
                }
            }
            log::debug!(
                "Cholesky condition estimate {estimate:.3e} exceeds limit {condition_limit:.3e}"
            );
        }
        Err(err) => log::debug!("Cholesky factorization rejected the system: {err}"),
    }

    eigen_pseudo_inverse_solve(matrix, rhs)
}

fn eigen_pseudo_inverse_solve(
    matrix: &Array2<f64>,
    rhs: &Array1<f64>,
) -> Result<SymmetricSolution, FaerLinalgError> {
    let (values, vectors) = matrix.eigh(Side::Lower)?;
    let n = values.len();
    let largest = values.iter().fold(0.0_f64, |acc, &v| acc.max(v.abs()));
    let cutoff = largest * PSEUDO_INVERSE_RTOL.max(n as f64 * f64::EPSILON);

    let mut solution = Array1::<f64>::zeros(n);
    let mut smallest_kept = f64::INFINITY;
    let mut discarded = 0usize;
    for (idx, &value) in values.iter().enumerate() {
        if value > cutoff {
            let vector = vectors.column(idx);
            let coefficient = vector.dot(rhs) / value;
            solution.scaled_add(coefficient, &vector);
            smallest_kept = smallest_kept.min(value);
        } else {
            discarded += 1;
        }
    }

    let condition_estimate = if discarded > 0 || !smallest_kept.is_finite() {
        f64::INFINITY
    } else {
        largest / smallest_kept
    };
    log::debug!(
        "Pseudo-inverse solve discarded {discarded} of {n} eigen-directions (cutoff {cutoff:.3e})"
    );

    Ok(SymmetricSolution {
        solution,
        condition_estimate,
        method: SolveMethod::EigenPseudoInverse,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_spd(n: usize, rng: &mut StdRng) -> Array2<f64> {
        let mut mat = Array2::zeros((n + 3, n));
        for value in mat.iter_mut() {
            *value = rng.gen_range(-1.0..1.0);
        }
        let mut spd = mat.t().dot(&mat);
        for d in 0..n {
            spd[[d, d]] += 0.5;
        }
        spd
    }

    #[test]
    fn cholesky_path_solves_well_conditioned_system() {
        let mut rng = StdRng::seed_from_u64(7);
        let a = random_spd(6, &mut rng);
        let x_true = array![1.0, -2.0, 0.5, 3.0, 0.0, -1.25];
        let b = a.dot(&x_true);

        let result = solve_symmetric(&a, &b, 1e12).unwrap();
        assert_eq!(result.method, SolveMethod::Cholesky);
        for (got, want) in result.solution.iter().zip(x_true.iter()) {
            assert_abs_diff_eq!(*got, *want, epsilon = 1e-9);
        }
    }

    #[test]
    fn singular_system_falls_back_to_min_norm_solution() {
        // Two identical directions: x0 + x1 is determined, x0 - x1 is not.
        let a = array![[2.0, 2.0, 0.0], [2.0, 2.0, 0.0], [0.0, 0.0, 1.0]];
        let b = array![4.0, 4.0, 3.0];

        let result = solve_symmetric(&a, &b, 1e12).unwrap();
        assert_eq!(result.method, SolveMethod::EigenPseudoInverse);
        assert!(result.condition_estimate.is_infinite());
        assert_abs_diff_eq!(result.solution[0], 1.0, epsilon = 1e-10);
        assert_abs_diff_eq!(result.solution[1], 1.0, epsilon = 1e-10);
        assert_abs_diff_eq!(result.solution[2], 3.0, epsilon = 1e-10);
    }

    #[test]
    fn tight_condition_limit_forces_fallback_with_same_answer() {
        let a = array![[1.0e4, 0.0], [0.0, 1.0]];
        let b = array![2.0e4, 3.0];

        let result = solve_symmetric(&a, &b, 10.0).unwrap();
        assert_eq!(result.method, SolveMethod::EigenPseudoInverse);
        assert_abs_diff_eq!(result.condition_estimate, 1.0e4, epsilon = 1e-6);
        assert_abs_diff_eq!(result.solution[0], 2.0, epsilon = 1e-10);
        assert_abs_diff_eq!(result.solution[1], 3.0, epsilon = 1e-10);
    }

    #[test]
    fn rejects_mismatched_dimensions() {
        let a = Array2::<f64>::eye(3);
        let b = array![1.0, 2.0];
        assert!(matches!(
            solve_symmetric(&a, &b, 1e12),
            Err(FaerLinalgError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn empty_system_is_trivially_solved() {
        let a = Array2::<f64>::zeros((0, 0));
        let b = Array1::<f64>::zeros(0);
        let result = solve_symmetric(&a, &b, 1e12).unwrap();
        assert!(result.solution.is_empty());
    }
}
