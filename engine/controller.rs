//! # Convergence Controller
//!
//! Rank 0 owns the controller. It validates the configuration, picks the algorithm once,
//! and makes every decision the ranks must agree on: each coordinate update, whether to
//! run another sweep, and the direct solve. Decisions reach the other ranks by broadcast,
//! so all ranks walk the same state sequence:
//!
//! ```text
//! Init → BuildStats (optional) → Iterate → { Converged | MaxIterReached
//!                                          | DirectSolved | TimeLimitReached } → Done
//! ```

use crate::builder::NormalEquations;
use crate::collective::CollectiveGroup;
use crate::config::{Algorithm, FitOptions, RegularizationSpec, TrainingConfig};
use crate::error::{FitError, FitWarning};
use crate::fit::{self, FitOutcome};
use crate::linalg::{SolveMethod, solve_symmetric};
use crate::partition::HostPartition;
use crate::progress::FitProgressObserver;
use crate::stats::FeatureTransform;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Guards the stopping rule against division by zero when every coefficient is zero.
const TINY_NORM: f64 = 1.0e-30;

/// Controller states, in the order a fit visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FitState {
    Init,
    BuildStats,
    Iterate,
    Converged,
    MaxIterReached,
    DirectSolved,
    TimeLimitReached,
    Done,
}

/// How a successful fit terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FitStatus {
    /// Single aggregation plus factorization (OLS and ridge).
    DirectSolved,
    /// The relative coefficient change fell below the tolerance.
    Converged,
    /// `max_iter` sweeps ran without meeting the tolerance.
    MaxIterationsReached,
    /// The wall-clock budget ran out between sweeps.
    TimeLimitReached,
}

impl FitStatus {
    /// `false` for the flagged terminal states whose coefficients are usable but not
    /// converged.
    pub fn is_converged(self) -> bool {
        matches!(self, FitStatus::DirectSolved | FitStatus::Converged)
    }

    fn terminal_state(self) -> FitState {
        match self {
            FitStatus::DirectSolved => FitState::DirectSolved,
            FitStatus::Converged => FitState::Converged,
            FitStatus::MaxIterationsReached => FitState::MaxIterReached,
            FitStatus::TimeLimitReached => FitState::TimeLimitReached,
        }
    }
}

impl fmt::Display for FitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FitStatus::DirectSolved => "solved directly",
            FitStatus::Converged => "converged",
            FitStatus::MaxIterationsReached => "stopped at the iteration limit",
            FitStatus::TimeLimitReached => "stopped at the time limit",
        };
        f.write_str(text)
    }
}

/// Cooperative cancellation, honored at control points between iterations.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// What every rank does next; broadcast from rank 0 as a single code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    Continue,
    Stop(FitStatus),
    Cancel,
}

impl Decision {
    pub(crate) fn to_code(self) -> f64 {
        match self {
            Decision::Continue => 0.0,
            Decision::Stop(FitStatus::Converged) => 1.0,
            Decision::Stop(FitStatus::MaxIterationsReached) => 2.0,
            Decision::Stop(FitStatus::TimeLimitReached) => 3.0,
            Decision::Stop(FitStatus::DirectSolved) => 4.0,
            Decision::Cancel => 5.0,
        }
    }

    pub(crate) fn from_code(code: f64) -> Option<Self> {
        match code as i64 {
            0 => Some(Decision::Continue),
            1 => Some(Decision::Stop(FitStatus::Converged)),
            2 => Some(Decision::Stop(FitStatus::MaxIterationsReached)),
            3 => Some(Decision::Stop(FitStatus::TimeLimitReached)),
            4 => Some(Decision::Stop(FitStatus::DirectSolved)),
            5 => Some(Decision::Cancel),
            _ => None,
        }
    }
}

/// `S(x, t) = sign(x) · max(|x| − t, 0)`; exactly `0.0` inside the band.
#[inline]
pub fn soft_threshold(x: f64, threshold: f64) -> f64 {
    if x > threshold {
        x - threshold
    } else if x < -threshold {
        x + threshold
    } else {
        0.0
    }
}

/// Closed-form minimizer of the objective along coordinate `j`.
///
/// `gradient = Σ w z_j r` and `curvature = Σ w z_j²` are the all-reduced partition terms
/// against the residual of the current coefficients.
#[inline]
pub fn coordinate_update(
    current: f64,
    gradient: f64,
    curvature: f64,
    total_weight: f64,
    l1: f64,
    l2: f64,
) -> f64 {
    let denominator = curvature / total_weight + l2;
    if denominator <= 0.0 {
        return 0.0;
    }
    let numerator = gradient / total_weight + curvature / total_weight * current;
    soft_threshold(numerator, l1) / denominator
}

/// `‖new − prev‖₂ / max(‖new‖₂, tiny)`.
pub fn relative_change(prev: &Array1<f64>, new: &Array1<f64>) -> f64 {
    let diff = prev
        .iter()
        .zip(new.iter())
        .fold(0.0, |acc, (a, b)| acc + (b - a) * (b - a))
        .sqrt();
    let norm = new.dot(new).sqrt();
    diff / norm.max(TINY_NORM)
}

/// Drives one fit. Consumed by [`fit`](Self::fit), so a controller is never reused.
#[derive(Debug)]
pub struct ConvergenceController {
    spec: RegularizationSpec,
    options: FitOptions,
    algorithm: Algorithm,
    cancellation: CancellationToken,
    started: Instant,
    states: Vec<FitState>,
    objective_history: Vec<f64>,
}

impl ConvergenceController {
    /// The `Init` state: rejects an invalid configuration before any rank starts.
    pub fn new(config: &TrainingConfig) -> Result<Self, FitError> {
        config.regularization.validate()?;
        config.options.validate()?;
        let algorithm = config.regularization.algorithm();
        log::debug!(
            "Selected {algorithm} for reg_param={} elastic_net_param={}",
            config.regularization.reg_param,
            config.regularization.elastic_net_param
        );
        Ok(Self {
            spec: config.regularization,
            options: config.options,
            algorithm,
            cancellation: CancellationToken::new(),
            started: Instant::now(),
            states: Vec::new(),
            objective_history: Vec::new(),
        })
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn spec(&self) -> &RegularizationSpec {
        &self.spec
    }

    pub fn options(&self) -> &FitOptions {
        &self.options
    }

    /// Stages `partitions` (one per rank of `group`) and runs the fit to completion.
    pub fn fit(
        self,
        partitions: Vec<HostPartition>,
        group: &CollectiveGroup,
        observer: &mut dyn FitProgressObserver,
    ) -> Result<FitOutcome, FitError> {
        fit::execute(self, partitions, group, observer)
    }

    pub(crate) fn begin(&mut self, observer: &mut dyn FitProgressObserver) {
        self.started = Instant::now();
        self.enter(FitState::Init, observer);
    }

    pub(crate) fn enter(&mut self, state: FitState, observer: &mut dyn FitProgressObserver) {
        if self.states.last() == Some(&state) {
            return;
        }
        log::debug!("Controller entering {state:?}");
        self.states.push(state);
        observer.on_state(state);
    }

    /// Records the terminal state for `status` followed by `Done`.
    pub(crate) fn finish(&mut self, status: FitStatus, observer: &mut dyn FitProgressObserver) {
        self.enter(status.terminal_state(), observer);
        self.enter(FitState::Done, observer);
    }

    /// Checked between iterations only: cancellation first, then the wall-clock budget.
    pub(crate) fn control_point(&self, completed_iterations: usize) -> Decision {
        if self.cancellation.is_cancelled() {
            log::info!("Fit cancelled after {completed_iterations} iterations");
            return Decision::Cancel;
        }
        if let Some(limit) = self.options.max_wall_time() {
            if self.started.elapsed() >= limit {
                log::warn!(
                    "Time limit of {:.3}s reached after {completed_iterations} iterations",
                    limit.as_secs_f64()
                );
                return Decision::Stop(FitStatus::TimeLimitReached);
            }
        }
        Decision::Continue
    }

    /// Rank 0's view of one coordinate update.
    pub(crate) fn update_coordinate(
        &self,
        current: f64,
        terms: &[f64],
        total_weight: f64,
    ) -> f64 {
        coordinate_update(
            current,
            terms[0],
            terms[1],
            total_weight,
            self.spec.l1_strength(),
            self.spec.l2_strength(),
        )
    }

    /// `1/(2W) Σ w r² + λ(α‖β‖₁ + (1−α)/2 ‖β‖²)` in the working space.
    pub(crate) fn objective(&self, weighted_loss: f64, total_weight: f64, beta: &Array1<f64>) -> f64 {
        let l1_norm: f64 = beta.iter().map(|b| b.abs()).sum();
        let l2_norm_sq = beta.dot(beta);
        weighted_loss / (2.0 * total_weight)
            + self.spec.l1_strength() * l1_norm
            + 0.5 * self.spec.l2_strength() * l2_norm_sq
    }

    /// Records a finished sweep and decides whether to run another.
    pub(crate) fn after_sweep(
        &mut self,
        iteration: usize,
        prev: &Array1<f64>,
        beta: &Array1<f64>,
        objective: f64,
        observer: &mut dyn FitProgressObserver,
    ) -> Decision {
        self.objective_history.push(objective);
        observer.on_iteration(iteration, beta.as_slice().unwrap_or(&[]), objective);
        let change = relative_change(prev, beta);
        log::debug!("Sweep {iteration}: objective {objective:.6e}, relative change {change:.3e}");
        if change <= self.spec.tolerance {
            log::info!("Coordinate descent converged after {iteration} sweeps");
            return Decision::Stop(FitStatus::Converged);
        }
        if iteration >= self.spec.max_iter {
            log::warn!(
                "Coordinate descent reached max_iter={} without meeting tolerance {:.1e} (last change {change:.3e})",
                self.spec.max_iter,
                self.spec.tolerance
            );
            return Decision::Stop(FitStatus::MaxIterationsReached);
        }
        self.control_point(iteration)
    }

    /// Solves `(G/W + λ(1−α) I) β = c/W` over the active features.
    ///
    /// Inactive (constant) features keep a zero coefficient. A near-singular system is
    /// solved by the pseudo-inverse fallback and reported as `IllConditionedSystem`.
    pub(crate) fn solve_direct(
        &mut self,
        equations: &NormalEquations,
        transform: &FeatureTransform,
        observer: &mut dyn FitProgressObserver,
    ) -> Result<(Array1<f64>, Option<FitWarning>), FitError> {
        let active = &transform.active;
        let w = equations.total_weight;
        let l2 = self.spec.l2_strength();
        let m = active.len();
        let mut system = Array2::zeros((m, m));
        let mut rhs = Array1::zeros(m);
        for (a, &j) in active.iter().enumerate() {
            rhs[a] = equations.cross[j] / w;
            for (b, &k) in active.iter().enumerate() {
                system[(a, b)] = equations.gram[(j, k)] / w;
            }
            system[(a, a)] += l2;
        }

        let solved = solve_symmetric(&system, &rhs, self.options.condition_limit)?;
        let warning = match solved.method {
            SolveMethod::Cholesky => None,
            SolveMethod::EigenPseudoInverse => {
                let warning = FitWarning::IllConditionedSystem {
                    condition_number: solved.condition_estimate,
                };
                log::warn!("{warning}");
                Some(warning)
            }
        };

        let mut beta = Array1::zeros(transform.num_features());
        for (a, &j) in active.iter().enumerate() {
            beta[j] = solved.solution[a];
        }
        let rss = equations.residual_sum_of_squares(beta.view());
        let objective = self.objective(rss, w, &beta);
        self.objective_history.push(objective);
        observer.on_iteration(1, beta.as_slice().unwrap_or(&[]), objective);
        Ok((beta, warning))
    }

    pub(crate) fn into_trace(self) -> (Vec<FitState>, Vec<f64>) {
        (self.states, self.objective_history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::RecordingFitProgress;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn soft_threshold_is_exactly_zero_inside_band() {
        assert_eq!(soft_threshold(0.3, 0.5), 0.0);
        assert_eq!(soft_threshold(-0.5, 0.5), 0.0);
        assert_eq!(soft_threshold(2.0, 0.5), 1.5);
        assert_eq!(soft_threshold(-2.0, 0.5), -1.5);
        assert_eq!(soft_threshold(1.0, 0.0), 1.0);
    }

    #[test]
    fn coordinate_update_matches_one_dimensional_elastic_net() {
        // With h = W the update is S(g/W + b, λα) / (1 + λ(1−α)).
        let b = coordinate_update(0.5, 2.0, 10.0, 10.0, 0.1, 0.2);
        assert_abs_diff_eq!(b, (0.2 + 0.5 - 0.1) / 1.2, epsilon = 1e-15);
        assert_eq!(coordinate_update(0.0, 0.05, 10.0, 10.0, 0.1, 0.0), 0.0);
        assert_eq!(coordinate_update(3.0, 0.0, 0.0, 10.0, 0.0, 0.0), 0.0);
    }

    #[test]
    fn coordinate_update_lands_on_zero_or_crosses_it_in_one_step() {
        // Unpenalized target -0.2 is inside the band: exactly zero.
        assert_eq!(coordinate_update(1.0, -1.2, 1.0, 1.0, 0.5, 0.0), 0.0);
        // Target -2.0 is outside the band: the minimizer is on the other side of zero.
        assert_eq!(coordinate_update(1.0, -3.0, 1.0, 1.0, 0.5, 0.0), -1.5);
    }

    #[test]
    fn relative_change_handles_zero_vectors() {
        let zero = Array1::zeros(3);
        assert_eq!(relative_change(&zero, &zero), 0.0);
        let prev = array![1.0, 0.0];
        let new = array![1.0, 1.0];
        assert_abs_diff_eq!(relative_change(&prev, &new), 1.0 / 2.0_f64.sqrt(), epsilon = 1e-15);
    }

    #[test]
    fn invalid_configuration_is_rejected_at_init() {
        let mut config = TrainingConfig::default();
        config.regularization.reg_param = -1.0;
        assert!(matches!(
            ConvergenceController::new(&config),
            Err(FitError::InvalidConfig(_))
        ));
        let mut config = TrainingConfig::default();
        config.options.devices.num_devices = 0;
        assert!(ConvergenceController::new(&config).is_err());
    }

    #[test]
    fn decisions_survive_the_broadcast_encoding() {
        for decision in [
            Decision::Continue,
            Decision::Cancel,
            Decision::Stop(FitStatus::Converged),
            Decision::Stop(FitStatus::MaxIterationsReached),
            Decision::Stop(FitStatus::TimeLimitReached),
            Decision::Stop(FitStatus::DirectSolved),
        ] {
            assert_eq!(Decision::from_code(decision.to_code()), Some(decision));
        }
        assert_eq!(Decision::from_code(42.0), None);
    }

    #[test]
    fn sweep_decisions_follow_precedence() {
        let config = TrainingConfig {
            regularization: RegularizationSpec {
                elastic_net_param: 1.0,
                reg_param: 0.1,
                max_iter: 3,
                tolerance: 1e-3,
                ..Default::default()
            },
            ..Default::default()
        };
        let token = CancellationToken::new();
        let mut controller = ConvergenceController::new(&config)
            .unwrap()
            .with_cancellation(token.clone());
        let mut observer = RecordingFitProgress::default();
        let prev = array![0.0, 0.0];
        let moved = array![1.0, 0.0];

        assert_eq!(
            controller.after_sweep(1, &prev, &moved, 1.0, &mut observer),
            Decision::Continue
        );
        token.cancel();
        assert_eq!(
            controller.after_sweep(2, &prev, &moved, 0.9, &mut observer),
            Decision::Cancel
        );
        assert_eq!(
            controller.after_sweep(3, &prev, &moved, 0.8, &mut observer),
            Decision::Stop(FitStatus::MaxIterationsReached)
        );
        assert_eq!(
            controller.after_sweep(3, &moved, &moved, 0.8, &mut observer),
            Decision::Stop(FitStatus::Converged)
        );
        assert_eq!(observer.iterations.len(), 4);
    }

    #[test]
    fn direct_solve_reports_ill_conditioning() {
        let config = TrainingConfig::default();
        let mut controller = ConvergenceController::new(&config).unwrap();
        let transform = FeatureTransform::identity(2);
        // Two identical standardized columns.
        let equations = NormalEquations {
            gram: array![[4.0, 4.0], [4.0, 4.0]],
            cross: array![2.0, 2.0],
            label_ss: 1.0,
            total_weight: 4.0,
            num_rows: 4.0,
        };
        let mut observer = RecordingFitProgress::default();
        let (beta, warning) = controller
            .solve_direct(&equations, &transform, &mut observer)
            .unwrap();
        assert!(matches!(
            warning,
            Some(FitWarning::IllConditionedSystem { .. })
        ));
        assert_abs_diff_eq!(beta[0], 0.25, epsilon = 1e-10);
        assert_abs_diff_eq!(beta[1], 0.25, epsilon = 1e-10);
        assert_eq!(observer.iterations.len(), 1);
    }
}
