use crate::controller::FitState;

/// Observer for reporting controller progress while fitting.
///
/// Only rank 0 drives the observer, on the calling thread, so implementations need not be
/// `Send`. Coefficients are reported in the solver's transformed feature space.
pub trait FitProgressObserver {
    fn on_state(&mut self, state: FitState) {
        let _ = state;
    }
    fn on_iteration(&mut self, iteration: usize, coefficients: &[f64], objective: f64) {
        let _ = (iteration, coefficients, objective);
    }
}

#[derive(Default)]
pub struct NoopFitProgress;

impl FitProgressObserver for NoopFitProgress {}

/// Records every callback; used to compare runs.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RecordingFitProgress {
    pub states: Vec<FitState>,
    pub iterations: Vec<(usize, Vec<f64>, f64)>,
}

impl FitProgressObserver for RecordingFitProgress {
    fn on_state(&mut self, state: FitState) {
        self.states.push(state);
    }

    fn on_iteration(&mut self, iteration: usize, coefficients: &[f64], objective: f64) {
        self.iterations
            .push((iteration, coefficients.to_vec(), objective));
    }
}
