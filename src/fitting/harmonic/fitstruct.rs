use crate::fitting::common::solver::SolverStatus;
use ndarray::Array1;
use std::time::Duration;

/// Result of a joint phase/DM fit of a portrait against a model.
#[derive(Clone, Debug)]
pub struct FitResult {
    /// Rotation [rot] that aligns the data with the model; not wrapped.
    pub phase: f64,
    pub phase_err: f64,
    /// Dispersion measure [cm**-3 pc] relative to the data's own.
    pub dm: f64,
    pub dm_err: f64,
    /// Frequency [MHz] the phase refers to.
    pub nu_ref: f64,
    /// Per-channel amplitude of the data relative to the model.
    pub scales: Array1<f64>,
    pub scale_errs: Array1<f64>,
    pub nfeval: usize,
    pub status: SolverStatus,
    pub red_chi2: f64,
    pub duration: Duration,
}

impl FitResult {
    pub fn return_code(&self) -> i32 {
        self.status.code()
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Result of aligning a single profile with a model profile.
#[derive(Clone, Debug)]
pub struct PhaseShiftResult {
    pub phase: f64,
    pub phase_err: f64,
    pub scale: f64,
    pub scale_err: f64,
    pub nfeval: usize,
    pub status: SolverStatus,
    pub red_chi2: f64,
    pub duration: Duration,
}
