use crate::fitting::common::fitstruct::ParameterTable;
use crate::fitting::common::solver::SolverStatus;
use crate::models::gaussian::GaussianModel;
use crate::models::join::JoinTable;
use ndarray::Array1;

/// Outcome of a least-squares component fit.
#[derive(Clone, Debug)]
pub struct ComponentFit {
    /// Fitted values, with standard errors scaled by `sqrt(chi2 / dof)`.
    pub params: ParameterTable,
    pub chi2: f64,
    pub dof: usize,
    /// `(data - model) / err`, flattened channel by channel.
    pub residuals: Array1<f64>,
    pub nfev: usize,
    pub status: SolverStatus,
}

impl ComponentFit {
    pub fn fitted_params(&self) -> Vec<f64> {
        self.params.values()
    }

    pub fn fit_errs(&self) -> Vec<f64> {
        self.params.stderrs()
    }

    pub fn red_chi2(&self) -> f64 {
        self.chi2 / self.dof as f64
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// A fitted frequency-evolving Gaussian model.
#[derive(Clone, Debug)]
pub struct GaussianPortraitFit {
    pub model: GaussianModel,
    /// Standard errors laid out like `model`.
    pub model_errs: GaussianModel,
    /// Fitted offsets of each joined band; empty without bands.
    pub join: JoinTable,
    pub fit: ComponentFit,
}

/// A fitted power-law spectrum.
#[derive(Clone, Debug)]
pub struct PowlawFit {
    pub amp: f64,
    pub amp_err: f64,
    pub alpha: f64,
    pub alpha_err: f64,
    pub fit: ComponentFit,
}
