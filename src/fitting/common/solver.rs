//! Pluggable numerical solvers.
//!
//! Two capabilities are needed by the fitters: minimising a smooth scalar
//! objective inside box bounds ([`NonlinearSolver`]), and minimising a sum of
//! squared residuals with per-parameter bounds and fixed flags
//! ([`LeastSquaresSolver`]). Neither failure to converge nor a stalled line
//! search is an error; both come back as a [`SolverStatus`].
use crate::fitting::common::error::FittingError;
use crate::fitting::common::fitstruct::ParameterTable;
use argmin::core::{CostFunction, Error as ArgminError, Executor, Gradient, State, TerminationReason};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use itertools::izip;
use log::debug;
use rmpfit::{MPConfig, MPFitter, MPPar, MPResult, MPSuccess};
use std::cell::{Cell, RefCell};

type Result<T> = std::result::Result<T, FittingError>;

/// Box bound on a single parameter; `None` on either side means unbounded.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Bound {
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

impl Bound {
    pub const UNBOUNDED: Bound = Bound {
        lower: None,
        upper: None,
    };

    pub fn project(&self, x: f64) -> f64 {
        let mut x = x;
        if let Some(lo) = self.lower {
            x = x.max(lo);
        }
        if let Some(hi) = self.upper {
            x = x.min(hi);
        }
        x
    }

    fn at_lower(&self, x: f64) -> bool {
        self.lower.map_or(false, |lo| x <= lo)
    }

    fn at_upper(&self, x: f64) -> bool {
        self.upper.map_or(false, |hi| x >= hi)
    }
}

/// Why a solver stopped.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SolverStatus {
    /// The projected gradient vanished.
    GradientConverged,
    /// The objective stopped changing.
    FunctionConverged,
    /// The parameters stopped changing.
    StepConverged,
    /// Iteration budget exhausted.
    MaxIterations,
    /// Evaluation budget exhausted.
    MaxEvaluations,
    /// No acceptable step could be found along the search direction.
    LineSearchFailed,
    /// The one-channel fit path, which never runs the two-parameter solver.
    SingleChannel,
}

impl SolverStatus {
    pub fn code(&self) -> i32 {
        match self {
            SolverStatus::GradientConverged => 0,
            SolverStatus::FunctionConverged => 1,
            SolverStatus::StepConverged => 2,
            SolverStatus::MaxEvaluations => 3,
            SolverStatus::LineSearchFailed => 4,
            SolverStatus::MaxIterations => 5,
            SolverStatus::SingleChannel => -2,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            SolverStatus::GradientConverged
                | SolverStatus::FunctionConverged
                | SolverStatus::StepConverged
                | SolverStatus::SingleChannel
        )
    }
}

/// What a solver hands back: the best iterate whether or not it converged.
#[derive(Clone, Debug)]
pub struct SolverOutcome {
    pub x: Vec<f64>,
    /// Objective value (or sum of squared residuals) at `x`.
    pub fun: f64,
    pub nfev: usize,
    pub niter: usize,
    pub status: SolverStatus,
    /// One-sigma parameter uncertainties, if the solver can estimate them.
    pub xerror: Option<Vec<f64>>,
}

/// A smooth scalar objective to be minimised.
pub trait Objective {
    fn value(&self, x: &[f64]) -> f64;

    /// Analytic gradient, if available. Falls back to central differences.
    fn gradient(&self, x: &[f64]) -> Option<Vec<f64>> {
        let _ = x;
        None
    }

    /// Diagonal of the Hessian, if available.
    fn curvature(&self, x: &[f64]) -> Option<Vec<f64>> {
        let _ = x;
        None
    }
}

/// Bound-constrained minimisation of a scalar objective.
pub trait NonlinearSolver {
    fn minimize(&self, objective: &dyn Objective, x0: &[f64], bounds: &[Bound]) -> Result<SolverOutcome>;
}

/// Residual vector `(data - model) / error` of a least-squares problem.
pub trait ResidualProblem {
    fn num_residuals(&self) -> usize;
    fn residuals(&self, params: &[f64], out: &mut [f64]);
}

/// Least-squares minimisation honouring the bounds and vary flags of a
/// [`ParameterTable`].
pub trait LeastSquaresSolver {
    fn solve(&self, problem: &dyn ResidualProblem, table: &ParameterTable) -> Result<SolverOutcome>;
}

#[derive(Copy, Clone, Debug)]
pub struct MinimizerConfig {
    pub max_iter: usize,
    /// Stop once the gradient norm falls below this, measured in variables
    /// scaled by the starting curvature (roughly: offsets in units of the
    /// one-sigma error).
    pub gtol: f64,
    /// Stop once successive objective values differ by less than this; zero
    /// disables the test.
    pub ftol: f64,
    /// Correction pairs kept by L-BFGS.
    pub memory: usize,
}

impl Default for MinimizerConfig {
    fn default() -> Self {
        MinimizerConfig {
            max_iter: 200,
            gtol: 1e-6,
            ftol: 0.0,
            memory: 7,
        }
    }
}

/// L-BFGS with a More-Thuente line search, from the argmin crate.
///
/// The search runs in the variables `u = (x - x0) sqrt(|h|)`, where `h` is
/// the objective's diagonal curvature at the start (one where it has none),
/// so the first step is close to a Newton step. Bounds are honoured by
/// projecting every trial point onto them.
#[derive(Copy, Clone, Debug, Default)]
pub struct BoundedQuasiNewton {
    pub config: MinimizerConfig,
}

/// Scaled gradient norm below which a stalled search still counts as
/// converged: round-off dominates the gradient there.
const STALLED_GRADIENT: f64 = 1e-3;

impl BoundedQuasiNewton {
    pub fn new(config: MinimizerConfig) -> Self {
        BoundedQuasiNewton { config }
    }
}

/// Evaluation count and best point seen, shared with the argmin problem.
#[derive(Default)]
struct Tracker {
    nfev: Cell<usize>,
    best: RefCell<Option<(Vec<f64>, f64)>>,
}

/// An [`Objective`] in scaled, projected variables.
#[derive(Clone)]
struct ScaledProblem<'a> {
    objective: &'a dyn Objective,
    origin: Vec<f64>,
    scale: Vec<f64>,
    bounds: Vec<Bound>,
    tracker: &'a Tracker,
}

impl ScaledProblem<'_> {
    fn raw(&self, u: &[f64]) -> Vec<f64> {
        izip!(u, &self.origin, &self.scale)
            .map(|(u, x0, s)| x0 + u / s)
            .collect()
    }

    fn unscaled(&self, u: &[f64]) -> Vec<f64> {
        self.raw(u)
            .iter()
            .zip(&self.bounds)
            .map(|(&x, b)| b.project(x))
            .collect()
    }

    fn value(&self, x: &[f64]) -> f64 {
        let t = self.tracker;
        t.nfev.set(t.nfev.get() + 1);
        let f = self.objective.value(x);
        let mut best = t.best.borrow_mut();
        if f.is_finite() && best.as_ref().map_or(true, |(_, fb)| f < *fb) {
            *best = Some((x.to_vec(), f));
        }
        f
    }

    fn raw_gradient(&self, x: &[f64]) -> Vec<f64> {
        let t = self.tracker;
        if let Some(g) = self.objective.gradient(x) {
            t.nfev.set(t.nfev.get() + 1);
            return g;
        }
        let mut xp = x.to_vec();
        let g = (0..x.len())
            .map(|i| {
                let h = 1e-7 * (1.0 + x[i].abs());
                xp[i] = x[i] + h;
                let fp = self.objective.value(&xp);
                xp[i] = x[i] - h;
                let fm = self.objective.value(&xp);
                xp[i] = x[i];
                (fp - fm) / (2.0 * h)
            })
            .collect();
        t.nfev.set(t.nfev.get() + 2 * x.len());
        g
    }

    /// Gradient in the scaled variables, zero along any coordinate held at a
    /// bound.
    fn scaled_gradient(&self, u: &[f64]) -> Vec<f64> {
        let raw = self.raw(u);
        let g = self.raw_gradient(&self.unscaled(u));
        izip!(raw, g, &self.scale, &self.bounds)
            .map(|(x, g, s, b)| {
                let below = b.lower.map_or(false, |lo| x < lo || (b.at_lower(x) && g > 0.0));
                let above = b.upper.map_or(false, |hi| x > hi || (b.at_upper(x) && g < 0.0));
                if below || above {
                    0.0
                } else {
                    g / s
                }
            })
            .collect()
    }

    fn scaled(&self, x: &[f64]) -> Vec<f64> {
        izip!(x, &self.origin, &self.scale)
            .map(|(x, x0, s)| (x - x0) * s)
            .collect()
    }
}

impl CostFunction for ScaledProblem<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, u: &Self::Param) -> std::result::Result<Self::Output, ArgminError> {
        Ok(self.value(&self.unscaled(u)))
    }
}

impl Gradient for ScaledProblem<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, u: &Self::Param) -> std::result::Result<Self::Gradient, ArgminError> {
        Ok(self.scaled_gradient(u))
    }
}

fn norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

impl NonlinearSolver for BoundedQuasiNewton {
    fn minimize(&self, objective: &dyn Objective, x0: &[f64], bounds: &[Bound]) -> Result<SolverOutcome> {
        let n = x0.len();
        if n == 0 {
            return Err(FittingError::InvalidInput("No parameters to minimise".to_string()));
        }
        let bounds: Vec<Bound> = if bounds.is_empty() {
            vec![Bound::UNBOUNDED; n]
        } else if bounds.len() == n {
            bounds.to_vec()
        } else {
            return Err(FittingError::ShapeMismatch(format!(
                "{} bounds for {} parameters",
                bounds.len(),
                n
            )));
        };
        let cfg = self.config;

        let origin: Vec<f64> = x0.iter().zip(&bounds).map(|(&v, b)| b.project(v)).collect();
        if !objective.value(&origin).is_finite() {
            return Err(FittingError::BadFit(format!(
                "Objective is not finite at the starting point {origin:?}"
            )));
        }
        let scale: Vec<f64> = match objective.curvature(&origin) {
            Some(c) if c.len() == n => c
                .iter()
                .map(|h| if h.is_finite() && *h != 0.0 { h.abs().sqrt() } else { 1.0 })
                .collect(),
            _ => vec![1.0; n],
        };
        let tracker = Tracker::default();
        let problem = ScaledProblem {
            objective,
            origin,
            scale,
            bounds,
            tracker: &tracker,
        };
        let u0 = vec![0.0; n];
        problem.value(&problem.unscaled(&u0));

        let solver = LBFGS::new(MoreThuenteLineSearch::new(), cfg.memory.max(1))
            .with_tolerance_grad(cfg.gtol)
            .and_then(|s| s.with_tolerance_cost(cfg.ftol))
            .map_err(|e| FittingError::Solver(format!("Invalid L-BFGS settings: {e}")))?;
        let run = Executor::new(problem.clone(), solver)
            .configure(|state| state.param(u0).max_iters(cfg.max_iter as u64))
            .run();

        let (x, fun) = tracker
            .best
            .borrow()
            .clone()
            .unwrap_or_else(|| (problem.origin.clone(), f64::NAN));
        let grad_norm = norm(&problem.scaled_gradient(&problem.scaled(&x)));
        let (status, niter, nfev) = match run {
            Ok(result) => {
                let state = result.state();
                let counts = state.get_func_counts();
                let nfev = ["cost_count", "gradient_count"]
                    .iter()
                    .filter_map(|k| counts.get(*k))
                    .sum::<u64>();
                let status = match state.get_termination_reason() {
                    Some(TerminationReason::SolverConverged) if grad_norm <= cfg.gtol => {
                        SolverStatus::GradientConverged
                    }
                    Some(TerminationReason::SolverConverged) | Some(TerminationReason::TargetCostReached) => {
                        SolverStatus::FunctionConverged
                    }
                    _ if grad_norm <= STALLED_GRADIENT => SolverStatus::FunctionConverged,
                    Some(TerminationReason::MaxItersReached) => SolverStatus::MaxIterations,
                    _ => SolverStatus::LineSearchFailed,
                };
                (status, state.get_iter() as usize, nfev as usize)
            }
            Err(e) => {
                debug!("L-BFGS stopped early: {e}");
                let status = if grad_norm <= STALLED_GRADIENT {
                    SolverStatus::FunctionConverged
                } else {
                    SolverStatus::LineSearchFailed
                };
                (status, 0, tracker.nfev.get())
            }
        };

        let xerror = objective
            .curvature(&x)
            .map(|c| c.iter().map(|h| h.powf(-0.5)).collect());
        debug!("L-BFGS stopped after {niter} iterations ({nfev} evaluations): {status:?}");
        Ok(SolverOutcome {
            x,
            fun,
            nfev,
            niter,
            status,
            xerror,
        })
    }
}

#[derive(Copy, Clone, Debug)]
pub struct LevMarConfig {
    pub ftol: f64,
    pub xtol: f64,
    pub gtol: f64,
    pub max_iter: usize,
    pub max_fev: usize,
}

impl Default for LevMarConfig {
    fn default() -> Self {
        LevMarConfig {
            ftol: 1e-10,
            xtol: 1e-10,
            gtol: 1e-10,
            max_iter: 200,
            max_fev: 0,
        }
    }
}

/// Levenberg-Marquardt solver using the rmpfit crate
#[derive(Copy, Clone, Debug, Default)]
pub struct LevMar {
    pub config: LevMarConfig,
}

impl LevMar {
    pub fn new(config: LevMarConfig) -> Self {
        LevMar { config }
    }
}

/// Bridges a [`ResidualProblem`] onto rmpfit's fitter trait.
struct MpfitProblem<'a> {
    problem: &'a dyn ResidualProblem,
    config: LevMarConfig,
    params: Vec<MPPar>,
}

impl MPFitter for MpfitProblem<'_> {
    fn eval(&mut self, params: &[f64], deviates: &mut [f64]) -> MPResult<()> {
        self.problem.residuals(params, deviates);
        Ok(())
    }

    fn number_of_points(&self) -> usize {
        self.problem.num_residuals()
    }

    fn config(&self) -> MPConfig {
        MPConfig {
            ftol: self.config.ftol,
            xtol: self.config.xtol,
            gtol: self.config.gtol,
            max_iter: self.config.max_iter,
            max_fev: self.config.max_fev,
            no_finite_check: false,
            ..Default::default()
        }
    }

    fn parameters(&self) -> Option<&[MPPar]> {
        Some(&*self.params)
    }
}

impl LeastSquaresSolver for LevMar {
    fn solve(&self, problem: &dyn ResidualProblem, table: &ParameterTable) -> Result<SolverOutcome> {
        if table.num_varying() == 0 {
            return Err(FittingError::InvalidInput("No free parameters to fit".to_string()));
        }
        let params: Vec<MPPar> = table
            .iter()
            .map(|p| MPPar {
                fixed: !p.vary,
                limited_low: p.lower.is_some(),
                limit_low: p.lower.unwrap_or(0.0),
                limited_up: p.upper.is_some(),
                limit_up: p.upper.unwrap_or(0.0),
                ..Default::default()
            })
            .collect();
        let mut fitter = MpfitProblem {
            problem,
            config: self.config,
            params,
        };
        let mut x: Vec<f64> = table.iter().map(|p| p.clamped()).collect();
        let result = fitter
            .mpfit(&mut x)
            .map_err(|e| FittingError::Solver(format!("Error with MPFit: {e}")))?;

        let status = match result.success {
            MPSuccess::Chi | MPSuccess::Both | MPSuccess::Ftol => SolverStatus::FunctionConverged,
            MPSuccess::Par | MPSuccess::Xtol => SolverStatus::StepConverged,
            MPSuccess::Dir | MPSuccess::Gtol => SolverStatus::GradientConverged,
            MPSuccess::MaxIter => SolverStatus::MaxIterations,
            _ => SolverStatus::LineSearchFailed,
        };
        debug!(
            "MPFit stopped after {} iterations ({} evaluations): {:?}",
            result.n_iter, result.n_fev, status
        );
        Ok(SolverOutcome {
            x,
            fun: result.best_norm,
            nfev: result.n_fev,
            niter: result.n_iter,
            status,
            xerror: Some(result.xerror.clone()),
        })
    }
}
