//! Joint phase/DM alignment of portraits in the harmonic domain.
use crate::fitting::common::error::FittingError;
use crate::fitting::common::solver::{BoundedQuasiNewton, MinimizerConfig, NonlinearSolver, Objective, SolverStatus};
use crate::fitting::harmonic::fitstruct::{FitResult, PhaseShiftResult};
use crate::fitting::harmonic::fitting::{scan_cross_correlation, PhaseObjective, PortraitObjective};
use crate::fitting::harmonic::preprocessing::{check_shapes, frequency_terms, prepare};
use crate::utils::constants::{DISPERSION_CONSTANT, NOISE_TAIL_FRACTION};
use crate::utils::fft::HarmonicTransform;
use log::{debug, warn};
use ndarray::{array, Array1, ArrayView1, ArrayView2, Axis};
use num_complex::Complex64;
use std::time::Instant;

type Result<T> = std::result::Result<T, FittingError>;

/// Default number of trial phases for the cross-correlation first guess.
pub const DEFAULT_NGUESS: usize = 1000;

#[derive(Copy, Clone, Debug)]
pub struct HarmonicConfig {
    /// Dispersion constant [MHz**2 cm**3 pc**-1 s].
    pub dispersion_constant: f64,
    /// The noise tail is the top `1 / tail_fraction` of the harmonics.
    pub tail_fraction: usize,
    /// Trial phases scanned by [`first_guess`].
    pub nguess: usize,
    pub minimizer: MinimizerConfig,
}

impl Default for HarmonicConfig {
    fn default() -> Self {
        HarmonicConfig {
            dispersion_constant: DISPERSION_CONSTANT,
            tail_fraction: NOISE_TAIL_FRACTION,
            nguess: DEFAULT_NGUESS,
            minimizer: MinimizerConfig::default(),
        }
    }
}

/// Wraps a phase [rot] into `[-0.5, 0.5)`.
pub fn wrap_phase(phase: f64) -> f64 {
    let p = phase.rem_euclid(1.0);
    if p >= 0.5 {
        p - 1.0
    } else {
        p
    }
}

/// Phase [rot] in `linspace(-0.5, 0.5, nguess)` that best aligns the
/// channel-summed `data` with the channel-summed `model`.
///
/// # Errors
/// Will return `Err` if `data` and `model` differ in shape.
pub fn first_guess(data: ArrayView2<f64>, model: ArrayView2<f64>, nguess: usize) -> Result<f64> {
    check_shapes(data, model, None)?;
    let plan = HarmonicTransform::new(data.ncols());
    let d = plan.forward(data.sum_axis(Axis(0)).view());
    let m = plan.forward(model.sum_axis(Axis(0)).view());
    let cross: Array1<Complex64> = d.iter().zip(m.iter()).map(|(d, m)| d * m.conj()).collect();
    let trials = Array1::linspace(-0.5, 0.5, nguess.max(1));
    Ok(scan_cross_correlation(cross.view(), data.ncols(), trials.view()))
}

/// Fits phase offsets, DMs and channel amplitudes of portraits against models.
#[derive(Clone, Debug)]
pub struct HarmonicAligner<S = BoundedQuasiNewton> {
    pub config: HarmonicConfig,
    solver: S,
}

impl HarmonicAligner<BoundedQuasiNewton> {
    pub fn new(config: HarmonicConfig) -> Self {
        HarmonicAligner {
            solver: BoundedQuasiNewton::new(config.minimizer),
            config,
        }
    }
}

impl Default for HarmonicAligner<BoundedQuasiNewton> {
    fn default() -> Self {
        HarmonicAligner::new(HarmonicConfig::default())
    }
}

impl<S: NonlinearSolver> HarmonicAligner<S> {
    pub fn with_solver(config: HarmonicConfig, solver: S) -> Self {
        HarmonicAligner { config, solver }
    }

    /// Jointly fits the phase and DM that align `data` with `model`, then the
    /// per-channel amplitude scales.
    ///
    /// `init` is the starting `[phase, dm]`. Positive results mean the data
    /// must be rotated to earlier phase to match the model. A fit that does
    /// not converge is still returned, with a non-success status.
    ///
    /// With a single channel the DM cannot be fitted: the phase comes from
    /// [`HarmonicAligner::fit_phase_shift`], the DM is the initial one with
    /// zero error and the status is [`SolverStatus::SingleChannel`].
    ///
    /// # Errors
    /// Will return `Err` if the shapes of `data`, `model` and `freqs` disagree,
    /// or if the period is not positive.
    pub fn fit_portrait(
        &self,
        data: ArrayView2<f64>,
        model: ArrayView2<f64>,
        init: [f64; 2],
        period: f64,
        freqs: ArrayView1<f64>,
        nu_ref: f64,
    ) -> Result<FitResult> {
        let start = Instant::now();
        check_shapes(data, model, Some(freqs))?;
        if period <= 0.0 || !period.is_finite() {
            return Err(FittingError::InvalidInput(format!("Invalid period {period}")));
        }
        if data.nrows() == 1 {
            return self.fit_single_channel(data.row(0), model.row(0), init[1], freqs[0], None);
        }

        let harmonics = prepare(data, model, self.config.tail_fraction, None);
        let terms = frequency_terms(freqs, nu_ref);
        let objective = PortraitObjective::new(&harmonics, terms.view(), self.config.dispersion_constant / period);
        let outcome = self.solver.minimize(&objective, &init, &[])?;
        if !outcome.status.is_success() {
            warn!("Fit failed. Return code is {}", outcome.status.code());
        }

        let (phase, dm) = (outcome.x[0], outcome.x[1]);
        let errs: Vec<f64> = objective
            .curvature(&outcome.x)
            .unwrap_or_else(|| vec![f64::NAN; 2])
            .iter()
            .map(|c| c.powf(-0.5))
            .collect();
        let (nchan, nbin) = data.dim();
        let dof = (nchan * nbin) as f64 - (nchan + 2) as f64;
        let red_chi2 = (objective.data_power() + outcome.fun) / dof;
        debug!(
            "Portrait fit: phase {:.8} +/- {:.2e} rot, DM {:.6e} +/- {:.2e}, red. chi2 {:.3}, {} evaluations",
            phase, errs[0], dm, errs[1], red_chi2, outcome.nfev
        );

        Ok(FitResult {
            phase,
            phase_err: errs[0],
            dm,
            dm_err: errs[1],
            nu_ref,
            scales: objective.scales(phase, dm),
            scale_errs: objective.scale_errors(),
            nfeval: outcome.nfev,
            status: outcome.status,
            red_chi2,
            duration: start.elapsed(),
        })
    }

    /// The one-channel form of [`HarmonicAligner::fit_portrait`]: the phase
    /// and scale of a single profile, with the DM held at `dm`. `noise` is
    /// passed on to [`HarmonicAligner::fit_phase_shift`].
    ///
    /// # Errors
    /// Will return `Err` if the profiles differ in length.
    pub fn fit_single_channel(
        &self,
        data: ArrayView1<f64>,
        model: ArrayView1<f64>,
        dm: f64,
        freq: f64,
        noise: Option<f64>,
    ) -> Result<FitResult> {
        let start = Instant::now();
        let shift = self.fit_phase_shift(data, model, noise)?;
        debug!("Single-channel fit: phase {:.6e} +/- {:.2e}", shift.phase, shift.phase_err);
        Ok(FitResult {
            phase: shift.phase,
            phase_err: shift.phase_err,
            dm,
            dm_err: 0.0,
            nu_ref: freq,
            scales: array![shift.scale],
            scale_errs: array![shift.scale_err],
            nfeval: 0,
            status: SolverStatus::SingleChannel,
            red_chi2: shift.red_chi2,
            duration: start.elapsed(),
        })
    }

    /// Fits the rotation and amplitude that align profile `data` with `model`.
    ///
    /// `noise` is the standard deviation of the data samples; the harmonic
    /// tail estimate is used without it.
    ///
    /// # Errors
    /// Will return `Err` if the profiles differ in length.
    pub fn fit_phase_shift(
        &self,
        data: ArrayView1<f64>,
        model: ArrayView1<f64>,
        noise: Option<f64>,
    ) -> Result<PhaseShiftResult> {
        let start = Instant::now();
        let data = data.insert_axis(Axis(0));
        let model = model.insert_axis(Axis(0));
        check_shapes(data, model, None)?;
        let nbin = data.ncols();

        // white noise of std s has harmonics whose real parts have variance N s² / 2
        let precision = noise.map(|s| array![2.0 / (nbin as f64 * s * s)]);
        let harmonics = prepare(data, model, self.config.tail_fraction, precision.as_ref().map(|p| p.view()));
        let guess = scan_cross_correlation(
            harmonics.cross.row(0),
            nbin,
            Array1::linspace(-0.5, 0.5, self.config.nguess.max(1)).view(),
        );
        let terms = Array1::zeros(1);
        let objective = PhaseObjective(PortraitObjective::new(&harmonics, terms.view(), 0.0));
        let outcome = self.solver.minimize(&objective, &[guess], &[])?;
        if !outcome.status.is_success() {
            warn!("Phase-shift fit failed. Return code is {}", outcome.status.code());
        }
        let phase = outcome.x[0];
        let phase_err = objective
            .curvature(&outcome.x)
            .map_or(f64::NAN, |c| c[0].powf(-0.5));
        let red_chi2 = (objective.0.data_power() + outcome.fun) / (nbin as f64 - 2.0);

        Ok(PhaseShiftResult {
            phase,
            phase_err,
            scale: objective.0.scales(phase, 0.0)[0],
            scale_err: objective.0.scale_errors()[0],
            nfeval: outcome.nfev,
            status: outcome.status,
            red_chi2,
            duration: start.elapsed(),
        })
    }

    /// See [`first_guess`].
    ///
    /// # Errors
    /// Will return `Err` if `data` and `model` differ in shape.
    pub fn first_guess(&self, data: ArrayView2<f64>, model: ArrayView2<f64>) -> Result<f64> {
        first_guess(data, model, self.config.nguess)
    }

    /// Closed-form per-channel amplitudes of `data` relative to `model` after
    /// rotating by `phase` and `dm`.
    ///
    /// # Errors
    /// Will return `Err` if the shapes of `data`, `model` and `freqs` disagree.
    #[allow(clippy::too_many_arguments)]
    pub fn get_scales(
        &self,
        data: ArrayView2<f64>,
        model: ArrayView2<f64>,
        phase: f64,
        dm: f64,
        period: f64,
        freqs: ArrayView1<f64>,
        nu_ref: f64,
    ) -> Result<Array1<f64>> {
        check_shapes(data, model, Some(freqs))?;
        let harmonics = prepare(data, model, self.config.tail_fraction, None);
        let terms = frequency_terms(freqs, nu_ref);
        let objective = PortraitObjective::new(&harmonics, terms.view(), self.config.dispersion_constant / period);
        Ok(objective.scales(phase, dm))
    }
}
