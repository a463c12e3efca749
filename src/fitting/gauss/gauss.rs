//! Least-squares fits of Gaussian mixtures and power-law spectra.
use crate::fitting::common::error::FittingError;
use crate::fitting::common::fitstruct::{Parameter, ParameterRole, ParameterTable};
use crate::fitting::common::solver::{LeastSquaresSolver, LevMar, LevMarConfig, ResidualProblem, SolverOutcome};
use crate::fitting::gauss::fitstruct::{ComponentFit, GaussianPortraitFit, PowlawFit};
use crate::fitting::gauss::fitting::{PortraitProblem, PowlawProblem, ProfileProblem};
use crate::models::gaussian::{GaussianModel, ProfileOptions, Scattering, PROFILE_STRIDE};
use crate::models::join::{JoinBand, JoinParameters, JoinTable};
use crate::utils::constants::SCATTERING_INDEX;
use crate::utils::fft::HarmonicTransform;
use log::{debug, warn};
use ndarray::{ArrayView1, ArrayView2};

type Result<T> = std::result::Result<T, FittingError>;

/// Which parameters of a `1 + 3n` profile fit vary, and its scattering.
#[derive(Clone, Debug, Default)]
pub struct ProfileFitFlags {
    /// Vary flag per `[dc, (loc, wid, amp) * n]` entry; all vary if `None`.
    pub vary: Option<Vec<bool>>,
    /// Scattering timescale [rot]; applied when non-zero or fitted.
    pub tau: f64,
    pub fit_scattering: bool,
}

/// Which frequency-evolution parameters of a portrait fit are held fixed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PortraitFitFlags {
    /// Hold every location slope.
    pub fix_loc: bool,
    /// Hold every width slope.
    pub fix_wid: bool,
    /// Hold every amplitude index.
    pub fix_amp: bool,
    /// Hold only the first component's location slope, freeing the others.
    pub fiducial: bool,
    pub fit_scattering: bool,
    pub fit_scattering_index: bool,
}

fn check_errs(errs: ArrayView1<f64>, expected: usize) -> Result<()> {
    if errs.len() != expected {
        return Err(FittingError::ShapeMismatch(format!(
            "{} uncertainties for {} data points",
            errs.len(),
            expected
        )));
    }
    if errs.iter().any(|&e| e <= 0.0 || !e.is_finite()) {
        return Err(FittingError::InvalidInput("Uncertainties must be positive".to_string()));
    }
    Ok(())
}

/// Gathers residuals and scales the standard errors by `sqrt(chi2 / dof)`.
fn finish(mut table: ParameterTable, problem: &dyn ResidualProblem, outcome: SolverOutcome) -> ComponentFit {
    let mut residuals = vec![0.0; problem.num_residuals()];
    problem.residuals(&outcome.x, &mut residuals);
    let chi2: f64 = residuals.iter().map(|r| r * r).sum();
    let dof = residuals.len().saturating_sub(table.num_varying());
    let scale = if dof > 0 { (chi2 / dof as f64).sqrt() } else { 1.0 };
    let errs: Vec<f64> = match outcome.xerror {
        Some(e) => e.iter().map(|e| e * scale).collect(),
        None => vec![0.0; table.len()],
    };
    table.update(&outcome.x, Some(&errs));
    if !outcome.status.is_success() {
        warn!(
            "Least-squares fit did not converge after {} evaluations: {:?}",
            outcome.nfev, outcome.status
        );
    }
    debug!("Least-squares fit: chi2 {chi2:.4} for {dof} degrees of freedom\n{table}");
    ComponentFit {
        params: table,
        chi2,
        dof,
        residuals: residuals.into(),
        nfev: outcome.nfev,
        status: outcome.status,
    }
}

/// Fits Gaussian mixtures and power laws by nonlinear least squares.
#[derive(Clone, Debug, Default)]
pub struct NonlinearComponentFitter<L = LevMar> {
    solver: L,
    pub options: ProfileOptions,
}

impl NonlinearComponentFitter<LevMar> {
    pub fn new(config: LevMarConfig) -> Self {
        NonlinearComponentFitter {
            solver: LevMar::new(config),
            options: ProfileOptions::default(),
        }
    }
}

impl<L: LeastSquaresSolver> NonlinearComponentFitter<L> {
    pub fn with_solver(solver: L) -> Self {
        NonlinearComponentFitter {
            solver,
            options: ProfileOptions::default(),
        }
    }

    /// Fits `[dc, (loc, wid, amp) * n]` to a profile with per-sample
    /// uncertainties `errs`. Widths and amplitudes are bounded below by zero;
    /// a fitted scattering timescale is appended to the parameters.
    ///
    /// # Errors
    /// Will return `Err` if the parameter layout, the flags or `errs` do not
    /// match the data, or if the solver rejects the problem.
    pub fn fit_gaussian_profile<'a>(
        &self,
        data: ArrayView1<'a, f64>,
        init_params: &[f64],
        errs: ArrayView1<'a, f64>,
        flags: &ProfileFitFlags,
    ) -> Result<ComponentFit> {
        check_errs(errs, data.len())?;
        let model = GaussianModel::from_profile_params("", 1.0, init_params)?;
        let ngauss = model.ngauss();
        let vary = match &flags.vary {
            Some(v) if v.len() != init_params.len() => {
                return Err(FittingError::ShapeMismatch(format!(
                    "{} vary flags for {} parameters",
                    v.len(),
                    init_params.len()
                )))
            }
            Some(v) => v.clone(),
            None => vec![true; init_params.len()],
        };

        let mut table = ParameterTable::new();
        table.push(Parameter::new(ParameterRole::Dc, None, init_params[0]).vary(vary[0]));
        for igauss in 0..ngauss {
            let i = 1 + igauss * PROFILE_STRIDE;
            table.push(Parameter::new(ParameterRole::Location, Some(igauss), init_params[i]).vary(vary[i]));
            table.push(
                Parameter::new(ParameterRole::Width, Some(igauss), init_params[i + 1])
                    .min(0.0)
                    .vary(vary[i + 1]),
            );
            table.push(
                Parameter::new(ParameterRole::Amplitude, Some(igauss), init_params[i + 2])
                    .min(0.0)
                    .vary(vary[i + 2]),
            );
        }
        let scattered = flags.fit_scattering || flags.tau != 0.0;
        if scattered {
            let tau = if flags.fit_scattering && flags.tau == 0.0 {
                // half a bin
                0.5 / data.len() as f64
            } else {
                flags.tau
            };
            table.push(
                Parameter::new(ParameterRole::ScatteringTime, None, tau)
                    .min(0.0)
                    .vary(flags.fit_scattering),
            );
        }

        let problem = ProfileProblem {
            data,
            errs,
            ngauss,
            scattered,
            options: self.options,
            plan: HarmonicTransform::new(data.len()),
        };
        let outcome = self.solver.solve(&problem, &table)?;
        Ok(finish(table, &problem, outcome))
    }

    /// Fits a frequency-evolving Gaussian model to a portrait whose channels
    /// have noise `errs`, starting from `init` (which also fixes the reference
    /// frequency).
    ///
    /// # Errors
    /// Will return `Err` if `errs` or `freqs` do not match the data, or if the
    /// solver rejects the problem.
    pub fn fit_gaussian_portrait<'a>(
        &self,
        data: ArrayView2<'a, f64>,
        errs: ArrayView1<'a, f64>,
        init: &GaussianModel,
        freqs: ArrayView1<'a, f64>,
        flags: &PortraitFitFlags,
    ) -> Result<GaussianPortraitFit> {
        self.fit_joined_portrait(data, errs, init, freqs, flags, 1.0, &[])
    }

    /// As [`fit_gaussian_portrait`](Self::fit_gaussian_portrait), for a
    /// portrait combined from several receiver bands. Each band's model rows
    /// are offset by its own phase and DM, fitted alongside the model and
    /// returned in [`GaussianPortraitFit::join`]. Hold one band's phase fixed
    /// or it is degenerate with the component locations.
    ///
    /// # Errors
    /// Will return `Err` if `errs` or `freqs` do not match the data, a band
    /// names a channel outside the portrait, or the solver rejects the
    /// problem.
    #[allow(clippy::too_many_arguments)]
    pub fn fit_joined_portrait<'a>(
        &self,
        data: ArrayView2<'a, f64>,
        errs: ArrayView1<'a, f64>,
        init: &GaussianModel,
        freqs: ArrayView1<'a, f64>,
        flags: &PortraitFitFlags,
        period: f64,
        bands: &'a [JoinBand],
    ) -> Result<GaussianPortraitFit> {
        check_errs(errs, data.nrows())?;
        if freqs.len() != data.nrows() {
            return Err(FittingError::ShapeMismatch(format!(
                "{} frequencies for {} channels",
                freqs.len(),
                data.nrows()
            )));
        }
        for band in bands {
            if let Some(&bad) = band.channels.iter().find(|&&i| i >= data.nrows()) {
                return Err(FittingError::ShapeMismatch(format!(
                    "band {} names channel {} of a {}-channel portrait",
                    band.name,
                    bad,
                    data.nrows()
                )));
            }
        }
        let ngauss = init.ngauss();

        let mut table = ParameterTable::new();
        table.push(Parameter::new(ParameterRole::Dc, None, init.dc));
        for (igauss, c) in init.components.iter().enumerate() {
            let vary_loc_slope = if flags.fiducial { igauss != 0 } else { !flags.fix_loc };
            table.push(Parameter::new(ParameterRole::Location, Some(igauss), c.loc));
            table.push(Parameter::new(ParameterRole::LocationSlope, Some(igauss), c.loc_slope).vary(vary_loc_slope));
            table.push(Parameter::new(ParameterRole::Width, Some(igauss), c.wid).min(0.0));
            table.push(Parameter::new(ParameterRole::WidthSlope, Some(igauss), c.wid_slope).vary(!flags.fix_wid));
            table.push(Parameter::new(ParameterRole::Amplitude, Some(igauss), c.amp).min(0.0));
            table.push(Parameter::new(ParameterRole::AmplitudeIndex, Some(igauss), c.amp_index).vary(!flags.fix_amp));
        }
        let scattering = match init.scattering {
            Some(s) if flags.fit_scattering && s.tau == 0.0 => Some(Scattering {
                tau: 0.5 / data.ncols() as f64,
                ..s
            }),
            Some(s) => Some(s),
            None if flags.fit_scattering => Some(Scattering {
                tau: 0.5 / data.ncols() as f64,
                index: SCATTERING_INDEX,
            }),
            None => None,
        };
        if let Some(s) = scattering {
            table.push(
                Parameter::new(ParameterRole::ScatteringTime, None, s.tau)
                    .min(0.0)
                    .vary(flags.fit_scattering),
            );
            table.push(Parameter::new(ParameterRole::ScatteringIndex, None, s.index).vary(flags.fit_scattering_index));
        }
        for (iband, band) in bands.iter().enumerate() {
            table.push(Parameter::new(ParameterRole::JoinPhase, Some(iband), band.params.phase).vary(band.fit_phase));
            table.push(Parameter::new(ParameterRole::JoinDm, Some(iband), band.params.dm).vary(band.fit_dm));
        }

        let problem = PortraitProblem {
            data,
            errs,
            freqs,
            nu_ref: init.nu_ref,
            ngauss,
            scattered: scattering.is_some(),
            options: self.options,
            period,
            join: bands,
        };
        let outcome = self.solver.solve(&problem, &table)?;
        let fit = finish(table, &problem, outcome);

        let mut model = problem.gaussian_model(&fit.fitted_params());
        model.name = init.name.clone();
        let mut model_errs = problem.gaussian_model(&fit.fit_errs());
        model_errs.name = init.name.clone();

        let values = fit.fitted_params();
        let errors = fit.fit_errs();
        let start = problem.join_start();
        let mut join = JoinTable::new();
        for (iband, band) in bands.iter().enumerate() {
            let i = start + 2 * iband;
            join.insert(
                &band.name,
                JoinParameters {
                    phase: values[i],
                    phase_err: errors[i],
                    dm: values[i + 1],
                    dm_err: errors[i + 1],
                },
            );
        }
        Ok(GaussianPortraitFit {
            model,
            model_errs,
            join,
            fit,
        })
    }

    /// Fits `A (nu / nu0)^alpha` to the valid channels of a flux spectrum.
    ///
    /// # Errors
    /// Will return `Err` if the inputs differ in length or fewer than two
    /// channels are valid.
    #[allow(clippy::too_many_arguments)]
    pub fn fit_powlaw(
        &self,
        data: ArrayView1<f64>,
        init: [f64; 2],
        errs: ArrayView1<f64>,
        mask: ArrayView1<bool>,
        freqs: ArrayView1<f64>,
        nu0: f64,
    ) -> Result<PowlawFit> {
        check_errs(errs, data.len())?;
        if mask.len() != data.len() || freqs.len() != data.len() {
            return Err(FittingError::ShapeMismatch(format!(
                "{} channels of data, {} mask entries and {} frequencies",
                data.len(),
                mask.len(),
                freqs.len()
            )));
        }
        let ok: Vec<usize> = (0..data.len()).filter(|&i| mask[i]).collect();
        if ok.len() < 2 {
            return Err(FittingError::InvalidInput(format!(
                "Cannot fit a power law to {} valid channels",
                ok.len()
            )));
        }
        let problem = PowlawProblem {
            freqs: ok.iter().map(|&i| freqs[i]).collect(),
            data: ok.iter().map(|&i| data[i]).collect(),
            errs: ok.iter().map(|&i| errs[i]).collect(),
            nu0,
        };
        let mut table = ParameterTable::new();
        table.push(Parameter::new(ParameterRole::PowerLawAmplitude, None, init[0]));
        table.push(Parameter::new(ParameterRole::PowerLawIndex, None, init[1]));
        let outcome = self.solver.solve(&problem, &table)?;
        let fit = finish(table, &problem, outcome);
        Ok(PowlawFit {
            amp: fit.params[0].value,
            amp_err: fit.params[0].stderr.unwrap_or(0.0),
            alpha: fit.params[1].value,
            alpha_err: fit.params[1].stderr.unwrap_or(0.0),
            fit,
        })
    }
}
