//! Iterative co-addition of observations into a template portrait.
use crate::fitting::common::error::FittingError;
use crate::fitting::common::solver::{BoundedQuasiNewton, NonlinearSolver};
use crate::fitting::harmonic::fitstruct::FitResult;
use crate::fitting::harmonic::harmonic::{wrap_phase, HarmonicAligner, HarmonicConfig};
use crate::utils::noise::NoiseEstimator;
use crate::utils::portrait::{guess_fit_freq, rotate_portrait, Dispersion, Observation, Portrait};
use itertools::izip;
use log::{debug, info, warn};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

type Result<T> = std::result::Result<T, FittingError>;

/// When to stop re-templating.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Termination {
    /// A fixed number of passes over the observations.
    Iterations(usize),
    /// Stop once the new template no longer moves relative to the previous
    /// one by more than `efac` times the fitted uncertainties.
    Converged { max_iter: usize, efac: f64 },
}

#[derive(Copy, Clone, Debug)]
pub struct AlignConfig {
    pub termination: Termination,
    /// Reference frequency [MHz] of every fit; if `None`, chosen per
    /// observation to decorrelate phase and DM.
    pub nu_ref: Option<f64>,
    /// Offsets below these [rot, pc cm**-3] count as converged whatever their
    /// fitted uncertainty.
    pub phase_floor: f64,
    pub dm_floor: f64,
    pub harmonic: HarmonicConfig,
}

impl Default for AlignConfig {
    fn default() -> Self {
        AlignConfig {
            termination: Termination::Iterations(1),
            nu_ref: None,
            phase_floor: 1e-8,
            dm_floor: 1e-6,
            harmonic: HarmonicConfig::default(),
        }
    }
}

/// Running weighted sum of aligned observations.
#[derive(Clone, Debug)]
pub struct AlignmentState {
    pub sum: Array2<f64>,
    /// Accumulated weight of every sample; constant along each channel.
    pub weights: Array2<f64>,
}

impl AlignmentState {
    pub fn new(nchan: usize, nbin: usize) -> Self {
        AlignmentState {
            sum: Array2::zeros((nchan, nbin)),
            weights: Array2::zeros((nchan, nbin)),
        }
    }

    /// Adds `rows` of aligned data into `channels`, each weighted by its
    /// entry in `weights`.
    pub fn accumulate(&mut self, channels: &[usize], rows: ArrayView2<f64>, weights: &Array1<f64>) {
        for (&ichan, row, &w) in izip!(channels, rows.axis_iter(Axis(0)), weights) {
            self.sum.row_mut(ichan).scaled_add(w, &row);
            self.weights.row_mut(ichan).mapv_inplace(|x| x + w);
        }
    }

    /// The weighted mean of `template`'s shape. Channels that received no
    /// weight keep their previous data and are masked out.
    pub fn normalize(self, template: &Portrait) -> Portrait {
        let mut next = template.clone();
        for (ichan, (sum, weights)) in self
            .sum
            .axis_iter(Axis(0))
            .zip(self.weights.axis_iter(Axis(0)))
            .enumerate()
        {
            let w = weights[0];
            if w > 0.0 && w.is_finite() {
                next.data.row_mut(ichan).assign(&(&sum / w));
            } else {
                next.mask[ichan] = false;
            }
        }
        next.noise = NoiseEstimator::default().channels(next.data.view());
        next
    }
}

/// Result of fitting one observation against the template.
#[derive(Clone, Debug)]
pub struct ObservationFit {
    pub fit: FitResult,
    /// Template channels the fit used.
    pub channels: Vec<usize>,
    /// The fitted channels rotated into alignment with the template.
    pub aligned: Array2<f64>,
    /// `scale / noise**2` of each fitted channel.
    pub weights: Array1<f64>,
}

#[derive(Clone, Debug)]
pub struct AlignmentOutcome {
    pub template: Portrait,
    /// Fits of the final pass, `None` for observations that were skipped.
    pub fits: Vec<Option<FitResult>>,
    /// Observations with no valid channel in the final pass.
    pub skipped: Vec<usize>,
    pub iterations: usize,
    /// Always `true` for a fixed number of iterations.
    pub converged: bool,
}

/// Builds a template by repeatedly aligning observations against it and
/// averaging them.
#[derive(Clone, Debug)]
pub struct PortraitAligner<S = BoundedQuasiNewton> {
    pub config: AlignConfig,
    aligner: HarmonicAligner<S>,
}

impl PortraitAligner<BoundedQuasiNewton> {
    pub fn new(config: AlignConfig) -> Self {
        PortraitAligner {
            aligner: HarmonicAligner::new(config.harmonic),
            config,
        }
    }
}

impl Default for PortraitAligner<BoundedQuasiNewton> {
    fn default() -> Self {
        PortraitAligner::new(AlignConfig::default())
    }
}

/// The channel-by-channel sum of all observations, a typical first template.
///
/// # Errors
/// Will return `Err` if there are no observations or their shapes differ.
pub fn direct_sum<O: Observation>(observations: &[O]) -> Result<Portrait> {
    let first = observations
        .first()
        .ok_or_else(|| FittingError::InvalidInput("No observations to sum".to_string()))?;
    let mut sum = first.get_samples().to_owned();
    let mut mask = first.get_mask().to_owned();
    for obs in &observations[1..] {
        if obs.get_samples().dim() != sum.dim() {
            return Err(FittingError::ShapeMismatch(format!(
                "observation of shape {:?} cannot be summed with {:?}",
                obs.get_samples().dim(),
                sum.dim()
            )));
        }
        sum += &obs.get_samples();
        mask.zip_mut_with(&obs.get_mask(), |a, &b| *a |= b);
    }
    Portrait::new(sum, first.get_channels().to_owned(), first.get_period())?.with_mask(mask)
}

impl<S: NonlinearSolver + Sync> PortraitAligner<S> {
    pub fn with_solver(config: AlignConfig, solver: S) -> Self {
        PortraitAligner {
            aligner: HarmonicAligner::with_solver(config.harmonic, solver),
            config,
        }
    }

    pub fn harmonic_aligner(&self) -> &HarmonicAligner<S> {
        &self.aligner
    }

    /// Fits one observation against `template` and rotates its data into
    /// alignment. Returns `None` if no channel is valid in both.
    ///
    /// # Errors
    /// Will return `Err` if the observation and template differ in shape.
    pub fn fit_observation<O: Observation>(&self, template: &Portrait, obs: &O) -> Result<Option<ObservationFit>> {
        let samples = obs.get_samples();
        if samples.dim() != template.data.dim() {
            return Err(FittingError::ShapeMismatch(format!(
                "observation of shape {:?} against template of shape {:?}",
                samples.dim(),
                template.data.dim()
            )));
        }
        let obs_mask = obs.get_mask();
        let channels: Vec<usize> = (0..template.nchan())
            .filter(|&i| obs_mask[i] && template.mask[i])
            .collect();
        if channels.is_empty() {
            return Ok(None);
        }
        let period = obs.get_period();
        let noise = obs.get_noise().select(Axis(0), &channels);
        let data = samples.select(Axis(0), &channels);
        let model = template.data.select(Axis(0), &channels);
        let freqs = obs.get_channels().select(Axis(0), &channels);

        let nu_fit = match self.config.nu_ref {
            Some(nu) => nu,
            None => {
                let snrs: Array1<f64> = data
                    .axis_iter(Axis(0))
                    .zip(noise.iter())
                    .map(|(row, &sigma)| row.fold(0.0_f64, |a, &b| a.max(b)) / sigma)
                    .collect();
                guess_fit_freq(freqs.view(), snrs.view())
            }
        };

        let dm_guess = obs.get_dm();
        let dedispersed = rotate_portrait(
            data.view(),
            0.0,
            Some(&Dispersion::new(dm_guess, period, freqs.view(), nu_fit).with_constant(self.config.harmonic.dispersion_constant)),
        );
        let mean_data = dedispersed.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(data.ncols()));
        let mean_model = model.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(data.ncols()));
        let phase_guess = self
            .aligner
            .fit_phase_shift(mean_data.view(), mean_model.view(), None)?
            .phase;

        let fit = if data.nrows() == 1 {
            self.aligner
                .fit_single_channel(data.row(0), model.row(0), dm_guess, freqs[0], Some(noise[0]))?
        } else {
            self.aligner
                .fit_portrait(data.view(), model.view(), [phase_guess, dm_guess], period, freqs.view(), nu_fit)?
        };
        let aligned = rotate_portrait(
            data.view(),
            fit.phase,
            Some(&Dispersion::new(fit.dm, period, freqs.view(), fit.nu_ref).with_constant(self.config.harmonic.dispersion_constant)),
        );
        let weights: Array1<f64> = fit
            .scales
            .iter()
            .zip(noise.iter())
            .map(|(&s, &sigma)| if sigma > 0.0 { s / (sigma * sigma) } else { 0.0 })
            .collect();
        Ok(Some(ObservationFit {
            fit,
            channels,
            aligned,
            weights,
        }))
    }

    /// Adds the fits of one pass to a fresh state, in observation order.
    fn accumulate(
        &self,
        template: &Portrait,
        results: Vec<Option<ObservationFit>>,
    ) -> (Portrait, Vec<Option<FitResult>>, Vec<usize>) {
        let mut state = AlignmentState::new(template.nchan(), template.nbin());
        let mut fits = Vec::with_capacity(results.len());
        let mut skipped = vec![];
        for (iobs, result) in results.into_iter().enumerate() {
            match result {
                Some(r) => {
                    if !r.fit.is_success() {
                        warn!("Observation {iobs}: fit returned code {}", r.fit.return_code());
                    }
                    state.accumulate(&r.channels, r.aligned.view(), &r.weights);
                    fits.push(Some(r.fit));
                }
                None => {
                    warn!("Observation {iobs} has no valid channels; skipping");
                    skipped.push(iobs);
                    fits.push(None);
                }
            }
        }
        (state.normalize(template), fits, skipped)
    }

    /// Whether `next` sits on `previous` within the fitted uncertainties.
    fn has_converged(&self, next: &Portrait, previous: &Portrait, efac: f64) -> Result<bool> {
        let fit = match self.fit_observation(previous, next)? {
            Some(f) => f.fit,
            None => return Ok(false),
        };
        let phase = wrap_phase(fit.phase).abs();
        let phase_ok = phase < fit.phase_err * efac || phase < self.config.phase_floor;
        let dm_ok = fit.dm.abs() < fit.dm_err * efac || fit.dm.abs() < self.config.dm_floor;
        debug!(
            "Template moved by {:.3e} +/- {:.2e} rot, DM {:.3e} +/- {:.2e}",
            phase, fit.phase_err, fit.dm, fit.dm_err
        );
        Ok(phase_ok && dm_ok)
    }

    fn run<F>(&self, initial: Portrait, mut pass: F) -> Result<AlignmentOutcome>
    where
        F: FnMut(&Portrait) -> Result<Vec<Option<ObservationFit>>>,
    {
        let (max_iter, efac) = match self.config.termination {
            Termination::Iterations(n) => (n, None),
            Termination::Converged { max_iter, efac } => (max_iter, Some(efac)),
        };
        let mut template = initial;
        let mut fits = vec![];
        let mut skipped = vec![];
        let mut converged = efac.is_none();
        let mut iterations = 0;
        while iterations < max_iter {
            let results = pass(&template)?;
            let (next, pass_fits, pass_skipped) = self.accumulate(&template, results);
            iterations += 1;
            fits = pass_fits;
            skipped = pass_skipped;
            let done = match efac {
                Some(efac) => self.has_converged(&next, &template, efac)?,
                None => false,
            };
            template = next;
            info!("Alignment iteration {iterations}: {} observations skipped", skipped.len());
            if done {
                converged = true;
                break;
            }
        }
        if !converged {
            warn!("Template did not converge after {iterations} iterations");
        }
        Ok(AlignmentOutcome {
            template,
            fits,
            skipped,
            iterations,
            converged,
        })
    }

    /// Aligns and averages `observations`, starting from `initial`.
    ///
    /// # Errors
    /// Will return `Err` if any observation differs in shape from the
    /// template, or if a fit is rejected.
    pub fn align<O: Observation>(&self, observations: &[O], initial: Portrait) -> Result<AlignmentOutcome> {
        self.run(initial, |template| {
            let mut results = vec![];
            for obs in observations {
                results.push(self.fit_observation(template, obs)?);
            }
            Ok(results)
        })
    }

    /// As [`PortraitAligner::align`], fitting the observations of each pass
    /// in parallel. They are accumulated in input order, so the template is
    /// the same as the sequential one.
    ///
    /// # Errors
    /// Will return `Err` if any observation differs in shape from the
    /// template, or if a fit is rejected.
    pub fn par_align<O: Observation + Sync>(&self, observations: &[O], initial: Portrait) -> Result<AlignmentOutcome> {
        self.run(initial, |template| {
            let results: Vec<Result<Option<ObservationFit>>> = observations
                .par_iter()
                .map(|obs| self.fit_observation(template, obs))
                .collect();
            results.into_iter().collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fitting::common::solver::SolverStatus;
    use crate::models::gaussian::{GaussianComponent, GaussianModel, ProfileOptions};
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn original() -> Portrait {
        let freqs = Array1::linspace(1200.0, 1600.0, 8);
        let data = GaussianModel::new("psr", 1400.0, 0.0)
            .with_component(GaussianComponent::new(0.3, 0.05, 1.0))
            .portrait(128, freqs.view(), &ProfileOptions::default());
        Portrait::new(data, freqs, 0.01).unwrap()
    }

    #[test]
    fn state_accumulates_weighted_rows() {
        let mut state = AlignmentState::new(3, 4);
        let rows = Array2::from_elem((2, 4), 2.0);
        state.accumulate(&[0, 2], rows.view(), &Array1::from(vec![1.0, 3.0]));
        state.accumulate(&[0], Array2::from_elem((1, 4), 4.0).view(), &Array1::from(vec![1.0]));
        let template = Portrait::new(Array2::from_elem((3, 4), 7.0), Array1::linspace(1.0, 3.0, 3), 1.0).unwrap();
        let next = state.normalize(&template);
        assert_eq!(next.data.row(0).to_vec(), vec![3.0; 4]);
        assert_eq!(next.data.row(1).to_vec(), vec![7.0; 4]);
        assert_eq!(next.data.row(2).to_vec(), vec![2.0; 4]);
        assert_eq!(next.mask.to_vec(), vec![true, false, true]);
    }

    #[test]
    fn masked_observation_is_skipped() {
        let template = original();
        let mut dead = template.clone();
        dead.mask.fill(false);
        let aligner = PortraitAligner::default();
        let outcome = aligner.align(&[template.clone(), dead], template.clone()).unwrap();
        assert_eq!(outcome.skipped, vec![1]);
        assert!(outcome.fits[0].is_some());
        assert!(outcome.fits[1].is_none());
        for (a, b) in outcome.template.data.iter().zip(template.data.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-8);
        }
    }

    #[test]
    fn single_channel_uses_channel_noise() {
        let template = original();
        let shifted = rotate_portrait(template.data.view(), -0.04, None);
        let mut rng = StdRng::seed_from_u64(21);
        let normal = Normal::new(0.0, 0.05).unwrap();
        let data = shifted.mapv(|x| x + normal.sample(&mut rng));
        let mut obs = Portrait::new(data, template.freqs.clone(), 0.01)
            .unwrap()
            .with_noise(Array1::from_elem(8, 0.05))
            .unwrap();
        obs.mask.fill(false);
        obs.mask[3] = true;

        let aligner = PortraitAligner::default();
        let fitted = aligner.fit_observation(&template, &obs).unwrap().unwrap();
        assert_eq!(fitted.channels, vec![3]);
        assert_eq!(fitted.fit.status, SolverStatus::SingleChannel);
        assert_eq!(fitted.fit.nu_ref, template.freqs[3]);
        let expected = aligner
            .harmonic_aligner()
            .fit_phase_shift(obs.data.row(3), template.data.row(3), Some(0.05))
            .unwrap();
        assert_eq!(fitted.fit.phase, expected.phase);
        assert_eq!(fitted.fit.phase_err, expected.phase_err);
        assert_abs_diff_eq!(fitted.fit.phase, 0.04, epsilon = 5.0 * expected.phase_err);
    }

    #[test]
    fn shape_mismatch_is_fatal() {
        let template = original();
        let short = Portrait::new(
            template.data.slice(ndarray::s![..4, ..]).to_owned(),
            template.freqs.slice(ndarray::s![..4]).to_owned(),
            0.01,
        )
        .unwrap();
        assert!(matches!(
            PortraitAligner::default().align(&[short], template),
            Err(FittingError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn parallel_matches_sequential() {
        let template = original();
        let observations: Vec<Portrait> = [0.01, -0.02, 0.03]
            .iter()
            .map(|&shift| {
                let mut p = template.clone();
                p.rotate(-shift, 0.0, 1400.0);
                p
            })
            .collect();
        let aligner = PortraitAligner::new(AlignConfig {
            termination: Termination::Iterations(2),
            ..Default::default()
        });
        let seq = aligner.align(&observations, direct_sum(&observations).unwrap()).unwrap();
        let par = aligner.par_align(&observations, direct_sum(&observations).unwrap()).unwrap();
        assert_eq!(seq.iterations, 2);
        assert_eq!(seq.template.data, par.template.data);
    }
}
