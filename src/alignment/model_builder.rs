//! Iterative Gaussian modelling of a portrait: fit the model, measure how far
//! the data sit from it, rotate the data and fit again until they agree.
use crate::fitting::common::error::FittingError;
use crate::fitting::gauss::fitstruct::GaussianPortraitFit;
use crate::fitting::gauss::gauss::{NonlinearComponentFitter, PortraitFitFlags};
use crate::fitting::harmonic::fitstruct::FitResult;
use crate::fitting::harmonic::harmonic::{wrap_phase, HarmonicAligner, HarmonicConfig};
use crate::models::gaussian::GaussianModel;
use crate::models::join::{rotate_channels, JoinBand};
use crate::utils::portrait::{guess_fit_freq, rotate_portrait, Dispersion, Portrait};
use log::{info, warn};
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};

type Result<T> = std::result::Result<T, FittingError>;

#[derive(Copy, Clone, Debug)]
pub struct ModelBuildConfig {
    pub flags: PortraitFitFlags,
    /// Refits allowed after the first one.
    pub niter: usize,
    /// Converged when the offsets are within `efac` times their errors.
    pub efac: f64,
    pub phase_floor: f64,
    pub dm_floor: f64,
    pub harmonic: HarmonicConfig,
}

impl Default for ModelBuildConfig {
    fn default() -> Self {
        ModelBuildConfig {
            flags: PortraitFitFlags::default(),
            niter: 0,
            efac: 1.0,
            phase_floor: 1e-8,
            dm_floor: 1e-6,
            harmonic: HarmonicConfig::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ModelBuildOutcome {
    pub fit: GaussianPortraitFit,
    /// The input data after every rotation applied while iterating.
    pub data: Portrait,
    /// The last offset of the data from the model.
    pub offset: FitResult,
    /// Refits performed after the first.
    pub iterations: usize,
    pub converged: bool,
}

#[derive(Clone, Debug, Default)]
pub struct GaussianModelBuilder {
    pub config: ModelBuildConfig,
    fitter: NonlinearComponentFitter,
    aligner: HarmonicAligner,
    /// Receiver bands fitted with their own offsets, by portrait channel.
    join: Vec<JoinBand>,
}

impl GaussianModelBuilder {
    pub fn new(config: ModelBuildConfig) -> Self {
        GaussianModelBuilder {
            config,
            fitter: NonlinearComponentFitter::default(),
            aligner: HarmonicAligner::new(config.harmonic),
            join: Vec::new(),
        }
    }

    pub fn with_join(mut self, bands: Vec<JoinBand>) -> Self {
        self.join = bands;
        self
    }

    /// The join bands restricted to `channels`, indexed within them.
    fn screened_bands(&self, channels: &[usize]) -> Vec<JoinBand> {
        self.join
            .iter()
            .filter_map(|band| {
                let kept: Vec<usize> = band
                    .channels
                    .iter()
                    .filter_map(|c| channels.iter().position(|k| k == c))
                    .collect();
                if kept.is_empty() {
                    warn!("Join band {} has no valid channels", band.name);
                    return None;
                }
                Some(JoinBand {
                    channels: kept,
                    ..band.clone()
                })
            })
            .collect()
    }

    pub fn with_fitter(mut self, fitter: NonlinearComponentFitter) -> Self {
        self.fitter = fitter;
        self
    }

    /// Phase and DM of `data` relative to `model`, guessed from the mean
    /// profiles with no DM.
    fn offset(
        &self,
        data: ArrayView2<f64>,
        model: ArrayView2<f64>,
        period: f64,
        freqs: ArrayView1<f64>,
        nu_fit: f64,
    ) -> Result<FitResult> {
        let nbin = data.ncols();
        let mean_data = data.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(nbin));
        let mean_model = model.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(nbin));
        let phase_guess = wrap_phase(
            self.aligner
                .fit_phase_shift(mean_data.view(), mean_model.view(), None)?
                .phase,
        );
        self.aligner
            .fit_portrait(data, model, [phase_guess, 0.0], period, freqs, nu_fit)
    }

    fn is_converged(&self, offset: &FitResult) -> bool {
        let phase = offset.phase.rem_euclid(1.0);
        let phase = phase.min(1.0 - phase);
        let dm = offset.dm.abs();
        let efac = self.config.efac;
        (phase < offset.phase_err.abs() * efac || phase < self.config.phase_floor)
            && (dm < offset.dm_err.abs() * efac || dm < self.config.dm_floor)
    }

    /// Fits `init` to the valid channels of `portrait`, then refits while the
    /// data are measurably offset from the model, up to `niter` times.
    ///
    /// # Errors
    /// Will return `Err` if no channel is valid or a fit is rejected.
    pub fn build(&self, portrait: &Portrait, init: &GaussianModel) -> Result<ModelBuildOutcome> {
        let channels = portrait.valid_channels();
        if channels.is_empty() {
            return Err(FittingError::InvalidInput("All channels are masked".to_string()));
        }
        let mut data = portrait.clone();
        let freqs = portrait.freqs.select(Axis(0), &channels);
        let noise = portrait.noise.select(Axis(0), &channels);
        let snrs: Array1<f64> = channels
            .iter()
            .map(|&i| portrait.data.row(i).fold(0.0_f64, |a, &b| a.max(b)) / portrait.noise[i])
            .collect();
        let nu_fit = guess_fit_freq(freqs.view(), snrs.view());

        let mut bands = self.screened_bands(&channels);
        let mut model = init.clone();
        let mut iterations = 0;
        loop {
            let screened = data.data.select(Axis(0), &channels);
            let fit = self.fitter.fit_joined_portrait(
                screened.view(),
                noise.view(),
                &model,
                freqs.view(),
                &self.config.flags,
                data.period,
                &bands,
            )?;
            model = fit.model.clone();
            let mut model_portrait = model.portrait(data.nbin(), freqs.view(), &self.fitter.options);
            for band in bands.iter_mut() {
                if let Some(p) = fit.join.get(&band.name) {
                    band.params = *p;
                }
                rotate_channels(
                    &mut model_portrait,
                    &band.channels,
                    freqs.view(),
                    band.params.phase,
                    band.params.dm,
                    data.period,
                    model.nu_ref,
                );
            }
            let offset = self.offset(screened.view(), model_portrait.view(), data.period, freqs.view(), nu_fit)?;
            info!(
                "Model iteration {iterations}: phase offset {:.2e} +/- {:.2e} rot, DM {:.6e} +/- {:.2e}, red. chi2 {:.2}",
                offset.phase, offset.phase_err, offset.dm, offset.dm_err, fit.fit.red_chi2()
            );
            let converged = self.is_converged(&offset);
            if converged || iterations >= self.config.niter {
                if !converged {
                    warn!("Gaussian model did not converge after {iterations} iterations");
                }
                return Ok(ModelBuildOutcome {
                    fit,
                    data,
                    offset,
                    iterations,
                    converged,
                });
            }
            data.data = rotate_portrait(
                data.data.view(),
                offset.phase,
                Some(
                    &Dispersion::new(offset.dm, data.period, data.freqs.view(), nu_fit)
                        .with_constant(self.config.harmonic.dispersion_constant),
                ),
            );
            iterations += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::gaussian::{GaussianComponent, ProfileOptions};
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn truth() -> GaussianModel {
        GaussianModel::new("psr", 1400.0, 0.0).with_component(GaussianComponent {
            loc: 0.45,
            loc_slope: 0.0,
            wid: 0.04,
            wid_slope: 0.0,
            amp: 1.0,
            amp_index: -1.0,
        })
    }

    fn observed(seed: u64) -> Portrait {
        let freqs = Array1::linspace(1200.0, 1600.0, 8);
        let clean = truth().portrait(128, freqs.view(), &ProfileOptions::default());
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 0.02).unwrap();
        let data: Array2<f64> = clean.mapv(|x| x + normal.sample(&mut rng));
        Portrait::new(data, freqs, 0.005)
            .unwrap()
            .with_noise(Array1::from_elem(8, 0.02))
            .unwrap()
    }

    #[test]
    fn builds_model_from_rough_guess() {
        let init = GaussianModel::new("psr", 1400.0, 0.0).with_component(GaussianComponent::new(0.44, 0.05, 0.8));
        let builder = GaussianModelBuilder::new(ModelBuildConfig {
            flags: PortraitFitFlags {
                fix_loc: true,
                fix_wid: true,
                ..Default::default()
            },
            niter: 3,
            ..Default::default()
        });
        let outcome = builder.build(&observed(9), &init).unwrap();
        let c = outcome.fit.model.components[0];
        assert_abs_diff_eq!(c.wid, 0.04, epsilon = 2e-3);
        assert_abs_diff_eq!(c.amp_index, -1.0, epsilon = 0.2);
        assert!(outcome.iterations <= 3);
        assert!(outcome.offset.phase_err > 0.0);
    }

    #[test]
    fn joined_bands_are_fitted_and_remapped() {
        let mut portrait = observed(4);
        let upper: Vec<usize> = (4..8).collect();
        let freqs = portrait.freqs.clone();
        rotate_channels(&mut portrait.data, &upper, freqs.view(), 0.03, 0.0, 0.005, 1400.0);
        let mut lower = JoinBand::new("lower.ar", (0..4).collect()).fixed_phase();
        lower.fit_dm = false;
        let mut upper = JoinBand::new("upper.ar", upper);
        upper.fit_dm = false;
        let builder = GaussianModelBuilder::new(ModelBuildConfig {
            flags: PortraitFitFlags {
                fix_loc: true,
                fix_wid: true,
                fix_amp: true,
                ..Default::default()
            },
            ..Default::default()
        })
        .with_join(vec![lower, upper]);

        let screened = builder.screened_bands(&[1, 2, 5, 6]);
        assert_eq!(screened[0].channels, vec![0, 1]);
        assert_eq!(screened[1].channels, vec![2, 3]);
        assert!(builder.screened_bands(&[0]).len() == 1);

        let outcome = builder.build(&portrait, &truth()).unwrap();
        let fitted = outcome.fit.join.get("upper.ar").unwrap();
        assert_abs_diff_eq!(fitted.phase, 0.03, epsilon = 3e-3);
        assert_eq!(outcome.fit.join.get("lower.ar").unwrap().phase, 0.0);
    }

    #[test]
    fn converged_offsets() {
        let builder = GaussianModelBuilder::default();
        let mut offset = FitResult {
            phase: 0.999_999,
            phase_err: 1e-5,
            dm: 1e-4,
            dm_err: 1e-3,
            nu_ref: 1400.0,
            scales: Array1::ones(2),
            scale_errs: Array1::zeros(2),
            nfeval: 1,
            status: crate::fitting::common::solver::SolverStatus::GradientConverged,
            red_chi2: 1.0,
            duration: std::time::Duration::ZERO,
        };
        assert!(builder.is_converged(&offset));
        offset.dm = 2e-3;
        assert!(!builder.is_converged(&offset));
        offset.dm = 0.0;
        offset.phase = 0.01;
        assert!(!builder.is_converged(&offset));
    }

    #[test]
    fn masked_portrait_is_rejected() {
        let mut p = observed(1);
        p.mask.fill(false);
        assert!(GaussianModelBuilder::default().build(&p, &truth()).is_err());
    }
}
