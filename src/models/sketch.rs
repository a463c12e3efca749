//! A Gaussian decomposition built up one component at a time, as a sequence
//! of discrete actions on an explicit component list.
use crate::fitting::common::error::FittingError;
use crate::fitting::gauss::fitstruct::ComponentFit;
use crate::fitting::gauss::gauss::{NonlinearComponentFitter, ProfileFitFlags};
use crate::fitting::harmonic::harmonic::HarmonicAligner;
use crate::models::gaussian::{gaussian_profile, gen_gaussian_profile_with, GaussianComponent, PROFILE_STRIDE};
use crate::utils::noise::get_noise;
use log::{debug, info};
use ndarray::Array1;

type Result<T> = std::result::Result<T, FittingError>;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SketchAction {
    AddComponent { loc: f64, wid: f64, amp: f64 },
    RemoveLastComponent,
    RequestFit,
}

impl SketchAction {
    /// A component spanning `x1..x2` [rot] whose peak reaches `y2`.
    pub fn from_drag(x1: f64, x2: f64, y2: f64, dc: f64) -> SketchAction {
        SketchAction::AddComponent {
            loc: 0.5 * (x1 + x2),
            wid: (x2 - x1).abs(),
            amp: (1.05 * (y2 - dc)).abs(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct GaussianSketch {
    pub profile: Array1<f64>,
    /// Noise standard deviation of each profile sample.
    pub noise: f64,
    pub dc: f64,
    pub components: Vec<GaussianComponent>,
    /// Scattering timescale [rot]; zero for none unless it is fitted.
    pub tau: f64,
    pub fit_scattering: bool,
    /// Vary flags in `[dc, (loc, wid, amp) * n]` order; all vary if `None`.
    pub vary: Option<Vec<bool>>,
    /// The latest fit, cleared whenever the component list changes.
    pub fit: Option<ComponentFit>,
    fitter: NonlinearComponentFitter,
}

impl GaussianSketch {
    /// Starts an empty sketch of `profile`, with the DC level guessed from
    /// the lowest tenth of its samples.
    pub fn new(profile: Array1<f64>) -> Self {
        let mut sorted = profile.to_vec();
        sorted.sort_by(f64::total_cmp);
        let dc = sorted
            .get((sorted.len() / 10 + 1).min(sorted.len().saturating_sub(1)))
            .copied()
            .unwrap_or(0.0);
        let noise = get_noise(profile.view());
        GaussianSketch {
            profile,
            noise,
            dc,
            components: vec![],
            tau: 0.0,
            fit_scattering: false,
            vary: None,
            fit: None,
            fitter: NonlinearComponentFitter::default(),
        }
    }

    pub fn with_scattering(mut self, tau: f64, fit_scattering: bool) -> Self {
        self.tau = tau;
        self.fit_scattering = fit_scattering;
        self
    }

    pub fn with_fitter(mut self, fitter: NonlinearComponentFitter) -> Self {
        self.fitter = fitter;
        self
    }

    pub fn ngauss(&self) -> usize {
        self.components.len()
    }

    /// `[dc, (loc, wid, amp) * n]` of the current components.
    pub fn params(&self) -> Vec<f64> {
        let mut params = Vec::with_capacity(1 + PROFILE_STRIDE * self.ngauss());
        params.push(self.dc);
        for c in &self.components {
            params.extend_from_slice(&[c.loc, c.wid, c.amp]);
        }
        params
    }

    /// The unscattered profile of the current components.
    pub fn model(&self) -> Result<Array1<f64>> {
        gen_gaussian_profile_with(&self.params(), self.profile.len(), &self.fitter.options)
    }

    /// # Errors
    /// Will return `Err` if a requested fit is rejected; see
    /// [`NonlinearComponentFitter::fit_gaussian_profile`].
    pub fn apply(&mut self, action: SketchAction) -> Result<()> {
        match action {
            SketchAction::AddComponent { loc, wid, amp } => {
                debug!("Adding component at {loc:.4} rot, FWHM {wid:.4}, amplitude {amp:.4}");
                self.components.push(GaussianComponent::new(loc, wid, amp));
                self.fit = None;
            }
            SketchAction::RemoveLastComponent => {
                if self.components.pop().is_some() {
                    self.fit = None;
                }
            }
            SketchAction::RequestFit => self.request_fit()?,
        }
        Ok(())
    }

    fn request_fit(&mut self) -> Result<()> {
        if self.components.is_empty() {
            return Err(FittingError::InvalidInput("No components to fit".to_string()));
        }
        let errs = Array1::from_elem(self.profile.len(), self.noise);
        let flags = ProfileFitFlags {
            vary: self.vary.clone(),
            tau: self.tau,
            fit_scattering: self.fit_scattering,
        };
        let fit = self
            .fitter
            .fit_gaussian_profile(self.profile.view(), &self.params(), errs.view(), &flags)?;
        let fitted = fit.fitted_params();
        self.dc = fitted[0];
        for (c, block) in self
            .components
            .iter_mut()
            .zip(fitted[1..].chunks_exact(PROFILE_STRIDE))
        {
            *c = GaussianComponent::new(block[0], block[1], block[2]);
        }
        if fitted.len() > 1 + PROFILE_STRIDE * self.components.len() {
            self.tau = fitted[fitted.len() - 1];
        }
        info!(
            "Fitted {} components: red. chi2 {:.3}",
            self.components.len(),
            fit.red_chi2()
        );
        self.fit = Some(fit);
        Ok(())
    }

    /// Replaces the components with a single Gaussian of FWHM `wid` [rot]
    /// placed by cross-correlation, and fits it.
    ///
    /// # Errors
    /// Will return `Err` if the phase-shift or profile fit is rejected.
    pub fn auto_gauss(&mut self, wid: f64) -> Result<()> {
        let amp = self.profile.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
        let template = gaussian_profile(self.profile.len(), 0.5, wid, &self.fitter.options) * amp;
        let shift = HarmonicAligner::default().fit_phase_shift(self.profile.view(), template.view(), None)?;
        let loc = (0.5 + shift.phase).rem_euclid(1.0);
        self.components.clear();
        self.apply(SketchAction::AddComponent { loc, wid, amp })?;
        self.apply(SketchAction::RequestFit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::gaussian::gen_gaussian_profile;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn noisy_profile() -> Array1<f64> {
        let clean = gen_gaussian_profile(&[0.0, 0.35, 0.04, 1.0, 0.6, 0.08, 0.4], 256).unwrap();
        let mut rng = StdRng::seed_from_u64(21);
        let normal = Normal::new(0.0, 0.01).unwrap();
        clean.mapv(|x| x + normal.sample(&mut rng))
    }

    #[test]
    fn drag_spans_the_component() {
        match SketchAction::from_drag(0.4, 0.3, 1.1, 0.1) {
            SketchAction::AddComponent { loc, wid, amp } => {
                assert_abs_diff_eq!(loc, 0.35, epsilon = 1e-12);
                assert_abs_diff_eq!(wid, 0.1, epsilon = 1e-12);
                assert_abs_diff_eq!(amp, 1.05, epsilon = 1e-12);
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn add_remove_and_fit() {
        let mut sketch = GaussianSketch::new(noisy_profile());
        assert_abs_diff_eq!(sketch.dc, 0.0, epsilon = 0.05);
        assert!(sketch.apply(SketchAction::RequestFit).is_err());

        sketch.apply(SketchAction::AddComponent { loc: 0.34, wid: 0.05, amp: 0.9 }).unwrap();
        sketch.apply(SketchAction::AddComponent { loc: 0.9, wid: 0.05, amp: 0.1 }).unwrap();
        sketch.apply(SketchAction::RemoveLastComponent).unwrap();
        sketch.apply(SketchAction::AddComponent { loc: 0.62, wid: 0.07, amp: 0.5 }).unwrap();
        assert_eq!(sketch.ngauss(), 2);

        sketch.apply(SketchAction::RequestFit).unwrap();
        let fit = sketch.fit.as_ref().unwrap();
        assert!(fit.is_success());
        assert_abs_diff_eq!(sketch.components[0].loc, 0.35, epsilon = 2e-3);
        assert_abs_diff_eq!(sketch.components[1].wid, 0.08, epsilon = 5e-3);

        sketch.apply(SketchAction::RemoveLastComponent).unwrap();
        assert!(sketch.fit.is_none());
    }

    #[test]
    fn white_noise_fit_has_unit_reduced_chi2() {
        let clean = gen_gaussian_profile(&[0.0, 0.3, 0.04, 1.0], 2048).unwrap();
        let mut rng = StdRng::seed_from_u64(13);
        let normal = Normal::new(0.0, 0.01).unwrap();
        let mut sketch = GaussianSketch::new(clean.mapv(|x| x + normal.sample(&mut rng)));
        assert_abs_diff_eq!(sketch.noise, 0.01, epsilon = 1e-3);
        sketch.apply(SketchAction::AddComponent { loc: 0.3, wid: 0.04, amp: 1.0 }).unwrap();
        sketch.apply(SketchAction::RequestFit).unwrap();
        let red_chi2 = sketch.fit.as_ref().unwrap().red_chi2();
        assert!(red_chi2 > 0.7 && red_chi2 < 1.3, "{red_chi2}");
    }

    #[test]
    fn auto_gauss_finds_the_pulse() {
        let clean = gen_gaussian_profile(&[0.0, 0.72, 0.05, 2.0], 128).unwrap();
        let mut rng = StdRng::seed_from_u64(4);
        let normal = Normal::new(0.0, 0.02).unwrap();
        let mut sketch = GaussianSketch::new(clean.mapv(|x| x + normal.sample(&mut rng)));
        sketch.auto_gauss(0.03).unwrap();
        assert_eq!(sketch.ngauss(), 1);
        assert_abs_diff_eq!(sketch.components[0].loc, 0.72, epsilon = 2e-3);
        assert_abs_diff_eq!(sketch.components[0].wid, 0.05, epsilon = 2e-3);
        assert_abs_diff_eq!(sketch.components[0].amp, 2.0, epsilon = 0.05);
    }
}
