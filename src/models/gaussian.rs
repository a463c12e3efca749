//! Gaussian-mixture profiles and frequency-evolving portraits.
//!
//! Profile parameter vectors are laid out `[dc, (loc, wid, amp) * n]`;
//! portrait parameter vectors are `[dc, (loc, m_loc, wid, m_wid, amp, alpha) * n]`.
use crate::fitting::common::error::FittingError;
use crate::utils::constants::{FWHM_TO_SIGMA, GAUSSIAN_CUTOFF_SIGMA};
use crate::utils::fft::HarmonicTransform;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use num_complex::Complex64;
use std::f64::consts::PI;

type Result<T> = std::result::Result<T, FittingError>;

/// Parameters per component in a profile vector.
pub const PROFILE_STRIDE: usize = 3;
/// Parameters per component in a portrait vector.
pub const PORTRAIT_STRIDE: usize = 6;

/// How single Gaussian components are evaluated.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProfileOptions {
    /// Use `|wid|`, so negative widths give ordinary Gaussians.
    pub abs_wid: bool,
    /// Negative widths contribute nothing. When `false`, they give a signed
    /// component with a negative peak.
    pub zero_negative: bool,
    /// Unit area instead of unit peak.
    pub area_normalized: bool,
}

impl Default for ProfileOptions {
    fn default() -> Self {
        ProfileOptions {
            abs_wid: false,
            zero_negative: true,
            area_normalized: false,
        }
    }
}

/// One Gaussian of `nbin` samples centred on `loc` [rot] with full width at
/// half maximum `wid` [rot].
///
/// A zero width always gives an all-zero profile, as does a negative one
/// unless the options say otherwise.
pub fn gaussian_profile(nbin: usize, loc: f64, wid: f64, options: &ProfileOptions) -> Array1<f64> {
    let wid = if options.abs_wid { wid.abs() } else { wid };
    if wid == 0.0 || !wid.is_finite() || (wid < 0.0 && options.zero_negative) {
        return Array1::zeros(nbin);
    }
    let sigma = wid / FWHM_TO_SIGMA;
    let mean = loc.rem_euclid(1.0);
    let norm = 1.0 / (sigma * (2.0 * PI).sqrt());
    let mut profile = Array1::from_shape_fn(nbin, |i| {
        let mut x = i as f64 / nbin as f64 - mean;
        x -= x.round();
        let z = x / sigma;
        if z.abs() < GAUSSIAN_CUTOFF_SIGMA {
            (-0.5 * z * z).exp() * norm
        } else {
            0.0
        }
    });
    if !options.area_normalized {
        let peak = profile.fold(0.0_f64, |m, &v| m.max(v.abs()));
        if peak > 0.0 {
            profile /= peak;
        }
    }
    profile
}

fn check_layout(params: &[f64], stride: usize) -> Result<usize> {
    if params.is_empty() || (params.len() - 1) % stride != 0 {
        return Err(FittingError::InvalidInput(format!(
            "Parameter vector of length {} is not 1 + {}n",
            params.len(),
            stride
        )));
    }
    Ok((params.len() - 1) / stride)
}

/// DC offset plus a sum of Gaussians, from a `[dc, (loc, wid, amp) * n]` vector.
///
/// # Errors
/// Will return `Err` if the vector does not follow the `1 + 3n` layout.
pub fn gen_gaussian_profile(params: &[f64], nbin: usize) -> Result<Array1<f64>> {
    gen_gaussian_profile_with(params, nbin, &ProfileOptions::default())
}

pub fn gen_gaussian_profile_with(params: &[f64], nbin: usize, options: &ProfileOptions) -> Result<Array1<f64>> {
    let ngauss = check_layout(params, PROFILE_STRIDE)?;
    let mut model = Array1::from_elem(nbin, params[0]);
    for igauss in 0..ngauss {
        let block = &params[1 + igauss * PROFILE_STRIDE..1 + (igauss + 1) * PROFILE_STRIDE];
        let (loc, wid, amp) = (block[0], block[1], block[2]);
        model.scaled_add(amp, &gaussian_profile(nbin, loc, wid, options));
    }
    Ok(model)
}

/// Portrait of frequency-evolving Gaussians, from a 1 + 6n vector. Only the
/// length of `phases` is used.
///
/// # Errors
/// Will return `Err` if the vector does not follow the `1 + 6n` layout.
pub fn gen_gaussian_portrait(
    params: &[f64],
    phases: ArrayView1<f64>,
    freqs: ArrayView1<f64>,
    nu_ref: f64,
) -> Result<Array2<f64>> {
    let model = GaussianModel::from_params("", nu_ref, params)?;
    Ok(model.portrait(phases.len(), freqs, &ProfileOptions::default()))
}

/// One frequency-evolving component.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct GaussianComponent {
    pub loc: f64,
    /// d(loc)/d(freq) [rot/MHz]
    pub loc_slope: f64,
    pub wid: f64,
    /// d(wid)/d(freq) [rot/MHz]
    pub wid_slope: f64,
    pub amp: f64,
    /// Power-law index of the amplitude.
    pub amp_index: f64,
}

impl GaussianComponent {
    /// A component with no frequency evolution.
    pub fn new(loc: f64, wid: f64, amp: f64) -> Self {
        GaussianComponent {
            loc,
            wid,
            amp,
            ..Default::default()
        }
    }

    pub fn from_slice(block: &[f64]) -> Self {
        GaussianComponent {
            loc: block[0],
            loc_slope: block[1],
            wid: block[2],
            wid_slope: block[3],
            amp: block[4],
            amp_index: block[5],
        }
    }

    pub fn to_array(&self) -> [f64; PORTRAIT_STRIDE] {
        [
            self.loc,
            self.loc_slope,
            self.wid,
            self.wid_slope,
            self.amp,
            self.amp_index,
        ]
    }

    /// (loc, wid, amp) at `freq`.
    pub fn at(&self, freq: f64, nu_ref: f64) -> (f64, f64, f64) {
        let df = freq - nu_ref;
        (
            self.loc + self.loc_slope * df,
            self.wid + self.wid_slope * df,
            self.amp * (freq / nu_ref).powf(self.amp_index),
        )
    }
}

/// Exponential scattering tail.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Scattering {
    /// Timescale [rot] at the reference frequency.
    pub tau: f64,
    /// Power-law index of the timescale, typically near -4.4.
    pub index: f64,
}

impl Scattering {
    pub fn timescale(&self, freq: f64, nu_ref: f64) -> f64 {
        self.tau * (freq / nu_ref).powf(self.index)
    }

    /// Convolves with a one-sided exponential of timescale `tau` [rot] by
    /// multiplying harmonic `k` by `1 / (1 + 2πik·tau)`.
    pub fn broaden(harmonics: &mut [Complex64], tau: f64) {
        if tau <= 0.0 {
            return;
        }
        for (k, h) in harmonics.iter_mut().enumerate() {
            *h /= Complex64::new(1.0, 2.0 * PI * k as f64 * tau);
        }
    }
}

/// A DC term plus ordered, frequency-evolving Gaussian components.
#[derive(Clone, Debug, PartialEq)]
pub struct GaussianModel {
    pub name: String,
    /// Reference frequency [MHz].
    pub nu_ref: f64,
    pub dc: f64,
    pub components: Vec<GaussianComponent>,
    pub scattering: Option<Scattering>,
}

impl GaussianModel {
    pub fn new(name: &str, nu_ref: f64, dc: f64) -> Self {
        GaussianModel {
            name: name.to_string(),
            nu_ref,
            dc,
            components: vec![],
            scattering: None,
        }
    }

    pub fn with_component(mut self, component: GaussianComponent) -> Self {
        self.components.push(component);
        self
    }

    pub fn with_scattering(mut self, scattering: Scattering) -> Self {
        self.scattering = Some(scattering);
        self
    }

    pub fn ngauss(&self) -> usize {
        self.components.len()
    }

    /// Builds a model from a `1 + 6n` portrait vector.
    ///
    /// # Errors
    /// Will return `Err` if the vector does not follow the layout.
    pub fn from_params(name: &str, nu_ref: f64, params: &[f64]) -> Result<Self> {
        let ngauss = check_layout(params, PORTRAIT_STRIDE)?;
        let components = (0..ngauss)
            .map(|i| GaussianComponent::from_slice(&params[1 + i * PORTRAIT_STRIDE..]))
            .collect();
        Ok(GaussianModel {
            name: name.to_string(),
            nu_ref,
            dc: params[0],
            components,
            scattering: None,
        })
    }

    /// Builds a model with no frequency evolution from a `1 + 3n` profile vector.
    ///
    /// # Errors
    /// Will return `Err` if the vector does not follow the layout.
    pub fn from_profile_params(name: &str, nu_ref: f64, params: &[f64]) -> Result<Self> {
        let ngauss = check_layout(params, PROFILE_STRIDE)?;
        let components = params[1..]
            .chunks(PROFILE_STRIDE)
            .take(ngauss)
            .map(|c| GaussianComponent::new(c[0], c[1], c[2]))
            .collect();
        Ok(GaussianModel {
            name: name.to_string(),
            nu_ref,
            dc: params[0],
            components,
            scattering: None,
        })
    }

    pub fn to_params(&self) -> Vec<f64> {
        let mut params = Vec::with_capacity(1 + PORTRAIT_STRIDE * self.ngauss());
        params.push(self.dc);
        for c in &self.components {
            params.extend_from_slice(&c.to_array());
        }
        params
    }

    /// `[dc, (loc, wid, amp) * n]` evaluated at `freq`.
    pub fn profile_params(&self, freq: f64) -> Vec<f64> {
        let mut params = Vec::with_capacity(1 + PROFILE_STRIDE * self.ngauss());
        params.push(self.dc);
        for c in &self.components {
            let (loc, wid, amp) = c.at(freq, self.nu_ref);
            params.extend_from_slice(&[loc, wid, amp]);
        }
        params
    }

    fn unscattered(&self, freq: f64, nbin: usize, options: &ProfileOptions) -> Array1<f64> {
        let mut model = Array1::from_elem(nbin, self.dc);
        for c in &self.components {
            let (loc, wid, amp) = c.at(freq, self.nu_ref);
            model.scaled_add(amp, &gaussian_profile(nbin, loc, wid, options));
        }
        model
    }

    /// The model profile at a single frequency.
    pub fn profile(&self, freq: f64, nbin: usize, options: &ProfileOptions) -> Array1<f64> {
        let profile = self.unscattered(freq, nbin, options);
        match self.scattering {
            Some(s) => {
                let plan = HarmonicTransform::new(nbin);
                scatter(&plan, profile.view(), s.timescale(freq, self.nu_ref))
            }
            None => profile,
        }
    }

    /// One model profile per channel frequency.
    pub fn portrait(&self, nbin: usize, freqs: ArrayView1<f64>, options: &ProfileOptions) -> Array2<f64> {
        let plan = self.scattering.map(|_| HarmonicTransform::new(nbin));
        let mut port = Array2::zeros((freqs.len(), nbin));
        for (mut row, &freq) in port.axis_iter_mut(Axis(0)).zip(freqs.iter()) {
            let profile = self.unscattered(freq, nbin, options);
            match (&plan, self.scattering) {
                (Some(plan), Some(s)) => {
                    row.assign(&scatter(plan, profile.view(), s.timescale(freq, self.nu_ref)))
                }
                _ => row.assign(&profile),
            }
        }
        port
    }
}

/// Broadens `profile` by an exponential tail of timescale `tau` [rot].
pub(crate) fn scatter(plan: &HarmonicTransform, profile: ArrayView1<f64>, tau: f64) -> Array1<f64> {
    let mut harmonics = plan.forward(profile);
    if let Some(h) = harmonics.as_slice_mut() {
        Scattering::broaden(h, tau);
    }
    plan.inverse(harmonics.view())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array;

    #[test]
    fn zero_width_is_empty() {
        let opts = ProfileOptions::default();
        for n in [1, 7, 256] {
            assert!(gaussian_profile(n, 0.3, 0.0, &opts).iter().all(|&x| x == 0.0));
        }
        assert!(gaussian_profile(64, 0.3, -0.1, &opts).iter().all(|&x| x == 0.0));
    }

    #[test]
    fn negative_width_can_be_signed() {
        let opts = ProfileOptions {
            zero_negative: false,
            ..Default::default()
        };
        let prof = gaussian_profile(128, 0.25, -0.05, &opts);
        assert_abs_diff_eq!(prof[32], -1.0, epsilon = 1e-12);

        let opts = ProfileOptions {
            abs_wid: true,
            ..Default::default()
        };
        let prof = gaussian_profile(128, 0.25, -0.05, &opts);
        assert_abs_diff_eq!(prof[32], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn peak_wraps_and_half_max() {
        let opts = ProfileOptions::default();
        let prof = gaussian_profile(200, 0.0, 0.1, &opts);
        assert_abs_diff_eq!(prof[0], 1.0, epsilon = 1e-12);
        // symmetric about phase zero across the wrap
        assert_abs_diff_eq!(prof[5], prof[195], epsilon = 1e-12);
        // half maximum at half the FWHM
        assert_abs_diff_eq!(prof[10], 0.5, epsilon = 1e-12);
        // locations differing by a whole turn are identical
        let shifted = gaussian_profile(200, 1.0, 0.1, &opts);
        assert_abs_diff_eq!(prof, shifted, epsilon = 1e-12);
    }

    #[test]
    fn area_normalisation() {
        let opts = ProfileOptions {
            area_normalized: true,
            ..Default::default()
        };
        let nbin = 1024;
        let prof = gaussian_profile(nbin, 0.5, 0.05, &opts);
        assert_abs_diff_eq!(prof.sum() / nbin as f64, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn profile_layout_is_checked() {
        assert!(gen_gaussian_profile(&[0.0, 0.5, 0.1], 64).is_err());
        let prof = gen_gaussian_profile(&[0.5, 0.5, 0.1, 2.0], 64).unwrap();
        assert_abs_diff_eq!(prof[32], 2.5, epsilon = 1e-12);
    }

    #[test]
    fn portrait_evolution() {
        let model = GaussianModel::new("test", 1400.0, 0.0).with_component(GaussianComponent {
            loc: 0.5,
            loc_slope: 1e-4,
            wid: 0.05,
            wid_slope: 0.0,
            amp: 2.0,
            amp_index: -2.0,
        });
        let freqs = Array::from_vec(vec![1400.0, 2800.0]);
        let port = gen_gaussian_portrait(&model.to_params(), Array1::zeros(100).view(), freqs.view(), 1400.0)
            .unwrap();
        assert_abs_diff_eq!(port[[0, 50]], 2.0, epsilon = 1e-12);
        // amplitude falls by (2800/1400)^-2, peak moves by 0.14 rot
        assert_abs_diff_eq!(port[[1, 64]], 0.5, epsilon = 1e-12);
        let back = GaussianModel::from_params("test", 1400.0, &model.to_params()).unwrap();
        assert_eq!(back, model);
    }

    #[test]
    fn scattering_preserves_flux_and_delays_peak() {
        let base = GaussianModel::new("s", 1400.0, 0.0).with_component(GaussianComponent::new(0.5, 0.02, 1.0));
        let scattered = base.clone().with_scattering(Scattering {
            tau: 0.02,
            index: -4.4,
        });
        let opts = ProfileOptions::default();
        let a = base.profile(1400.0, 256, &opts);
        let b = scattered.profile(1400.0, 256, &opts);
        assert_abs_diff_eq!(a.sum(), b.sum(), epsilon = 1e-9);
        let argmax = |p: &Array1<f64>| {
            p.iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc })
                .0
        };
        assert!(argmax(&b) > argmax(&a));
        assert!(b[128] < a[128]);
    }
}
