//! Portraits (frequency-resolved pulse profiles) and the operations that move
//! them around in phase.
use crate::fitting::common::error::FittingError;
use crate::utils::constants::DISPERSION_CONSTANT;
use crate::utils::fft::HarmonicTransform;
use crate::utils::noise::NoiseEstimator;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use num_complex::Complex64;
use std::f64::consts::PI;

/// A pulse waveform resolved in phase and observing frequency.
///
/// `data` has shape `[nchan, nbin]`; `freqs`, `mask` and `noise` are indexed
/// by channel.
#[derive(Clone, Debug)]
pub struct Portrait {
    pub data: Array2<f64>,
    /// Channel centre frequencies [MHz].
    pub freqs: Array1<f64>,
    /// `false` marks a channel excluded from fits.
    pub mask: Array1<bool>,
    /// Per-channel noise standard deviation.
    pub noise: Array1<f64>,
    /// Folding period [s].
    pub period: f64,
}

/// How to normalise each channel of a portrait.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Normalization {
    Max,
    Mean,
    /// Divide by the tail-noise level so that each channel has unit noise.
    Rms,
}

impl Portrait {
    /// Wraps channel data, marking every channel valid and estimating the
    /// noise from the harmonic tail.
    pub fn new(data: Array2<f64>, freqs: Array1<f64>, period: f64) -> Result<Portrait, FittingError> {
        if data.nrows() != freqs.len() {
            return Err(FittingError::ShapeMismatch(format!(
                "{} channels of data but {} frequencies",
                data.nrows(),
                freqs.len()
            )));
        }
        let noise = NoiseEstimator::default().channels(data.view());
        let mask = Array1::from_elem(freqs.len(), true);
        Ok(Portrait {
            data,
            freqs,
            mask,
            noise,
            period,
        })
    }

    pub fn with_mask(mut self, mask: Array1<bool>) -> Result<Portrait, FittingError> {
        if mask.len() != self.nchan() {
            return Err(FittingError::ShapeMismatch(format!(
                "mask has {} entries for {} channels",
                mask.len(),
                self.nchan()
            )));
        }
        self.mask = mask;
        Ok(self)
    }

    pub fn with_noise(mut self, noise: Array1<f64>) -> Result<Portrait, FittingError> {
        if noise.len() != self.nchan() {
            return Err(FittingError::ShapeMismatch(format!(
                "noise has {} entries for {} channels",
                noise.len(),
                self.nchan()
            )));
        }
        self.noise = noise;
        Ok(self)
    }

    pub fn nchan(&self) -> usize {
        self.data.nrows()
    }

    pub fn nbin(&self) -> usize {
        self.data.ncols()
    }

    /// Indices of the channels that are not masked out.
    pub fn valid_channels(&self) -> Vec<usize> {
        self.mask
            .iter()
            .enumerate()
            .filter_map(|(i, &ok)| if ok { Some(i) } else { None })
            .collect()
    }

    /// The portrait restricted to its valid channels (data, freqs, noise).
    pub fn screened(&self) -> (Array2<f64>, Array1<f64>, Array1<f64>) {
        let ok = self.valid_channels();
        (
            self.data.select(Axis(0), &ok),
            self.freqs.select(Axis(0), &ok),
            self.noise.select(Axis(0), &ok),
        )
    }

    /// Data with masked channels zeroed.
    pub fn masked_data(&self) -> Array2<f64> {
        let mut out = self.data.clone();
        for (mut row, &ok) in out.axis_iter_mut(Axis(0)).zip(self.mask.iter()) {
            if !ok {
                row.fill(0.0);
            }
        }
        out
    }

    /// Phase-averaged flux of every channel.
    pub fn flux_profile(&self) -> Array1<f64> {
        self.data.mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(self.nchan()))
    }

    /// Mean profile over the valid channels.
    pub fn mean_profile(&self) -> Array1<f64> {
        let (data, _, _) = self.screened();
        data.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(self.nbin()))
    }

    /// Normalises each non-empty channel and refreshes its noise estimate.
    pub fn normalize(&mut self, method: Normalization) {
        let noise = NoiseEstimator::default();
        for (mut row, sigma) in self.data.axis_iter_mut(Axis(0)).zip(self.noise.iter_mut()) {
            if row.iter().all(|&x| x == 0.0) {
                continue;
            }
            let norm = match method {
                Normalization::Max => row.fold(f64::NEG_INFINITY, |a, &b| a.max(b)),
                Normalization::Mean => row.mean().unwrap_or(1.0),
                Normalization::Rms => noise.profile(row.view()),
            };
            if norm != 0.0 && norm.is_finite() {
                row.mapv_inplace(|x| x / norm);
            }
            *sigma = noise.profile(row.view());
        }
    }

    /// Reorders channels by increasing frequency.
    pub fn sort_by_frequency(&mut self) {
        let mut order: Vec<usize> = (0..self.nchan()).collect();
        order.sort_by(|&a, &b| self.freqs[a].total_cmp(&self.freqs[b]));
        self.data = self.data.select(Axis(0), &order);
        self.freqs = self.freqs.select(Axis(0), &order);
        self.mask = self.mask.select(Axis(0), &order);
        self.noise = self.noise.select(Axis(0), &order);
    }

    /// Rotates every channel in place; see [`rotate_portrait`].
    pub fn rotate(&mut self, phase: f64, dm: f64, nu_ref: f64) {
        self.data = rotate_portrait(
            self.data.view(),
            phase,
            Some(&Dispersion::new(dm, self.period, self.freqs.view(), nu_ref)),
        );
    }
}

/// Dispersive phase delays for a set of channels.
#[derive(Clone, Debug)]
pub struct Dispersion<'a> {
    pub dm: f64,
    pub period: f64,
    pub freqs: ArrayView1<'a, f64>,
    pub nu_ref: f64,
    pub dispersion_constant: f64,
}

impl<'a> Dispersion<'a> {
    pub fn new(dm: f64, period: f64, freqs: ArrayView1<'a, f64>, nu_ref: f64) -> Self {
        Dispersion {
            dm,
            period,
            freqs,
            nu_ref,
            dispersion_constant: DISPERSION_CONSTANT,
        }
    }

    pub fn with_constant(mut self, dispersion_constant: f64) -> Self {
        self.dispersion_constant = dispersion_constant;
        self
    }

    /// Phase delay [rot] of channel `ichan` relative to `nu_ref`.
    pub fn phase_delay(&self, ichan: usize) -> f64 {
        dm_delay(
            self.dm,
            self.freqs[ichan],
            Some(self.nu_ref),
            Some(self.period),
            self.dispersion_constant,
        )
    }
}

/// Dispersive delay of `freq` [MHz] relative to infinite frequency, or to
/// `freq_ref` if given. Returned in seconds, or in rotations if a period is
/// given.
pub fn dm_delay(
    dm: f64,
    freq: f64,
    freq_ref: Option<f64>,
    period: Option<f64>,
    dispersion_constant: f64,
) -> f64 {
    let ref_term = freq_ref.map_or(0.0, |f| f.powi(-2));
    let delay = dispersion_constant * dm * (freq.powi(-2) - ref_term);
    match period {
        Some(p) => delay / p,
        None => delay,
    }
}

/// Multiplies each harmonic `k` by `exp(2πik·phase)`.
pub(crate) fn rotate_harmonics(harmonics: &mut [Complex64], phase: f64) {
    for (k, h) in harmonics.iter_mut().enumerate() {
        *h *= Complex64::from_polar(1.0, 2.0 * PI * k as f64 * phase);
    }
}

/// Rotates a profile by `phase` rotations. Positive phase moves the pulse to
/// earlier phase.
pub fn rotate_profile(profile: ArrayView1<f64>, phase: f64) -> Array1<f64> {
    let plan = HarmonicTransform::new(profile.len());
    let mut harmonics = plan.forward(profile);
    if let Some(h) = harmonics.as_slice_mut() {
        rotate_harmonics(h, phase);
    }
    plan.inverse(harmonics.view())
}

/// Rotates every channel by `phase` plus, if given, its dispersive delay.
/// Positive phase and DM move the pulse to earlier phase.
pub fn rotate_portrait(
    portrait: ArrayView2<f64>,
    phase: f64,
    dispersion: Option<&Dispersion>,
) -> Array2<f64> {
    let plan = HarmonicTransform::new(portrait.ncols());
    let mut harmonics = plan.forward_portrait(portrait);
    for (ichan, mut row) in harmonics.axis_iter_mut(Axis(0)).enumerate() {
        let delay = dispersion.map_or(0.0, |d| d.phase_delay(ichan));
        if let Some(h) = row.as_slice_mut() {
            rotate_harmonics(h, phase + delay);
        }
    }
    plan.inverse_portrait(harmonics.view())
}

/// Reference frequency that decorrelates phase and DM for channels weighted by
/// their signal-to-noise: `(Σ w f⁻² / Σ w)^(-1/2)` with `w = snr²`.
pub fn guess_fit_freq(freqs: ArrayView1<f64>, snrs: ArrayView1<f64>) -> f64 {
    let (num, den) = freqs
        .iter()
        .zip(snrs.iter())
        .fold((0.0, 0.0), |(num, den), (&f, &s)| {
            let w = s * s;
            (num + w * f.powi(-2), den + w)
        });
    if den <= 0.0 || num <= 0.0 {
        return freqs.mean().unwrap_or(f64::INFINITY);
    }
    (num / den).powf(-0.5)
}

/// The external data provider's view of one observation.
pub trait Observation {
    /// Channel centre frequencies [MHz].
    fn get_channels(&self) -> ArrayView1<f64>;
    /// Folding period [s].
    fn get_period(&self) -> f64;
    /// Amplitudes, shape `[nchan, nbin]`.
    fn get_samples(&self) -> ArrayView2<f64>;
    /// Channel validity.
    fn get_mask(&self) -> ArrayView1<bool>;
    /// Per-channel noise standard deviation.
    fn get_noise(&self) -> Array1<f64> {
        NoiseEstimator::default().channels(self.get_samples())
    }
    /// Dispersion measure the data were folded with; the starting DM guess.
    fn get_dm(&self) -> f64 {
        0.0
    }
}

impl Observation for Portrait {
    fn get_channels(&self) -> ArrayView1<f64> {
        self.freqs.view()
    }

    fn get_period(&self) -> f64 {
        self.period
    }

    fn get_samples(&self) -> ArrayView2<f64> {
        self.data.view()
    }

    fn get_mask(&self) -> ArrayView1<bool> {
        self.mask.view()
    }

    fn get_noise(&self) -> Array1<f64> {
        self.noise.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array};

    fn bumpy_portrait() -> Array2<f64> {
        Array::from_shape_fn((4, 128), |(c, b)| {
            let x = b as f64 / 128.0;
            (-(x - 0.3 - 0.01 * c as f64).powi(2) / 0.002).exp()
        })
    }

    #[test]
    fn integer_bin_rotation_is_a_roll() {
        let prof = array![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0];
        let rotated = rotate_profile(prof.view(), 2.0 / 8.0);
        // positive rotation moves features earlier
        let expected = array![2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 0.0, 1.0];
        for (a, b) in rotated.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn rotation_round_trip() {
        let port = bumpy_portrait();
        let freqs = array![1200.0, 1300.0, 1400.0, 1500.0];
        let disp = Dispersion::new(3.2, 0.005, freqs.view(), 1400.0);
        let there = rotate_portrait(port.view(), 0.123, Some(&disp));
        let back_disp = Dispersion::new(-3.2, 0.005, freqs.view(), 1400.0);
        let back = rotate_portrait(there.view(), -0.123, Some(&back_disp));
        for (a, b) in port.iter().zip(back.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn channel_noise_is_the_sample_deviation() {
        use rand::rngs::StdRng;
        use rand::SeedableRng;
        use rand_distr::{Distribution, Normal};
        let mut rng = StdRng::seed_from_u64(17);
        let normal = Normal::new(0.0, 0.2).unwrap();
        let data = Array::from_shape_fn((4, 1024), |(c, b)| {
            let x = b as f64 / 1024.0;
            (-(x - 0.3 - 0.01 * c as f64).powi(2) / 0.002).exp() + normal.sample(&mut rng)
        });
        let portrait = Portrait::new(data, array![1200.0, 1300.0, 1400.0, 1500.0], 0.005).unwrap();
        for &sigma in portrait.noise.iter() {
            assert_abs_diff_eq!(sigma, 0.2, epsilon = 0.05);
        }
    }

    #[test]
    fn dm_delay_units() {
        let secs = dm_delay(10.0, 1000.0, None, None, DISPERSION_CONSTANT);
        assert_abs_diff_eq!(secs, DISPERSION_CONSTANT * 10.0 * 1e-6, epsilon = 1e-15);
        let rots = dm_delay(10.0, 1000.0, Some(2000.0), Some(0.5), DISPERSION_CONSTANT);
        assert_abs_diff_eq!(
            rots,
            DISPERSION_CONSTANT * 10.0 * (1e-6 - 0.25e-6) / 0.5,
            epsilon = 1e-12
        );
    }

    #[test]
    fn equal_weights_fit_freq() {
        let freqs = array![1000.0, 2000.0];
        let snrs = array![1.0, 1.0];
        let expected = (0.5 * (1e-6 + 0.25e-6) as f64).powf(-0.5);
        assert_abs_diff_eq!(guess_fit_freq(freqs.view(), snrs.view()), expected, epsilon = 1e-9);
    }

    #[test]
    fn screening_and_sorting() {
        let freqs = array![1500.0, 1200.0, 1400.0, 1300.0];
        let mut port = Portrait::new(bumpy_portrait(), freqs, 0.01)
            .unwrap()
            .with_mask(array![true, false, true, true])
            .unwrap();
        assert_eq!(port.valid_channels(), vec![0, 2, 3]);
        let (data, f, _) = port.screened();
        assert_eq!(data.nrows(), 3);
        assert_eq!(f.to_vec(), vec![1500.0, 1400.0, 1300.0]);
        port.sort_by_frequency();
        assert_eq!(port.freqs.to_vec(), vec![1200.0, 1300.0, 1400.0, 1500.0]);
        assert_eq!(port.mask.to_vec(), vec![false, true, true, true]);
        assert!(port.masked_data().row(0).iter().all(|&x| x == 0.0));
    }

    #[test]
    fn normalize_by_max() {
        let mut port = Portrait::new(bumpy_portrait().mapv(|x| 5.0 * x), array![1.0, 2.0, 3.0, 4.0], 1.0)
            .unwrap();
        port.normalize(Normalization::Max);
        for row in port.data.axis_iter(Axis(0)) {
            assert_abs_diff_eq!(row.fold(f64::MIN, |a, &b| a.max(b)), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let err = Portrait::new(bumpy_portrait(), array![1.0, 2.0], 1.0);
        assert!(matches!(err, Err(FittingError::ShapeMismatch(_))));
    }
}
