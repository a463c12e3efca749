//! Noise estimates from the high-harmonic tail of a profile.
//!
//! The top quarter of harmonics is assumed to carry no pulse signal, so the
//! spread of those harmonics measures the white-noise level. This is a
//! heuristic: profiles with significant power at high harmonics will have
//! their noise overestimated.
use crate::utils::constants::NOISE_TAIL_FRACTION;
use crate::utils::fft::HarmonicTransform;
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use num_complex::Complex64;

/// Which tail statistic to measure.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum NoiseDomain {
    /// Standard deviation of the real parts of the tail harmonics. For white
    /// noise of sample std σ this is `σ sqrt(N / 2)`.
    Harmonic,
    /// Root-mean of the tail power spectrum, `sqrt(mean(|F_k|²/N))`: the
    /// standard deviation of the profile samples.
    #[default]
    Power,
}

/// Whether to report a standard deviation or a precision (σ⁻²).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum NoiseOutput {
    #[default]
    Std,
    Precision,
}

#[derive(Copy, Clone, Debug)]
pub struct NoiseEstimator {
    pub domain: NoiseDomain,
    pub output: NoiseOutput,
    /// The last `nharm / tail_fraction` harmonics (rounded up) form the tail.
    pub tail_fraction: usize,
}

impl Default for NoiseEstimator {
    fn default() -> Self {
        NoiseEstimator {
            domain: NoiseDomain::Power,
            output: NoiseOutput::Std,
            tail_fraction: NOISE_TAIL_FRACTION,
        }
    }
}

/// Number of tail harmonics out of `nharm`.
pub(crate) fn tail_length(nharm: usize, tail_fraction: usize) -> usize {
    nharm.div_ceil(tail_fraction.max(1)).max(1).min(nharm)
}

/// Smallest harmonic-domain noise level reported: the round-off level of the
/// largest harmonic. Noiseless synthetic data land here.
fn harmonic_floor(harmonics: ArrayView1<Complex64>) -> f64 {
    let peak = harmonics.iter().map(|c| c.norm()).fold(0.0, f64::max);
    f64::EPSILON.sqrt() * if peak > 0.0 && peak.is_finite() { peak } else { 1.0 }
}

/// Population standard deviation of the real parts of the harmonic tail,
/// floored at [`harmonic_floor`].
pub(crate) fn harmonic_tail_std(harmonics: ArrayView1<Complex64>, tail_fraction: usize) -> f64 {
    let nharm = harmonics.len();
    if nharm == 0 {
        return f64::EPSILON.sqrt();
    }
    let ntail = tail_length(nharm, tail_fraction);
    let tail = harmonics.slice(ndarray::s![nharm - ntail..]);
    let mean = tail.iter().map(|c| c.re).sum::<f64>() / ntail as f64;
    let var = tail.iter().map(|c| (c.re - mean).powi(2)).sum::<f64>() / ntail as f64;
    let std = var.sqrt();
    let floor = harmonic_floor(harmonics);
    if std.is_finite() {
        std.max(floor)
    } else {
        floor
    }
}

/// Sample standard deviation from the mean tail power, floored like
/// [`harmonic_tail_std`] after conversion to the sample domain.
pub(crate) fn power_tail_std(harmonics: ArrayView1<Complex64>, nbin: usize, tail_fraction: usize) -> f64 {
    let nharm = harmonics.len();
    if nharm == 0 || nbin == 0 {
        return f64::EPSILON.sqrt();
    }
    let ntail = tail_length(nharm, tail_fraction);
    let n = nbin as f64;
    let mean_pow = harmonics
        .slice(ndarray::s![nharm - ntail..])
        .iter()
        .map(|c| c.norm_sqr() / n)
        .sum::<f64>()
        / ntail as f64;
    let std = mean_pow.sqrt();
    let floor = harmonic_floor(harmonics) * (2.0 / n).sqrt();
    if std.is_finite() {
        std.max(floor)
    } else {
        floor
    }
}

impl NoiseEstimator {
    pub fn precision() -> Self {
        NoiseEstimator {
            output: NoiseOutput::Precision,
            ..Default::default()
        }
    }

    fn finish(&self, std: f64) -> f64 {
        match self.output {
            NoiseOutput::Std => std,
            NoiseOutput::Precision => std.powi(-2),
        }
    }

    pub fn harmonic() -> Self {
        NoiseEstimator {
            domain: NoiseDomain::Harmonic,
            ..Default::default()
        }
    }

    fn tail_std(&self, profile: ArrayView1<f64>, plan: &HarmonicTransform) -> f64 {
        let harmonics = plan.forward(profile);
        match self.domain {
            NoiseDomain::Harmonic => harmonic_tail_std(harmonics.view(), self.tail_fraction),
            NoiseDomain::Power => power_tail_std(harmonics.view(), plan.nbin(), self.tail_fraction),
        }
    }

    /// Noise of a single profile.
    pub fn profile(&self, profile: ArrayView1<f64>) -> f64 {
        let plan = HarmonicTransform::new(profile.len());
        self.finish(self.tail_std(profile, &plan))
    }

    /// Independent noise estimate for every channel of a portrait.
    pub fn channels(&self, portrait: ArrayView2<f64>) -> Array1<f64> {
        let plan = HarmonicTransform::new(portrait.ncols());
        portrait
            .axis_iter(Axis(0))
            .map(|row| self.finish(self.tail_std(row, &plan)))
            .collect()
    }

    /// Single noise level for a portrait: the median of the channel standard
    /// deviations (converted to a precision afterwards if requested).
    pub fn median(&self, portrait: ArrayView2<f64>) -> f64 {
        let plan = HarmonicTransform::new(portrait.ncols());
        let mut stds: Vec<f64> = portrait
            .axis_iter(Axis(0))
            .map(|row| self.tail_std(row, &plan))
            .collect();
        self.finish(median(&mut stds))
    }
}

/// Median of a slice, averaging the two middle values for even lengths.
pub(crate) fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        0.5 * (values[mid - 1] + values[mid])
    } else {
        values[mid]
    }
}

/// Standard deviation of the samples of a profile, from its tail power.
pub fn get_noise(profile: ArrayView1<f64>) -> f64 {
    NoiseEstimator::default().profile(profile)
}

/// Per-channel sample standard deviations of a portrait.
pub fn get_noise_chans(portrait: ArrayView2<f64>) -> Array1<f64> {
    NoiseEstimator::default().channels(portrait)
}
