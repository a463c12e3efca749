//! Real half-spectrum ("harmonic") transforms of profiles and portraits.
//!
//! Conventions follow the usual real FFT: a profile of `N` samples has
//! `N/2 + 1` harmonics, the forward transform is unnormalised and the inverse
//! carries the `1/N`. On the inverse, the imaginary parts of the DC and (for
//! even `N`) Nyquist harmonics are discarded.
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use num_complex::Complex64;
use rustfft::{Fft, FftPlanner};
use std::fmt;
use std::sync::Arc;

/// Number of harmonics in the half-spectrum of an `nbin`-sample profile.
pub fn num_harmonics(nbin: usize) -> usize {
    if nbin == 0 {
        0
    } else {
        nbin / 2 + 1
    }
}

/// Forward/inverse plans for profiles of a fixed length.
pub struct HarmonicTransform {
    nbin: usize,
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
}

impl fmt::Debug for HarmonicTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HarmonicTransform")
            .field("nbin", &self.nbin)
            .finish()
    }
}

impl HarmonicTransform {
    pub fn new(nbin: usize) -> Self {
        let mut planner = FftPlanner::new();
        // empty profiles are never transformed
        let forward = planner.plan_fft_forward(nbin.max(1));
        let inverse = planner.plan_fft_inverse(nbin.max(1));
        HarmonicTransform {
            nbin,
            forward,
            inverse,
        }
    }

    pub fn nbin(&self) -> usize {
        self.nbin
    }

    pub fn nharm(&self) -> usize {
        num_harmonics(self.nbin)
    }

    /// Half-spectrum of a real profile, cropped or zero-padded to `nbin`
    /// samples first.
    pub fn forward(&self, profile: ArrayView1<f64>) -> Array1<Complex64> {
        if self.nbin == 0 {
            return Array1::zeros(0);
        }
        let mut buffer: Vec<Complex64> = profile
            .iter()
            .take(self.nbin)
            .map(|&x| Complex64::new(x, 0.0))
            .collect();
        buffer.resize(self.nbin, Complex64::new(0.0, 0.0));
        self.forward.process(&mut buffer);
        buffer.truncate(self.nharm());
        Array1::from(buffer)
    }

    /// Real profile from its half-spectrum. Missing harmonics count as zero
    /// and surplus ones are ignored.
    pub fn inverse(&self, harmonics: ArrayView1<Complex64>) -> Array1<f64> {
        let n = self.nbin;
        if n == 0 {
            return Array1::zeros(0);
        }
        let nharm = self.nharm().min(harmonics.len());
        let mut buffer = vec![Complex64::new(0.0, 0.0); n];
        for k in 0..nharm {
            if k == 0 || 2 * k == n {
                buffer[k] = Complex64::new(harmonics[k].re, 0.0);
            } else {
                buffer[k] = harmonics[k];
                buffer[n - k] = harmonics[k].conj();
            }
        }
        self.inverse.process(&mut buffer);
        let scale = 1.0 / n as f64;
        buffer.iter().map(|c| c.re * scale).collect()
    }

    /// Channel-wise half-spectra of a portrait, shape `[nchan, nharm]`.
    pub fn forward_portrait(&self, portrait: ArrayView2<f64>) -> Array2<Complex64> {
        let mut out = Array2::zeros((portrait.nrows(), self.nharm()));
        for (row, mut out_row) in portrait.axis_iter(Axis(0)).zip(out.axis_iter_mut(Axis(0))) {
            out_row.assign(&self.forward(row));
        }
        out
    }

    /// Channel-wise inverse of [`HarmonicTransform::forward_portrait`].
    pub fn inverse_portrait(&self, harmonics: ArrayView2<Complex64>) -> Array2<f64> {
        let mut out = Array2::zeros((harmonics.nrows(), self.nbin));
        for (row, mut out_row) in harmonics.axis_iter(Axis(0)).zip(out.axis_iter_mut(Axis(0))) {
            out_row.assign(&self.inverse(row));
        }
        out
    }
}

/// One-off half-spectrum of a profile.
pub fn rfft(profile: ArrayView1<f64>) -> Array1<Complex64> {
    HarmonicTransform::new(profile.len()).forward(profile)
}

/// One-off inverse half-spectrum transform to `nbin` samples.
pub fn irfft(harmonics: ArrayView1<Complex64>, nbin: usize) -> Array1<f64> {
    HarmonicTransform::new(nbin).inverse(harmonics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::portrait::rotate_profile;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn impulse_has_flat_spectrum() {
        let prof = array![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let spec = rfft(prof.view());
        assert_eq!(spec.len(), 5);
        for c in spec.iter() {
            assert_abs_diff_eq!(c.re, 1.0, epsilon = 1e-12);
            assert_abs_diff_eq!(c.im, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn inverse_recovers_even_and_odd_lengths() {
        for nbin in [16usize, 15] {
            let prof: Array1<f64> = (0..nbin).map(|i| ((i * i) % 7) as f64 - 2.5).collect();
            let plan = HarmonicTransform::new(nbin);
            let back = plan.inverse(plan.forward(prof.view()).view());
            for (a, b) in prof.iter().zip(back.iter()) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn empty_profiles_stay_empty() {
        let empty = Array1::<f64>::zeros(0);
        let plan = HarmonicTransform::new(0);
        assert_eq!(plan.nharm(), 0);
        assert!(plan.forward(empty.view()).is_empty());
        assert!(plan.inverse(Array1::zeros(0).view()).is_empty());
        assert!(rotate_profile(empty.view(), 0.3).is_empty());
    }

    #[test]
    fn mismatched_lengths_are_cropped_or_padded() {
        let prof = array![1.0, 2.0, 3.0, 4.0];
        let plan = HarmonicTransform::new(8);
        let padded = plan.forward(prof.view());
        assert_eq!(padded.len(), 5);
        assert_abs_diff_eq!(padded[0].re, 10.0, epsilon = 1e-12);
        let back = plan.inverse(padded.slice(ndarray::s![..3]));
        assert_eq!(back.len(), 8);
    }
}
