use crate::fitting::common::solver::Objective;
use crate::fitting::harmonic::preprocessing::HarmonicData;
use ndarray::{Array1, ArrayView1};
use num_complex::Complex64;
use std::f64::consts::PI;

/// Per-channel harmonic cross-power sums at one trial rotation.
#[derive(Copy, Clone, Debug, Default)]
struct CrossSums {
    /// `Σ Re(D M* e^{2πikθ})`
    g1: f64,
    /// First derivative with respect to θ.
    g2: f64,
    /// Second derivative with respect to θ.
    g3: f64,
}

/// The phase/DM objective `-Σ_c w_c g1_c² / p_c`, minimised when the rotated
/// data line up with the model.
///
/// Adding the constant data power `Σ w |D|²` turns the minimum into the
/// chi-square of the best scaled fit.
pub(crate) struct PortraitObjective<'a> {
    harmonics: &'a HarmonicData,
    /// `f⁻² − nu_ref⁻²` per channel.
    freq_terms: Array1<f64>,
    /// `D / P`: rotations of delay per unit DM and unit `freq_terms`.
    dm_factor: f64,
}

impl<'a> PortraitObjective<'a> {
    pub fn new(harmonics: &'a HarmonicData, freq_terms: ArrayView1<f64>, dm_factor: f64) -> Self {
        PortraitObjective {
            harmonics,
            freq_terms: freq_terms.to_owned(),
            dm_factor,
        }
    }

    /// Rotation [rot] applied to channel `ichan` for the given phase and DM.
    pub fn channel_phase(&self, ichan: usize, phase: f64, dm: f64) -> f64 {
        phase + dm * self.dm_factor * self.freq_terms[ichan]
    }

    fn sums(&self, ichan: usize, theta: f64, derivatives: bool) -> CrossSums {
        let row = self.harmonics.cross.row(ichan);
        let mut out = CrossSums::default();
        for (k, c) in row.iter().enumerate() {
            let z = c * Complex64::from_polar(1.0, 2.0 * PI * k as f64 * theta);
            out.g1 += z.re;
            if derivatives {
                let w = 2.0 * PI * k as f64;
                // Re(i w z) and Re((i w)² z)
                out.g2 -= w * z.im;
                out.g3 -= w * w * z.re;
            }
        }
        out
    }

    fn weight(&self, ichan: usize) -> Option<f64> {
        let p = self.harmonics.model_power[ichan];
        if p > 0.0 {
            Some(self.harmonics.precision[ichan] / p)
        } else {
            None
        }
    }

    /// Data power `Σ w |D|²`, the constant that makes `value` a chi-square.
    pub fn data_power(&self) -> f64 {
        self.harmonics.data_power
    }

    /// Closed-form amplitude of each channel at the given rotation.
    pub fn scales(&self, phase: f64, dm: f64) -> Array1<f64> {
        (0..self.harmonics.nchan())
            .map(|ichan| {
                let p = self.harmonics.model_power[ichan];
                if p > 0.0 {
                    self.sums(ichan, self.channel_phase(ichan, phase, dm), false).g1 / p
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// One-sigma errors on the channel scales, `(2 p w)^(-1/2)`.
    pub fn scale_errors(&self) -> Array1<f64> {
        (&self.harmonics.model_power * &self.harmonics.precision * 2.0).mapv(|x| x.powf(-0.5))
    }
}

impl Objective for PortraitObjective<'_> {
    fn value(&self, x: &[f64]) -> f64 {
        let mut m = 0.0;
        for ichan in 0..self.harmonics.nchan() {
            if let Some(w) = self.weight(ichan) {
                let g1 = self.sums(ichan, self.channel_phase(ichan, x[0], x[1]), false).g1;
                m += w * g1 * g1;
            }
        }
        -m
    }

    fn gradient(&self, x: &[f64]) -> Option<Vec<f64>> {
        let (mut d_phi, mut d_dm) = (0.0, 0.0);
        for ichan in 0..self.harmonics.nchan() {
            if let Some(w) = self.weight(ichan) {
                let s = self.sums(ichan, self.channel_phase(ichan, x[0], x[1]), true);
                let chain = self.freq_terms[ichan] * self.dm_factor;
                d_phi -= 2.0 * w * s.g1 * s.g2;
                d_dm -= 2.0 * w * s.g1 * s.g2 * chain;
            }
        }
        Some(vec![d_phi, d_dm])
    }

    fn curvature(&self, x: &[f64]) -> Option<Vec<f64>> {
        let (mut d2_phi, mut d2_dm) = (0.0, 0.0);
        for ichan in 0..self.harmonics.nchan() {
            if let Some(w) = self.weight(ichan) {
                let s = self.sums(ichan, self.channel_phase(ichan, x[0], x[1]), true);
                let chain = self.freq_terms[ichan] * self.dm_factor;
                let d2 = -2.0 * w * (s.g2 * s.g2 + s.g1 * s.g3);
                d2_phi += d2;
                d2_dm += d2 * chain * chain;
            }
        }
        Some(vec![d2_phi, d2_dm])
    }
}

/// The portrait objective with DM held at zero, for single profiles.
pub(crate) struct PhaseObjective<'a>(pub PortraitObjective<'a>);

impl Objective for PhaseObjective<'_> {
    fn value(&self, x: &[f64]) -> f64 {
        self.0.value(&[x[0], 0.0])
    }

    fn gradient(&self, x: &[f64]) -> Option<Vec<f64>> {
        self.0.gradient(&[x[0], 0.0]).map(|g| vec![g[0]])
    }

    fn curvature(&self, x: &[f64]) -> Option<Vec<f64>> {
        self.0.curvature(&[x[0], 0.0]).map(|c| vec![c[0]])
    }
}

/// Circular cross-correlation of `data` rotated by each trial phase against
/// `model`, from their harmonics. Returns the trial phase with the largest
/// correlation.
pub(crate) fn scan_cross_correlation(cross: ArrayView1<Complex64>, nbin: usize, trials: ArrayView1<f64>) -> f64 {
    let nharm = cross.len();
    let mut best = (f64::NEG_INFINITY, 0.0);
    for &phase in trials.iter() {
        let mut corr = 0.0;
        for (k, c) in cross.iter().enumerate() {
            // the conjugate half of the spectrum doubles interior harmonics
            let fold = if k == 0 || (nbin % 2 == 0 && k == nharm - 1) {
                1.0
            } else {
                2.0
            };
            corr += fold * (c * Complex64::from_polar(1.0, 2.0 * PI * k as f64 * phase)).re;
        }
        if corr > best.0 {
            best = (corr, phase);
        }
    }
    best.1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fitting::harmonic::preprocessing::prepare;
    use crate::utils::portrait::rotate_portrait;
    use approx::assert_relative_eq;
    use ndarray::{array, Array2};

    fn objective_inputs() -> (Array2<f64>, Array2<f64>) {
        let model = Array2::from_shape_fn((3, 64), |(c, b)| {
            let x = b as f64 / 64.0 - 0.4 - 0.02 * c as f64;
            (-x * x / 0.004).exp()
        });
        let data = rotate_portrait(model.view(), -0.03, None);
        (data, model)
    }

    #[test]
    fn analytic_derivatives_match_differences() {
        let (data, model) = objective_inputs();
        let harmonics = prepare(data.view(), model.view(), 4, Some(array![1.0, 2.0, 0.5].view()));
        let terms = array![1e-7, 2e-7, 3e-7];
        let obj = PortraitObjective::new(&harmonics, terms.view(), 2e5);
        let x = [0.01, 0.2];
        let g = obj.gradient(&x).unwrap();
        let c = obj.curvature(&x).unwrap();
        for i in 0..2 {
            let h = 1e-6;
            let mut xp = x;
            let mut xm = x;
            xp[i] += h;
            xm[i] -= h;
            let fd = (obj.value(&xp) - obj.value(&xm)) / (2.0 * h);
            assert_relative_eq!(g[i], fd, max_relative = 1e-5);
            let gp = obj.gradient(&xp).unwrap()[i];
            let gm = obj.gradient(&xm).unwrap()[i];
            assert_relative_eq!(c[i], (gp - gm) / (2.0 * h), max_relative = 1e-5);
        }
    }

    #[test]
    fn scales_at_alignment() {
        let (data, model) = objective_inputs();
        let data = data * 3.0;
        let harmonics = prepare(data.view(), model.view(), 4, None);
        let terms = Array1::zeros(3);
        let obj = PortraitObjective::new(&harmonics, terms.view(), 0.0);
        for s in obj.scales(0.03, 0.0).iter() {
            assert_relative_eq!(*s, 3.0, max_relative = 1e-9);
        }
    }

    #[test]
    fn scan_finds_the_shift() {
        let (data, model) = objective_inputs();
        let harmonics = prepare(data.view(), model.view(), 4, None);
        let cross = harmonics.cross.sum_axis(ndarray::Axis(0));
        let trials = Array1::linspace(-0.5, 0.5, 1001);
        let best = scan_cross_correlation(cross.view(), 64, trials.view());
        assert_relative_eq!(best, 0.03, epsilon = 1e-3);
    }
}
