use crate::fitting::common::solver::ResidualProblem;
use crate::models::gaussian::{
    gaussian_profile, scatter, GaussianComponent, GaussianModel, ProfileOptions, Scattering, PORTRAIT_STRIDE,
    PROFILE_STRIDE,
};
use crate::models::join::{rotate_channels, JoinBand};
use crate::models::powlaw::powlaw;
use crate::utils::fft::HarmonicTransform;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

/// `[dc, (loc, wid, amp) * n, tau?]` against a single profile.
pub(crate) struct ProfileProblem<'a> {
    pub data: ArrayView1<'a, f64>,
    pub errs: ArrayView1<'a, f64>,
    pub ngauss: usize,
    /// A trailing scattering timescale [rot] follows the components.
    pub scattered: bool,
    pub options: ProfileOptions,
    pub plan: HarmonicTransform,
}

impl ProfileProblem<'_> {
    pub fn model(&self, params: &[f64]) -> Array1<f64> {
        let nbin = self.data.len();
        let mut model = Array1::from_elem(nbin, params[0]);
        for block in params[1..1 + PROFILE_STRIDE * self.ngauss].chunks(PROFILE_STRIDE) {
            model.scaled_add(block[2], &gaussian_profile(nbin, block[0], block[1], &self.options));
        }
        if self.scattered {
            let tau = params[1 + PROFILE_STRIDE * self.ngauss];
            model = scatter(&self.plan, model.view(), tau);
        }
        model
    }
}

impl ResidualProblem for ProfileProblem<'_> {
    fn num_residuals(&self) -> usize {
        self.data.len()
    }

    fn residuals(&self, params: &[f64], out: &mut [f64]) {
        let model = self.model(params);
        for (i, r) in out.iter_mut().enumerate() {
            *r = (self.data[i] - model[i]) / self.errs[i];
        }
    }
}

/// `[dc, (loc, m_loc, wid, m_wid, amp, alpha) * n, tau?, tau_index?,
/// (phi_join, dm_join) * nband]` against a portrait.
pub(crate) struct PortraitProblem<'a> {
    pub data: ArrayView2<'a, f64>,
    /// Noise of each channel.
    pub errs: ArrayView1<'a, f64>,
    pub freqs: ArrayView1<'a, f64>,
    pub nu_ref: f64,
    pub ngauss: usize,
    pub scattered: bool,
    pub options: ProfileOptions,
    /// Pulse period [s], for the DM offsets of `join`.
    pub period: f64,
    pub join: &'a [JoinBand],
}

impl PortraitProblem<'_> {
    pub fn gaussian_model(&self, params: &[f64]) -> GaussianModel {
        let mut model = GaussianModel::new("", self.nu_ref, params[0]);
        model.components = params[1..1 + PORTRAIT_STRIDE * self.ngauss]
            .chunks(PORTRAIT_STRIDE)
            .map(GaussianComponent::from_slice)
            .collect();
        if self.scattered {
            let i = 1 + PORTRAIT_STRIDE * self.ngauss;
            model.scattering = Some(Scattering {
                tau: params[i],
                index: params[i + 1],
            });
        }
        model
    }

    /// Index of the first join offset.
    pub fn join_start(&self) -> usize {
        1 + PORTRAIT_STRIDE * self.ngauss + if self.scattered { 2 } else { 0 }
    }

    pub fn model(&self, params: &[f64]) -> Array2<f64> {
        let mut model = self
            .gaussian_model(params)
            .portrait(self.data.ncols(), self.freqs, &self.options);
        let start = self.join_start();
        for (band, offsets) in self.join.iter().zip(params[start..].chunks(2)) {
            rotate_channels(
                &mut model,
                &band.channels,
                self.freqs,
                offsets[0],
                offsets[1],
                self.period,
                self.nu_ref,
            );
        }
        model
    }
}

impl ResidualProblem for PortraitProblem<'_> {
    fn num_residuals(&self) -> usize {
        self.data.len()
    }

    fn residuals(&self, params: &[f64], out: &mut [f64]) {
        let model = self.model(params);
        let nbin = self.data.ncols();
        for ((ichan, ibin), &d) in self.data.indexed_iter() {
            out[ichan * nbin + ibin] = (d - model[[ichan, ibin]]) / self.errs[ichan];
        }
    }
}

/// `[A, alpha]` against the valid channels of a flux spectrum.
pub(crate) struct PowlawProblem {
    pub freqs: Vec<f64>,
    pub data: Vec<f64>,
    pub errs: Vec<f64>,
    pub nu0: f64,
}

impl ResidualProblem for PowlawProblem {
    fn num_residuals(&self) -> usize {
        self.data.len()
    }

    fn residuals(&self, params: &[f64], out: &mut [f64]) {
        for (i, r) in out.iter_mut().enumerate() {
            *r = (self.data[i] - powlaw(self.freqs[i], self.nu0, params[0], params[1])) / self.errs[i];
        }
    }
}
