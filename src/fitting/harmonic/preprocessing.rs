use crate::fitting::common::error::FittingError;
use crate::utils::fft::HarmonicTransform;
use crate::utils::noise::harmonic_tail_std;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use num_complex::Complex64;

type Result<T> = std::result::Result<T, FittingError>;

/// Data and model in the harmonic domain, with the per-channel weights the
/// phase/DM objective needs.
#[derive(Debug)]
pub(crate) struct HarmonicData {
    /// `D_k · conj(M_k)` per channel, shape `[nchan, nharm]`.
    pub cross: Array2<Complex64>,
    /// Tail-noise precision of each data channel.
    pub precision: Array1<f64>,
    /// `Σ_k |M_k|²` per channel.
    pub model_power: Array1<f64>,
    /// `Σ_c precision_c Σ_k |D_k|²`.
    pub data_power: f64,
    pub nbin: usize,
}

impl HarmonicData {
    pub fn nchan(&self) -> usize {
        self.cross.nrows()
    }
}

/// # Errors
/// Will return `Err` if data, model and frequencies do not agree in shape.
pub(crate) fn check_shapes(
    data: ArrayView2<f64>,
    model: ArrayView2<f64>,
    freqs: Option<ArrayView1<f64>>,
) -> Result<()> {
    if data.dim() != model.dim() {
        return Err(FittingError::ShapeMismatch(format!(
            "data is {:?} but model is {:?}",
            data.dim(),
            model.dim()
        )));
    }
    if let Some(f) = freqs {
        if f.len() != data.nrows() {
            return Err(FittingError::ShapeMismatch(format!(
                "{} frequencies for {} channels",
                f.len(),
                data.nrows()
            )));
        }
    }
    if data.nrows() == 0 || data.ncols() < 2 {
        return Err(FittingError::ShapeMismatch(format!(
            "cannot fit a portrait of shape {:?}",
            data.dim()
        )));
    }
    Ok(())
}

/// Transforms both portraits and derives the channel weights.
///
/// `precision` overrides the tail-noise estimate when given.
pub(crate) fn prepare(
    data: ArrayView2<f64>,
    model: ArrayView2<f64>,
    tail_fraction: usize,
    precision: Option<ArrayView1<f64>>,
) -> HarmonicData {
    let plan = HarmonicTransform::new(data.ncols());
    let d_fft = plan.forward_portrait(data);
    let m_fft = plan.forward_portrait(model);

    let precision: Array1<f64> = match precision {
        Some(p) => p.to_owned(),
        None => d_fft
            .axis_iter(Axis(0))
            .map(|row| harmonic_tail_std(row, tail_fraction).powi(-2))
            .collect(),
    };
    let model_power: Array1<f64> = m_fft
        .axis_iter(Axis(0))
        .map(|row| row.iter().map(|m| m.norm_sqr()).sum())
        .collect();
    let data_power = d_fft
        .axis_iter(Axis(0))
        .zip(precision.iter())
        .map(|(row, &w)| w * row.iter().map(|d| d.norm_sqr()).sum::<f64>())
        .sum();

    let mut cross = Array2::zeros(d_fft.raw_dim());
    Zip::from(&mut cross)
        .and(&d_fft)
        .and(&m_fft)
        .for_each(|c, &d, &m| *c = d * m.conj());

    HarmonicData {
        cross,
        precision,
        model_power,
        data_power,
        nbin: data.ncols(),
    }
}

/// `f⁻² − nu_ref⁻²` for every channel; zero for an infinite reference and
/// infinite channel frequencies alike.
pub(crate) fn frequency_terms(freqs: ArrayView1<f64>, nu_ref: f64) -> Array1<f64> {
    freqs.mapv(|f| f.powi(-2) - nu_ref.powi(-2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn shapes_must_agree() {
        let a = Array2::<f64>::zeros((2, 16));
        let b = Array2::<f64>::zeros((3, 16));
        assert!(matches!(
            check_shapes(a.view(), b.view(), None),
            Err(FittingError::ShapeMismatch(_))
        ));
        let f = array![1400.0];
        assert!(check_shapes(a.view(), a.view(), Some(f.view())).is_err());
        assert!(check_shapes(a.view(), a.view(), None).is_ok());
    }

    #[test]
    fn model_power_is_parseval() {
        let model = Array2::from_shape_fn((1, 8), |(_, b)| if b == 0 { 1.0 } else { 0.0 });
        let prepared = prepare(model.view(), model.view(), 4, Some(array![1.0].view()));
        // an impulse has |M_k| = 1 for all 5 harmonics
        assert_relative_eq!(prepared.model_power[0], 5.0);
        assert_relative_eq!(prepared.data_power, 5.0);
    }

    #[test]
    fn infinite_reference_frequency() {
        let terms = frequency_terms(array![1000.0, f64::INFINITY].view(), f64::INFINITY);
        assert_relative_eq!(terms[0], 1e-6);
        assert_eq!(terms[1], 0.0);
    }
}
