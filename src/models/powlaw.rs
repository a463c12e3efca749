//! Power-law spectra `F(nu) = A (nu / nu0)^alpha`.
use ndarray::Array1;

pub fn powlaw(nu: f64, nu0: f64, amp: f64, alpha: f64) -> f64 {
    amp * (nu / nu0).powf(alpha)
}

/// Integral of [`powlaw`] from `nu1` to `nu2`.
pub fn powlaw_integral(nu2: f64, nu1: f64, nu0: f64, amp: f64, alpha: f64) -> f64 {
    if alpha == -1.0 {
        amp * nu0 * (nu2 / nu1).ln()
    } else {
        let c = amp * nu0.powf(-alpha) / (1.0 + alpha);
        c * (nu2.powf(1.0 + alpha) - nu1.powf(1.0 + alpha))
    }
}

/// Splits the band `lo..hi` into `n` chunks of equal power for spectral index
/// `alpha`.
///
/// Returns the `n + 1` chunk edges, or the `n` chunk mid-points if `mid` is set.
pub fn powlaw_freqs(lo: f64, hi: f64, n: usize, alpha: f64, mid: bool) -> Array1<f64> {
    let edges: Array1<f64> = if alpha == -1.0 {
        Array1::linspace(lo.ln(), hi.ln(), n + 1).mapv(f64::exp)
    } else {
        let p = 1.0 + alpha;
        Array1::linspace(lo.powf(p), hi.powf(p), n + 1).mapv(|x| x.powf(1.0 / p))
    };
    if mid {
        (0..n).map(|i| 0.5 * (edges[i] + edges[i + 1])).collect()
    } else {
        edges
    }
}
