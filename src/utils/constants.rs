/// "Traditional" dispersion constant [MHz² pc⁻¹ cm³ s], as used by psrchive.
pub const DISPERSION_CONSTANT: f64 = 1.0 / 0.000_241;

/// FWHM = `FWHM_TO_SIGMA` × σ for a Gaussian, i.e. 2·sqrt(2·ln 2).
pub const FWHM_TO_SIGMA: f64 = 2.354_820_045_030_949_3;

/// Gaussian kernels are not evaluated further than this many σ from centre.
pub const GAUSSIAN_CUTOFF_SIGMA: f64 = 20.0;

/// Fraction denominator for the high-harmonic tail used in noise estimates.
pub const NOISE_TAIL_FRACTION: usize = 4;

/// Default frequency index of the scattering timescale, for a Kolmogorov medium.
pub const SCATTERING_INDEX: f64 = -4.4;
