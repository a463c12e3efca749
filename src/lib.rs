//! Phase and dispersion-measure alignment of frequency-resolved pulse
//! profiles ("portraits"), template building by iterative co-addition, and
//! Gaussian-component modelling of the result.
//!
//! Data arrive as in-memory arrays through the [`Observation`] trait; no
//! archive format is read here. Diagnostics go through the `log` facade.

pub mod alignment;
pub mod error;
pub mod fitting;
pub mod models;
pub mod utils;

pub use crate::alignment::align::{AlignConfig, AlignmentOutcome, PortraitAligner, Termination};
pub use crate::alignment::model_builder::{GaussianModelBuilder, ModelBuildConfig};
pub use crate::error::PortraitError;
pub use crate::fitting::common::error::FittingError;
pub use crate::fitting::common::solver::SolverStatus;
pub use crate::fitting::gauss::gauss::NonlinearComponentFitter;
pub use crate::fitting::harmonic::fitstruct::FitResult;
pub use crate::fitting::harmonic::harmonic::{HarmonicAligner, HarmonicConfig};
pub use crate::models::gaussian::{GaussianComponent, GaussianModel, ProfileOptions};
pub use crate::utils::portrait::{Observation, Portrait};
