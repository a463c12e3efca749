pub mod common;
pub mod gauss;
pub mod harmonic;
