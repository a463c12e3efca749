pub mod fitstruct;
pub mod harmonic;
mod fitting;
mod preprocessing;
