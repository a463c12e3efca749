pub mod constants;
pub mod fft;
pub mod noise;
pub mod portrait;
