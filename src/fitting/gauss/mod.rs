pub mod fitstruct;
pub mod gauss;
mod fitting;
