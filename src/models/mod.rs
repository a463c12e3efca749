pub mod gaussian;
pub mod join;
pub mod model_file;
pub mod powlaw;
pub mod sketch;
