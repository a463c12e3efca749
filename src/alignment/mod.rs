pub mod align;
pub mod model_builder;
