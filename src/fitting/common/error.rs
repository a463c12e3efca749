use thiserror::Error;

/// Enum of the possible error variants that may be encountered
#[derive(Error, Debug)]
pub enum FittingError {
    /// Channel or bin counts of the inputs to a fit do not agree
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Represents input that cannot be fitted at all, e.g. an empty parameter vector
    #[error("{0}")]
    InvalidInput(String),

    /// Represents a bad fit, for any reason
    #[error("{0}")]
    BadFit(String),

    /// The underlying solver refused the problem before iterating
    #[error("Solver error: {0}")]
    Solver(String),
}
