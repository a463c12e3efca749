use crate::fitting::common::error::FittingError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PortraitError {
    /// Represents a model file that does not follow the fixed-stride layout
    #[error("Malformed model file: {0}")]
    MalformedModelFile(String),

    /// Represents a join-parameter file line that cannot be parsed
    #[error("Malformed join file: {0}")]
    MalformedJoinFile(String),

    /// Unable to read or write a file
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// Fitting failed
    #[error("{0}")]
    Fitting(#[from] FittingError),
}
