use std::io;

use thiserror::Error;

/// Central error type for the varan engine.
#[derive(Debug, Error)]
pub enum VaranError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid or incomplete configuration, rejected before startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// The request handler refused its startup parameters.
    #[error("handler error: {0}")]
    Handler(String),

    /// Generic or miscellaneous error.
    #[error("{0}")]
    Other(String),
}

pub type VaranResult<T> = Result<T, VaranError>;
