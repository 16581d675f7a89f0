//! Error type shared by every stage of a deconvolution run.
//!
//! Configuration and shape errors are raised before any buffer is allocated.
//! Numerical edge cases inside the update kernel (division by zero, NaN) are sanitized in
//! place and never surface here. A user interruption is a terminal run state, not an error.

use std::io;
use std::path::PathBuf;

/// Errors that can occur while preparing or running a deconvolution.
#[derive(Debug, thiserror::Error)]
pub enum DeconvolutionError {
    /// A configuration value is outside the supported set (block count, first-estimate
    /// strategy, negative regularization weight, ...).
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// Two volumes that must agree in shape (or rank) do not.
    #[error("dimension mismatch: expected {expected:?}, got {got:?}")]
    DimensionMismatch { expected: Vec<usize>, got: Vec<usize> },

    /// Only 2D and 3D volumes are supported.
    #[error("unsupported rank {0}: only 2D and 3D volumes are supported")]
    UnsupportedRank(usize),

    /// The run has been closed and its buffers released.
    #[error("the deconvolution run has already been closed")]
    Closed,

    #[error("failed to map backing file '{path}': {source}")]
    MapBackingFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to read npy file: {0}")]
    ReadNpy(#[from] ndarray_npy::ReadNpyError),

    #[error("failed to write npy file: {0}")]
    WriteNpy(#[from] ndarray_npy::WriteNpyError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("image encoding error: {0}")]
    Image(#[from] image::ImageError),

    #[error("invalid job file: {0}")]
    Json(#[from] serde_json::Error),
}

impl DeconvolutionError {
    /// Builds a [`DeconvolutionError::DimensionMismatch`] from two shapes.
    pub fn mismatch(expected: &[usize], got: &[usize]) -> Self {
        DeconvolutionError::DimensionMismatch {
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, DeconvolutionError>;

/// Fails with [`DeconvolutionError::UnsupportedRank`] unless `rank` is 2 or 3.
pub fn check_rank(rank: usize) -> Result<()> {
    match rank {
        2 | 3 => Ok(()),
        other => Err(DeconvolutionError::UnsupportedRank(other)),
    }
}
