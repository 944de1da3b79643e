// src/error.rs

use std::error::Error;
use std::path::PathBuf;
use thiserror::Error;

/// A thread-safe wrapper for standard dynamic errors,
/// so they implement `Send` and `Sync`.
pub type ThreadSafeStdError = Box<dyn Error + Send + Sync + 'static>;

/// Errors raised by the denoising engine and its I/O collaborators.
#[derive(Debug, Error)]
pub enum DenoiseError {
    /// Inputs or parameters that cannot describe a valid run
    /// (dimension mismatch, empty mask, bad component budget, ...).
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The file could not be opened, read, or written.
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file was readable but is not a usable NIfTI volume.
    #[error("Invalid volume file {path:?}: {message}")]
    Format { path: PathBuf, message: String },

    /// The symmetric eigendecomposition of the covariance matrix failed.
    #[error("Eigendecomposition of the {dim}x{dim} covariance matrix failed: {source}")]
    Decomposition {
        dim: usize,
        #[source]
        source: ThreadSafeStdError,
    },

    /// Saving or loading a component model failed, or the loaded model is inconsistent.
    #[error("Component model error: {0}")]
    Model(String),
}

impl DenoiseError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        DenoiseError::Configuration(message.into())
    }
}

pub type Result<T> = std::result::Result<T, DenoiseError>;
