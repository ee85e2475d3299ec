//! Package manifest error types

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for package results
pub type Result<T> = std::result::Result<T, PackageError>;

/// Errors that can occur while reading a package manifest
#[derive(Error, Debug)]
pub enum PackageError {
    /// The manifest file could not be read
    #[error("IO error reading manifest {path}: {error}")]
    Io {
        /// Path of the manifest
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        error: std::io::Error,
    },

    /// The manifest was read but is not a valid manifest
    #[error("Invalid manifest {path}: {message}")]
    InvalidManifest {
        /// Path of the manifest
        path: PathBuf,
        /// What was wrong with it
        message: String,
    },

    /// JSON parsing failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
