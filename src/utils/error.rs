//! Error types for the denoiser.
//!
//! Uses thiserror for ergonomic error definitions. Configuration errors are
//! raised eagerly, before any computation starts, and carry the offending
//! value verbatim.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for denoiser operations.
#[derive(Error, Debug)]
pub enum DenoiseError {
    /// Invalid configuration value, reported before training begins.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Input tensor shape incompatible with the requested operation.
    #[error("Shape error: {0}")]
    Shape(String),

    /// Error with dataset operations.
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Error loading or processing an image.
    #[error("Failed to load image at '{0}': {1}")]
    ImageLoad(PathBuf, String),

    /// Checkpoint save/restore failure, including restore mismatches that
    /// were not explicitly allowed with `expect_partial`.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Convenience Result type for denoiser operations.
pub type Result<T> = std::result::Result<T, DenoiseError>;

impl From<serde_json::Error> for DenoiseError {
    fn from(err: serde_json::Error) -> Self {
        DenoiseError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DenoiseError::Config("levels must be > 0, got 0".to_string());
        assert_eq!(
            format!("{}", err),
            "Configuration error: levels must be > 0, got 0"
        );
    }

    #[test]
    fn test_image_load_error() {
        let path = PathBuf::from("/data/images/broken.png");
        let err = DenoiseError::ImageLoad(path, "truncated file".to_string());
        assert!(format!("{}", err).contains("broken.png"));
    }
}
