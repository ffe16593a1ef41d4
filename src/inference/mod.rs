//! Inference on trained models.

pub mod predictor;

pub use predictor::{ArtifactManifest, Predictor};
