//! # blind-denoise
//!
//! A multi-scale, bias-free blind image denoiser built on the Burn framework.
//!
//! The model decomposes an image into a pyramid of spatial scales, denoises
//! every level with a residual convolutional sub-network (optionally shared
//! across levels), and recomposes the result with the inverse pyramid. The
//! "bias-free" discipline removes every additive offset from the network so
//! that scaling the input scales the output by the same factor.
//!
//! ## Modules
//!
//! - `model`: pyramid transform, normalization stages, residual sub-networks
//!   and the assembled denoiser
//! - `loss`: the multi-term training objective and quality metrics
//! - `dataset`: image-folder loading, noise augmentation and batch prefetch
//! - `training`: the step/epoch loop, checkpointing, pruning, visualization
//! - `inference`: iterated denoising on integer-range images
//! - `utils`: errors, logging and the observability event stream

pub mod backend;
pub mod config;
pub mod dataset;
pub mod inference;
pub mod loss;
pub mod model;
pub mod training;
pub mod utils;

pub use config::Config;
pub use inference::predictor::Predictor;
pub use loss::LossEngine;
pub use model::assembler::MultiscaleDenoiser;
pub use model::pyramid::PyramidTransform;
pub use training::trainer::{TrainState, Trainer};
pub use utils::error::{DenoiseError, Result};

/// Numeric guard shared by every division on a computed statistic or
/// magnitude (normalization sigma, NAE denominator, SNR, softmax weighting,
/// gradient magnitude). One value for the whole system.
pub const EPSILON: f32 = 1e-6;

/// Lower bound of the model's internal value space.
pub const INTERNAL_MIN: f32 = -0.5;

/// Upper bound of the model's internal value space.
pub const INTERNAL_MAX: f32 = 0.5;

/// Version of the library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
