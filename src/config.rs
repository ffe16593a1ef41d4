//! Typed configuration.
//!
//! The configuration is a nested document: `{"model", "dataset", "loss",
//! "train"}`. Every default is enumerated here, on the field it belongs to;
//! missing keys fall back to those defaults and unknown keys are ignored.
//! `validate()` runs eagerly at startup so invalid values surface before any
//! computation begins, with the offending value in the message.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::model::pyramid::PyramidKind;
use crate::model::resnet::ModelKind;
use crate::training::pruning::PruneStrategy;
use crate::utils::error::{DenoiseError, Result};

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub loss: LossConfig,
    #[serde(default)]
    pub train: TrainConfig,
}

impl Config {
    /// Load a configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        Ok(config)
    }

    /// Save the as-run configuration to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Validate every section. Called once, before training begins.
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.dataset.validate()?;
        self.loss.validate()?;
        self.train.validate()
    }
}

/// Architecture of the multi-scale denoiser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model family: "resnet", "sparse_resnet" or "gatenet".
    #[serde(default = "defaults::model_type", rename = "type")]
    pub model_type: String,

    /// Number of input channels (1 or 3).
    #[serde(default = "defaults::channels")]
    pub channels: usize,

    /// Filters per convolution layer.
    #[serde(default = "defaults::filters")]
    pub filters: usize,

    /// Residual blocks per sub-network.
    #[serde(default = "defaults::no_layers")]
    pub no_layers: usize,

    /// Convolution kernel size.
    #[serde(default = "defaults::kernel_size")]
    pub kernel_size: usize,

    /// Lowest raw input value (pre-normalization).
    #[serde(default = "defaults::min_value")]
    pub min_value: f64,

    /// Highest raw input value (pre-normalization).
    #[serde(default = "defaults::max_value")]
    pub max_value: f64,

    /// Use batch normalization inside residual blocks.
    #[serde(default = "defaults::yes")]
    pub batchnorm: bool,

    /// Omit every additive bias/offset parameter.
    #[serde(default = "defaults::yes")]
    pub bias_free: bool,

    /// Clamp the recomposed output to the internal value space.
    #[serde(default)]
    pub clip_values: bool,

    /// Reuse one sub-network for every pyramid level.
    #[serde(default)]
    pub shared_model: bool,

    /// Scale applied to sub-network outputs before denormalization.
    #[serde(default = "defaults::one")]
    pub output_multiplier: f64,

    /// Per-level statistics normalization: > 0 selects a local window of
    /// that size, 0 selects global statistics, < 0 disables the stage.
    #[serde(default = "defaults::minus_one")]
    pub local_normalization: i64,

    /// Activation on the residual correction: "linear" or "tanh".
    #[serde(default = "defaults::final_activation")]
    pub final_activation: String,

    /// Weight penalty reported to the loss engine: "l1", "l2" or "none".
    #[serde(default = "defaults::kernel_regularizer")]
    pub kernel_regularizer: String,

    /// Weight initializer: "glorot_normal", "glorot_uniform", "he_normal",
    /// "he_uniform" or "zeros".
    #[serde(default = "defaults::kernel_initializer")]
    pub kernel_initializer: String,

    /// Also expose per-block outputs for diagnostic supervision.
    #[serde(default)]
    pub intermediate_results: bool,

    /// Pyramid decomposition.
    #[serde(default)]
    pub pyramid: PyramidConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty model config")
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.filters == 0 {
            return Err(DenoiseError::Config("filters must be > 0, got 0".into()));
        }
        if self.no_layers == 0 {
            return Err(DenoiseError::Config("no_layers must be > 0, got 0".into()));
        }
        if self.kernel_size == 0 {
            return Err(DenoiseError::Config("kernel_size must be > 0, got 0".into()));
        }
        if self.channels != 1 && self.channels != 3 {
            return Err(DenoiseError::Config(format!(
                "channels must be 1 or 3, got {}",
                self.channels
            )));
        }
        if self.max_value <= self.min_value {
            return Err(DenoiseError::Config(format!(
                "max_value must be > min_value, got [{}, {}]",
                self.min_value, self.max_value
            )));
        }
        if self.local_normalization > 0 && self.local_normalization % 2 == 0 {
            return Err(DenoiseError::Config(format!(
                "local_normalization window must be odd, got {}",
                self.local_normalization
            )));
        }
        match self.final_activation.as_str() {
            "linear" | "tanh" => {}
            other => {
                return Err(DenoiseError::Config(format!(
                    "unknown final_activation [{}]",
                    other
                )))
            }
        }
        // String-tagged selectors fail here, carrying the offending value.
        ModelKind::parse(&self.model_type)?;
        crate::model::resnet::Regularizer::parse(&self.kernel_regularizer)?;
        crate::model::resnet::parse_initializer(&self.kernel_initializer)?;
        self.pyramid.validate()
    }
}

/// Pyramid decomposition settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PyramidConfig {
    /// Decomposition strategy: "laplacian" or "identity".
    #[serde(default = "defaults::pyramid_kind", rename = "type")]
    pub kind: String,

    /// Number of scale levels.
    #[serde(default = "defaults::levels")]
    pub levels: usize,
}

impl Default for PyramidConfig {
    fn default() -> Self {
        Self {
            kind: defaults::pyramid_kind(),
            levels: defaults::levels(),
        }
    }
}

impl PyramidConfig {
    pub fn validate(&self) -> Result<()> {
        if self.levels == 0 {
            return Err(DenoiseError::Config("levels must be > 0, got 0".into()));
        }
        let kind = PyramidKind::parse(&self.kind)?;
        if kind == PyramidKind::Identity && self.levels != 1 {
            return Err(DenoiseError::Config(format!(
                "identity pyramid requires levels == 1, got {}",
                self.levels
            )));
        }
        Ok(())
    }
}

/// Dataset location and augmentation statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Directory scanned recursively for training images.
    #[serde(default)]
    pub directory: String,

    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,

    /// Training patch size as `[height, width]`.
    #[serde(default = "defaults::input_shape")]
    pub input_shape: [usize; 2],

    /// Additive Gaussian noise sigmas; one is drawn per batch.
    #[serde(default = "defaults::additive_noise")]
    pub additive_noise: Vec<f64>,

    /// Multiplicative Gaussian noise sigmas; one is drawn per batch.
    #[serde(default = "defaults::multiplicative_noise")]
    pub multiplicative_noise: Vec<f64>,

    /// Randomly blur the noisy branch.
    #[serde(default)]
    pub random_blur: bool,

    /// Random horizontal flip, applied to both tensors.
    #[serde(default)]
    pub random_left_right: bool,

    /// Random vertical flip, applied to both tensors.
    #[serde(default)]
    pub random_up_down: bool,

    /// Seed for augmentation decisions and epoch shuffling.
    #[serde(default = "defaults::seed")]
    pub seed: u64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty dataset config")
    }
}

impl DatasetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(DenoiseError::Config("batch_size must be > 0, got 0".into()));
        }
        if self.input_shape[0] == 0 || self.input_shape[1] == 0 {
            return Err(DenoiseError::Config(format!(
                "input_shape must be positive, got {:?}",
                self.input_shape
            )));
        }
        if self.additive_noise.is_empty() {
            return Err(DenoiseError::Config(
                "additive_noise must list at least one sigma".into(),
            ));
        }
        if self.multiplicative_noise.is_empty() {
            return Err(DenoiseError::Config(
                "multiplicative_noise must list at least one sigma".into(),
            ));
        }
        Ok(())
    }
}

/// Weights and options of the training objective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossConfig {
    /// Per-pixel differences below this value contribute zero.
    #[serde(default)]
    pub hinge: f64,

    #[serde(default = "defaults::one")]
    pub mae_multiplier: f64,

    #[serde(default)]
    pub nae_multiplier: f64,

    /// Multiplier on the model-reported weight penalties.
    #[serde(default = "defaults::one")]
    pub regularization: f64,

    /// Enable the edge-weighted MAE term.
    #[serde(default)]
    pub mae_delta: bool,

    /// Gradient kernel size for the edge weighting (2–5).
    #[serde(default = "defaults::delta_kernel_size")]
    pub delta_kernel_size: usize,

    /// Compute reconstruction terms per pyramid level. When absent the loss
    /// is computed once, on the full-resolution tensors.
    #[serde(default)]
    pub pyramid: Option<PyramidConfig>,
}

impl Default for LossConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty loss config")
    }
}

impl LossConfig {
    pub fn validate(&self) -> Result<()> {
        if self.hinge < 0.0 {
            return Err(DenoiseError::Config(format!(
                "hinge must be >= 0, got {}",
                self.hinge
            )));
        }
        if !(2..=5).contains(&self.delta_kernel_size) {
            return Err(DenoiseError::Config(format!(
                "delta_kernel_size must be in 2..=5, got {}",
                self.delta_kernel_size
            )));
        }
        if let Some(pyramid) = &self.pyramid {
            pyramid.validate()?;
        }
        Ok(())
    }
}

/// Optimizer settings. The learning rate follows an exponential decay
/// schedule evaluated per step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "defaults::learning_rate")]
    pub learning_rate: f64,

    /// Multiplier applied every `decay_steps` steps.
    #[serde(default = "defaults::decay_rate")]
    pub decay_rate: f64,

    #[serde(default = "defaults::decay_steps")]
    pub decay_steps: u64,

    /// L2 weight decay inside the optimizer. Zero disables it.
    #[serde(default)]
    pub weight_decay: f64,

    /// Gradient clipping max norm. Absent disables clipping.
    #[serde(default)]
    pub gradient_clip: Option<f64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty optimizer config")
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.learning_rate <= 0.0 {
            return Err(DenoiseError::Config(format!(
                "learning_rate must be > 0, got {}",
                self.learning_rate
            )));
        }
        if self.decay_rate <= 0.0 || self.decay_rate > 1.0 {
            return Err(DenoiseError::Config(format!(
                "decay_rate must be in (0, 1], got {}",
                self.decay_rate
            )));
        }
        if self.decay_steps == 0 {
            return Err(DenoiseError::Config("decay_steps must be > 0, got 0".into()));
        }
        Ok(())
    }

    /// Learning rate at `step`.
    pub fn learning_rate_at(&self, step: u64) -> f64 {
        self.learning_rate * self.decay_rate.powf(step as f64 / self.decay_steps as f64)
    }
}

/// Weight pruning triggers and strategies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneConfig {
    /// Named strategies applied in order. Empty (or "none" entries only)
    /// disables pruning.
    #[serde(default)]
    pub strategies: Vec<PruneStrategyConfig>,

    /// First epoch at which pruning triggers fire.
    #[serde(default)]
    pub start_epoch: u64,

    /// Additional within-epoch cadence: prune every this many steps.
    /// Non-positive disables the step trigger.
    #[serde(default = "defaults::minus_one")]
    pub steps: i64,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            strategies: Vec::new(),
            start_epoch: 0,
            steps: -1,
        }
    }
}

/// One named pruning strategy with its parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneStrategyConfig {
    /// "magnitude_threshold", "magnitude_percentile", "random_fraction"
    /// or "none".
    pub strategy: String,

    /// Absolute magnitude threshold (magnitude_threshold).
    #[serde(default)]
    pub threshold: f64,

    /// Fraction of weights to zero (magnitude_percentile, random_fraction).
    #[serde(default)]
    pub fraction: f64,

    /// Mask seed (random_fraction).
    #[serde(default = "defaults::seed")]
    pub seed: u64,
}

impl PruneConfig {
    pub fn validate(&self) -> Result<()> {
        for s in &self.strategies {
            PruneStrategy::parse(s)?;
        }
        Ok(())
    }

    /// Whether any strategy is active.
    pub fn enabled(&self) -> bool {
        self.strategies
            .iter()
            .any(|s| s.strategy.as_str() != "none")
    }
}

/// Training loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    #[serde(default = "defaults::epochs")]
    pub epochs: u64,

    /// Stop after this many optimizer updates. Non-positive disables the
    /// early exit.
    #[serde(default = "defaults::minus_one")]
    pub total_steps: i64,

    /// Checkpoint every this many steps. Non-positive disables the step
    /// trigger (epoch-end checkpoints are unconditional).
    #[serde(default = "defaults::minus_one")]
    pub checkpoint_every: i64,

    #[serde(default = "defaults::checkpoints_to_keep")]
    pub checkpoints_to_keep: usize,

    /// Tolerate missing members on checkpoint restore instead of failing.
    #[serde(default)]
    pub expect_partial: bool,

    /// Visualize every this many steps.
    #[serde(default = "defaults::visualization_every")]
    pub visualization_every: u64,

    /// Images per visualization dump.
    #[serde(default = "defaults::visualization_number")]
    pub visualization_number: usize,

    /// Self-feedback passes of the denoiser over the random batch.
    #[serde(default = "defaults::one_u64")]
    pub random_batch_iterations: u64,

    /// Spatial size `[height, width]` of the random visualization batch.
    #[serde(default = "defaults::random_batch_size")]
    pub random_batch_size: [usize; 2],

    /// Buckets of the weight histogram.
    #[serde(default = "defaults::weight_buckets")]
    pub weight_buckets: usize,

    #[serde(default)]
    pub optimizer: OptimizerConfig,

    #[serde(default)]
    pub prune: PruneConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty train config")
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(DenoiseError::Config("epochs must be > 0, got 0".into()));
        }
        if self.visualization_every == 0 {
            return Err(DenoiseError::Config(
                "visualization_every must be > 0, got 0".into(),
            ));
        }
        if self.random_batch_iterations == 0 {
            return Err(DenoiseError::Config(
                "random_batch_iterations must be > 0, got 0".into(),
            ));
        }
        if self.checkpoints_to_keep == 0 {
            return Err(DenoiseError::Config(
                "checkpoints_to_keep must be > 0, got 0".into(),
            ));
        }
        self.optimizer.validate()?;
        self.prune.validate()
    }
}

mod defaults {
    pub fn model_type() -> String {
        "resnet".to_string()
    }
    pub fn channels() -> usize {
        3
    }
    pub fn filters() -> usize {
        32
    }
    pub fn no_layers() -> usize {
        5
    }
    pub fn kernel_size() -> usize {
        3
    }
    pub fn min_value() -> f64 {
        0.0
    }
    pub fn max_value() -> f64 {
        255.0
    }
    pub fn yes() -> bool {
        true
    }
    pub fn one() -> f64 {
        1.0
    }
    pub fn one_u64() -> u64 {
        1
    }
    pub fn minus_one() -> i64 {
        -1
    }
    pub fn final_activation() -> String {
        "linear".to_string()
    }
    pub fn kernel_regularizer() -> String {
        "l1".to_string()
    }
    pub fn kernel_initializer() -> String {
        "glorot_normal".to_string()
    }
    pub fn pyramid_kind() -> String {
        "laplacian".to_string()
    }
    pub fn levels() -> usize {
        1
    }
    pub fn batch_size() -> usize {
        16
    }
    pub fn input_shape() -> [usize; 2] {
        [256, 256]
    }
    pub fn additive_noise() -> Vec<f64> {
        vec![0.1]
    }
    pub fn multiplicative_noise() -> Vec<f64> {
        vec![0.01]
    }
    pub fn seed() -> u64 {
        42
    }
    pub fn delta_kernel_size() -> usize {
        5
    }
    pub fn learning_rate() -> f64 {
        1e-3
    }
    pub fn decay_rate() -> f64 {
        0.9
    }
    pub fn decay_steps() -> u64 {
        10_000
    }
    pub fn epochs() -> u64 {
        1
    }
    pub fn checkpoints_to_keep() -> usize {
        3
    }
    pub fn visualization_every() -> u64 {
        1000
    }
    pub fn visualization_number() -> usize {
        5
    }
    pub fn random_batch_size() -> [usize; 2] {
        [256, 256]
    }
    pub fn weight_buckets() -> usize {
        100
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.model.filters, 32);
        assert_eq!(config.model.no_layers, 5);
        assert!(config.model.bias_free);
        assert_eq!(config.train.checkpoints_to_keep, 3);
    }

    #[test]
    fn test_missing_keys_fall_back() {
        let config: Config =
            serde_json::from_str(r#"{"model": {"filters": 64}, "train": {"epochs": 2}}"#).unwrap();
        assert_eq!(config.model.filters, 64);
        assert_eq!(config.model.no_layers, 5);
        assert_eq!(config.train.epochs, 2);
        assert_eq!(config.train.total_steps, -1);
    }

    #[test]
    fn test_unknown_model_type_is_fatal() {
        let config: Config =
            serde_json::from_str(r#"{"model": {"type": "densenet"}}"#).unwrap();
        let err = config.validate().unwrap_err();
        assert!(format!("{}", err).contains("densenet"));
    }

    #[test]
    fn test_invalid_counts_rejected() {
        let mut config = Config::default();
        config.model.filters = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.model.pyramid.levels = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.model.channels = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_identity_pyramid_rejects_multiple_levels() {
        let mut config = Config::default();
        config.model.pyramid.kind = "identity".to_string();
        config.model.pyramid.levels = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_learning_rate_schedule_decays() {
        let optimizer = OptimizerConfig {
            learning_rate: 0.1,
            decay_rate: 0.5,
            decay_steps: 100,
            ..Default::default()
        };
        assert!((optimizer.learning_rate_at(0) - 0.1).abs() < 1e-12);
        assert!((optimizer.learning_rate_at(100) - 0.05).abs() < 1e-12);
        assert!(optimizer.learning_rate_at(200) < optimizer.learning_rate_at(100));
    }
}
