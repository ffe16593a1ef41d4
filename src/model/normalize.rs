//! Normalization stages.
//!
//! Two distinct concerns live here. `RangeNormalizer` is the affine map
//! between the raw value range `[min_value, max_value]` and the model's
//! internal `[-0.5, +0.5]` space. `SigmaNormalizer` computes per-level
//! mean/sigma statistics (from a local window or globally per channel) and
//! standardizes a pyramid level with them; the statistics live only for the
//! duration of one forward pass and are handed back for denormalization.

use burn::tensor::backend::Backend;
use burn::tensor::module::avg_pool2d;
use burn::tensor::Tensor;

use crate::utils::error::{DenoiseError, Result};
use crate::EPSILON;

/// Affine map between the raw range and the internal value space.
#[derive(Debug, Clone, Copy)]
pub struct RangeNormalizer {
    min_value: f64,
    max_value: f64,
}

impl RangeNormalizer {
    pub fn new(min_value: f64, max_value: f64) -> Result<Self> {
        if max_value <= min_value {
            return Err(DenoiseError::Config(format!(
                "max_value must be > min_value, got [{}, {}]",
                min_value, max_value
            )));
        }
        Ok(Self {
            min_value,
            max_value,
        })
    }

    /// `[min, max]` -> `[-0.5, +0.5]`.
    pub fn normalize<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let span = self.max_value - self.min_value;
        x.sub_scalar(self.min_value).div_scalar(span).sub_scalar(0.5)
    }

    /// `[-0.5, +0.5]` -> `[min, max]`.
    pub fn denormalize<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let span = self.max_value - self.min_value;
        x.add_scalar(0.5).mul_scalar(span).add_scalar(self.min_value)
    }

    pub fn min_value(&self) -> f64 {
        self.min_value
    }

    pub fn max_value(&self) -> f64 {
        self.max_value
    }
}

/// Where the standardization statistics come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizationMode {
    /// Sliding window of the given (odd) size, per spatial location.
    Local { kernel: usize },
    /// Whole spatial extent, per channel, per batch element.
    Global,
}

/// Mean/sigma pair for one pyramid level, expanded to the level's shape.
/// Owned by the caller for the duration of one forward pass.
#[derive(Debug, Clone)]
pub struct SigmaStats<B: Backend> {
    pub mean: Tensor<B, 4>,
    pub sigma: Tensor<B, 4>,
}

/// Standardizes a tensor with statistics recomputed on every call.
#[derive(Debug, Clone, Copy)]
pub struct SigmaNormalizer {
    mode: NormalizationMode,
}

impl SigmaNormalizer {
    pub fn new(mode: NormalizationMode) -> Result<Self> {
        if let NormalizationMode::Local { kernel } = mode {
            if kernel == 0 || kernel % 2 == 0 {
                return Err(DenoiseError::Config(format!(
                    "local normalization window must be odd and > 0, got {}",
                    kernel
                )));
            }
        }
        Ok(Self { mode })
    }

    /// Interpret the configuration flag: `> 0` local window size, `== 0`
    /// global, `< 0` stage disabled.
    pub fn from_flag(local_normalization: i64) -> Result<Option<Self>> {
        if local_normalization > 0 {
            Ok(Some(Self::new(NormalizationMode::Local {
                kernel: local_normalization as usize,
            })?))
        } else if local_normalization == 0 {
            Ok(Some(Self::new(NormalizationMode::Global)?))
        } else {
            Ok(None)
        }
    }

    pub fn mode(&self) -> NormalizationMode {
        self.mode
    }

    /// Standardize `x`, returning the statistics needed to invert.
    pub fn normalize<B: Backend>(&self, x: &Tensor<B, 4>) -> (Tensor<B, 4>, SigmaStats<B>) {
        let stats = self.statistics(x);
        let normalized = (x.clone() - stats.mean.clone())
            / stats.sigma.clone().add_scalar(EPSILON);
        (normalized, stats)
    }

    /// Exact inverse of `normalize` for the same statistics.
    pub fn denormalize<B: Backend>(&self, x: Tensor<B, 4>, stats: &SigmaStats<B>) -> Tensor<B, 4> {
        x * stats.sigma.clone().add_scalar(EPSILON) + stats.mean.clone()
    }

    fn statistics<B: Backend>(&self, x: &Tensor<B, 4>) -> SigmaStats<B> {
        let [batch, channels, height, width] = x.dims();
        match self.mode {
            NormalizationMode::Local { kernel } => {
                let pad = (kernel - 1) / 2;
                let mean = avg_pool2d(
                    x.clone(),
                    [kernel, kernel],
                    [1, 1],
                    [pad, pad],
                    true,
                );
                let mean_sq = avg_pool2d(
                    x.clone().powf_scalar(2.0),
                    [kernel, kernel],
                    [1, 1],
                    [pad, pad],
                    true,
                );
                let variance = (mean_sq - mean.clone().powf_scalar(2.0)).clamp_min(0.0);
                SigmaStats {
                    mean,
                    sigma: variance.sqrt(),
                }
            }
            NormalizationMode::Global => {
                let mean = x.clone().mean_dim(3).mean_dim(2);
                let mean_sq = x.clone().powf_scalar(2.0).mean_dim(3).mean_dim(2);
                let variance = (mean_sq - mean.clone().powf_scalar(2.0)).clamp_min(0.0);
                SigmaStats {
                    mean: mean.expand([batch, channels, height, width]),
                    sigma: variance.sqrt().expand([batch, channels, height, width]),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;

    type TestBackend = burn::backend::NdArray;

    fn max_abs_diff(a: Tensor<TestBackend, 4>, b: Tensor<TestBackend, 4>) -> f32 {
        (a - b).abs().max().into_scalar()
    }

    #[test]
    fn test_range_round_trip() {
        let device = Default::default();
        let range = RangeNormalizer::new(0.0, 255.0).unwrap();
        let x = Tensor::<TestBackend, 4>::random(
            [2, 3, 8, 8],
            Distribution::Uniform(0.0, 255.0),
            &device,
        );

        let normalized = range.normalize(x.clone());
        assert!(normalized.clone().max().into_scalar() <= 0.5 + 1e-6);
        assert!(normalized.clone().min().into_scalar() >= -0.5 - 1e-6);

        let back = range.denormalize(normalized);
        assert!(max_abs_diff(x, back) < 1e-3);
    }

    #[test]
    fn test_range_rejects_empty_interval() {
        assert!(RangeNormalizer::new(1.0, 1.0).is_err());
    }

    #[test]
    fn test_local_round_trip_is_exact() {
        let device = Default::default();
        let normalizer = SigmaNormalizer::new(NormalizationMode::Local { kernel: 5 }).unwrap();
        let x = Tensor::<TestBackend, 4>::random(
            [2, 3, 16, 16],
            Distribution::Uniform(-0.5, 0.5),
            &device,
        );

        let (normalized, stats) = normalizer.normalize(&x);
        let back = normalizer.denormalize(normalized, &stats);
        assert!(max_abs_diff(x, back) < 1e-5);
    }

    #[test]
    fn test_global_round_trip_is_exact() {
        let device = Default::default();
        let normalizer = SigmaNormalizer::new(NormalizationMode::Global).unwrap();
        let x = Tensor::<TestBackend, 4>::random(
            [2, 3, 16, 16],
            Distribution::Uniform(-0.5, 0.5),
            &device,
        );

        let (normalized, stats) = normalizer.normalize(&x);
        let back = normalizer.denormalize(normalized, &stats);
        assert!(max_abs_diff(x, back) < 1e-5);
    }

    #[test]
    fn test_global_statistics_standardize() {
        let device = Default::default();
        let normalizer = SigmaNormalizer::new(NormalizationMode::Global).unwrap();
        let x = Tensor::<TestBackend, 4>::random(
            [1, 1, 32, 32],
            Distribution::Uniform(0.0, 1.0),
            &device,
        );

        let (normalized, _) = normalizer.normalize(&x);
        let mean: f32 = normalized.clone().mean().into_scalar();
        assert!(mean.abs() < 1e-4);
        let sigma: f32 = normalized.powf_scalar(2.0).mean().into_scalar().sqrt();
        assert!((sigma - 1.0).abs() < 1e-2);
    }

    #[test]
    fn test_constant_input_is_guarded() {
        let device = Default::default();
        let normalizer = SigmaNormalizer::new(NormalizationMode::Global).unwrap();
        let x = Tensor::<TestBackend, 4>::ones([1, 1, 8, 8], &device);

        // Zero variance: the epsilon guard keeps the division finite and the
        // round trip exact.
        let (normalized, stats) = normalizer.normalize(&x);
        let max_norm: f32 = normalized.clone().abs().max().into_scalar();
        assert!(max_norm.is_finite());
        let back = normalizer.denormalize(normalized, &stats);
        assert!(max_abs_diff(x, back) < 1e-5);
    }

    #[test]
    fn test_even_local_window_rejected() {
        assert!(SigmaNormalizer::new(NormalizationMode::Local { kernel: 4 }).is_err());
        assert!(SigmaNormalizer::from_flag(4).is_err());
        assert!(SigmaNormalizer::from_flag(-1).unwrap().is_none());
        assert!(SigmaNormalizer::from_flag(0).unwrap().is_some());
    }
}
