//! The training objective.
//!
//! A weighted combination of reconstruction error (plain and edge-weighted
//! MAE, optionally per pyramid level), normalized absolute error, and the
//! model-reported weight penalties, plus SNR and improvement diagnostics.
//! Every call returns the full named map for logging and the scalar total
//! tensor for gradient computation; nothing is retained across steps.

pub mod delta;

use std::collections::BTreeMap;

use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Tensor};

use crate::config::LossConfig;
use crate::loss::delta::delta_xy_magnitude;
use crate::model::pyramid::PyramidTransform;
use crate::utils::error::Result;
use crate::EPSILON;

/// Named metric keys of the loss map.
pub const MAE: &str = "mae";
pub const SNR: &str = "snr";
pub const NAE_NOISE: &str = "nae_noise";
pub const NAE_PREDICTION: &str = "nae_prediction";
pub const NAE_IMPROVEMENT: &str = "nae_improvement";
pub const MAE_DECOMPOSITION: &str = "mae_decomposition";
pub const MAE_DELTA: &str = "mae_delta";
pub const REGULARIZATION: &str = "regularization";
pub const MEAN_TOTAL_LOSS: &str = "mean_total_loss";

/// Result of one loss evaluation.
pub struct LossOutput<B: Backend> {
    /// Scalar objective for backpropagation.
    pub total: Tensor<B, 1>,
    /// Named scalar metrics for the observability stream.
    pub metrics: BTreeMap<&'static str, f64>,
}

/// Zero out values at or below the hinge; surviving entries keep their
/// unshifted value and gradient.
fn hinged<B: Backend>(d: Tensor<B, 4>, hinge: f64) -> Tensor<B, 4> {
    if hinge == 0.0 {
        return d;
    }
    let keep = d.clone().greater_elem(hinge);
    d * keep.float()
}

/// Softmax over the spatial extent, per channel, per batch element.
fn softmax_spatial<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [batch, channels, height, width] = x.dims();
    let flat = x.reshape([batch, channels, height * width]);
    burn::tensor::activation::softmax(flat, 2).reshape([batch, channels, height, width])
}

/// Sum over channel and spatial dimensions, one value per batch element.
fn sum_per_sample<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 1> {
    let [batch, _, _, _] = x.dims();
    x.sum_dim(3).sum_dim(2).sum_dim(1).reshape([batch])
}

/// Mean absolute error with an optional hinge.
pub fn mae<B: Backend>(original: &Tensor<B, 4>, prediction: &Tensor<B, 4>, hinge: f64) -> Tensor<B, 1> {
    let d = (original.clone() - prediction.clone()).abs();
    hinged(d, hinge).mean()
}

/// Mean absolute error weighted by the softmax of the ground-truth gradient
/// magnitude, emphasizing edges.
pub fn mae_weighted_delta<B: Backend>(
    original: &Tensor<B, 4>,
    prediction: &Tensor<B, 4>,
    hinge: f64,
    kernel_size: usize,
) -> Result<Tensor<B, 1>> {
    let magnitude = delta_xy_magnitude(original, kernel_size, 1.0, 1.0)?;
    let weight = softmax_spatial(magnitude);
    let d = hinged((original.clone() - prediction.clone()).abs(), hinge);
    Ok((d * weight).mean())
}

/// Normalized absolute error: summed absolute difference over the ground
/// truth magnitude, averaged over the batch.
pub fn nae<B: Backend>(original: &Tensor<B, 4>, prediction: &Tensor<B, 4>, hinge: f64) -> Tensor<B, 1> {
    let d = hinged((original.clone() - prediction.clone()).abs(), hinge);
    let numerator = sum_per_sample(d).mean();
    let denominator = sum_per_sample(original.clone().abs()).mean();
    numerator / denominator.add_scalar(EPSILON)
}

/// Signal-to-noise ratio in decibels, epsilon-guarded on both sides.
pub fn snr<B: Backend>(original: &Tensor<B, 4>, prediction: &Tensor<B, 4>) -> Tensor<B, 1> {
    let signal = prediction.clone().powf_scalar(2.0).mean().add_scalar(EPSILON);
    let noise = (original.clone() - prediction.clone())
        .powf_scalar(2.0)
        .mean()
        .add_scalar(EPSILON);
    (signal / noise).log().mul_scalar(10.0 / std::f64::consts::LN_10)
}

/// Computes the named loss map and the scalar training objective.
pub struct LossEngine {
    config: LossConfig,
    pyramid: Option<PyramidTransform>,
}

impl LossEngine {
    pub fn new(config: &LossConfig) -> Result<Self> {
        config.validate()?;
        let pyramid = match &config.pyramid {
            Some(pyramid_config) => Some(PyramidTransform::new(pyramid_config)?),
            None => None,
        };
        Ok(Self {
            config: config.clone(),
            pyramid,
        })
    }

    /// Evaluate the objective.
    ///
    /// `decompositions` carries pre-computed `(ground_truth_levels,
    /// prediction_levels)` from the training loop; when absent and a pyramid
    /// is configured the engine decomposes internally; otherwise the
    /// reconstruction terms are computed once at full resolution.
    /// `regularization` is the model-reported weight penalty.
    pub fn compute<B: Backend>(
        &self,
        clean: &Tensor<B, 4>,
        noisy: &Tensor<B, 4>,
        prediction: &Tensor<B, 4>,
        decompositions: Option<(&[Tensor<B, 4>], &[Tensor<B, 4>])>,
        regularization: Tensor<B, 1>,
    ) -> Result<LossOutput<B>> {
        let hinge = self.config.hinge;
        let kernel = self.config.delta_kernel_size;

        let owned_levels;
        let level_pairs: Option<(&[Tensor<B, 4>], &[Tensor<B, 4>])> = match decompositions {
            Some(pairs) => Some(pairs),
            None => match &self.pyramid {
                Some(pyramid) => {
                    owned_levels = (
                        pyramid.decompose(clean)?,
                        pyramid.decompose(prediction)?,
                    );
                    Some((owned_levels.0.as_slice(), owned_levels.1.as_slice()))
                }
                None => None,
            },
        };

        let device = clean.device();
        let mut mae_loss = Tensor::<B, 1>::zeros([1], &device);
        let mut mae_delta_loss = Tensor::<B, 1>::zeros([1], &device);
        let decomposed = level_pairs.is_some();

        match level_pairs {
            Some((clean_levels, prediction_levels)) => {
                let levels = clean_levels.len() as f64;
                for (truth, estimate) in clean_levels.iter().zip(prediction_levels.iter()) {
                    mae_loss = mae_loss + mae(truth, estimate, hinge);
                    if self.config.mae_delta {
                        mae_delta_loss =
                            mae_delta_loss + mae_weighted_delta(truth, estimate, hinge, kernel)?;
                    }
                }
                mae_loss = mae_loss.div_scalar(levels);
                mae_delta_loss = mae_delta_loss.div_scalar(levels);
            }
            None => {
                mae_loss = mae(clean, prediction, hinge);
                if self.config.mae_delta {
                    mae_delta_loss = mae_weighted_delta(clean, prediction, hinge, kernel)?;
                }
            }
        }

        let mae_actual = mae(clean, prediction, 0.0);
        let nae_prediction = nae(clean, prediction, hinge);
        let nae_noise = nae(clean, noisy, hinge);
        let nae_improvement = nae_noise.clone() - nae_prediction.clone();
        let signal_to_noise = snr(clean, prediction);

        let total = nae_prediction.clone().mul_scalar(self.config.nae_multiplier)
            + (mae_loss.clone() + mae_delta_loss.clone()).mul_scalar(self.config.mae_multiplier)
            + regularization.clone().mul_scalar(self.config.regularization);

        let mut metrics: BTreeMap<&'static str, f64> = BTreeMap::new();
        let scalar = |t: Tensor<B, 1>| -> f64 { t.into_scalar().elem() };
        metrics.insert(MAE, scalar(mae_actual));
        metrics.insert(SNR, scalar(signal_to_noise));
        metrics.insert(NAE_NOISE, scalar(nae_noise));
        metrics.insert(NAE_PREDICTION, scalar(nae_prediction));
        metrics.insert(NAE_IMPROVEMENT, scalar(nae_improvement));
        metrics.insert(REGULARIZATION, scalar(regularization));
        metrics.insert(MEAN_TOTAL_LOSS, scalar(total.clone()));
        if decomposed {
            metrics.insert(MAE_DECOMPOSITION, scalar(mae_loss));
        }
        if self.config.mae_delta {
            metrics.insert(MAE_DELTA, scalar(mae_delta_loss));
        }

        Ok(LossOutput { total, metrics })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PyramidConfig;
    use burn::tensor::Distribution;

    type TestBackend = burn::backend::NdArray;

    fn random(device: &<TestBackend as Backend>::Device) -> Tensor<TestBackend, 4> {
        Tensor::random([2, 1, 16, 16], Distribution::Uniform(0.0, 255.0), device)
    }

    #[test]
    fn test_mae_of_identical_tensors_is_zero() {
        let device = Default::default();
        let x = random(&device);
        let value: f32 = mae(&x, &x, 0.0).into_scalar();
        assert_eq!(value, 0.0);
    }

    #[test]
    fn test_mae_monotonic_in_offset() {
        let device = Default::default();
        let x = random(&device);
        let mut previous = 0.0f32;
        for c in [1.0, 2.0, 5.0, 10.0] {
            let shifted = x.clone().add_scalar(c);
            let value: f32 = mae(&x, &shifted, 0.0).into_scalar();
            assert!((value - c as f32).abs() < 1e-3);
            assert!(value > previous);
            previous = value;
        }
    }

    #[test]
    fn test_hinge_suppresses_small_differences() {
        let device = Default::default();
        let x = random(&device);
        let shifted = x.clone().add_scalar(0.5);
        let value: f32 = mae(&x, &shifted, 1.0).into_scalar();
        assert_eq!(value, 0.0);
    }

    #[test]
    fn test_nae_invariant_to_joint_scaling_only() {
        let device = Default::default();
        let x = random(&device).add_scalar(1.0);
        let p = random(&device).add_scalar(1.0);

        let base: f32 = nae(&x, &p, 0.0).into_scalar();
        let joint: f32 = nae(&x.clone().mul_scalar(3.0), &p.clone().mul_scalar(3.0), 0.0)
            .into_scalar();
        assert!((base - joint).abs() < 1e-4);

        // Scaling only the prediction changes the metric.
        let lopsided: f32 = nae(&x, &p.mul_scalar(3.0), 0.0).into_scalar();
        assert!((base - lopsided).abs() > 1e-3);
    }

    #[test]
    fn test_snr_increases_with_accuracy() {
        let device = Default::default();
        let x = random(&device);
        let close = x.clone().add_scalar(1.0);
        let far = x.clone().add_scalar(25.0);

        let snr_close: f32 = snr(&x, &close).into_scalar();
        let snr_far: f32 = snr(&x, &far).into_scalar();
        assert!(snr_close > snr_far);
    }

    #[test]
    fn test_weighted_delta_zero_for_identical() {
        let device = Default::default();
        let x = random(&device);
        let value: f32 = mae_weighted_delta(&x, &x, 0.0, 5).unwrap().into_scalar();
        assert_eq!(value, 0.0);
    }

    #[test]
    fn test_engine_emits_full_map() {
        let device = Default::default();
        let engine = LossEngine::new(&LossConfig {
            mae_delta: true,
            ..Default::default()
        })
        .unwrap();

        let clean = random(&device);
        let noisy = clean.clone().add_scalar(5.0);
        let prediction = clean.clone().add_scalar(1.0);
        let reg = Tensor::<TestBackend, 1>::zeros([1], &device);

        let output = engine
            .compute(&clean, &noisy, &prediction, None, reg)
            .unwrap();
        for key in [MAE, SNR, NAE_NOISE, NAE_PREDICTION, NAE_IMPROVEMENT, REGULARIZATION, MEAN_TOTAL_LOSS, MAE_DELTA]
        {
            assert!(output.metrics.contains_key(key), "missing {}", key);
        }
        // The prediction is closer than the noisy input.
        assert!(output.metrics[NAE_IMPROVEMENT] > 0.0);
    }

    #[test]
    fn test_engine_averages_over_pyramid_levels() {
        let device = Default::default();
        let engine = LossEngine::new(&LossConfig {
            pyramid: Some(PyramidConfig {
                kind: "laplacian".to_string(),
                levels: 3,
            }),
            ..Default::default()
        })
        .unwrap();

        let clean = random(&device);
        let noisy = clean.clone().add_scalar(5.0);
        let prediction = clean.clone().add_scalar(1.0);
        let reg = Tensor::<TestBackend, 1>::zeros([1], &device);

        let output = engine
            .compute(&clean, &noisy, &prediction, None, reg)
            .unwrap();
        assert!(output.metrics.contains_key(MAE_DECOMPOSITION));
    }

    #[test]
    fn test_total_respects_multipliers() {
        let device = Default::default();
        let engine = LossEngine::new(&LossConfig {
            mae_multiplier: 0.0,
            nae_multiplier: 0.0,
            regularization: 0.0,
            ..Default::default()
        })
        .unwrap();

        let clean = random(&device);
        let noisy = clean.clone().add_scalar(5.0);
        let prediction = clean.clone().add_scalar(9.0);
        let reg = Tensor::<TestBackend, 1>::ones([1], &device);

        let output = engine
            .compute(&clean, &noisy, &prediction, None, reg)
            .unwrap();
        let total: f64 = output.metrics[MEAN_TOTAL_LOSS];
        assert!(total.abs() < 1e-9);
    }
}
