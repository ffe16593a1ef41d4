//! Weight pruning.
//!
//! Zeroes selected convolution weights of the live stack to induce sparsity.
//! Expressed as a transform `prune(stack) -> stack'` so the trainer stays
//! the single writer and swaps the stack between steps; shapes never change
//! and every strategy is idempotent: pruning an already-pruned stack again
//! is a no-op.

use burn::module::Param;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::config::{PruneConfig, PruneStrategyConfig};
use crate::model::assembler::DenoiseStack;
use crate::utils::error::{DenoiseError, Result};

/// One pruning decision rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PruneStrategy {
    /// Zero weights with magnitude at or below a fixed threshold.
    MagnitudeThreshold { threshold: f32 },
    /// Zero the smallest-magnitude fraction of each kernel.
    MagnitudePercentile { fraction: f32 },
    /// Zero a fixed random fraction of each kernel, seeded so the mask is
    /// stable across reapplications.
    RandomFraction { fraction: f32, seed: u64 },
    /// Explicitly disabled.
    None,
}

impl PruneStrategy {
    /// Parse a strategy entry, keeping the offending name on error.
    pub fn parse(config: &PruneStrategyConfig) -> Result<Self> {
        match config.strategy.as_str() {
            "none" => Ok(Self::None),
            "magnitude_threshold" => Ok(Self::MagnitudeThreshold {
                threshold: config.threshold as f32,
            }),
            "magnitude_percentile" => {
                if !(0.0..=1.0).contains(&config.fraction) {
                    return Err(DenoiseError::Config(format!(
                        "prune fraction must be in [0, 1], got {}",
                        config.fraction
                    )));
                }
                Ok(Self::MagnitudePercentile {
                    fraction: config.fraction as f32,
                })
            }
            "random_fraction" => {
                if !(0.0..=1.0).contains(&config.fraction) {
                    return Err(DenoiseError::Config(format!(
                        "prune fraction must be in [0, 1], got {}",
                        config.fraction
                    )));
                }
                Ok(Self::RandomFraction {
                    fraction: config.fraction as f32,
                    seed: config.seed,
                })
            }
            other => Err(DenoiseError::Config(format!(
                "unknown prune strategy [{}]",
                other
            ))),
        }
    }

    /// Keep-mask for one weight tensor, or `None` when the strategy leaves
    /// the tensor untouched.
    fn mask<B: Backend>(&self, weight: &Tensor<B, 4>) -> Option<Tensor<B, 4>> {
        match *self {
            PruneStrategy::None => None,
            PruneStrategy::MagnitudeThreshold { threshold } => {
                Some(weight.clone().abs().greater_elem(threshold).float())
            }
            PruneStrategy::MagnitudePercentile { fraction } => {
                if fraction <= 0.0 {
                    return None;
                }
                let Ok(mut magnitudes) = weight
                    .clone()
                    .abs()
                    .into_data()
                    .convert::<f32>()
                    .to_vec::<f32>()
                else {
                    return None;
                };
                magnitudes.sort_by(|a, b| a.total_cmp(b));
                let count = magnitudes.len();
                let cut = ((fraction * count as f32).ceil() as usize).clamp(1, count);
                // Pruning at-or-below the boundary keeps the decision stable
                // when reapplied: once the bottom fraction is zero, the
                // boundary magnitude is zero as well.
                let threshold = magnitudes[cut - 1];
                Some(weight.clone().abs().greater_elem(threshold).float())
            }
            PruneStrategy::RandomFraction { fraction, seed } => {
                if fraction <= 0.0 {
                    return None;
                }
                let dims = weight.dims();
                let count: usize = dims.iter().product();
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                let values: Vec<f32> = (0..count)
                    .map(|_| if rng.gen::<f32>() < fraction { 0.0 } else { 1.0 })
                    .collect();
                Some(Tensor::from_data(
                    TensorData::new(values, dims),
                    &weight.device(),
                ))
            }
        }
    }
}

/// Applies the configured strategies to every convolution kernel.
pub struct PruneEngine {
    strategies: Vec<PruneStrategy>,
}

impl PruneEngine {
    pub fn new(config: &PruneConfig) -> Result<Self> {
        let strategies = config
            .strategies
            .iter()
            .map(PruneStrategy::parse)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { strategies })
    }

    /// Whether any strategy does work.
    pub fn enabled(&self) -> bool {
        self.strategies
            .iter()
            .any(|s| !matches!(s, PruneStrategy::None))
    }

    /// Apply every strategy to every convolution weight, returning the
    /// mutated stack. Shapes are preserved.
    pub fn prune<B: Backend>(&self, mut stack: DenoiseStack<B>) -> DenoiseStack<B> {
        if !self.enabled() {
            return stack;
        }

        for net in &mut stack.nets {
            for param in net.conv_params_mut() {
                let weight = param.val();
                let mut combined: Option<Tensor<B, 4>> = None;
                for strategy in &self.strategies {
                    if let Some(mask) = strategy.mask(&weight) {
                        combined = Some(match combined {
                            Some(existing) => existing * mask,
                            None => mask,
                        });
                    }
                }
                if let Some(mask) = combined {
                    *param = Param::from_tensor((weight * mask).detach());
                }
            }
        }
        stack
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;

    type TestBackend = burn::backend::NdArray;

    fn stack() -> DenoiseStack<TestBackend> {
        let device = Default::default();
        let config = ModelConfig {
            channels: 1,
            filters: 4,
            no_layers: 2,
            ..Default::default()
        };
        DenoiseStack::new(&config, &device).unwrap()
    }

    fn engine(strategy: PruneStrategyConfig) -> PruneEngine {
        PruneEngine::new(&PruneConfig {
            strategies: vec![strategy],
            ..Default::default()
        })
        .unwrap()
    }

    fn weights_of(stack: &DenoiseStack<TestBackend>) -> Vec<Vec<f32>> {
        stack
            .conv_weights()
            .into_iter()
            .map(|w| w.into_data().convert::<f32>().to_vec().unwrap())
            .collect()
    }

    fn zero_fraction(weights: &[Vec<f32>]) -> f32 {
        let total: usize = weights.iter().map(|w| w.len()).sum();
        let zeros: usize = weights
            .iter()
            .flat_map(|w| w.iter())
            .filter(|&&v| v == 0.0)
            .count();
        zeros as f32 / total as f32
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let err = PruneStrategy::parse(&PruneStrategyConfig {
            strategy: "lottery".to_string(),
            threshold: 0.0,
            fraction: 0.0,
            seed: 0,
        })
        .unwrap_err();
        assert!(format!("{}", err).contains("lottery"));
    }

    #[test]
    fn test_percentile_prunes_and_preserves_shape() {
        let original = stack();
        let shapes: Vec<_> = original.conv_weights().iter().map(|w| w.dims()).collect();

        let engine = engine(PruneStrategyConfig {
            strategy: "magnitude_percentile".to_string(),
            threshold: 0.0,
            fraction: 0.5,
            seed: 0,
        });
        let pruned = engine.prune(original);

        let new_shapes: Vec<_> = pruned.conv_weights().iter().map(|w| w.dims()).collect();
        assert_eq!(shapes, new_shapes);

        let fraction = zero_fraction(&weights_of(&pruned));
        assert!(
            (fraction - 0.5).abs() < 0.1,
            "expected about half the weights zeroed, got {}",
            fraction
        );
    }

    #[test]
    fn test_percentile_is_idempotent() {
        let engine = engine(PruneStrategyConfig {
            strategy: "magnitude_percentile".to_string(),
            threshold: 0.0,
            fraction: 0.3,
            seed: 0,
        });

        let once = engine.prune(stack());
        let after_once = weights_of(&once);
        let twice = engine.prune(once);
        assert_eq!(after_once, weights_of(&twice));
    }

    #[test]
    fn test_threshold_is_idempotent_and_zeroes_small_weights() {
        let engine = engine(PruneStrategyConfig {
            strategy: "magnitude_threshold".to_string(),
            threshold: 0.05,
            fraction: 0.0,
            seed: 0,
        });

        let once = engine.prune(stack());
        for weights in weights_of(&once) {
            for v in weights {
                assert!(v == 0.0 || v.abs() > 0.05);
            }
        }

        let after_once = weights_of(&once);
        let twice = engine.prune(once);
        assert_eq!(after_once, weights_of(&twice));
    }

    #[test]
    fn test_random_fraction_is_idempotent() {
        let engine = engine(PruneStrategyConfig {
            strategy: "random_fraction".to_string(),
            threshold: 0.0,
            fraction: 0.4,
            seed: 11,
        });

        let once = engine.prune(stack());
        let after_once = weights_of(&once);
        let twice = engine.prune(once);
        assert_eq!(after_once, weights_of(&twice));
    }

    #[test]
    fn test_none_disables_pruning() {
        let engine = engine(PruneStrategyConfig {
            strategy: "none".to_string(),
            threshold: 0.0,
            fraction: 0.0,
            seed: 0,
        });
        assert!(!engine.enabled());

        let original = stack();
        let before = weights_of(&original);
        let untouched = engine.prune(original);
        assert_eq!(before, weights_of(&untouched));
    }
}
