//! Online augmentation.
//!
//! Produces the `(clean, noisy)` training pair from a clean batch: additive
//! and multiplicative Gaussian noise on the noisy branch (sigma drawn per
//! batch from the configured lists), optional blur of the noisy branch, and
//! geometric flips applied identically to both tensors so the pair stays
//! aligned. Arbitrary-angle rotation is left to an external image-op
//! collaborator.

use burn::tensor::backend::Backend;
use burn::tensor::{Distribution, Tensor};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::config::DatasetConfig;
use crate::model::pyramid::binomial_blur;

/// Applies the configured augmentations to one batch.
#[derive(Debug, Clone)]
pub struct Augmenter {
    additive_noise: Vec<f64>,
    multiplicative_noise: Vec<f64>,
    random_blur: bool,
    random_left_right: bool,
    random_up_down: bool,
}

impl Augmenter {
    pub fn from_config(config: &DatasetConfig) -> Self {
        Self {
            additive_noise: config.additive_noise.clone(),
            multiplicative_noise: config.multiplicative_noise.clone(),
            random_blur: config.random_blur,
            random_left_right: config.random_left_right,
            random_up_down: config.random_up_down,
        }
    }

    /// Augment a clean batch into an aligned `(clean, noisy)` pair.
    pub fn augment<B: Backend>(
        &self,
        clean: Tensor<B, 4>,
        rng: &mut ChaCha8Rng,
    ) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let mut clean = clean;
        let shape = clean.dims();
        let device = clean.device();

        // Additive noise.
        let sigma = self.additive_noise[rng.gen_range(0..self.additive_noise.len())];
        let mut noisy = if sigma > 0.0 {
            clean.clone()
                + Tensor::<B, 4>::random(shape, Distribution::Normal(0.0, sigma), &device)
        } else {
            clean.clone()
        };

        // Multiplicative noise.
        let sigma = self.multiplicative_noise[rng.gen_range(0..self.multiplicative_noise.len())];
        if sigma > 0.0 {
            noisy = noisy
                * Tensor::<B, 4>::random(shape, Distribution::Normal(1.0, sigma), &device);
        }

        // Blur only degrades the noisy branch.
        if self.random_blur && rng.gen::<bool>() {
            noisy = binomial_blur(noisy);
        }

        // Geometric transforms apply to both tensors identically.
        if self.random_left_right && rng.gen::<bool>() {
            clean = clean.flip([3]);
            noisy = noisy.flip([3]);
        }
        if self.random_up_down && rng.gen::<bool>() {
            clean = clean.flip([2]);
            noisy = noisy.flip([2]);
        }

        (clean, noisy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    type TestBackend = burn::backend::NdArray;

    fn augmenter(config: DatasetConfig) -> Augmenter {
        Augmenter::from_config(&config)
    }

    #[test]
    fn test_shapes_preserved() {
        let device = Default::default();
        let aug = augmenter(DatasetConfig {
            random_blur: true,
            random_left_right: true,
            random_up_down: true,
            ..Default::default()
        });
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let x = Tensor::<TestBackend, 4>::zeros([2, 3, 16, 16], &device);

        let (clean, noisy) = aug.augment(x, &mut rng);
        assert_eq!(clean.dims(), [2, 3, 16, 16]);
        assert_eq!(noisy.dims(), [2, 3, 16, 16]);
    }

    #[test]
    fn test_zero_noise_is_identity_on_noisy_branch() {
        let device = Default::default();
        let aug = augmenter(DatasetConfig {
            additive_noise: vec![0.0],
            multiplicative_noise: vec![0.0],
            ..Default::default()
        });
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let x = Tensor::<TestBackend, 4>::random(
            [1, 1, 8, 8],
            Distribution::Uniform(0.0, 255.0),
            &device,
        );

        let (clean, noisy) = aug.augment(x.clone(), &mut rng);
        let diff: f32 = (clean - noisy).abs().max().into_scalar();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn test_additive_noise_statistics() {
        let device = Default::default();
        <TestBackend as Backend>::seed(3);
        let aug = augmenter(DatasetConfig {
            additive_noise: vec![10.0],
            multiplicative_noise: vec![0.0],
            ..Default::default()
        });
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let x = Tensor::<TestBackend, 4>::ones([4, 1, 64, 64], &device).mul_scalar(100.0);

        let (clean, noisy) = aug.augment(x, &mut rng);
        let residual = noisy - clean;
        let mean: f32 = residual.clone().mean().into_scalar();
        let std: f32 = residual.powf_scalar(2.0).mean().into_scalar().sqrt();

        assert!(mean.abs() < 0.5, "noise mean {} too far from 0", mean);
        assert!((std - 10.0).abs() < 0.5, "noise std {} too far from 10", std);
    }

    #[test]
    fn test_flips_keep_pair_aligned() {
        let device = Default::default();
        let aug = augmenter(DatasetConfig {
            additive_noise: vec![0.0],
            multiplicative_noise: vec![0.0],
            random_left_right: true,
            random_up_down: true,
            ..Default::default()
        });

        let x = Tensor::<TestBackend, 4>::random(
            [1, 1, 8, 8],
            Distribution::Uniform(0.0, 255.0),
            &device,
        );

        // Whatever geometric transform was drawn, the pair must match
        // pixel for pixel because the noise is off.
        for seed in 0..8 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let (clean, noisy) = aug.augment(x.clone(), &mut rng);
            let diff: f32 = (clean - noisy).abs().max().into_scalar();
            assert_eq!(diff, 0.0, "pair misaligned for seed {}", seed);
        }
    }
}
