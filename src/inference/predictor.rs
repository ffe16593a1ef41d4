//! Iterated denoising on integer-range images.
//!
//! Wraps a trained model with the fixed-range integer contract of the
//! export boundary: a `[batch, channels, height, width]` integer tensor
//! goes in, the denoiser runs a configurable number of clamped passes in
//! the internal value space, and a same-range integer tensor comes out.
//! Channel count is plain configuration, validated at construction.

use std::path::Path;

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::Config;
use crate::model::assembler::MultiscaleDenoiser;
use crate::utils::error::{DenoiseError, Result};
use crate::{INTERNAL_MAX, INTERNAL_MIN};

/// Sidecar metadata of an exported artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactManifest {
    /// Denoiser passes per image.
    pub iterations: u64,
    /// Channel count the model was trained with.
    pub channels: usize,
}

/// Self-contained denoising predictor.
pub struct Predictor<B: Backend> {
    model: MultiscaleDenoiser<B>,
    iterations: u64,
    channels: usize,
}

impl<B: Backend> Predictor<B> {
    pub fn new(model: MultiscaleDenoiser<B>, iterations: u64, channels: usize) -> Result<Self> {
        if iterations == 0 {
            return Err(DenoiseError::Config("iterations must be > 0, got 0".into()));
        }
        if channels != 1 && channels != 3 {
            return Err(DenoiseError::Config(format!(
                "channels must be 1 or 3, got {}",
                channels
            )));
        }
        Ok(Self {
            model,
            iterations,
            channels,
        })
    }

    /// Load an exported artifact directory: `config.json`, `artifact.json`
    /// and the parameter record.
    pub fn from_artifact(dir: &Path, device: &B::Device) -> Result<Self> {
        let config = Config::load(&dir.join("config.json"))?;
        let manifest: ArtifactManifest =
            serde_json::from_str(&std::fs::read_to_string(dir.join("artifact.json"))?)?;

        let model = MultiscaleDenoiser::<B>::build(&config.model, device)?
            .load_snapshot(&dir.join("denoiser"), device)?;

        info!(
            "loaded denoising artifact from '{}' ({} iterations, {} channels)",
            dir.display(),
            manifest.iterations,
            manifest.channels
        );

        Self::new(model, manifest.iterations, manifest.channels)
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Denoise a raw-range float batch.
    pub fn denoise(&self, raw: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        let [_, channels, _, _] = raw.dims();
        if channels != self.channels {
            return Err(DenoiseError::Shape(format!(
                "expected {} channels, got {}",
                self.channels, channels
            )));
        }

        let mut x = self.model.range.normalize(raw);
        for _ in 0..self.iterations {
            x = self.model.forward(x)?.clamp(INTERNAL_MIN, INTERNAL_MAX);
        }
        Ok(self.model.range.denormalize(x))
    }

    /// Denoise a fixed-range integer batch, returning the same range.
    pub fn denoise_u8(&self, image: Tensor<B, 4, Int>) -> Result<Tensor<B, 4, Int>> {
        let denoised = self.denoise(image.float())?;
        Ok(denoised
            .round()
            .clamp(self.model.range.min_value(), self.model.range.max_value())
            .int())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, PyramidConfig};
    use burn::tensor::TensorData;

    type TestBackend = burn::backend::NdArray;

    fn identity_model() -> MultiscaleDenoiser<TestBackend> {
        let device = Default::default();
        let config = ModelConfig {
            channels: 1,
            filters: 2,
            no_layers: 1,
            kernel_initializer: "zeros".to_string(),
            batchnorm: false,
            pyramid: PyramidConfig {
                kind: "laplacian".to_string(),
                levels: 2,
            },
            ..Default::default()
        };
        MultiscaleDenoiser::build(&config, &device).unwrap()
    }

    #[test]
    fn test_construction_validation() {
        assert!(Predictor::new(identity_model(), 0, 1).is_err());
        assert!(Predictor::new(identity_model(), 1, 2).is_err());
        assert!(Predictor::new(identity_model(), 1, 1).is_ok());
    }

    #[test]
    fn test_channel_mismatch_rejected() {
        let device = Default::default();
        let predictor = Predictor::new(identity_model(), 1, 1).unwrap();
        let rgb = Tensor::<TestBackend, 4>::zeros([1, 3, 16, 16], &device);
        assert!(predictor.denoise(rgb).is_err());
    }

    #[test]
    fn test_integer_round_trip_through_identity_model() {
        let device = Default::default();
        let predictor = Predictor::new(identity_model(), 2, 1).unwrap();

        let pixels = vec![128i64; 16 * 16];
        let image = Tensor::<TestBackend, 4, Int>::from_data(
            TensorData::new(pixels, [1, 1, 16, 16]),
            &device,
        );

        let out = predictor.denoise_u8(image).unwrap();
        let values = out.into_data().convert::<i64>().to_vec::<i64>().unwrap();
        assert!(values.iter().all(|&v| v == 128));
    }

    #[test]
    fn test_artifact_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();

        let mut config = Config::default();
        config.model.channels = 1;
        config.model.filters = 2;
        config.model.no_layers = 1;
        config.model.pyramid = PyramidConfig {
            kind: "identity".to_string(),
            levels: 1,
        };

        let model = MultiscaleDenoiser::<TestBackend>::build(&config.model, &device).unwrap();
        model.save_snapshot(&dir.path().join("denoiser")).unwrap();
        config.save(&dir.path().join("config.json")).unwrap();
        std::fs::write(
            dir.path().join("artifact.json"),
            serde_json::to_string(&ArtifactManifest {
                iterations: 1,
                channels: 1,
            })
            .unwrap(),
        )
        .unwrap();

        let predictor = Predictor::<TestBackend>::from_artifact(dir.path(), &device).unwrap();
        assert_eq!(predictor.iterations(), 1);

        let image = Tensor::<TestBackend, 4>::zeros([1, 1, 8, 8], &device);
        assert!(predictor.denoise(image).is_ok());
    }
}
