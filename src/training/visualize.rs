//! Periodic training visualization.
//!
//! Every `visualization_every` steps the trainer dumps PNG grids of the
//! current batch (clean, noisy, prediction), runs a self-feedback loop of
//! the denoiser over clamped random noise, and emits the weight histogram.
//! A denoiser that behaves like a prior will pull structure out of pure
//! noise over the iterations, which makes the random batch a quick health
//! check.

use std::path::{Path, PathBuf};

use burn::tensor::backend::Backend;
use burn::tensor::{Distribution, Tensor};
use tracing::debug;

use crate::config::TrainConfig;
use crate::model::assembler::MultiscaleDenoiser;
use crate::utils::error::{DenoiseError, Result};
use crate::utils::summary::SummaryWriter;
use crate::{INTERNAL_MAX, INTERNAL_MIN};

/// Iterate the denoiser over random noise, clamping between passes.
/// Returns a raw-range batch.
pub fn self_feedback_batch<B: Backend>(
    model: &MultiscaleDenoiser<B>,
    count: usize,
    channels: usize,
    size: [usize; 2],
    iterations: u64,
    device: &B::Device,
) -> Result<Tensor<B, 4>> {
    let mut x = Tensor::<B, 4>::random(
        [count, channels, size[0], size[1]],
        Distribution::Normal(0.0, 0.25),
        device,
    )
    .clamp(INTERNAL_MIN, INTERNAL_MAX);

    for _ in 0..iterations {
        x = model.forward(x)?.clamp(INTERNAL_MIN, INTERNAL_MAX);
    }

    Ok(model.range.denormalize(x))
}

/// Write the first `count` images of a raw-range batch as PNGs.
pub fn save_batch_images<B: Backend>(
    batch: &Tensor<B, 4>,
    dir: &Path,
    prefix: &str,
    count: usize,
    min_value: f64,
    max_value: f64,
) -> Result<Vec<PathBuf>> {
    let [batch_size, channels, height, width] = batch.dims();
    let count = count.min(batch_size);
    let span = (max_value - min_value) as f32;
    let min_value = min_value as f32;

    let data: Vec<f32> = batch
        .clone()
        .into_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|e| DenoiseError::Serialization(format!("{:?}", e)))?;

    let mut written = Vec::with_capacity(count);
    for index in 0..count {
        let path = dir.join(format!("{}_{}.png", prefix, index));
        let to_u8 = |value: f32| -> u8 {
            (((value - min_value) / span) * 255.0).clamp(0.0, 255.0) as u8
        };
        let at = |c: usize, y: usize, x: usize| -> f32 {
            data[((index * channels + c) * height + y) * width + x]
        };

        match channels {
            1 => {
                let img = image::GrayImage::from_fn(width as u32, height as u32, |x, y| {
                    image::Luma([to_u8(at(0, y as usize, x as usize))])
                });
                img.save(&path)
                    .map_err(|e| DenoiseError::Serialization(e.to_string()))?;
            }
            3 => {
                let img = image::RgbImage::from_fn(width as u32, height as u32, |x, y| {
                    image::Rgb([
                        to_u8(at(0, y as usize, x as usize)),
                        to_u8(at(1, y as usize, x as usize)),
                        to_u8(at(2, y as usize, x as usize)),
                    ])
                });
                img.save(&path)
                    .map_err(|e| DenoiseError::Serialization(e.to_string()))?;
            }
            other => {
                return Err(DenoiseError::Shape(format!(
                    "cannot visualize {} channels",
                    other
                )))
            }
        }
        written.push(path);
    }

    Ok(written)
}

/// One full visualization pass: image dumps plus the weight histogram.
#[allow(clippy::too_many_arguments)]
pub fn run<B: Backend>(
    model: &MultiscaleDenoiser<B>,
    summary: &mut SummaryWriter,
    model_dir: &Path,
    step: u64,
    config: &TrainConfig,
    channels: usize,
    clean: &Tensor<B, 4>,
    noisy: &Tensor<B, 4>,
    prediction: &Tensor<B, 4>,
    device: &B::Device,
) -> Result<()> {
    let dir = model_dir
        .join("visualization")
        .join(format!("step_{:09}", step));
    std::fs::create_dir_all(&dir)?;

    let count = config.visualization_number;
    let min_value = model.range.min_value();
    let max_value = model.range.max_value();

    save_batch_images(clean, &dir, "input", count, min_value, max_value)?;
    save_batch_images(noisy, &dir, "noisy", count, min_value, max_value)?;
    save_batch_images(prediction, &dir, "prediction", count, min_value, max_value)?;

    let random = self_feedback_batch(
        model,
        count,
        channels,
        config.random_batch_size,
        config.random_batch_iterations,
        device,
    )?;
    save_batch_images(&random, &dir, "random", count, min_value, max_value)?;

    let mut weights: Vec<f32> = Vec::new();
    for weight in model.stack.conv_weights() {
        weights.extend(
            weight
                .into_data()
                .convert::<f32>()
                .to_vec::<f32>()
                .map_err(|e| DenoiseError::Serialization(format!("{:?}", e)))?,
        );
    }
    summary.histogram(step, "training/weights", &weights, config.weight_buckets)?;

    debug!("visualization written to {}", dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, PyramidConfig};

    type TestBackend = burn::backend::NdArray;

    fn model() -> MultiscaleDenoiser<TestBackend> {
        let device = Default::default();
        let config = ModelConfig {
            channels: 1,
            filters: 2,
            no_layers: 1,
            pyramid: PyramidConfig {
                kind: "identity".to_string(),
                levels: 1,
            },
            ..Default::default()
        };
        MultiscaleDenoiser::build(&config, &device).unwrap()
    }

    #[test]
    fn test_self_feedback_batch_in_raw_range() {
        let device = Default::default();
        let model = model();
        let batch = self_feedback_batch(&model, 2, 1, [16, 16], 3, &device).unwrap();
        assert_eq!(batch.dims(), [2, 1, 16, 16]);
        // Clamped in internal space, so the raw range bounds hold.
        assert!(batch.clone().max().into_scalar() <= 255.0 + 1e-3);
        assert!(batch.min().into_scalar() >= -1e-3);
    }

    #[test]
    fn test_images_written_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let batch = Tensor::<TestBackend, 4>::random(
            [3, 1, 8, 8],
            Distribution::Uniform(0.0, 255.0),
            &device,
        );

        let written =
            save_batch_images(&batch, dir.path(), "input", 2, 0.0, 255.0).unwrap();
        assert_eq!(written.len(), 2);
        for path in written {
            assert!(path.is_file());
        }
    }
}
