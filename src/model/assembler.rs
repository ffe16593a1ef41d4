//! Model assembly.
//!
//! Wires the pieces into one inference graph with fixed topology:
//! input → pyramid decompose → per level (sigma-normalize → denoise net →
//! sigma-denormalize) → inverse pyramid → optional clamp. The training loop
//! needs the pieces individually, so they stay addressable: the end-to-end
//! `forward`, the per-level `forward_decomposition`, the range normalizer,
//! and the pyramid transform are all separate entry points.
//!
//! Only `DenoiseStack` carries trainable parameters; everything else is
//! closed-form. Weight updates and pruning replace the stack wholesale, so a
//! reader can never observe a half-updated parameter set.

use std::path::Path;

use burn::module::{AutodiffModule, Module};
use burn::record::CompactRecorder;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;

use crate::config::ModelConfig;
use crate::model::normalize::{RangeNormalizer, SigmaNormalizer};
use crate::model::pyramid::PyramidTransform;
use crate::model::resnet::{DenoiseNet, Regularizer};
use crate::utils::error::{DenoiseError, Result};
use crate::{INTERNAL_MAX, INTERNAL_MIN};

/// The trainable part of the model: one denoising net per pyramid level, or
/// a single shared net.
#[derive(Module, Debug)]
pub struct DenoiseStack<B: Backend> {
    pub nets: Vec<DenoiseNet<B>>,
    shared: bool,
    levels: usize,
}

impl<B: Backend> DenoiseStack<B> {
    pub fn new(config: &ModelConfig, device: &B::Device) -> Result<Self> {
        let levels = config.pyramid.levels;
        let instances = if config.shared_model { 1 } else { levels };
        let nets = (0..instances)
            .map(|_| DenoiseNet::new(config, device))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            nets,
            shared: config.shared_model,
            levels,
        })
    }

    pub fn levels(&self) -> usize {
        self.levels
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    fn net_for_level(&self, level: usize) -> &DenoiseNet<B> {
        if self.shared {
            &self.nets[0]
        } else {
            &self.nets[level]
        }
    }

    /// Every convolution weight in the stack.
    pub fn conv_weights(&self) -> Vec<Tensor<B, 4>> {
        self.nets.iter().flat_map(|net| net.conv_weights()).collect()
    }

    /// Sum of the configured weight penalty over every convolution kernel.
    pub fn regularization_penalty(&self, regularizer: Regularizer, device: &B::Device) -> Tensor<B, 1> {
        let mut total = Tensor::<B, 1>::zeros([1], device);
        for weight in self.conv_weights() {
            total = match regularizer {
                Regularizer::None => total,
                Regularizer::L1 => total + weight.abs().sum(),
                Regularizer::L2 => total + weight.powf_scalar(2.0).sum(),
            };
        }
        total
    }
}

/// The assembled multi-scale denoiser. Topology is fixed at build time.
pub struct MultiscaleDenoiser<B: Backend> {
    pub stack: DenoiseStack<B>,
    pub pyramid: PyramidTransform,
    pub sigma: Option<SigmaNormalizer>,
    pub range: RangeNormalizer,
    pub regularizer: Regularizer,
    clip_values: bool,
    output_multiplier: f64,
    intermediate_results: bool,
}

impl<B: Backend> MultiscaleDenoiser<B> {
    /// Build the model from configuration. Validation happens here, before
    /// any parameter is allocated.
    pub fn build(config: &ModelConfig, device: &B::Device) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            stack: DenoiseStack::new(config, device)?,
            pyramid: PyramidTransform::new(&config.pyramid)?,
            sigma: SigmaNormalizer::from_flag(config.local_normalization)?,
            range: RangeNormalizer::new(config.min_value, config.max_value)?,
            regularizer: Regularizer::parse(&config.kernel_regularizer)?,
            clip_values: config.clip_values,
            output_multiplier: config.output_multiplier,
            intermediate_results: config.intermediate_results,
        })
    }

    pub fn intermediate_results(&self) -> bool {
        self.intermediate_results
    }

    /// Denoise one pyramid level: sigma-normalize, run the level's net,
    /// rescale, sigma-denormalize.
    fn denoise_level(&self, level: usize, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let (x, stats) = match &self.sigma {
            Some(sigma) => {
                let (normalized, stats) = sigma.normalize(&x);
                (normalized, Some(stats))
            }
            None => (x, None),
        };

        let mut y = self.stack.net_for_level(level).forward(x);
        if self.output_multiplier != 1.0 {
            y = y.mul_scalar(self.output_multiplier);
        }

        match (&self.sigma, stats) {
            (Some(sigma), Some(stats)) => sigma.denormalize(y, &stats),
            _ => y,
        }
    }

    /// Per-level denoised tensors for an internal-space input. This is the
    /// path the training loop differentiates through.
    pub fn forward_decomposition(&self, x: Tensor<B, 4>) -> Result<Vec<Tensor<B, 4>>> {
        let levels = self.pyramid.decompose(&x)?;
        Ok(levels
            .into_iter()
            .enumerate()
            .map(|(i, level)| self.denoise_level(i, level))
            .collect())
    }

    /// End-to-end denoising in the internal value space.
    pub fn forward(&self, x: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        let levels = self.forward_decomposition(x)?;
        let mut out = self.pyramid.recompose(&levels)?;
        if self.clip_values {
            out = out.clamp(INTERNAL_MIN, INTERNAL_MAX);
        }
        Ok(out)
    }

    /// End-to-end denoising plus the raw per-block estimates of every
    /// level's net, in order: level 0 blocks, level 1 blocks, ...
    pub fn forward_with_intermediates(
        &self,
        x: Tensor<B, 4>,
    ) -> Result<(Tensor<B, 4>, Vec<Tensor<B, 4>>)> {
        if !self.intermediate_results {
            return Err(DenoiseError::Config(
                "intermediate_results is disabled for this model".into(),
            ));
        }

        let levels = self.pyramid.decompose(&x)?;
        let mut denoised = Vec::with_capacity(levels.len());
        let mut taps = Vec::new();
        for (i, level) in levels.into_iter().enumerate() {
            let (level, stats) = match &self.sigma {
                Some(sigma) => {
                    let (normalized, stats) = sigma.normalize(&level);
                    (normalized, Some(stats))
                }
                None => (level, None),
            };

            let (mut y, level_taps) = self
                .stack
                .net_for_level(i)
                .forward_with_intermediates(level);
            taps.extend(level_taps);

            if self.output_multiplier != 1.0 {
                y = y.mul_scalar(self.output_multiplier);
            }
            if let (Some(sigma), Some(stats)) = (&self.sigma, stats) {
                y = sigma.denormalize(y, &stats);
            }
            denoised.push(y);
        }

        let mut out = self.pyramid.recompose(&denoised)?;
        if self.clip_values {
            out = out.clamp(INTERNAL_MIN, INTERNAL_MAX);
        }
        Ok((out, taps))
    }

    /// Save the trainable stack to a single record file.
    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        self.stack
            .clone()
            .save_file(path.to_path_buf(), &CompactRecorder::new())
            .map_err(|e| DenoiseError::Checkpoint(format!("failed to save snapshot: {:?}", e)))
    }

    /// Replace the stack with the parameters stored at `path`.
    pub fn load_snapshot(mut self, path: &Path, device: &B::Device) -> Result<Self> {
        self.stack = self
            .stack
            .load_file(path.to_path_buf(), &CompactRecorder::new(), device)
            .map_err(|e| DenoiseError::Checkpoint(format!("failed to load snapshot: {:?}", e)))?;
        Ok(self)
    }
}

impl<B: AutodiffBackend> MultiscaleDenoiser<B> {
    /// The inference view of the model, on the inner backend.
    pub fn valid(&self) -> MultiscaleDenoiser<B::InnerBackend> {
        MultiscaleDenoiser {
            stack: self.stack.valid(),
            pyramid: self.pyramid.clone(),
            sigma: self.sigma,
            range: self.range,
            regularizer: self.regularizer,
            clip_values: self.clip_values,
            output_multiplier: self.output_multiplier,
            intermediate_results: self.intermediate_results,
        }
    }
}
