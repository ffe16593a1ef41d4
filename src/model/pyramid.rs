//! Multi-scale pyramid decomposition.
//!
//! The Laplacian strategy stores, per level, the detail lost by one
//! blur-downsample step; the coarsest level keeps the remaining low-pass
//! residue. Because details are stored residuals, `recompose` is the exact
//! inverse of `decompose` up to floating point, without any learned
//! parameters. The identity strategy passes a single level through
//! untouched.

use burn::tensor::backend::Backend;
use burn::tensor::module::{conv2d, interpolate};
use burn::tensor::ops::{ConvOptions, InterpolateMode, InterpolateOptions};
use burn::tensor::{Tensor, TensorData};

use crate::config::PyramidConfig;
use crate::utils::error::{DenoiseError, Result};

/// Decomposition strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PyramidKind {
    /// Single-level pass-through.
    Identity,
    /// Blur-downsample detail pyramid with exact reconstruction.
    Laplacian,
}

impl PyramidKind {
    /// Parse the configuration tag, keeping the offending value on error.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "identity" => Ok(Self::Identity),
            "laplacian" => Ok(Self::Laplacian),
            other => Err(DenoiseError::Config(format!(
                "unknown pyramid type [{}]",
                other
            ))),
        }
    }
}

/// Decomposes an image batch into scale levels and reconstructs it.
///
/// Level 0 is the finest scale; the last level is the coarsest.
#[derive(Debug, Clone)]
pub struct PyramidTransform {
    kind: PyramidKind,
    levels: usize,
}

impl PyramidTransform {
    pub fn new(config: &PyramidConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            kind: PyramidKind::parse(&config.kind)?,
            levels: config.levels,
        })
    }

    pub fn levels(&self) -> usize {
        self.levels
    }

    /// Split `x` into `levels` tensors of decreasing spatial size.
    pub fn decompose<B: Backend>(&self, x: &Tensor<B, 4>) -> Result<Vec<Tensor<B, 4>>> {
        let [_, _, height, width] = x.dims();
        let factor = 1usize << (self.levels - 1);
        if height % factor != 0 || width % factor != 0 {
            return Err(DenoiseError::Config(format!(
                "input {}x{} is not divisible by 2^{} required by {} pyramid levels",
                height,
                width,
                self.levels - 1,
                self.levels
            )));
        }

        match self.kind {
            PyramidKind::Identity => Ok(vec![x.clone()]),
            PyramidKind::Laplacian => {
                let mut out = Vec::with_capacity(self.levels);
                let mut current = x.clone();
                for _ in 0..self.levels - 1 {
                    let [_, _, h, w] = current.dims();
                    let down = blur_downsample(current.clone());
                    let up = upsample(down.clone(), [h, w]);
                    out.push(current - up);
                    current = down;
                }
                out.push(current);
                Ok(out)
            }
        }
    }

    /// Reassemble one image batch from `levels` tensors.
    pub fn recompose<B: Backend>(&self, levels: &[Tensor<B, 4>]) -> Result<Tensor<B, 4>> {
        if levels.len() != self.levels {
            return Err(DenoiseError::Shape(format!(
                "recompose expected {} levels, got {}",
                self.levels,
                levels.len()
            )));
        }

        match self.kind {
            PyramidKind::Identity => Ok(levels[0].clone()),
            PyramidKind::Laplacian => {
                let mut current = levels[self.levels - 1].clone();
                for detail in levels[..self.levels - 1].iter().rev() {
                    let [_, _, h, w] = detail.dims();
                    current = upsample(current, [h, w]) + detail.clone();
                }
                Ok(current)
            }
        }
    }
}

/// 5x5 binomial low-pass kernel, one copy per channel for depthwise use.
fn binomial_kernel<B: Backend>(channels: usize, device: &B::Device) -> Tensor<B, 4> {
    const ROW: [f32; 5] = [1.0, 4.0, 6.0, 4.0, 1.0];
    let mut values = Vec::with_capacity(25);
    for a in ROW {
        for b in ROW {
            values.push(a * b / 256.0);
        }
    }
    Tensor::<B, 4>::from_data(TensorData::new(values, [1, 1, 5, 5]), device)
        .repeat_dim(0, channels)
}

/// Depthwise binomial blur with stride 2. Halves both spatial dimensions.
fn blur_downsample<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [_, channels, _, _] = x.dims();
    let weight = binomial_kernel::<B>(channels, &x.device());
    conv2d(
        x,
        weight,
        None,
        ConvOptions::new([2, 2], [2, 2], [1, 1], channels),
    )
}

/// Depthwise binomial blur at full resolution. Shared with the augmentation
/// pipeline.
pub(crate) fn binomial_blur<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [_, channels, _, _] = x.dims();
    let weight = binomial_kernel::<B>(channels, &x.device());
    conv2d(
        x,
        weight,
        None,
        ConvOptions::new([1, 1], [2, 2], [1, 1], channels),
    )
}

/// Bilinear upsample to an explicit spatial size.
fn upsample<B: Backend>(x: Tensor<B, 4>, size: [usize; 2]) -> Tensor<B, 4> {
    interpolate(
        x,
        size,
        InterpolateOptions::new(InterpolateMode::Bilinear),
    )
}
