//! Image gradient filters.
//!
//! Hand-specified horizontal/vertical difference kernels for sizes 2 to 5,
//! applied depthwise so every channel is filtered independently. They are
//! fixed weights, never trained. The magnitude map
//! `sqrt(alpha*dx^2 + beta*dy^2 + eps)` drives the edge-weighted loss term.

use burn::tensor::backend::Backend;
use burn::tensor::module::conv2d;
use burn::tensor::ops::ConvOptions;
use burn::tensor::{Tensor, TensorData};

use crate::utils::error::{DenoiseError, Result};
use crate::EPSILON;

/// Difference kernel rows for each supported size.
fn kernel_table(kernel_size: usize) -> Result<Vec<f32>> {
    let values: &[f32] = match kernel_size {
        2 => &[
            1.0, -1.0, //
            1.0, -1.0,
        ],
        3 => &[
            1.0, 0.0, -1.0, //
            2.0, 0.0, -2.0, //
            1.0, 0.0, -1.0,
        ],
        4 => &[
            3.0, 1.0, -1.0, -3.0, //
            3.0, 1.0, -1.0, -3.0, //
            3.0, 1.0, -1.0, -3.0, //
            3.0, 1.0, -1.0, -3.0,
        ],
        5 => &[
            2.0, 1.0, 0.0, -1.0, -2.0, //
            2.0, 1.0, 0.0, -1.0, -2.0, //
            2.0, 1.0, 0.0, -1.0, -2.0, //
            2.0, 1.0, 0.0, -1.0, -2.0, //
            2.0, 1.0, 0.0, -1.0, -2.0,
        ],
        other => {
            return Err(DenoiseError::Config(format!(
                "delta kernel size [{}] not supported, expected 2..=5",
                other
            )))
        }
    };
    Ok(values.to_vec())
}

/// Depthwise difference filter with same padding. `transpose` swaps the
/// kernel axes, turning the horizontal filter into the vertical one.
fn delta<B: Backend>(x: &Tensor<B, 4>, kernel_size: usize, transpose: bool) -> Result<Tensor<B, 4>> {
    let values = kernel_table(kernel_size)?;
    let values = if transpose {
        let mut t = vec![0.0f32; kernel_size * kernel_size];
        for i in 0..kernel_size {
            for j in 0..kernel_size {
                t[j * kernel_size + i] = values[i * kernel_size + j];
            }
        }
        t
    } else {
        values
    };

    let [_, channels, _, _] = x.dims();
    let device = x.device();
    let weight = Tensor::<B, 4>::from_data(
        TensorData::new(values, [1, 1, kernel_size, kernel_size]),
        &device,
    )
    .repeat_dim(0, channels);

    // Same padding, asymmetric for even kernels, applied before the conv.
    let before = (kernel_size - 1) / 2;
    let after = kernel_size - 1 - before;
    let padded = x.clone().pad((before, after, before, after), 0.0);

    Ok(conv2d(
        padded,
        weight,
        None,
        ConvOptions::new([1, 1], [0, 0], [1, 1], channels),
    ))
}

/// Horizontal difference for each channel.
pub fn delta_x<B: Backend>(x: &Tensor<B, 4>, kernel_size: usize) -> Result<Tensor<B, 4>> {
    delta(x, kernel_size, false)
}

/// Vertical difference for each channel.
pub fn delta_y<B: Backend>(x: &Tensor<B, 4>, kernel_size: usize) -> Result<Tensor<B, 4>> {
    delta(x, kernel_size, true)
}

/// Gradient magnitude `sqrt(alpha*dx^2 + beta*dy^2 + eps)`.
pub fn delta_xy_magnitude<B: Backend>(
    x: &Tensor<B, 4>,
    kernel_size: usize,
    alpha: f64,
    beta: f64,
) -> Result<Tensor<B, 4>> {
    let dx = delta_x(x, kernel_size)?.powf_scalar(2.0).mul_scalar(alpha);
    let dy = delta_y(x, kernel_size)?.powf_scalar(2.0).mul_scalar(beta);
    Ok((dx + dy).abs().add_scalar(EPSILON).sqrt())
}
