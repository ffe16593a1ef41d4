//! Residual denoising sub-network.
//!
//! A stack of convolution + normalization residual blocks with a global skip
//! connection, so the network learns the correction to apply to its input.
//! Three variants: the plain residual stack, a sparsity-gated variant that
//! zeroes weak activations, and a gated variant with learned multipliers.
//!
//! The bias-free discipline removes every additive parameter: convolutions
//! carry no bias and batch normalization is replaced by `BiasFreeNorm`,
//! which rescales by the running sigma without centering or offset. With
//! constant inference statistics the whole network is positively
//! homogeneous: scaling the input scales the output.

use burn::module::{Module, Param, RunningState};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Initializer, PaddingConfig2d};
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::config::ModelConfig;
use crate::utils::error::{DenoiseError, Result};
use crate::EPSILON;

/// Architectural variant of the residual stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Resnet,
    SparseResnet,
    Gatenet,
}

impl ModelKind {
    /// Parse the configuration tag, keeping the offending value on error.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "resnet" => Ok(Self::Resnet),
            "sparse_resnet" => Ok(Self::SparseResnet),
            "gatenet" => Ok(Self::Gatenet),
            other => Err(DenoiseError::Config(format!(
                "don't know how to build model [{}]",
                other
            ))),
        }
    }
}

/// Map an initializer tag to the burn initializer.
pub fn parse_initializer(value: &str) -> Result<Initializer> {
    match value {
        "glorot_normal" => Ok(Initializer::XavierNormal { gain: 1.0 }),
        "glorot_uniform" => Ok(Initializer::XavierUniform { gain: 1.0 }),
        "he_normal" => Ok(Initializer::KaimingNormal {
            gain: std::f64::consts::SQRT_2,
            fan_out_only: false,
        }),
        "he_uniform" => Ok(Initializer::KaimingUniform {
            gain: std::f64::consts::SQRT_2,
            fan_out_only: false,
        }),
        "zeros" => Ok(Initializer::Zeros),
        other => Err(DenoiseError::Config(format!(
            "unknown kernel_initializer [{}]",
            other
        ))),
    }
}

/// Weight penalty reported to the loss engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regularizer {
    L1,
    L2,
    None,
}

impl Regularizer {
    /// Parse the configuration tag, keeping the offending value on error.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "l1" => Ok(Self::L1),
            "l2" => Ok(Self::L2),
            "none" => Ok(Self::None),
            other => Err(DenoiseError::Config(format!(
                "unknown kernel_regularizer [{}]",
                other
            ))),
        }
    }
}

/// Batch normalization without additive parameters.
///
/// Rescales each channel by `gamma / sqrt(var + eps)`: no mean subtraction,
/// no beta. During training the second moment comes from the batch and feeds
/// the running estimate; at inference the running estimate is a constant, so
/// the layer is a pure (learned) channel scaling.
#[derive(Module, Debug)]
pub struct BiasFreeNorm<B: Backend> {
    gamma: Param<Tensor<B, 1>>,
    running_var: RunningState<Tensor<B, 1>>,
    momentum: f64,
    epsilon: f64,
}

impl<B: Backend> BiasFreeNorm<B> {
    pub fn new(num_features: usize, device: &B::Device) -> Self {
        Self {
            gamma: Initializer::Ones.init([num_features], device),
            running_var: RunningState::new(Tensor::ones([num_features], device)),
            momentum: 0.1,
            epsilon: EPSILON as f64,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, channels, height, width] = x.dims();

        let var = if B::ad_enabled() {
            let batch_var = x
                .clone()
                .powf_scalar(2.0)
                .mean_dim(0)
                .mean_dim(2)
                .mean_dim(3)
                .reshape([channels]);
            let running = self.running_var.value();
            self.running_var.update(
                running
                    .mul_scalar(1.0 - self.momentum)
                    .add(batch_var.clone().detach().mul_scalar(self.momentum)),
            );
            batch_var
        } else {
            self.running_var.value()
        };

        let scale = self
            .gamma
            .val()
            .div(var.add_scalar(self.epsilon).sqrt())
            .reshape([1, channels, 1, 1])
            .expand([batch, channels, height, width]);
        x * scale
    }
}

/// Learned output multiplier, initialized to one.
#[derive(Module, Debug)]
pub struct ChannelGate<B: Backend> {
    weight: Param<Tensor<B, 1>>,
}

impl<B: Backend> ChannelGate<B> {
    pub fn new(device: &B::Device) -> Self {
        Self {
            weight: Initializer::Ones.init([1], device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, channels, height, width] = x.dims();
        let gate = self
            .weight
            .val()
            .reshape([1, 1, 1, 1])
            .expand([batch, channels, height, width]);
        x * gate
    }
}

/// Zero activations below their per-channel mean magnitude. Parameter-free
/// sparsity gating for the `sparse_resnet` variant.
fn sparsity_gate<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [batch, channels, height, width] = x.dims();
    let threshold = x
        .clone()
        .mean_dim(3)
        .mean_dim(2)
        .expand([batch, channels, height, width]);
    let keep = x.clone().greater(threshold);
    x * keep.float()
}

/// One convolution + normalization + activation block with a skip
/// connection.
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    conv: Conv2d<B>,
    bn: Option<BatchNorm<B>>,
    bias_free_norm: Option<BiasFreeNorm<B>>,
    gate: Option<ChannelGate<B>>,
    sparse: bool,
}

impl<B: Backend> ResidualBlock<B> {
    fn new(
        filters: usize,
        kernel_size: usize,
        kind: ModelKind,
        batchnorm: bool,
        bias_free: bool,
        initializer: &Initializer,
        device: &B::Device,
    ) -> Self {
        let conv = Conv2dConfig::new([filters, filters], [kernel_size, kernel_size])
            .with_padding(PaddingConfig2d::Same)
            .with_bias(!bias_free)
            .with_initializer(initializer.clone())
            .init(device);

        let (bn, bias_free_norm) = match (batchnorm, bias_free) {
            (false, _) => (None, None),
            (true, false) => (Some(BatchNormConfig::new(filters).init(device)), None),
            (true, true) => (None, Some(BiasFreeNorm::new(filters, device))),
        };

        let gate = match kind {
            ModelKind::Gatenet => Some(ChannelGate::new(device)),
            _ => None,
        };

        Self {
            conv,
            bn,
            bias_free_norm,
            gate,
            sparse: kind == ModelKind::SparseResnet,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let skip = x.clone();
        let mut y = self.conv.forward(x);
        if let Some(bn) = &self.bn {
            y = bn.forward(y);
        }
        if let Some(norm) = &self.bias_free_norm {
            y = norm.forward(y);
        }
        y = relu(y);
        if self.sparse {
            y = sparsity_gate(y);
        }
        if let Some(gate) = &self.gate {
            y = gate.forward(y);
        }
        skip + y
    }
}

/// The per-level denoising network: entry convolution into filter space,
/// `no_layers` residual blocks, exit convolution back to image space, and a
/// global skip so the stack predicts a correction.
#[derive(Module, Debug)]
pub struct DenoiseNet<B: Backend> {
    entry: Conv2d<B>,
    blocks: Vec<ResidualBlock<B>>,
    exit: Conv2d<B>,
    tanh_output: bool,
}

impl<B: Backend> DenoiseNet<B> {
    pub fn new(config: &ModelConfig, device: &B::Device) -> Result<Self> {
        let kind = ModelKind::parse(&config.model_type)?;
        let initializer = parse_initializer(&config.kernel_initializer)?;
        let kernel = config.kernel_size;

        let entry = Conv2dConfig::new([config.channels, config.filters], [kernel, kernel])
            .with_padding(PaddingConfig2d::Same)
            .with_bias(!config.bias_free)
            .with_initializer(initializer.clone())
            .init(device);

        let blocks = (0..config.no_layers)
            .map(|_| {
                ResidualBlock::new(
                    config.filters,
                    kernel,
                    kind,
                    config.batchnorm,
                    config.bias_free,
                    &initializer,
                    device,
                )
            })
            .collect();

        let exit = Conv2dConfig::new([config.filters, config.channels], [kernel, kernel])
            .with_padding(PaddingConfig2d::Same)
            .with_bias(!config.bias_free)
            .with_initializer(initializer)
            .init(device);

        Ok(Self {
            entry,
            blocks,
            exit,
            tanh_output: config.final_activation == "tanh",
        })
    }

    fn correction(&self, features: Tensor<B, 4>) -> Tensor<B, 4> {
        let y = self.exit.forward(features);
        if self.tanh_output {
            y.tanh()
        } else {
            y
        }
    }

    /// Denoised estimate for one pyramid level.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut features = relu(self.entry.forward(x.clone()));
        for block in &self.blocks {
            features = block.forward(features);
        }
        x + self.correction(features)
    }

    /// Denoised estimate plus one estimate per residual block, for
    /// diagnostic supervision.
    pub fn forward_with_intermediates(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, Vec<Tensor<B, 4>>) {
        let mut features = relu(self.entry.forward(x.clone()));
        let mut intermediates = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            features = block.forward(features);
            intermediates.push(x.clone() + self.correction(features.clone()));
        }
        (x + self.correction(features), intermediates)
    }

    /// Every rank-4 convolution weight, for histograms and penalties.
    pub fn conv_weights(&self) -> Vec<Tensor<B, 4>> {
        let mut weights = vec![self.entry.weight.val(), self.exit.weight.val()];
        for block in &self.blocks {
            weights.push(block.conv.weight.val());
        }
        weights
    }

    /// Mutable access to the convolution weights, for pruning.
    pub fn conv_params_mut(&mut self) -> Vec<&mut Param<Tensor<B, 4>>> {
        let mut params = vec![&mut self.entry.weight, &mut self.exit.weight];
        for block in &mut self.blocks {
            params.push(&mut block.conv.weight);
        }
        params
    }

    /// Whether any layer carries an additive parameter.
    pub fn has_bias(&self) -> bool {
        self.entry.bias.is_some()
            || self.exit.bias.is_some()
            || self.blocks.iter().any(|b| b.conv.bias.is_some() || b.bn.is_some())
    }
}
