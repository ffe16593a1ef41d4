//! Model components: pyramid transform, normalization stages, residual
//! denoising sub-networks and the assembled multi-scale denoiser.

pub mod assembler;
pub mod normalize;
pub mod pyramid;
pub mod resnet;

pub use assembler::{DenoiseStack, MultiscaleDenoiser};
pub use normalize::{RangeNormalizer, SigmaNormalizer};
pub use pyramid::{PyramidKind, PyramidTransform};
pub use resnet::{DenoiseNet, ModelKind};
