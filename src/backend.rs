//! Backend selection.
//!
//! The CPU `NdArray` backend is the default so the crate trains and tests
//! everywhere; the CUDA backend is an opt-in feature for real runs.

use burn::backend::Autodiff;

#[cfg(not(feature = "cuda"))]
pub type DefaultBackend = burn::backend::NdArray;

#[cfg(feature = "cuda")]
pub type DefaultBackend = burn_cuda::Cuda;

/// The autodiff backend used for training.
pub type TrainingBackend = Autodiff<DefaultBackend>;

/// Get the default device for the selected backend.
pub fn default_device() -> <DefaultBackend as burn::tensor::backend::Backend>::Device {
    Default::default()
}

/// Human-readable name for the selected backend.
pub fn backend_name() -> &'static str {
    #[cfg(feature = "cuda")]
    {
        "CUDA (GPU)"
    }
    #[cfg(not(feature = "cuda"))]
    {
        "NdArray (CPU)"
    }
}
