//! Data loading, augmentation and batch prefetch.

pub mod augmentation;
pub mod loader;
pub mod prefetch;

pub use augmentation::Augmenter;
pub use loader::{ImageBatcher, ImageFolderDataset, ImageItem};
pub use prefetch::BatchPrefetcher;

/// Batches loaded ahead of the training loop.
pub const PREFETCH_DEPTH: usize = 2;
