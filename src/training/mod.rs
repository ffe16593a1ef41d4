//! Training: the step/epoch loop and its side effects.

pub mod checkpoint;
pub mod pruning;
pub mod trainer;
pub mod visualize;

pub use checkpoint::CheckpointManager;
pub use pruning::PruneEngine;
pub use trainer::{TrainState, Trainer};
