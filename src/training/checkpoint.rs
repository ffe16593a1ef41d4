//! Checkpointing.
//!
//! One directory per snapshot (`step_<n>/`) holding the trainable stack,
//! the optimizer state and the training counters. Saves happen strictly
//! between steps, so a snapshot is always a consistent
//! `{step, epoch, optimizer, parameters}` tuple; the newest
//! `checkpoints_to_keep` snapshots are retained and older ones are removed
//! on write. Restore is strict by default: a missing member is an error
//! unless `expect_partial` was set.

use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::optim::Optimizer;
use burn::record::{CompactRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use tracing::{info, warn};

use crate::model::assembler::DenoiseStack;
use crate::training::trainer::TrainState;
use crate::utils::error::{DenoiseError, Result};

const STACK_FILE: &str = "denoiser";
const OPTIMIZER_FILE: &str = "optimizer";
const STATE_FILE: &str = "state.json";
const RECORD_EXTENSION: &str = "mpk";

/// Writes and restores training snapshots with retention.
pub struct CheckpointManager {
    directory: PathBuf,
    keep: usize,
    expect_partial: bool,
}

impl CheckpointManager {
    /// Create the checkpoint directory under `model_dir`. Fails hard if the
    /// directory cannot be created.
    pub fn new(model_dir: &Path, keep: usize, expect_partial: bool) -> Result<Self> {
        let directory = model_dir.join("checkpoints");
        std::fs::create_dir_all(&directory)?;
        if !directory.is_dir() {
            return Err(DenoiseError::Checkpoint(format!(
                "checkpoint directory '{}' is not valid",
                directory.display()
            )));
        }
        Ok(Self {
            directory,
            keep,
            expect_partial,
        })
    }

    fn snapshot_dir(&self, step: u64) -> PathBuf {
        self.directory.join(format!("step_{:09}", step))
    }

    /// Persist one consistent snapshot, then prune old ones.
    pub fn save<B, O>(
        &self,
        stack: &DenoiseStack<B>,
        optimizer: &O,
        state: &TrainState,
    ) -> Result<()>
    where
        B: AutodiffBackend,
        O: Optimizer<DenoiseStack<B>, B>,
    {
        let dir = self.snapshot_dir(state.step);
        std::fs::create_dir_all(&dir)?;

        let recorder = CompactRecorder::new();
        stack
            .clone()
            .save_file(dir.join(STACK_FILE), &recorder)
            .map_err(|e| DenoiseError::Checkpoint(format!("failed to save stack: {:?}", e)))?;
        recorder
            .record(optimizer.to_record(), dir.join(OPTIMIZER_FILE))
            .map_err(|e| {
                DenoiseError::Checkpoint(format!("failed to save optimizer state: {:?}", e))
            })?;
        std::fs::write(dir.join(STATE_FILE), serde_json::to_string_pretty(state)?)?;

        self.enforce_retention()?;
        info!("checkpoint saved at step {}", state.step);
        Ok(())
    }

    /// Steps of the snapshots currently on disk, oldest first.
    pub fn snapshot_steps(&self) -> Result<Vec<u64>> {
        let mut steps = Vec::new();
        for entry in std::fs::read_dir(&self.directory)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            if let Some(step) = name
                .to_str()
                .and_then(|n| n.strip_prefix("step_"))
                .and_then(|n| n.parse::<u64>().ok())
            {
                steps.push(step);
            }
        }
        steps.sort_unstable();
        Ok(steps)
    }

    /// Restore the most recent snapshot, if any. The stack and optimizer
    /// are passed through unchanged (with a `None` state) when no snapshot
    /// exists.
    pub fn restore<B, O>(
        &self,
        stack: DenoiseStack<B>,
        optimizer: O,
        device: &B::Device,
    ) -> Result<(DenoiseStack<B>, O, Option<TrainState>)>
    where
        B: AutodiffBackend,
        O: Optimizer<DenoiseStack<B>, B>,
    {
        let Some(&step) = self.snapshot_steps()?.last() else {
            return Ok((stack, optimizer, None));
        };
        let dir = self.snapshot_dir(step);

        let state_path = dir.join(STATE_FILE);
        if !state_path.is_file() {
            return Err(DenoiseError::Checkpoint(format!(
                "snapshot '{}' has no state file",
                dir.display()
            )));
        }
        let state: TrainState = serde_json::from_str(&std::fs::read_to_string(state_path)?)?;

        let recorder = CompactRecorder::new();

        let stack_file = dir.join(format!("{}.{}", STACK_FILE, RECORD_EXTENSION));
        let stack = if stack_file.is_file() {
            stack
                .load_file(dir.join(STACK_FILE), &recorder, device)
                .map_err(|e| {
                    DenoiseError::Checkpoint(format!("failed to restore stack: {:?}", e))
                })?
        } else if self.expect_partial {
            warn!("snapshot {} has no stack record, keeping current", step);
            stack
        } else {
            return Err(DenoiseError::Checkpoint(format!(
                "snapshot '{}' is missing the stack record (set expect_partial to allow)",
                dir.display()
            )));
        };

        let optimizer_file = dir.join(format!("{}.{}", OPTIMIZER_FILE, RECORD_EXTENSION));
        let optimizer = if optimizer_file.is_file() {
            let record = recorder.load(dir.join(OPTIMIZER_FILE), device).map_err(|e| {
                DenoiseError::Checkpoint(format!("failed to restore optimizer state: {:?}", e))
            })?;
            optimizer.load_record(record)
        } else if self.expect_partial {
            warn!("snapshot {} has no optimizer record, keeping current", step);
            optimizer
        } else {
            return Err(DenoiseError::Checkpoint(format!(
                "snapshot '{}' is missing the optimizer record (set expect_partial to allow)",
                dir.display()
            )));
        };

        info!("restored checkpoint from step {}", state.step);
        Ok((stack, optimizer, Some(state)))
    }

    fn enforce_retention(&self) -> Result<()> {
        let steps = self.snapshot_steps()?;
        if steps.len() <= self.keep {
            return Ok(());
        }
        for &step in &steps[..steps.len() - self.keep] {
            std::fs::remove_dir_all(self.snapshot_dir(step))?;
        }
        Ok(())
    }
}
