//! The training loop.
//!
//! Drives the per-step sequence: augment, range-normalize, decompose the
//! clean target, forward the noisy batch through the decomposition network,
//! recompose, denormalize, evaluate the loss map, compute gradients with
//! respect to the decomposition stack only, and apply the optimizer update.
//! Visualization, pruning and checkpointing are synchronous side effects
//! triggered strictly between steps. The loop ends when the configured
//! epoch count is reached or `total_steps` fires mid-epoch.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use burn::data::dataloader::batcher::Batcher;
use burn::grad_clipping::GradientClippingConfig;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Tensor;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{Config, OptimizerConfig};
use crate::dataset::{Augmenter, BatchPrefetcher, ImageBatcher, ImageFolderDataset};
use crate::loss::{LossEngine, LossOutput};
use crate::model::assembler::{DenoiseStack, MultiscaleDenoiser};
use crate::training::checkpoint::CheckpointManager;
use crate::training::pruning::PruneEngine;
use crate::training::visualize;
use crate::utils::error::{DenoiseError, Result};
use crate::utils::summary::SummaryWriter;

/// Step and epoch counters. Owned by the trainer, passed whole to the
/// checkpoint writer, and the sole source of truth when resuming.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainState {
    pub step: u64,
    pub epoch: u64,
}

/// Build the Adam optimizer for the decomposition stack.
pub fn build_optimizer<B: AutodiffBackend>(
    config: &OptimizerConfig,
) -> impl Optimizer<DenoiseStack<B>, B> {
    let mut adam = AdamConfig::new();
    if config.weight_decay > 0.0 {
        adam = adam.with_weight_decay(Some(WeightDecayConfig::new(config.weight_decay)));
    }
    if let Some(clip) = config.gradient_clip {
        adam = adam.with_grad_clipping(Some(GradientClippingConfig::Norm(clip as f32)));
    }
    adam.init()
}

/// Trains the multi-scale denoiser.
pub struct Trainer<B: AutodiffBackend, O: Optimizer<DenoiseStack<B>, B>> {
    pub model: MultiscaleDenoiser<B>,
    optimizer: O,
    config: Config,
    loss: LossEngine,
    pruning: PruneEngine,
    augmenter: Augmenter,
    batcher: ImageBatcher,
    checkpoints: CheckpointManager,
    summary: SummaryWriter,
    state: TrainState,
    model_dir: PathBuf,
    device: B::Device,
    rng: ChaCha8Rng,
}

impl<B: AutodiffBackend, O: Optimizer<DenoiseStack<B>, B>> Trainer<B, O> {
    /// Set up the training environment and restore the latest checkpoint if
    /// one exists under `model_dir`.
    pub fn new(
        config: Config,
        model: MultiscaleDenoiser<B>,
        optimizer: O,
        model_dir: &Path,
        device: B::Device,
    ) -> Result<Self> {
        config.validate()?;

        std::fs::create_dir_all(model_dir)?;
        if !model_dir.is_dir() {
            return Err(DenoiseError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("model directory '{}' is not valid", model_dir.display()),
            )));
        }
        config.save(&model_dir.join("config.json"))?;

        B::seed(config.dataset.seed);

        let checkpoints = CheckpointManager::new(
            model_dir,
            config.train.checkpoints_to_keep,
            config.train.expect_partial,
        )?;
        let summary = SummaryWriter::new(model_dir)?;
        let loss = LossEngine::new(&config.loss)?;
        let pruning = PruneEngine::new(&config.train.prune)?;
        let augmenter = Augmenter::from_config(&config.dataset);
        let batcher = ImageBatcher::new(config.model.channels, config.dataset.input_shape);
        let rng = ChaCha8Rng::seed_from_u64(config.dataset.seed);

        // Resume from the latest snapshot when one exists; restore passes
        // the stack and optimizer through untouched otherwise.
        let mut model = model;
        let (stack, optimizer, restored) =
            checkpoints.restore(model.stack, optimizer, &device)?;
        model.stack = stack;
        let state = restored.unwrap_or_default();
        if restored.is_some() {
            info!("resuming at epoch {}, step {}", state.epoch, state.step);
        }

        Ok(Self {
            model,
            optimizer,
            loss,
            pruning,
            augmenter,
            batcher,
            checkpoints,
            summary,
            state,
            model_dir: model_dir.to_path_buf(),
            device,
            config,
            rng,
        })
    }

    /// Current counters.
    pub fn state(&self) -> TrainState {
        self.state
    }

    fn prune_stack(&mut self) {
        info!("pruning weights at step {}", self.state.step);
        let stack = self.model.stack.clone();
        self.model.stack = self.pruning.prune(stack);
    }

    fn checkpoint(&self) -> Result<()> {
        self.checkpoints
            .save(&self.model.stack, &self.optimizer, &self.state)
    }

    fn snapshot(&self) -> Result<()> {
        self.model.save_snapshot(&self.model_dir.join("denoiser"))
    }

    fn emit_metrics(&mut self, metrics: &std::collections::BTreeMap<&'static str, f64>) -> Result<()> {
        for (&name, &value) in metrics {
            let channel = match name {
                crate::loss::NAE_NOISE | crate::loss::NAE_IMPROVEMENT | crate::loss::SNR => {
                    format!("quality/{}", name)
                }
                other => format!("loss/{}", other),
            };
            self.summary.scalar(self.state.step, &channel, value)?;
        }
        Ok(())
    }

    /// One optimizer update from one raw image batch. Returns the loss map.
    fn train_step(&mut self, raw: Tensor<B, 4>) -> Result<LossOutput<B>> {
        let (clean, noisy) = self.augmenter.augment(raw, &mut self.rng);

        let clean_internal = self.model.range.normalize(clean.clone());
        let noisy_internal = self.model.range.normalize(noisy.clone());

        // Per-level targets come from the clean decomposition; the forward
        // pass runs the decomposition network on the noisy input.
        let clean_levels = self.model.pyramid.decompose(&clean_internal)?;
        let denoised_levels = self.model.forward_decomposition(noisy_internal)?;
        let denoised = self.model.pyramid.recompose(&denoised_levels)?;
        let prediction = self.model.range.denormalize(denoised);

        let regularization = self
            .model
            .stack
            .regularization_penalty(self.model.regularizer, &self.device);

        let output = self.loss.compute(
            &clean,
            &noisy,
            &prediction,
            Some((clean_levels.as_slice(), denoised_levels.as_slice())),
            regularization,
        )?;

        // Gradients with respect to the decomposition stack only.
        let grads = output.total.clone().backward();
        let grads = GradientsParams::from_grads(grads, &self.model.stack);
        let lr = self.config.train.optimizer.learning_rate_at(self.state.step);
        self.model.stack = self
            .optimizer
            .step(lr, self.model.stack.clone(), grads);

        self.summary
            .scalar(self.state.step, "training/learning_rate", lr)?;

        if self.state.step % self.config.train.visualization_every == 0 {
            visualize::run(
                &self.model.valid(),
                &mut self.summary,
                &self.model_dir,
                self.state.step,
                &self.config.train,
                self.config.model.channels,
                &clean.inner(),
                &noisy.inner(),
                &prediction.inner(),
                &self.device,
            )?;
        }

        Ok(output)
    }

    /// Run the epoch/step loop over the dataset until completion.
    pub fn fit(&mut self, dataset: Arc<ImageFolderDataset>) -> Result<()> {
        let train = self.config.train.clone();
        let prune = &train.prune;
        let batch_size = self.config.dataset.batch_size;
        let shuffle_seed = self.config.dataset.seed;
        let mut early_exit = false;

        info!(
            "training for {} epochs ({} batches per epoch)",
            train.epochs,
            BatchPrefetcher::batches_per_epoch(&dataset, batch_size)
        );

        'epochs: while self.state.epoch < train.epochs {
            info!("epoch: {}, step: {}", self.state.epoch, self.state.step);

            if self.pruning.enabled() && self.state.epoch >= prune.start_epoch {
                self.prune_stack();
            }

            let prefetcher = BatchPrefetcher::new(
                dataset.clone(),
                batch_size,
                shuffle_seed.wrapping_add(self.state.epoch),
            );

            for batch in prefetcher {
                let start = Instant::now();
                let items = batch?;
                let raw: Tensor<B, 4> = self.batcher.batch(items, &self.device);

                let output = self.train_step(raw)?;
                self.emit_metrics(&output.metrics)?;

                if self.pruning.enabled()
                    && self.state.epoch >= prune.start_epoch
                    && prune.steps > 0
                    && self.state.step % prune.steps as u64 == 0
                {
                    self.prune_stack();
                }

                if train.checkpoint_every > 0
                    && self.state.step % train.checkpoint_every as u64 == 0
                {
                    self.checkpoint()?;
                }

                let elapsed = start.elapsed().as_secs_f64();
                self.summary.scalar(
                    self.state.step,
                    "training/steps_per_second",
                    1.0 / (elapsed + 1e-5),
                )?;
                self.summary
                    .scalar(self.state.step, "training/epoch", self.state.epoch as f64)?;

                self.state.step += 1;

                if train.total_steps > 0 && self.state.step >= train.total_steps as u64 {
                    info!("total_steps reached [{}]", train.total_steps);
                    early_exit = true;
                    break 'epochs;
                }
            }

            self.state.epoch += 1;
            info!("checkpoint at end of epoch: {}", self.state.epoch);
            self.checkpoint()?;
            self.snapshot()?;
        }

        if early_exit {
            self.checkpoint()?;
            self.snapshot()?;
        }

        info!("finished training");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatasetConfig, ModelConfig, PyramidConfig, TrainConfig};
    use burn::backend::Autodiff;
    use burn::tensor::backend::Backend;

    type TestAutodiff = Autodiff<burn::backend::NdArray>;

    fn test_config(total_steps: i64, epochs: u64) -> Config {
        Config {
            model: ModelConfig {
                channels: 1,
                filters: 2,
                no_layers: 1,
                pyramid: PyramidConfig {
                    kind: "identity".to_string(),
                    levels: 1,
                },
                ..Default::default()
            },
            dataset: DatasetConfig {
                batch_size: 2,
                input_shape: [8, 8],
                additive_noise: vec![5.0],
                ..Default::default()
            },
            train: TrainConfig {
                epochs,
                total_steps,
                visualization_every: 1_000_000,
                visualization_number: 1,
                random_batch_size: [8, 8],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn test_dataset(count: usize, dir: &std::path::Path) -> Arc<ImageFolderDataset> {
        let mut paths = Vec::new();
        for i in 0..count {
            let path = dir.join(format!("img_{:02}.png", i));
            let img = image::GrayImage::from_fn(8, 8, |x, y| {
                image::Luma([((x * 31 + y * 7 + i as u32 * 13) % 256) as u8])
            });
            img.save(&path).unwrap();
            paths.push(path);
        }
        ImageFolderDataset::from_paths(paths, 1, [8, 8])
    }

    fn make_trainer(
        config: Config,
        model_dir: &Path,
    ) -> Trainer<TestAutodiff, impl Optimizer<DenoiseStack<TestAutodiff>, TestAutodiff>> {
        let device = Default::default();
        let model = MultiscaleDenoiser::<TestAutodiff>::build(&config.model, &device).unwrap();
        let optimizer = build_optimizer::<TestAutodiff>(&config.train.optimizer);
        Trainer::new(config, model, optimizer, model_dir, device).unwrap()
    }

    fn stack_weights<B: Backend>(stack: &DenoiseStack<B>) -> Vec<Vec<f32>> {
        stack
            .conv_weights()
            .into_iter()
            .map(|w| w.into_data().convert::<f32>().to_vec().unwrap())
            .collect()
    }

    #[test]
    fn test_total_steps_stops_mid_epoch() {
        let data_dir = tempfile::tempdir().unwrap();
        let model_dir = tempfile::tempdir().unwrap();
        // 12 images, batch 2: six batches per epoch, more than total_steps.
        let dataset = test_dataset(12, data_dir.path());

        let mut trainer = make_trainer(test_config(5, 3), model_dir.path());
        trainer.fit(dataset).unwrap();

        // Exactly five optimizer updates, stopped before the epoch finished.
        assert_eq!(trainer.state().step, 5);
        assert_eq!(trainer.state().epoch, 0);
    }

    #[test]
    fn test_full_epoch_advances_counters_and_snapshots() {
        let data_dir = tempfile::tempdir().unwrap();
        let model_dir = tempfile::tempdir().unwrap();
        let dataset = test_dataset(4, data_dir.path());

        let mut trainer = make_trainer(test_config(-1, 1), model_dir.path());
        trainer.fit(dataset).unwrap();

        assert_eq!(trainer.state().epoch, 1);
        assert_eq!(trainer.state().step, 2);
        assert!(model_dir.path().join("denoiser.mpk").is_file());
        assert!(model_dir.path().join("config.json").is_file());
        assert!(model_dir.path().join("events.jsonl").is_file());
    }

    #[test]
    fn test_checkpoint_resume_restores_step_and_parameters() {
        let data_dir = tempfile::tempdir().unwrap();
        let model_dir = tempfile::tempdir().unwrap();
        let dataset = test_dataset(12, data_dir.path());

        let mut first = make_trainer(test_config(3, 3), model_dir.path());
        first.fit(dataset.clone()).unwrap();
        assert_eq!(first.state().step, 3);
        let trained = stack_weights(&first.model.stack);

        // A fresh trainer over the same directory resumes from the snapshot.
        let resumed = make_trainer(test_config(3, 3), model_dir.path());
        assert_eq!(resumed.state().step, 3);
        assert_eq!(stack_weights(&resumed.model.stack), trained);

        // Identical parameters produce bit-identical forward passes, so the
        // next step's gradients match as well.
        let device = Default::default();
        let probe = Tensor::<TestAutodiff, 4>::random(
            [1, 1, 8, 8],
            burn::tensor::Distribution::Uniform(-0.5, 0.5),
            &device,
        );
        let a = first
            .model
            .forward(probe.clone())
            .unwrap()
            .inner()
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .unwrap();
        let b = resumed
            .model
            .forward(probe)
            .unwrap()
            .inner()
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_training_updates_parameters() {
        let data_dir = tempfile::tempdir().unwrap();
        let model_dir = tempfile::tempdir().unwrap();
        let dataset = test_dataset(4, data_dir.path());

        let mut trainer = make_trainer(test_config(2, 1), model_dir.path());
        let before = stack_weights(&trainer.model.stack);
        trainer.fit(dataset).unwrap();
        let after = stack_weights(&trainer.model.stack);
        assert_ne!(before, after);
    }

    #[test]
    fn test_step_pruning_trigger_zeroes_weights() {
        let data_dir = tempfile::tempdir().unwrap();
        let model_dir = tempfile::tempdir().unwrap();
        let dataset = test_dataset(4, data_dir.path());

        let mut config = test_config(2, 1);
        config.train.prune = crate::config::PruneConfig {
            strategies: vec![crate::config::PruneStrategyConfig {
                strategy: "magnitude_percentile".to_string(),
                threshold: 0.0,
                fraction: 0.5,
                seed: 0,
            }],
            start_epoch: 0,
            steps: 1,
        };

        let mut trainer = make_trainer(config, model_dir.path());
        trainer.fit(dataset).unwrap();

        let weights = stack_weights(&trainer.model.stack);
        let zeros: usize = weights
            .iter()
            .flat_map(|w| w.iter())
            .filter(|&&v| v == 0.0)
            .count();
        assert!(zeros > 0, "pruning trigger never fired");
    }
}
