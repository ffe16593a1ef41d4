//! Bounded batch prefetch.
//!
//! One producer thread loads image batches ahead of the training loop
//! through a rendezvous channel with a small fixed capacity. Batches arrive
//! in shuffle order, exactly once each; the only concurrency in the system
//! lives here.

use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;

use burn::data::dataset::Dataset;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::dataset::loader::{ImageFolderDataset, ImageItem};
use crate::dataset::PREFETCH_DEPTH;
use crate::utils::error::{DenoiseError, Result};

/// Iterator over one epoch's batches, loaded ahead by a worker thread.
pub struct BatchPrefetcher {
    receiver: Receiver<Result<Vec<ImageItem>>>,
    handle: Option<JoinHandle<()>>,
}

impl BatchPrefetcher {
    /// Start prefetching one epoch. Indices are shuffled with the given
    /// seed; only full batches are produced.
    pub fn new(dataset: Arc<ImageFolderDataset>, batch_size: usize, shuffle_seed: u64) -> Self {
        let (sender, receiver) = sync_channel(PREFETCH_DEPTH);

        let handle = std::thread::spawn(move || {
            let mut indices: Vec<usize> = (0..dataset.len()).collect();
            let mut rng = ChaCha8Rng::seed_from_u64(shuffle_seed);
            indices.shuffle(&mut rng);

            for chunk in indices.chunks_exact(batch_size) {
                let batch: Result<Vec<ImageItem>> = chunk
                    .iter()
                    .map(|&index| {
                        dataset.get(index).ok_or_else(|| {
                            DenoiseError::Dataset(format!(
                                "failed to load sample {}",
                                index
                            ))
                        })
                    })
                    .collect();

                // The consumer hung up; stop loading.
                if sender.send(batch).is_err() {
                    return;
                }
            }
        });

        Self {
            receiver,
            handle: Some(handle),
        }
    }

    /// Number of full batches one epoch yields.
    pub fn batches_per_epoch(dataset: &ImageFolderDataset, batch_size: usize) -> usize {
        dataset.len() / batch_size
    }
}

impl Iterator for BatchPrefetcher {
    type Item = Result<Vec<ImageItem>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.recv().ok()
    }
}

impl Drop for BatchPrefetcher {
    fn drop(&mut self) {
        // Unblock the producer, then wait for it.
        let (_, dead_receiver) = sync_channel::<Result<Vec<ImageItem>>>(0);
        let _ = std::mem::replace(&mut self.receiver, dead_receiver);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
