//! Image-folder dataset and tensor batcher.
//!
//! Scans a directory tree for images, loads them lazily, resizes to the
//! configured patch size and packs them CHW in the raw value range (no
//! normalization here; that belongs to the model).

use std::path::PathBuf;
use std::sync::Arc;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use image::imageops::FilterType;
use image::ImageReader;
use indicatif::ProgressBar;
use tracing::info;
use walkdir::WalkDir;

use crate::config::DatasetConfig;
use crate::utils::error::{DenoiseError, Result};

const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

/// A single image ready for batching: CHW floats in the raw value range.
#[derive(Clone, Debug)]
pub struct ImageItem {
    pub pixels: Vec<f32>,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl ImageItem {
    /// Load and preprocess one image file.
    pub fn from_path(
        path: &PathBuf,
        channels: usize,
        height: usize,
        width: usize,
    ) -> Result<Self> {
        let img = ImageReader::open(path)
            .map_err(|e| DenoiseError::ImageLoad(path.clone(), e.to_string()))?
            .decode()
            .map_err(|e| DenoiseError::ImageLoad(path.clone(), e.to_string()))?
            .resize_exact(width as u32, height as u32, FilterType::Triangle);

        let mut pixels = vec![0.0f32; channels * height * width];
        match channels {
            1 => {
                let gray = img.to_luma8();
                for y in 0..height {
                    for x in 0..width {
                        pixels[y * width + x] = gray.get_pixel(x as u32, y as u32)[0] as f32;
                    }
                }
            }
            3 => {
                let rgb = img.to_rgb8();
                for y in 0..height {
                    for x in 0..width {
                        let pixel = rgb.get_pixel(x as u32, y as u32);
                        for c in 0..3 {
                            pixels[c * height * width + y * width + x] = pixel[c] as f32;
                        }
                    }
                }
            }
            other => {
                return Err(DenoiseError::Config(format!(
                    "channels must be 1 or 3, got {}",
                    other
                )))
            }
        }

        Ok(Self {
            pixels,
            channels,
            height,
            width,
        })
    }
}

/// Lazily-loading dataset over every image under a directory.
#[derive(Debug, Clone)]
pub struct ImageFolderDataset {
    samples: Vec<PathBuf>,
    channels: usize,
    patch: [usize; 2],
}

impl ImageFolderDataset {
    /// Scan `config.directory` recursively for supported image files.
    pub fn scan(config: &DatasetConfig, channels: usize) -> Result<Arc<Self>> {
        config.validate()?;
        if config.directory.is_empty() {
            return Err(DenoiseError::Config(
                "dataset.directory must not be empty".into(),
            ));
        }

        let bar = ProgressBar::new_spinner().with_message("scanning images");

        let mut samples = Vec::new();
        for entry in WalkDir::new(&config.directory)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let supported = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if supported {
                samples.push(path.to_path_buf());
                bar.inc(1);
            }
        }
        bar.finish_and_clear();

        if samples.is_empty() {
            return Err(DenoiseError::Dataset(format!(
                "no images found under '{}'",
                config.directory
            )));
        }
        samples.sort();

        info!(
            "dataset: {} images under '{}'",
            samples.len(),
            config.directory
        );

        Ok(Arc::new(Self {
            samples,
            channels,
            patch: config.input_shape,
        }))
    }

    /// Build a dataset from an explicit file list (tests, tooling).
    pub fn from_paths(samples: Vec<PathBuf>, channels: usize, patch: [usize; 2]) -> Arc<Self> {
        Arc::new(Self {
            samples,
            channels,
            patch,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn patch(&self) -> [usize; 2] {
        self.patch
    }
}

impl Dataset<ImageItem> for ImageFolderDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        let path = self.samples.get(index)?;
        ImageItem::from_path(path, self.channels, self.patch[0], self.patch[1]).ok()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Packs items into one `[batch, channels, height, width]` tensor.
#[derive(Debug, Clone)]
pub struct ImageBatcher {
    channels: usize,
    height: usize,
    width: usize,
}

impl ImageBatcher {
    pub fn new(channels: usize, patch: [usize; 2]) -> Self {
        Self {
            channels,
            height: patch[0],
            width: patch[1],
        }
    }
}

impl<B: Backend> Batcher<B, ImageItem, Tensor<B, 4>> for ImageBatcher {
    fn batch(&self, items: Vec<ImageItem>, device: &B::Device) -> Tensor<B, 4> {
        let batch_size = items.len();
        let pixels: Vec<f32> = items.iter().flat_map(|item| item.pixels.clone()).collect();
        Tensor::from_data(
            TensorData::new(
                pixels,
                [batch_size, self.channels, self.height, self.width],
            ),
            device,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestBackend = burn::backend::NdArray;

    fn write_test_image(dir: &std::path::Path, name: &str, width: u32, height: u32) -> PathBuf {
        let path = dir.join(name);
        let img = image::RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn test_scan_finds_images_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir_all(&nested).unwrap();
        write_test_image(dir.path(), "a.png", 16, 16);
        write_test_image(&nested, "b.png", 16, 16);
        std::fs::write(dir.path().join("notes.txt"), "not an image").unwrap();

        let config = DatasetConfig {
            directory: dir.path().to_string_lossy().to_string(),
            input_shape: [8, 8],
            ..Default::default()
        };
        let dataset = ImageFolderDataset::scan(&config, 3).unwrap();
        assert_eq!(dataset.len(), 2);
    }

    #[test]
    fn test_empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatasetConfig {
            directory: dir.path().to_string_lossy().to_string(),
            ..Default::default()
        };
        assert!(ImageFolderDataset::scan(&config, 3).is_err());
    }

    #[test]
    fn test_items_resized_and_packed_chw() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_image(dir.path(), "img.png", 32, 24);

        let item = ImageItem::from_path(&path, 3, 8, 8).unwrap();
        assert_eq!(item.pixels.len(), 3 * 8 * 8);
        assert!(item.pixels.iter().all(|&v| (0.0..=255.0).contains(&v)));
    }

    #[test]
    fn test_batcher_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_image(dir.path(), "img.png", 16, 16);
        let items: Vec<_> = (0..4)
            .map(|_| ImageItem::from_path(&path, 1, 8, 8).unwrap())
            .collect();

        let batcher = ImageBatcher::new(1, [8, 8]);
        let device = Default::default();
        let batch: Tensor<TestBackend, 4> = batcher.batch(items, &device);
        assert_eq!(batch.dims(), [4, 1, 8, 8]);
    }
}
