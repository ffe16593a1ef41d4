//! Command-line entry point: train a denoiser or run one on an image.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use blind_denoise::backend::{default_device, TrainingBackend};
use blind_denoise::config::Config;
use blind_denoise::dataset::ImageFolderDataset;
use blind_denoise::model::assembler::MultiscaleDenoiser;
use blind_denoise::training::trainer::{build_optimizer, Trainer};
use blind_denoise::utils::logging::{init_logging, LogConfig};
use blind_denoise::Predictor;

/// Multi-scale bias-free blind image denoiser.
#[derive(Parser, Debug)]
#[command(name = "blind-denoise")]
#[command(version, about = "Train and run a multi-scale bias-free denoiser", long_about = None)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train a denoiser from a JSON configuration.
    Train {
        /// Path to the configuration file.
        #[arg(short, long)]
        config: PathBuf,

        /// Directory for checkpoints, snapshots and the event stream.
        #[arg(short, long, default_value = "output/model")]
        model_dir: PathBuf,
    },

    /// Denoise one image with an exported artifact.
    Denoise {
        /// Exported artifact directory.
        #[arg(short, long)]
        artifact: PathBuf,

        /// Input image path.
        #[arg(short, long)]
        input: PathBuf,

        /// Output image path.
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    };
    init_logging(&log_config).map_err(|e| anyhow::anyhow!(e))?;

    match cli.command {
        Commands::Train { config, model_dir } => train(&config, &model_dir),
        Commands::Denoise {
            artifact,
            input,
            output,
        } => denoise(&artifact, &input, &output),
    }
}

fn train(config_path: &PathBuf, model_dir: &PathBuf) -> Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("loading configuration from '{}'", config_path.display()))?;
    config.validate().context("validating configuration")?;

    let device = default_device();
    info!("backend: {}", blind_denoise::backend::backend_name());

    let dataset = ImageFolderDataset::scan(&config.dataset, config.model.channels)?;
    let model = MultiscaleDenoiser::<TrainingBackend>::build(&config.model, &device)?;
    let optimizer = build_optimizer::<TrainingBackend>(&config.train.optimizer);

    let mut trainer = Trainer::new(config, model, optimizer, model_dir, device)?;
    trainer.fit(dataset)?;
    Ok(())
}

fn denoise(artifact: &PathBuf, input: &PathBuf, output: &PathBuf) -> Result<()> {
    use blind_denoise::backend::DefaultBackend;
    use burn::tensor::{Int, Tensor, TensorData};
    use image::GenericImageView;

    let device = default_device();
    let predictor = Predictor::<DefaultBackend>::from_artifact(artifact, &device)?;

    let img = image::ImageReader::open(input)
        .with_context(|| format!("opening '{}'", input.display()))?
        .decode()
        .with_context(|| format!("decoding '{}'", input.display()))?;
    let (width, height) = (img.width() as usize, img.height() as usize);

    let channels = predictor.channels();
    let mut pixels = vec![0i64; channels * height * width];
    match channels {
        1 => {
            let gray = img.to_luma8();
            for (x, y, pixel) in gray.enumerate_pixels() {
                pixels[y as usize * width + x as usize] = pixel[0] as i64;
            }
        }
        _ => {
            let rgb = img.to_rgb8();
            for (x, y, pixel) in rgb.enumerate_pixels() {
                for c in 0..3 {
                    pixels[c * height * width + y as usize * width + x as usize] =
                        pixel[c] as i64;
                }
            }
        }
    }

    let tensor = Tensor::<DefaultBackend, 4, Int>::from_data(
        TensorData::new(pixels, [1, channels, height, width]),
        &device,
    );
    let denoised = predictor.denoise_u8(tensor)?;

    let values = denoised
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| anyhow::anyhow!("reading denoised tensor: {:?}", e))?;

    match channels {
        1 => {
            let img = image::GrayImage::from_fn(width as u32, height as u32, |x, y| {
                image::Luma([values[y as usize * width + x as usize].clamp(0, 255) as u8])
            });
            img.save(output)?;
        }
        _ => {
            let img = image::RgbImage::from_fn(width as u32, height as u32, |x, y| {
                let at = |c: usize| {
                    values[c * height * width + y as usize * width + x as usize].clamp(0, 255)
                        as u8
                };
                image::Rgb([at(0), at(1), at(2)])
            });
            img.save(output)?;
        }
    }

    info!("denoised image written to '{}'", output.display());
    Ok(())
}
