//! Export a trained model as a self-contained inference artifact.
//!
//! Reads the as-run configuration and the latest parameter snapshot from a
//! model directory and writes an artifact directory consumable by
//! `Predictor::from_artifact`: the parameter record, the configuration, and
//! a manifest with the iteration count.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use blind_denoise::backend::{default_device, DefaultBackend};
use blind_denoise::config::Config;
use blind_denoise::inference::ArtifactManifest;
use blind_denoise::model::assembler::MultiscaleDenoiser;
use blind_denoise::utils::logging::init_default_logging;

#[derive(Parser, Debug)]
#[command(name = "export")]
#[command(about = "Export a trained denoiser for inference", long_about = None)]
struct Args {
    /// Model directory produced by training.
    #[arg(short, long)]
    model_dir: PathBuf,

    /// Output artifact directory.
    #[arg(short, long)]
    output: PathBuf,

    /// Denoiser passes the artifact should run per image.
    #[arg(short, long, default_value = "1")]
    iterations: u64,
}

fn main() -> Result<()> {
    init_default_logging().map_err(|e| anyhow::anyhow!(e))?;
    let args = Args::parse();

    let config = Config::load(&args.model_dir.join("config.json"))
        .with_context(|| format!("loading config from '{}'", args.model_dir.display()))?;

    let snapshot = args.model_dir.join("denoiser");
    if !args.model_dir.join("denoiser.mpk").is_file() {
        anyhow::bail!(
            "no parameter snapshot under '{}' (train first)",
            args.model_dir.display()
        );
    }

    let device = default_device();
    let model = MultiscaleDenoiser::<DefaultBackend>::build(&config.model, &device)?
        .load_snapshot(&snapshot, &device)?;

    std::fs::create_dir_all(&args.output)?;
    model.save_snapshot(&args.output.join("denoiser"))?;
    config.save(&args.output.join("config.json"))?;
    std::fs::write(
        args.output.join("artifact.json"),
        serde_json::to_string_pretty(&ArtifactManifest {
            iterations: args.iterations,
            channels: config.model.channels,
        })?,
    )?;

    info!("artifact written to '{}'", args.output.display());
    Ok(())
}
