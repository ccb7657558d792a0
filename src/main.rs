mod model;
mod utils;

use anyhow::{Result, anyhow, bail};
use burn::{backend::Autodiff, prelude::*};
use clap::Parser;
use std::path::{Path, PathBuf};

use model::training::{TrainingConfig, train};

#[cfg(feature = "cuda")]
type MyBackend = burn::backend::Cuda<f32, i32>;
#[cfg(not(feature = "cuda"))]
type MyBackend = burn::backend::NdArray<f32>;

type MyAutodiffBackend = Autodiff<MyBackend>;

/// Train a GAN on CelebA and append the evaluation loss at the stop epoch to result.txt.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Seed for parameter initialization, shuffling and the noise counter
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Directory holding the CelebA images
    #[arg(long = "img_path", default_value = "./celeba")]
    img_path: String,

    /// Epoch whose evaluation loss is reported before stopping
    #[arg(long = "stop_epoch", default_value_t = 10)]
    stop_epoch: usize,

    /// Directory that receives result.txt
    #[arg(long = "output_path", default_value = ".")]
    output_path: String,

    /// JSON training config overriding the built-in hyperparameters
    #[arg(long)]
    config: Option<PathBuf>,

    /// Name written in front of the loss (defaults to the executable name)
    #[arg(long)]
    identifier: Option<String>,
}

impl Args {
    fn validate(&self) -> Result<()> {
        if self.img_path.is_empty() {
            bail!("image path should be specified");
        }
        if self.output_path.is_empty() {
            bail!("output path should be specified");
        }
        Ok(())
    }

    fn training_config(&self) -> Result<TrainingConfig> {
        let config = match &self.config {
            Some(path) => TrainingConfig::load(path)
                .map_err(|err| anyhow!("failed to load config {}: {err:?}", path.display()))?,
            None => TrainingConfig::celeba(),
        };
        Ok(config
            .with_seed(self.seed)
            .with_stop_epoch(self.stop_epoch))
    }

    fn identifier(&self) -> String {
        self.identifier.clone().unwrap_or_else(|| {
            std::env::current_exe()
                .ok()
                .and_then(|exe| exe.file_stem().map(|s| s.to_string_lossy().into_owned()))
                .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string())
        })
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("celeba_gan=info".parse()?),
        )
        .init();

    let args = Args::parse();
    args.validate()?;
    let config = args.training_config()?;

    let device = <MyAutodiffBackend as Backend>::Device::default();
    tracing::info!(
        "training on {:?} with seed {}, stopping at epoch {}",
        device,
        config.seed,
        config.stop_epoch
    );

    let outcome = train::<MyAutodiffBackend>(
        Path::new(&args.img_path),
        Path::new(&args.output_path),
        &args.identifier(),
        config,
        device,
    )?;
    match (outcome.eval_loss, outcome.result_file) {
        (Some(loss), Some(file)) => tracing::info!(
            "stopped after {} epochs, eval loss {} recorded in {}",
            outcome.epochs_run,
            loss,
            file.display()
        ),
        _ => tracing::info!("finished {} epochs", outcome.epochs_run),
    }
    Ok(())
}
