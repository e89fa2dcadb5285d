use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use monet_gan::{
    data::SourceFormat,
    model::ModelConfig,
    server,
    training::{train, TrainingConfig},
};

#[cfg(not(feature = "wgpu"))]
mod backend {
    pub type MyBackend = burn::backend::NdArray<f32>;
    pub const NAME: &str = "ndarray";
}
#[cfg(feature = "wgpu")]
mod backend {
    pub type MyBackend = burn::backend::Wgpu<f32>;
    pub const NAME: &str = "wgpu";
}

type MyBackend = backend::MyBackend;
type MyAutodiffBackend = burn::backend::Autodiff<MyBackend>;

#[derive(Parser)]
#[command(name = "monet-gan")]
#[command(about = "Photo to Monet style transfer with a CycleGAN", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log filter, e.g. `info` or `monet_gan=debug`
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Train both generators and discriminators
    Train {
        /// Directory holding `data/`
        #[arg(long, default_value = ".")]
        base_dir: PathBuf,

        #[arg(long, default_value = "artifacts")]
        artifact_dir: PathBuf,

        #[arg(long, default_value_t = 4)]
        batch_size: usize,

        #[arg(long, default_value_t = 100)]
        epochs: usize,

        #[arg(long, value_enum, default_value_t = SourceFormat::Tfrecord)]
        format: SourceFormat,

        /// Continue a previous run from its exported model and optimizer state
        #[arg(long)]
        resume: bool,
    },

    /// Serve the trained photo-to-painting generator over HTTP
    Serve {
        #[arg(long, default_value = "artifacts")]
        artifact_dir: PathBuf,

        #[arg(long, default_value = "0.0.0.0:8000")]
        addr: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log_level).context("invalid --log-level")?)
        .init();

    let device = Default::default();
    info!("Using the {} backend", backend::NAME);

    match cli.command {
        Commands::Train {
            base_dir,
            artifact_dir,
            batch_size,
            epochs,
            format,
            resume,
        } => {
            let config = TrainingConfig::new(ModelConfig::new())
                .with_format(format)
                .with_batch_size(batch_size)
                .with_num_epochs(epochs);

            train::<MyAutodiffBackend>(&base_dir, &artifact_dir, config, &device, resume)
                .context("training failed")?;
        }
        Commands::Serve { artifact_dir, addr } => {
            server::serve::<MyBackend>(&artifact_dir, &addr, &device)
                .context("inference service failed")?;
        }
    }

    Ok(())
}
