use burn::{
    config::Config,
    data::dataloader::DataLoaderBuilder,
    module::{AutodiffModule, Module},
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        Tensor,
    },
};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    thread::JoinHandle,
    time::Instant,
};
use tracing::{info, warn};

use crate::{
    cyclegan::CycleGan,
    data::{self, EncodedImage, SourceFormat, UnpairedBatcher, UnpairedDataset},
    error::Error,
    metrics::StepMetrics,
    model::{CycleGanModelRecord, ModelConfig},
    utils::{image_to_tensor, save_mosaic, tensor_to_image},
};

pub const CONFIG_FILE: &str = "config.json";
pub const MODEL_CONFIG_FILE: &str = "model_config.json";
/// All four networks; also what `--resume` restores.
pub const MODEL_FILE: &str = "cyclegan";
/// G alone, as loaded by the server.
pub const GENERATOR_FILE: &str = "generator";
/// Epoch counter and best G loss, read back by `--resume`.
pub const STATE_FILE: &str = "train_state.json";
/// Adam state of the four networks.
pub const OPTIMIZER_DIR: &str = "optimizers";

type ArtifactRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

#[derive(Config)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    #[config(default = "SourceFormat::Tfrecord")]
    pub format: SourceFormat,

    /// Epochs to run in this invocation; a resumed run continues numbering.
    #[config(default = 100)]
    pub num_epochs: usize,
    #[config(default = 4)]
    pub batch_size: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
    /// Photos translated into the per-epoch sample mosaic.
    #[config(default = 3)]
    pub sample_count: usize,
    /// Steps between two progress lines.
    #[config(default = 50)]
    pub log_interval: usize,
}

/// One line of `logs/metrics.jsonl`.
#[derive(Serialize)]
struct EpochRecord {
    epoch: usize,
    steps: usize,
    seconds: f32,
    #[serde(flatten)]
    means: StepMetrics,
}

/// Where a run stopped.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq)]
pub struct TrainState {
    /// Last completed epoch.
    pub epoch: usize,
    pub best_gen_loss: Option<f32>,
}
impl TrainState {
    pub fn load(path: &Path) -> crate::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(|err| Error::Io(err.into()))
    }

    fn save(&self, path: &Path) -> crate::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)?;

        Ok(())
    }
}

/// Writes improved checkpoints off the training thread, one at a time.
#[derive(Default)]
struct CheckpointWriter {
    pending: Option<JoinHandle<crate::Result<()>>>,
    best_gen_loss: Option<f32>,
}
impl CheckpointWriter {
    fn improves(&self, gen_loss: f32) -> bool {
        gen_loss.is_finite() && self.best_gen_loss.is_none_or(|best| gen_loss < best)
    }

    fn write<B: Backend>(
        &mut self,
        record: CycleGanModelRecord<B>,
        path: PathBuf,
    ) -> crate::Result<()> {
        self.join()?;
        self.pending = Some(std::thread::spawn(move || {
            ArtifactRecorder::new().record(record, path.clone())?;
            info!("Checkpoint written to {}", path.display());
            Ok(())
        }));

        Ok(())
    }

    fn join(&mut self) -> crate::Result<()> {
        match self.pending.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                Err(Error::Io(std::io::Error::other("checkpoint thread panicked")))
            }),
            None => Ok(()),
        }
    }
}

fn create_artifact_dirs(artifact_dir: &Path) -> crate::Result<()> {
    for dir in ["checkpoints", "samples", "logs", OPTIMIZER_DIR] {
        std::fs::create_dir_all(artifact_dir.join(dir))?;
    }

    Ok(())
}

/// Translates the fixed sample photos and saves them next to their paintings.
fn save_sample<B: AutodiffBackend>(
    cyclegan: &CycleGan<B>,
    samples: &[EncodedImage],
    path: &Path,
    device: &B::Device,
) -> crate::Result<()> {
    if samples.is_empty() {
        return Ok(());
    }
    let config = cyclegan.config();

    let photos = samples
        .iter()
        .map(|image| image.decode(config.height, config.width))
        .collect::<crate::Result<Vec<RgbImage>>>()?;
    let batch = photos
        .iter()
        .map(|photo| image_to_tensor::<B::InnerBackend>(photo, device).unsqueeze_dim(0))
        .collect::<Vec<_>>();

    let paintings = cyclegan.translate(Tensor::cat(batch, 0));
    let pairs = photos
        .into_iter()
        .zip(paintings.iter_dim(0))
        .map(|(photo, painting)| (photo, tensor_to_image(painting.squeeze::<3>(0))))
        .collect::<Vec<_>>();

    save_mosaic(&pairs, path)
}

fn append_metrics(log: &mut File, record: &EpochRecord) -> crate::Result<()> {
    let line = serde_json::to_string(record).map_err(std::io::Error::other)?;
    writeln!(log, "{line}")?;

    Ok(())
}

/// Restores networks, Adam state and the epoch counter of a previous run.
/// Pieces that are missing are started fresh.
fn restore<B: AutodiffBackend>(
    artifact_dir: &Path,
    config: &ModelConfig,
    recorder: &ArtifactRecorder,
    device: &B::Device,
) -> crate::Result<(CycleGan<B>, TrainState)> {
    let model_path = artifact_dir.join(format!("{MODEL_FILE}.mpk"));
    if !model_path.exists() {
        warn!("No model at {}, starting a new run", model_path.display());
        return Ok((CycleGan::new(config.clone(), device), TrainState::default()));
    }
    info!("Resuming from {}", model_path.display());
    let model = config.init::<B>(device).load_file(model_path, recorder, device)?;
    let mut cyclegan = CycleGan::with_model(config.clone(), model, device);

    let optimizer_dir = artifact_dir.join(OPTIMIZER_DIR);
    if optimizer_dir.join("gen_g.mpk").exists() {
        cyclegan = cyclegan.load_optimizers(&optimizer_dir, recorder, device)?;
    } else {
        warn!("No optimizer state in {}, Adam restarts", optimizer_dir.display());
    }

    let state_path = artifact_dir.join(STATE_FILE);
    let state = if state_path.exists() {
        TrainState::load(&state_path)?
    } else {
        warn!("No {STATE_FILE}, epoch numbering restarts");
        TrainState::default()
    };
    info!("Continuing after epoch {}", state.epoch);

    Ok((cyclegan, state))
}

/// Trains a CycleGAN on `<base_dir>/data` and writes every artifact under
/// `artifact_dir`.
pub fn train<B: AutodiffBackend>(
    base_dir: &Path,
    artifact_dir: &Path,
    config: TrainingConfig,
    device: &B::Device,
    resume: bool,
) -> crate::Result<()> {
    config.model.validate()?;
    create_artifact_dirs(artifact_dir)?;
    config.save(artifact_dir.join(CONFIG_FILE))?;
    B::seed(config.seed);

    // data
    let files = data::discover(&base_dir.join("data"), config.format)?;
    let photos = Arc::new(data::load_domain(&files.photos, config.format)?);
    let paintings = Arc::new(data::load_domain(&files.paintings, config.format)?);
    info!(
        "Loaded {} photos from {} files and {} paintings from {} files",
        photos.len(),
        files.photos.len(),
        paintings.len(),
        files.paintings.len()
    );
    let samples = photos[..config.sample_count.min(photos.len())].to_vec();
    let batcher = UnpairedBatcher::new(config.model.height, config.model.width);

    // model
    let recorder = ArtifactRecorder::new();
    let (mut cyclegan, mut state) = if resume {
        restore::<B>(artifact_dir, &config.model, &recorder, device)?
    } else {
        (CycleGan::new(config.model.clone(), device), TrainState::default())
    };

    let mut metrics_log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(artifact_dir.join("logs").join("metrics.jsonl"))?;
    let mut checkpoints = CheckpointWriter {
        pending: None,
        best_gen_loss: state.best_gen_loss,
    };

    let first_epoch = state.epoch + 1;
    let last_epoch = state.epoch + config.num_epochs;
    for epoch in first_epoch..=last_epoch {
        let start = Instant::now();
        let dataset = UnpairedDataset::shuffled(
            photos.clone(),
            paintings.clone(),
            config.batch_size,
            config.seed + epoch as u64,
        );
        let dataloader = DataLoaderBuilder::<B, _, _>::new(batcher.clone())
            .batch_size(config.batch_size)
            .num_workers(config.num_workers)
            .set_device(device.clone())
            .build(dataset);
        let num_batches = dataloader.num_items() / config.batch_size;

        cyclegan.reset_trackers();
        let mut running = StepMetrics::default();
        let mut steps = 0;
        for (iteration, batch) in dataloader.iter().enumerate() {
            let output = cyclegan.train_step(batch.photos, batch.paintings)?;
            if !output.losses.is_finite() {
                warn!("Non-finite loss at epoch {epoch}, step {iteration}: {}", output.losses);
            }
            running = output.running;
            steps += 1;

            if (iteration + 1) % config.log_interval.max(1) == 0 {
                info!(
                    "[Epoch: {:3}/{:3}, Batch: {:4}/{:4}]{}",
                    epoch,
                    last_epoch,
                    iteration + 1,
                    num_batches,
                    running
                );
            }
        }

        let seconds = start.elapsed().as_secs_f32();
        info!("Epoch {epoch} done in {seconds:.1}s: {running}");
        append_metrics(
            &mut metrics_log,
            &EpochRecord {
                epoch,
                steps,
                seconds,
                means: running,
            },
        )?;

        let sample_path = artifact_dir
            .join("samples")
            .join(format!("epoch.{epoch:03}.png"));
        save_sample(&cyclegan, &samples, &sample_path, device)?;

        if steps > 0 && checkpoints.improves(running.gen_g_loss) {
            checkpoints.best_gen_loss = Some(running.gen_g_loss);
            let path = artifact_dir
                .join("checkpoints")
                .join(format!("model.{epoch:03}"));
            checkpoints.write(cyclegan.model().valid().into_record(), path)?;
        }
        state.epoch = epoch;
    }
    checkpoints.join()?;
    state.best_gen_loss = checkpoints.best_gen_loss;

    export(artifact_dir, &config.model, cyclegan, state, &recorder)
}

/// The run's final artifacts: all four networks with their Adam state, G
/// alone, the model config and the epoch counter.
fn export<B: AutodiffBackend>(
    artifact_dir: &Path,
    config: &ModelConfig,
    cyclegan: CycleGan<B>,
    state: TrainState,
    recorder: &ArtifactRecorder,
) -> crate::Result<()> {
    cyclegan.save_optimizers(&artifact_dir.join(OPTIMIZER_DIR), recorder)?;
    state.save(&artifact_dir.join(STATE_FILE))?;

    let model = cyclegan.into_model().valid();
    model
        .gen_g
        .clone()
        .save_file(artifact_dir.join(GENERATOR_FILE), recorder)?;
    model.save_file(artifact_dir.join(MODEL_FILE), recorder)?;
    config.save(artifact_dir.join(MODEL_CONFIG_FILE))?;
    info!("Model exported to {}", artifact_dir.display());

    Ok(())
}
