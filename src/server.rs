pub mod multipart;
mod routes;

use burn::{
    config::Config,
    module::Module,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::backend::Backend,
};
use std::path::Path;
use tiny_http::Server;
use tracing::info;

use crate::{
    error::{Error, Result},
    model::{generator::Generator, ModelConfig},
    training::{GENERATOR_FILE, MODEL_CONFIG_FILE},
    utils::{encode_jpeg, image_to_tensor, prepare_image, tensor_to_image},
};

pub use routes::{route, Reply};

/// Encoded image in, JPEG painting out.
pub trait StyleTransfer {
    fn transfer(&self, image: &[u8]) -> Result<Vec<u8>>;
}

/// G loaded from a training run's exported artifacts.
pub struct MonetStylizer<B: Backend> {
    config: ModelConfig,
    generator: Generator<B>,
    device: B::Device,
}
impl<B: Backend> MonetStylizer<B> {
    pub fn new(config: ModelConfig, generator: Generator<B>, device: B::Device) -> Self {
        Self {
            config,
            generator,
            device,
        }
    }

    pub fn load(artifact_dir: &Path, device: &B::Device) -> Result<Self> {
        let config = ModelConfig::load(artifact_dir.join(MODEL_CONFIG_FILE))?;
        config.validate()?;
        let generator = config.generator_config().init::<B>(device).load_file(
            artifact_dir.join(GENERATOR_FILE),
            &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
            device,
        )?;

        Ok(Self::new(config, generator, device.clone()))
    }
}
impl<B: Backend> StyleTransfer for MonetStylizer<B> {
    fn transfer(&self, image: &[u8]) -> Result<Vec<u8>> {
        let image = image::load_from_memory(image)?;
        let photo = prepare_image(&image, self.config.height, self.config.width);

        let input = image_to_tensor::<B>(&photo, &self.device).unsqueeze_dim(0);
        let painting = self.generator.forward(input).squeeze::<3>(0);

        encode_jpeg(&tensor_to_image(painting))
    }
}

/// Serves `stylizer` on `addr`, one request at a time.
pub fn serve_with(stylizer: &dyn StyleTransfer, addr: &str) -> Result<()> {
    let server = Server::http(addr).map_err(|err| Error::Bind {
        addr: addr.to_owned(),
        reason: err.to_string(),
    })?;
    info!("Listening on http://{addr}");

    for request in server.incoming_requests() {
        routes::dispatch(request, stylizer);
    }

    Ok(())
}

/// Loads the exported generator from `artifact_dir` and serves it. Any
/// artifact problem aborts before the socket is opened.
pub fn serve<B: Backend>(artifact_dir: &Path, addr: &str, device: &B::Device) -> Result<()> {
    let stylizer = MonetStylizer::<B>::load(artifact_dir, device)?;
    info!("Loaded generator from {}", artifact_dir.display());

    serve_with(&stylizer, addr)
}
