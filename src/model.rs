pub mod discriminator;
pub mod generator;
mod layers;

use burn::{module::Module, optim::AdamConfig, prelude::*};

use crate::{
    error::Error,
    model::{
        discriminator::{Discriminator, DiscriminatorConfig},
        generator::{Generator, GeneratorConfig, MIN_INPUT_SIZE},
    },
};

/// Run-wide hyperparameters. Built once, then only read.
#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = 256)]
    pub height: usize,
    #[config(default = 256)]
    pub width: usize,
    #[config(default = 3)]
    pub channels: usize,
    #[config(default = 64)]
    pub base_filters: usize,
    #[config(default = 10.0)]
    pub lambda_cycle: f32,
    #[config(default = 0.5)]
    pub lambda_identity: f32,
    #[config(default = 2e-4)]
    pub learning_rate: f64,
    #[config(default = 0.5)]
    pub beta_1: f32,
}
impl ModelConfig {
    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig::new()
            .with_channels(self.channels)
            .with_base_filters(self.base_filters)
    }

    pub fn discriminator_config(&self) -> DiscriminatorConfig {
        DiscriminatorConfig::new()
            .with_channels(self.channels)
            .with_base_filters(self.base_filters)
    }

    /// Rejects settings the networks cannot be built or run with. Every
    /// entry point calls this before allocating a model.
    pub fn validate(&self) -> crate::Result<()> {
        let invalid = |reason: String| Err(Error::InvalidConfig(reason));

        for (name, side) in [("height", self.height), ("width", self.width)] {
            if side == 0 || side % MIN_INPUT_SIZE != 0 {
                return invalid(format!(
                    "{name} must be a positive multiple of {MIN_INPUT_SIZE}, got {side}"
                ));
            }
        }
        if self.channels == 0 || self.base_filters == 0 {
            return invalid("channels and base_filters must be positive".to_owned());
        }
        if self.learning_rate.is_nan() || self.learning_rate <= 0.0 {
            return invalid(format!("learning_rate must be positive, got {}", self.learning_rate));
        }

        Ok(())
    }

    /// Adam as configured for all four networks.
    pub fn optimizer(&self) -> AdamConfig {
        AdamConfig::new()
            .with_beta_1(self.beta_1)
            .with_epsilon(1e-7)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> CycleGanModel<B> {
        let generator_config = self.generator_config();
        let discriminator_config = self.discriminator_config();

        CycleGanModel {
            gen_g: generator_config.init(device),
            gen_f: generator_config.init(device),
            disc_x: discriminator_config.init(device),
            disc_y: discriminator_config.init(device),
        }
    }
}

/// The four networks of a CycleGAN; also the unit written to checkpoints.
#[derive(Module, Debug)]
pub struct CycleGanModel<B: Backend> {
    /// G: photo (X) -> painting (Y)
    pub gen_g: Generator<B>,
    /// F: painting (Y) -> photo (X)
    pub gen_f: Generator<B>,
    /// Judges photos.
    pub disc_x: Discriminator<B>,
    /// Judges paintings.
    pub disc_y: Discriminator<B>,
}
