use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, LeakyRelu, LeakyReluConfig, PaddingConfig2d,
    },
    prelude::*,
};

use crate::model::layers::{
    batch_norm, detached_statistics, DownsampleBlock, KERNEL_SIZE, WEIGHT_INIT,
};

/// PatchGAN discriminator returning one raw score (logit) per receptive-field patch.
///
/// The zero-padding ahead of both stride-1 convolutions is folded into the
/// convolutions' explicit one-pixel padding.
#[derive(Module, Debug)]
pub struct Discriminator<B: Backend> {
    disc_layer_1: DownsampleBlock<B>,
    disc_layer_2: DownsampleBlock<B>,
    disc_layer_3: DownsampleBlock<B>,
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
    lrelu: LeakyRelu,
    out_layer: Conv2d<B>,
}
impl<B: Backend> Discriminator<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let output = self.disc_layer_1.forward(input);
        let output = self.disc_layer_2.forward(output);
        let output = self.disc_layer_3.forward(output);

        let output = self.conv.forward(output);
        let output = self.norm.forward(output);
        let output = self.lrelu.forward(output);

        self.out_layer.forward(output)
    }

    /// Copy that scores without training: no parameter gradients and batch
    /// norm statistics that do not feed back into `self`.
    pub fn frozen(&self) -> Self {
        let frozen = Self {
            disc_layer_1: self.disc_layer_1.with_detached_statistics(),
            disc_layer_2: self.disc_layer_2.with_detached_statistics(),
            disc_layer_3: self.disc_layer_3.with_detached_statistics(),
            conv: self.conv.clone(),
            norm: detached_statistics(&self.norm),
            lrelu: self.lrelu.clone(),
            out_layer: self.out_layer.clone(),
        };
        frozen.no_grad()
    }

    #[cfg(test)]
    pub(crate) fn out_weight(&self) -> Tensor<B, 4> {
        self.out_layer.weight.val()
    }

    #[cfg(test)]
    pub(crate) fn running_mean(&self) -> Tensor<B, 1> {
        self.norm.running_mean.value()
    }
}

#[derive(Config, Debug)]
pub struct DiscriminatorConfig {
    #[config(default = 3)]
    pub channels: usize,
    #[config(default = 64)]
    pub base_filters: usize,
}
impl DiscriminatorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Discriminator<B> {
        let filters = self.base_filters;

        let disc_layer_1 = DownsampleBlock::new([self.channels, filters], false, device);
        let disc_layer_2 = DownsampleBlock::new([filters, filters * 2], true, device);
        let disc_layer_3 = DownsampleBlock::new([filters * 2, filters * 4], true, device);

        let conv = Conv2dConfig::new([filters * 4, filters * 8], [KERNEL_SIZE, KERNEL_SIZE])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .with_initializer(WEIGHT_INIT)
            .init(device);
        let norm = batch_norm(filters * 8, device);
        let lrelu = LeakyReluConfig::new().with_negative_slope(0.2).init();

        let out_layer = Conv2dConfig::new([filters * 8, 1], [KERNEL_SIZE, KERNEL_SIZE])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_initializer(WEIGHT_INIT)
            .init(device);

        Discriminator {
            disc_layer_1,
            disc_layer_2,
            disc_layer_3,
            conv,
            norm,
            lrelu,
            out_layer,
        }
    }
}

/// Side of the square score map produced for a square input of side `size`,
/// or `None` when the input is too small to leave any patch.
pub fn patch_size(size: usize) -> Option<usize> {
    // three stride-2 stages, then two padded 4x4 stride-1 convs each shrink by one
    (size / 8).checked_sub(2).filter(|side| *side > 0)
}
