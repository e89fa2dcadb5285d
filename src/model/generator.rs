use burn::{
    module::Module,
    nn::conv::{ConvTranspose2d, ConvTranspose2dConfig},
    prelude::*,
};

use crate::model::layers::{DownsampleBlock, UpsampleBlock, KERNEL_SIZE, WEIGHT_INIT};

/// Encoder widths as multiples of `base_filters`.
const ENCODER_WIDTHS: [usize; 8] = [1, 2, 4, 8, 8, 8, 8, 8];
/// Decoder widths as multiples of `base_filters`; the first three stages use dropout.
const DECODER_WIDTHS: [usize; 7] = [8, 8, 8, 8, 4, 2, 1];
const DECODER_DROPOUT_STAGES: usize = 3;

/// Smallest square input the encoder can reduce to 1x1.
pub const MIN_INPUT_SIZE: usize = 1 << ENCODER_WIDTHS.len();

/// U-Net generator: 8 downsampling stages, 7 upsampling stages each followed
/// by a skip concatenation, and a final transposed conv with tanh.
#[derive(Module, Debug)]
pub struct Generator<B: Backend> {
    encoder: Vec<DownsampleBlock<B>>,
    decoder: Vec<UpsampleBlock<B>>,
    out_layer: ConvTranspose2d<B>,
}
impl<B: Backend> Generator<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut skips = Vec::with_capacity(self.encoder.len());
        let mut output = input;
        for stage in &self.encoder {
            output = stage.forward(output);
            skips.push(output.clone());
        }

        // The bottleneck is already `output`; it never doubles as a skip.
        skips.pop();

        for (stage, skip) in self.decoder.iter().zip(skips.into_iter().rev()) {
            output = stage.forward(output);
            output = Tensor::cat(vec![output, skip], 1);
        }

        burn::tensor::activation::tanh(self.out_layer.forward(output))
    }

    #[cfg(test)]
    pub(crate) fn out_weight(&self) -> Tensor<B, 4> {
        self.out_layer.weight.val()
    }

    /// Generator whose output is zero (mid-gray) for every input.
    #[cfg(test)]
    pub(crate) fn with_zero_output(mut self) -> Self {
        use burn::module::Param;

        self.out_layer.weight = Param::from_tensor(self.out_layer.weight.val().zeros_like());
        self.out_layer.bias = self
            .out_layer
            .bias
            .map(|bias| Param::from_tensor(bias.val().zeros_like()));
        self
    }
}

#[derive(Config, Debug)]
pub struct GeneratorConfig {
    #[config(default = 3)]
    pub channels: usize,
    #[config(default = 64)]
    pub base_filters: usize,
}
impl GeneratorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        let mut in_channels = self.channels;
        let encoder = ENCODER_WIDTHS
            .iter()
            .enumerate()
            .map(|(depth, width)| {
                let out_channels = width * self.base_filters;
                let block = DownsampleBlock::new([in_channels, out_channels], depth > 0, device);
                in_channels = out_channels;
                block
            })
            .collect::<Vec<_>>();

        // Skip widths in the order the decoder consumes them: deepest-but-one first.
        let skip_widths = ENCODER_WIDTHS[..ENCODER_WIDTHS.len() - 1]
            .iter()
            .rev()
            .map(|width| width * self.base_filters);

        let decoder = DECODER_WIDTHS
            .iter()
            .zip(skip_widths)
            .enumerate()
            .map(|(depth, (width, skip_channels))| {
                let out_channels = width * self.base_filters;
                let block = UpsampleBlock::new(
                    [in_channels, out_channels],
                    depth < DECODER_DROPOUT_STAGES,
                    device,
                );
                in_channels = out_channels + skip_channels;
                block
            })
            .collect::<Vec<_>>();

        let out_layer = ConvTranspose2dConfig::new(
            [in_channels, self.channels],
            [KERNEL_SIZE, KERNEL_SIZE],
        )
        .with_stride([2, 2])
        .with_padding([1, 1])
        .with_initializer(WEIGHT_INIT)
        .init(device);

        Generator {
            encoder,
            decoder,
            out_layer,
        }
    }
}
