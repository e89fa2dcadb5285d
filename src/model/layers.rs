use burn::{
    module::RunningState,
    nn::{
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Initializer, LeakyRelu,
        LeakyReluConfig, PaddingConfig2d, Relu,
    },
    prelude::*,
};

/// Kernel size shared by every strided block.
pub const KERNEL_SIZE: usize = 4;

/// N(0, 0.02) for every conv kernel and every batch-norm scale.
pub const WEIGHT_INIT: Initializer = Initializer::Normal {
    mean: 0.0,
    std: 0.02,
};

/// Weight of the current batch in the running statistics.
pub const NORM_MOMENTUM: f64 = 0.01;
pub const NORM_EPSILON: f64 = 1e-3;

/// Batch norm whose scale (gamma) starts from `WEIGHT_INIT` instead of ones.
pub fn batch_norm<B: Backend>(channels: usize, device: &B::Device) -> BatchNorm<B, 2> {
    let mut norm = BatchNormConfig::new(channels)
        .with_momentum(NORM_MOMENTUM)
        .with_epsilon(NORM_EPSILON)
        .init(device);
    norm.gamma = WEIGHT_INIT.init([channels], device);
    norm
}

/// Same parameters as `norm`, but running statistics of its own: batches it
/// normalizes no longer move the statistics of `norm`.
pub fn detached_statistics<B: Backend>(norm: &BatchNorm<B, 2>) -> BatchNorm<B, 2> {
    let mut copy = norm.clone();
    copy.running_mean = RunningState::new(norm.running_mean.value());
    copy.running_var = RunningState::new(norm.running_var.value());
    copy
}

/// Stride-2 convolution halving the spatial size, "same"-padded for even inputs.
#[derive(Module, Debug)]
pub struct DownsampleBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: Option<BatchNorm<B, 2>>,
    lrelu: LeakyRelu,
}
impl<B: Backend> DownsampleBlock<B> {
    /// `apply_norm` is false for the first layer of a network, which keeps a
    /// bias instead since nothing follows to re-center it.
    pub fn new(channels: [usize; 2], apply_norm: bool, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new(channels, [KERNEL_SIZE, KERNEL_SIZE])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(!apply_norm)
            .with_initializer(WEIGHT_INIT)
            .init(device);
        let norm = apply_norm.then(|| batch_norm(channels[1], device));
        let lrelu = LeakyReluConfig::new().with_negative_slope(0.2).init();

        Self { conv, norm, lrelu }
    }

    pub fn with_detached_statistics(&self) -> Self {
        Self {
            conv: self.conv.clone(),
            norm: self.norm.as_ref().map(detached_statistics),
            lrelu: self.lrelu.clone(),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let output = self.conv.forward(input);
        let output = match &self.norm {
            Some(norm) => norm.forward(output),
            None => output,
        };
        self.lrelu.forward(output)
    }
}

/// Stride-2 transposed convolution doubling the spatial size.
#[derive(Module, Debug)]
pub struct UpsampleBlock<B: Backend> {
    conv: ConvTranspose2d<B>,
    norm: BatchNorm<B, 2>,
    dropout: Option<Dropout>,
    relu: Relu,
}
impl<B: Backend> UpsampleBlock<B> {
    pub fn new(channels: [usize; 2], apply_dropout: bool, device: &B::Device) -> Self {
        let conv = ConvTranspose2dConfig::new(channels, [KERNEL_SIZE, KERNEL_SIZE])
            .with_stride([2, 2])
            .with_padding([1, 1])
            .with_bias(false)
            .with_initializer(WEIGHT_INIT)
            .init(device);
        let norm = batch_norm(channels[1], device);
        // Dropout is a no-op on non-autodiff backends, i.e. at inference.
        let dropout = apply_dropout.then(|| DropoutConfig::new(0.5).init());
        let relu = Relu::new();

        Self {
            conv,
            norm,
            dropout,
            relu,
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let output = self.conv.forward(input);
        let output = self.norm.forward(output);
        let output = match &self.dropout {
            Some(dropout) => dropout.forward(output),
            None => output,
        };
        self.relu.forward(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    #[test]
    fn downsample_halves_spatial_dims() {
        let device = Default::default();
        let block = DownsampleBlock::<TestBackend>::new([3, 8], true, &device);
        let input = Tensor::<TestBackend, 4>::random(
            [2, 3, 32, 32],
            Distribution::Uniform(-1.0, 1.0),
            &device,
        );

        assert_eq!(block.forward(input).dims(), [2, 8, 16, 16]);
    }

    #[test]
    fn first_downsample_has_bias_and_no_norm() {
        let device = Default::default();
        let first = DownsampleBlock::<TestBackend>::new([3, 8], false, &device);
        let inner = DownsampleBlock::<TestBackend>::new([8, 16], true, &device);

        assert!(first.norm.is_none());
        assert!(first.conv.bias.is_some());
        assert!(inner.norm.is_some());
        assert!(inner.conv.bias.is_none());
    }

    #[test]
    fn upsample_doubles_spatial_dims() {
        let device = Default::default();
        let block = UpsampleBlock::<TestBackend>::new([16, 8], true, &device);
        let input = Tensor::<TestBackend, 4>::random(
            [1, 16, 4, 4],
            Distribution::Uniform(-1.0, 1.0),
            &device,
        );

        assert_eq!(block.forward(input).dims(), [1, 8, 8, 8]);
    }

    #[test]
    fn batch_norm_uses_slow_running_statistics() {
        let device = Default::default();
        let norm = batch_norm::<TestBackend>(8, &device);

        assert_eq!(norm.momentum, NORM_MOMENTUM);
        assert_eq!(norm.epsilon, NORM_EPSILON);
    }

    #[test]
    fn detached_statistics_leave_the_original_untouched() {
        let device = Default::default();
        let norm = batch_norm::<Autodiff<TestBackend>>(4, &device);
        let before = norm.running_mean.value().into_data();
        let input = Tensor::<Autodiff<TestBackend>, 4>::random(
            [2, 4, 8, 8],
            Distribution::Uniform(2.0, 3.0),
            &device,
        );

        let copy = detached_statistics(&norm);
        copy.forward(input.clone());
        norm.running_mean.value().into_data().assert_eq(&before, true);
        let copied = copy.running_mean.value().into_data().to_vec::<f32>().unwrap();
        assert!(copied.iter().all(|mean| *mean > 0.0));

        norm.forward(input);
        let moved = norm.running_mean.value().into_data().to_vec::<f32>().unwrap();
        assert!(moved.iter().all(|mean| *mean > 0.0));
    }

    #[test]
    fn batch_norm_scale_is_drawn_near_zero() {
        let device = Default::default();
        let norm = batch_norm::<TestBackend>(4096, &device);
        let gamma = norm.gamma.val();

        let mean = gamma.clone().mean().into_scalar();
        let std = gamma.var(0).sqrt().into_scalar();
        assert!(mean.abs() < 0.005, "gamma mean {mean}");
        assert!((std - 0.02).abs() < 0.005, "gamma std {std}");
    }
}
