use burn::{
    module::AutodiffModule,
    nn::loss::{BinaryCrossEntropyLoss, BinaryCrossEntropyLossConfig},
    optim::{adaptor::OptimizerAdaptor, Adam, GradientsParams, Optimizer},
    record::FileRecorder,
    tensor::{
        backend::{AutodiffBackend, Backend},
        cast::ToElement,
        Int, Tensor,
    },
};

use crate::{
    error::{Error, Result},
    metrics::{LossTracker, StepMetrics},
    model::{
        discriminator::Discriminator, generator::Generator, CycleGanModel, ModelConfig,
    },
};
use std::path::Path;

type GenOptimizer<B> = OptimizerAdaptor<Adam, Generator<B>, B>;
type DiscOptimizer<B> = OptimizerAdaptor<Adam, Discriminator<B>, B>;

// ////////////////////////////////////////////////////////////////////////////
// Losses

/// Adversarial loss of a generator: its fakes should be scored as real.
pub fn generator_loss<B: Backend>(
    bce: &BinaryCrossEntropyLoss<B>,
    fake_scores: Tensor<B, 4>,
) -> Tensor<B, 1> {
    let fake_scores = fake_scores.flatten::<2>(1, 3);
    let targets = Tensor::<B, 2, Int>::ones(fake_scores.dims(), &fake_scores.device());

    bce.forward(fake_scores, targets)
}

pub fn discriminator_loss<B: Backend>(
    bce: &BinaryCrossEntropyLoss<B>,
    real_scores: Tensor<B, 4>,
    fake_scores: Tensor<B, 4>,
) -> Tensor<B, 1> {
    let real_scores = real_scores.flatten::<2>(1, 3);
    let real_targets = Tensor::<B, 2, Int>::ones(real_scores.dims(), &real_scores.device());
    let real_loss = bce.forward(real_scores, real_targets);

    let fake_scores = fake_scores.flatten::<2>(1, 3);
    let fake_targets = Tensor::<B, 2, Int>::zeros(fake_scores.dims(), &fake_scores.device());
    let fake_loss = bce.forward(fake_scores, fake_targets);

    (real_loss + fake_loss) * 0.5
}

/// Mean absolute error, used by both the cycle and the identity terms.
pub fn l1_loss<B: Backend>(real: Tensor<B, 4>, generated: Tensor<B, 4>) -> Tensor<B, 1> {
    (real - generated).abs().mean()
}

/// Every loss term of one step, still attached to the autodiff graph.
#[derive(Clone, Debug)]
pub struct CycleLosses<B: Backend> {
    pub adv_g: Tensor<B, 1>,
    pub adv_f: Tensor<B, 1>,
    pub cycle: Tensor<B, 1>,
    pub identity: Tensor<B, 1>,
    pub disc_x: Tensor<B, 1>,
    pub disc_y: Tensor<B, 1>,
}
impl<B: Backend> CycleLosses<B> {
    pub fn gen_g_total(&self) -> Tensor<B, 1> {
        self.adv_g.clone() + self.cycle.clone() + self.identity.clone()
    }

    pub fn gen_f_total(&self) -> Tensor<B, 1> {
        self.adv_f.clone() + self.cycle.clone() + self.identity.clone()
    }

    /// Sum whose gradient w.r.t. G (resp. F) equals the gradient of G's (resp.
    /// F's) total loss: `adv_f` does not depend on G and `adv_g` not on F.
    pub fn generator_objective(&self) -> Tensor<B, 1> {
        self.adv_g.clone() + self.adv_f.clone() + self.cycle.clone() + self.identity.clone()
    }

    pub fn discriminator_objective(&self) -> Tensor<B, 1> {
        self.disc_x.clone() + self.disc_y.clone()
    }

    pub fn objective(&self) -> Tensor<B, 1> {
        self.generator_objective() + self.discriminator_objective()
    }

    pub fn metrics(&self) -> StepMetrics {
        let scalar = |tensor: Tensor<B, 1>| tensor.into_scalar().to_f32();

        StepMetrics {
            gen_g_loss: scalar(self.gen_g_total()),
            gen_f_loss: scalar(self.gen_f_total()),
            disc_x_loss: scalar(self.disc_x.clone()),
            disc_y_loss: scalar(self.disc_y.clone()),
            cycle_loss: scalar(self.cycle.clone()),
            identity_loss: scalar(self.identity.clone()),
        }
    }
}

/// Runs all four networks once and builds every loss term.
///
/// Gradient isolation is built into the graph: the generators' adversarial
/// terms score fakes with frozen copies of the discriminators, and the
/// discriminator terms score detached fakes. Only the discriminator terms
/// update the batch norm running statistics, once for real and once for fake.
pub fn compute_losses<B: Backend>(
    model: &CycleGanModel<B>,
    bce: &BinaryCrossEntropyLoss<B>,
    config: &ModelConfig,
    real_x: Tensor<B, 4>,
    real_y: Tensor<B, 4>,
) -> CycleLosses<B> {
    // translation
    let fake_y = model.gen_g.forward(real_x.clone());
    let fake_x = model.gen_f.forward(real_y.clone());

    // round trip
    let cycled_x = model.gen_f.forward(fake_y.clone());
    let cycled_y = model.gen_g.forward(fake_x.clone());

    // each generator applied to its own target domain
    let same_x = model.gen_f.forward(real_x.clone());
    let same_y = model.gen_g.forward(real_y.clone());

    let frozen_disc_x = model.disc_x.frozen();
    let frozen_disc_y = model.disc_y.frozen();
    let adv_g = generator_loss(bce, frozen_disc_y.forward(fake_y.clone()));
    let adv_f = generator_loss(bce, frozen_disc_x.forward(fake_x.clone()));

    let cycle = (l1_loss(real_x.clone(), cycled_x) + l1_loss(real_y.clone(), cycled_y))
        * config.lambda_cycle;
    let identity = (l1_loss(real_x.clone(), same_x) + l1_loss(real_y.clone(), same_y))
        * config.lambda_identity;

    let disc_x = discriminator_loss(
        bce,
        model.disc_x.forward(real_x),
        model.disc_x.forward(fake_x.detach()),
    );
    let disc_y = discriminator_loss(
        bce,
        model.disc_y.forward(real_y),
        model.disc_y.forward(fake_y.detach()),
    );

    CycleLosses {
        adv_g,
        adv_f,
        cycle,
        identity,
        disc_x,
        disc_y,
    }
}

// ////////////////////////////////////////////////////////////////////////////
// Orchestrator

/// One optimizer per network, each only ever fed that network's gradients.
struct Optimizers<B: AutodiffBackend> {
    gen_g: GenOptimizer<B>,
    gen_f: GenOptimizer<B>,
    disc_x: DiscOptimizer<B>,
    disc_y: DiscOptimizer<B>,
}
impl<B: AutodiffBackend> Optimizers<B> {
    fn new(config: &ModelConfig) -> Self {
        let adam = config.optimizer();

        Self {
            gen_g: adam.init(),
            gen_f: adam.init(),
            disc_x: adam.init(),
            disc_y: adam.init(),
        }
    }

    fn save<R: FileRecorder<B>>(&self, dir: &Path, recorder: &R) -> Result<()> {
        recorder.record(self.gen_g.to_record(), dir.join("gen_g"))?;
        recorder.record(self.gen_f.to_record(), dir.join("gen_f"))?;
        recorder.record(self.disc_x.to_record(), dir.join("disc_x"))?;
        recorder.record(self.disc_y.to_record(), dir.join("disc_y"))?;

        Ok(())
    }

    fn load<R: FileRecorder<B>>(self, dir: &Path, recorder: &R, device: &B::Device) -> Result<Self> {
        Ok(Self {
            gen_g: self.gen_g.load_record(recorder.load(dir.join("gen_g"), device)?),
            gen_f: self.gen_f.load_record(recorder.load(dir.join("gen_f"), device)?),
            disc_x: self.disc_x.load_record(recorder.load(dir.join("disc_x"), device)?),
            disc_y: self.disc_y.load_record(recorder.load(dir.join("disc_y"), device)?),
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct StepOutput {
    /// Losses of this step alone.
    pub losses: StepMetrics,
    /// Running means since the last tracker reset, this step included.
    pub running: StepMetrics,
}

pub struct CycleGan<B: AutodiffBackend> {
    config: ModelConfig,
    model: CycleGanModel<B>,
    optimizers: Optimizers<B>,
    bce: BinaryCrossEntropyLoss<B>,
    tracker: LossTracker,
    steps: usize,
}
impl<B: AutodiffBackend> CycleGan<B> {
    pub fn new(config: ModelConfig, device: &B::Device) -> Self {
        let model = config.init(device);
        Self::with_model(config, model, device)
    }

    /// Wraps already-built (e.g. restored) networks with fresh optimizers.
    pub fn with_model(config: ModelConfig, model: CycleGanModel<B>, device: &B::Device) -> Self {
        let optimizers = Optimizers::new(&config);
        let bce = BinaryCrossEntropyLossConfig::new()
            .with_logits(true)
            .init(device);

        Self {
            config,
            model,
            optimizers,
            bce,
            tracker: LossTracker::default(),
            steps: 0,
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn model(&self) -> &CycleGanModel<B> {
        &self.model
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn reset_trackers(&mut self) {
        self.tracker.reset();
    }

    /// One full update of all four networks from a photo batch and a painting batch.
    ///
    /// All gradients come from a single forward pass over the current
    /// parameters; no network is updated before every gradient is known.
    pub fn train_step(&mut self, real_x: Tensor<B, 4>, real_y: Tensor<B, 4>) -> Result<StepOutput> {
        let (x, y) = (real_x.dims(), real_y.dims());
        if x != y {
            return Err(Error::ShapeMismatch { x, y });
        }

        let losses = compute_losses(&self.model, &self.bce, &self.config, real_x, real_y);
        let metrics = losses.metrics();
        let mut grads = losses.objective().backward();

        let CycleGanModel {
            gen_g,
            gen_f,
            disc_x,
            disc_y,
        } = self.model.clone();
        let grads_gen_g = GradientsParams::from_module(&mut grads, &gen_g);
        let grads_gen_f = GradientsParams::from_module(&mut grads, &gen_f);
        let grads_disc_x = GradientsParams::from_module(&mut grads, &disc_x);
        let grads_disc_y = GradientsParams::from_module(&mut grads, &disc_y);

        let lr = self.config.learning_rate;
        self.model = CycleGanModel {
            gen_g: self.optimizers.gen_g.step(lr, gen_g, grads_gen_g),
            gen_f: self.optimizers.gen_f.step(lr, gen_f, grads_gen_f),
            disc_x: self.optimizers.disc_x.step(lr, disc_x, grads_disc_x),
            disc_y: self.optimizers.disc_y.step(lr, disc_y, grads_disc_y),
        };

        self.tracker.update(&metrics);
        self.steps += 1;

        Ok(StepOutput {
            losses: metrics,
            running: self.tracker.mean(),
        })
    }

    /// Photo -> painting with G in inference mode: batch norm uses its running
    /// statistics and dropout is disabled.
    pub fn translate(&self, real_x: Tensor<B::InnerBackend, 4>) -> Tensor<B::InnerBackend, 4> {
        self.model.gen_g.valid().forward(real_x)
    }

    /// Writes the Adam moments of all four networks under `dir`.
    pub fn save_optimizers<R: FileRecorder<B>>(&self, dir: &Path, recorder: &R) -> Result<()> {
        self.optimizers.save(dir, recorder)
    }

    /// Restores the Adam moments written by [`CycleGan::save_optimizers`].
    pub fn load_optimizers<R: FileRecorder<B>>(
        mut self,
        dir: &Path,
        recorder: &R,
        device: &B::Device,
    ) -> Result<Self> {
        self.optimizers = self.optimizers.load(dir, recorder, device)?;
        Ok(self)
    }

    pub fn into_model(self) -> CycleGanModel<B> {
        self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::optim::AdamConfig;
    use burn::tensor::Distribution;

    type TestBackend = Autodiff<NdArray<f32>>;

    const SIZE: usize = 256;

    fn tiny_config() -> ModelConfig {
        ModelConfig::new().with_base_filters(1)
    }

    fn images(batch: usize, device: &<TestBackend as Backend>::Device) -> Tensor<TestBackend, 4> {
        Tensor::random(
            [batch, 3, SIZE, SIZE],
            Distribution::Uniform(-1.0, 1.0),
            device,
        )
    }

    fn bce(device: &<TestBackend as Backend>::Device) -> BinaryCrossEntropyLoss<TestBackend> {
        BinaryCrossEntropyLossConfig::new()
            .with_logits(true)
            .init(device)
    }

    #[test]
    fn l1_of_identical_images_is_zero() {
        let device = Default::default();
        let x = images(1, &device);

        let loss = l1_loss(x.clone(), x).into_scalar().to_f32();
        assert_eq!(loss, 0.0);
    }

    #[test]
    fn adversarial_losses_match_closed_form() {
        let device = Default::default();
        let bce = bce(&device);
        let zeros = Tensor::<TestBackend, 4>::zeros([1, 1, 2, 2], &device);

        // sigmoid(0) = 0.5 for every patch, whatever the target
        let ln2 = std::f32::consts::LN_2;
        let g = generator_loss(&bce, zeros.clone()).into_scalar().to_f32();
        let d = discriminator_loss(&bce, zeros.clone(), zeros).into_scalar().to_f32();
        assert!((g - ln2).abs() < 1e-5);
        assert!((d - ln2).abs() < 1e-5);
    }

    #[test]
    fn identity_term_is_weighted_l1_of_own_domain_passes() {
        // without autodiff, dropout is off and batch norm uses running
        // statistics, so the generators can be re-run deterministically
        type InferenceBackend = NdArray<f32>;

        let device = Default::default();
        let config = tiny_config();
        let model = config.init::<InferenceBackend>(&device);
        let bce = BinaryCrossEntropyLossConfig::new()
            .with_logits(true)
            .init(&device);
        let x = Tensor::<InferenceBackend, 4>::random(
            [1, 3, SIZE, SIZE],
            Distribution::Uniform(-1.0, 1.0),
            &device,
        );
        let y = Tensor::<InferenceBackend, 4>::random(
            [1, 3, SIZE, SIZE],
            Distribution::Uniform(-1.0, 1.0),
            &device,
        );

        let losses = compute_losses(&model, &bce, &config, x.clone(), y.clone());

        let expected = (l1_loss(x.clone(), model.gen_f.forward(x))
            + l1_loss(y.clone(), model.gen_g.forward(y)))
            * config.lambda_identity;
        let identity = losses.identity.into_scalar().to_f32();
        let expected = expected.into_scalar().to_f32();
        assert!(expected > 0.0);
        assert!((identity - expected).abs() < 1e-5, "{identity} vs {expected}");
    }

    #[test]
    fn identity_term_vanishes_for_identity_generators_on_shared_images() {
        let device = Default::default();
        let config = tiny_config();
        let model = config.init::<TestBackend>(&device);
        let model = CycleGanModel {
            gen_g: model.gen_g.with_zero_output(),
            gen_f: model.gen_f.with_zero_output(),
            disc_x: model.disc_x,
            disc_y: model.disc_y,
        };
        // mid-gray in both domains, which the generators reproduce exactly
        let images = Tensor::<TestBackend, 4>::zeros([2, 3, SIZE, SIZE], &device);

        let losses = compute_losses(&model, &bce(&device), &config, images.clone(), images);

        let metrics = losses.metrics();
        assert!(metrics.identity_loss.abs() < 1e-6, "{metrics}");
        assert!(metrics.cycle_loss.abs() < 1e-6, "{metrics}");
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let device = Default::default();
        let mut gan = CycleGan::<TestBackend>::new(tiny_config(), &device);

        let result = gan.train_step(images(1, &device), images(2, &device));

        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
        assert_eq!(gan.steps(), 0);
    }

    #[test]
    fn generator_objective_never_reaches_discriminators() {
        let device = Default::default();
        let config = tiny_config();
        let model = config.init::<TestBackend>(&device);

        let losses = compute_losses(
            &model,
            &bce(&device),
            &config,
            images(1, &device),
            images(1, &device),
        );
        let mut grads = losses.generator_objective().backward();

        assert!(GradientsParams::from_module(&mut grads, &model.disc_x).is_empty());
        assert!(GradientsParams::from_module(&mut grads, &model.disc_y).is_empty());
        assert!(!GradientsParams::from_module(&mut grads, &model.gen_g).is_empty());
        assert!(!GradientsParams::from_module(&mut grads, &model.gen_f).is_empty());
    }

    #[test]
    fn discriminator_objective_never_reaches_generators() {
        let device = Default::default();
        let config = tiny_config();
        let model = config.init::<TestBackend>(&device);

        let losses = compute_losses(
            &model,
            &bce(&device),
            &config,
            images(1, &device),
            images(1, &device),
        );
        let mut grads = losses.discriminator_objective().backward();

        assert!(GradientsParams::from_module(&mut grads, &model.gen_g).is_empty());
        assert!(GradientsParams::from_module(&mut grads, &model.gen_f).is_empty());
        assert!(!GradientsParams::from_module(&mut grads, &model.disc_x).is_empty());
        assert!(!GradientsParams::from_module(&mut grads, &model.disc_y).is_empty());
    }

    #[test]
    fn discriminators_unchanged_by_generator_only_update() {
        let device = Default::default();
        let config = tiny_config();
        let model = config.init::<TestBackend>(&device);
        let before = model.disc_x.out_weight().into_data();

        let losses = compute_losses(
            &model,
            &bce(&device),
            &config,
            images(1, &device),
            images(1, &device),
        );
        let mut grads = losses.generator_objective().backward();
        let disc_grads = GradientsParams::from_module(&mut grads, &model.disc_x);
        let mut optimizer: DiscOptimizer<TestBackend> = AdamConfig::new().init();
        let disc_x = optimizer.step(config.learning_rate, model.disc_x.clone(), disc_grads);

        disc_x.out_weight().into_data().assert_eq(&before, true);
    }

    #[test]
    fn generators_unchanged_by_discriminator_only_update() {
        let device = Default::default();
        let config = tiny_config();
        let model = config.init::<TestBackend>(&device);
        let before = model.gen_g.out_weight().into_data();

        let losses = compute_losses(
            &model,
            &bce(&device),
            &config,
            images(1, &device),
            images(1, &device),
        );
        let mut grads = losses.discriminator_objective().backward();
        let gen_grads = GradientsParams::from_module(&mut grads, &model.gen_g);
        let mut optimizer: GenOptimizer<TestBackend> = AdamConfig::new().init();
        let gen_g = optimizer.step(config.learning_rate, model.gen_g.clone(), gen_grads);

        gen_g.out_weight().into_data().assert_eq(&before, true);
    }

    #[test]
    fn train_step_updates_every_network() {
        let device = Default::default();
        let mut gan = CycleGan::<TestBackend>::new(tiny_config(), &device);
        let before = gan.model().clone();

        let output = gan.train_step(images(1, &device), images(1, &device)).unwrap();

        let after = gan.model();
        let weights = |tensor: Tensor<TestBackend, 4>| tensor.into_data().to_vec::<f32>().unwrap();
        assert_ne!(weights(before.gen_g.out_weight()), weights(after.gen_g.out_weight()));
        assert_ne!(weights(before.gen_f.out_weight()), weights(after.gen_f.out_weight()));
        assert_ne!(weights(before.disc_x.out_weight()), weights(after.disc_x.out_weight()));
        assert_ne!(weights(before.disc_y.out_weight()), weights(after.disc_y.out_weight()));
        assert_eq!(gan.steps(), 1);
        assert_eq!(output.losses, output.running);
    }

    #[test]
    fn total_losses_share_cycle_and_identity_terms() {
        let device = Default::default();
        let mut gan = CycleGan::<TestBackend>::new(tiny_config(), &device);

        let StepOutput { losses, .. } = gan
            .train_step(images(1, &device), images(1, &device))
            .unwrap();

        let shared = losses.cycle_loss + losses.identity_loss;
        assert!(losses.gen_g_loss >= shared);
        assert!(losses.gen_f_loss >= shared);
    }

    #[test]
    fn losses_stay_finite_for_100_steps() {
        let device = Default::default();
        let mut gan = CycleGan::<TestBackend>::new(tiny_config(), &device);
        let photos = (0..4).map(|_| images(1, &device)).collect::<Vec<_>>();
        let paintings = (0..4).map(|_| images(1, &device)).collect::<Vec<_>>();

        for step in 0..100 {
            let output = gan
                .train_step(photos[step % 4].clone(), paintings[step % 4].clone())
                .unwrap();
            assert!(output.losses.is_finite(), "step {step}: {}", output.losses);
        }
        assert_eq!(gan.steps(), 100);
    }

    #[test]
    fn translate_keeps_shape_and_range() {
        let device = Default::default();
        let gan = CycleGan::<TestBackend>::new(tiny_config(), &device);
        let photo = images(1, &device).inner();

        let painting = gan.translate(photo);

        assert_eq!(painting.dims(), [1, 3, SIZE, SIZE]);
        let values = painting.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    #[ignore = "convergence smoke test, runs many steps"]
    fn round_trip_error_shrinks_with_training() {
        let device = Default::default();
        let config = ModelConfig::new().with_base_filters(4);
        let mut gan = CycleGan::<TestBackend>::new(config, &device);
        let photo = images(1, &device);
        let painting = images(1, &device);

        let round_trip = |gan: &CycleGan<TestBackend>| {
            let model = gan.model().valid();
            let x = photo.clone().inner();
            let cycled = model.gen_f.forward(model.gen_g.forward(x.clone()));
            l1_loss(x, cycled).into_scalar().to_f32()
        };

        let initial = round_trip(&gan);
        for _ in 0..300 {
            gan.train_step(photo.clone(), painting.clone()).unwrap();
        }

        assert!(round_trip(&gan) < initial * 0.5);
    }
}
