use crate::model::{
    architecture::{Discriminator, DiscriminatorConfig, Generator, GeneratorConfig},
    data::{CelebaDataset, FaceBatch, FaceBatcher},
    noise::NoiseSource,
};

use anyhow::{Context, Result};
use burn::{
    data::dataloader::DataLoaderBuilder,
    module::AutodiffModule,
    optim::{AdamWConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::ElementConversion,
    tensor::backend::AutodiffBackend,
};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

pub const RESULT_FILE: &str = "result.txt";

const REAL_LABEL: f32 = 1.0;
const FAKE_LABEL: f32 = 0.0;

/// Probabilities are kept this far from 0 and 1 before taking logs.
const PROB_EPS: f64 = 1e-7;

#[derive(Config)]
pub struct TrainingConfig {
    pub generator: GeneratorConfig,
    pub discriminator: DiscriminatorConfig,
    pub optimizer_g: AdamWConfig,
    pub optimizer_d: AdamWConfig,

    #[config(default = 5)]
    pub num_epochs: usize,

    /// Epoch whose evaluation loss is written to the result file, ending the run.
    #[config(default = 10)]
    pub stop_epoch: usize,

    #[config(default = 32)]
    pub batch_size: usize,

    /// Training loader workers. With more than one, batches arrive in completion
    /// order, so only `1` replays a run exactly.
    #[config(default = 2)]
    pub num_workers: usize,

    /// Evaluation loader workers; one keeps the batch and noise pairing fixed.
    #[config(default = 1)]
    pub eval_num_workers: usize,

    #[config(default = 0)]
    pub seed: u64,

    #[config(default = 1e-4)]
    pub learning_rate: f64,

    #[config(default = 10000)]
    pub train_size: usize,
}

impl TrainingConfig {
    /// Default networks with AdamW on both sides.
    pub fn celeba() -> Self {
        Self::new(
            GeneratorConfig::new(),
            DiscriminatorConfig::new(),
            adamw(),
            adamw(),
        )
    }
}

fn adamw() -> AdamWConfig {
    AdamWConfig::new()
        .with_beta_1(0.9)
        .with_beta_2(0.999)
        .with_epsilon(1e-8)
        .with_weight_decay(0.01)
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingOutcome {
    pub epochs_run: usize,
    /// Rounded evaluation loss written at the stop epoch, if it was reached.
    pub eval_loss: Option<f64>,
    pub result_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default)]
struct BatchStats {
    loss_d: f64,
    loss_g: f64,
    d_x: f64,
    d_g_z1: f64,
    d_g_z2: f64,
}

/// Summed losses of one evaluation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EvalLosses {
    pub discriminator: f64,
    pub generator: f64,
}

impl EvalLosses {
    pub fn total(&self) -> f64 {
        self.discriminator + self.generator
    }
}

pub fn train<B: AutodiffBackend>(
    img_path: &Path,
    output_dir: &Path,
    identifier: &str,
    config: TrainingConfig,
    device: B::Device,
) -> Result<TrainingOutcome> {
    B::seed(config.seed);
    let mut noise = NoiseSource::new(config.seed, config.generator.latent_dim);

    let dataset_train = CelebaDataset::train(img_path, config.train_size)
        .with_context(|| format!("failed to load training images from {}", img_path.display()))?
        .with_seed(config.seed);
    let dataset_eval = CelebaDataset::eval(img_path, config.train_size)
        .with_context(|| format!("failed to load evaluation images from {}", img_path.display()))?;
    tracing::info!(
        "train images -> {}, eval images -> {}",
        dataset_train.image_paths.len(),
        dataset_eval.image_paths.len()
    );
    let train_epoch = dataset_train.epoch_counter();

    let dataloader_train = DataLoaderBuilder::<B, _, _>::new(FaceBatcher::default())
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(dataset_train);
    let dataloader_eval = DataLoaderBuilder::<B::InnerBackend, _, _>::new(FaceBatcher::default())
        .batch_size(config.batch_size)
        .num_workers(config.eval_num_workers)
        .build(dataset_eval);

    let mut generator: Generator<B> = config.generator.init(&device);
    let mut discriminator: Discriminator<B> = config.discriminator.init(&device);
    let mut optim_g = config.optimizer_g.init::<B, Generator<B>>();
    let mut optim_d = config.optimizer_d.init::<B, Discriminator<B>>();

    for epoch in 0..config.num_epochs {
        train_epoch.store(epoch as u64, Ordering::SeqCst);
        let mut last = BatchStats::default();

        for batch in dataloader_train.iter() {
            let real_images = batch.into_images()?.to_device(&device);
            let batch_size = real_images.dims()[0];

            let fake_images = generator.forward(noise.next::<B>(batch_size, &device));
            discriminator = discriminator_step(
                discriminator,
                &mut optim_d,
                config.learning_rate,
                real_images,
                fake_images.clone(),
                &mut last,
            );
            generator = generator_step(
                generator,
                &discriminator,
                &mut optim_g,
                config.learning_rate,
                fake_images,
                &mut last,
            );
        }

        let eval = evaluate(
            &generator.valid(),
            &discriminator.valid(),
            dataloader_eval.iter(),
            &mut noise,
            &device,
        )?;
        let eval_loss = eval.total();

        if epoch == config.stop_epoch {
            let loss = round_loss(eval_loss);
            println!("{}", format_loss(loss));
            let result_file = append_result(output_dir, identifier, loss)?;
            tracing::info!(
                "wrote evaluation loss to {} (noise counter at {})",
                result_file.display(),
                noise.seed()
            );
            return Ok(TrainingOutcome {
                epochs_run: epoch + 1,
                eval_loss: Some(loss),
                result_file: Some(result_file),
            });
        }

        tracing::info!(
            "[{}/{}] Loss_D: {:.4} Loss_G: {:.4} D(x): {:.4} D(G(z)): {:.4} / {:.4}  EvalLoss:{:.4}",
            epoch,
            config.num_epochs,
            last.loss_d,
            last.loss_g,
            last.d_x,
            last.d_g_z1,
            last.d_g_z2,
            eval_loss,
        );
    }

    tracing::warn!(
        "stop epoch {} was never reached in {} epochs, nothing written",
        config.stop_epoch,
        config.num_epochs
    );
    Ok(TrainingOutcome {
        epochs_run: config.num_epochs,
        eval_loss: None,
        result_file: None,
    })
}

/// Scores real images as real and the detached fakes as fake, then steps the
/// discriminator only. The generator graph is cut, so it receives no gradient.
fn discriminator_step<B, O>(
    discriminator: Discriminator<B>,
    optim: &mut O,
    learning_rate: f64,
    real_images: Tensor<B, 4>,
    fake_images: Tensor<B, 4>,
    stats: &mut BatchStats,
) -> Discriminator<B>
where
    B: AutodiffBackend,
    O: Optimizer<Discriminator<B>, B>,
{
    let output = discriminator.forward(real_images);
    let loss_real = bce_with_label(output.clone(), REAL_LABEL);
    stats.d_x = mean_value(output);

    let output = discriminator.forward(fake_images.detach());
    let loss_fake = bce_with_label(output.clone(), FAKE_LABEL);
    stats.d_g_z1 = mean_value(output);

    let loss = loss_real + loss_fake;
    stats.loss_d = scalar_value(loss.clone());
    let grads = GradientsParams::from_grads(loss.backward(), &discriminator);
    optim.step(learning_rate, discriminator, grads)
}

/// Pushes the refreshed discriminator's score on the fakes towards "real" and
/// steps the generator only.
fn generator_step<B, O>(
    generator: Generator<B>,
    discriminator: &Discriminator<B>,
    optim: &mut O,
    learning_rate: f64,
    fake_images: Tensor<B, 4>,
    stats: &mut BatchStats,
) -> Generator<B>
where
    B: AutodiffBackend,
    O: Optimizer<Generator<B>, B>,
{
    let output = discriminator.forward(fake_images);
    let loss = bce_with_label(output.clone(), REAL_LABEL);
    stats.d_g_z2 = mean_value(output);
    stats.loss_g = scalar_value(loss.clone());

    let grads = GradientsParams::from_grads(loss.backward(), &generator);
    optim.step(learning_rate, generator, grads)
}

/// Runs the training-time losses over `batches` without touching either network.
/// Draws one noise batch per image batch.
fn evaluate<B: Backend>(
    generator: &Generator<B>,
    discriminator: &Discriminator<B>,
    batches: impl Iterator<Item = FaceBatch<B>>,
    noise: &mut NoiseSource,
    device: &B::Device,
) -> Result<EvalLosses> {
    let mut losses = EvalLosses::default();
    for batch in batches {
        let real_images = batch.into_images()?.to_device(device);
        let batch_size = real_images.dims()[0];

        let loss_real = bce_with_label(discriminator.forward(real_images), REAL_LABEL);
        let fake_images = generator.forward(noise.next::<B>(batch_size, device));
        let output = discriminator.forward(fake_images);
        let loss_fake = bce_with_label(output.clone(), FAKE_LABEL);
        let loss_g = bce_with_label(output, REAL_LABEL);

        losses.discriminator += scalar_value(loss_real + loss_fake);
        losses.generator += scalar_value(loss_g);
    }
    Ok(losses)
}

/// Binary cross entropy of `[n, 1]` probabilities against one constant label,
/// averaged over the batch.
fn bce_with_label<B: Backend>(probs: Tensor<B, 2>, label: f32) -> Tensor<B, 1> {
    let probs = probs.clamp(PROB_EPS, 1.0 - PROB_EPS);
    let log_real = probs.clone().log() * label;
    let log_fake = (probs.neg() + 1.0).log() * (1.0 - label);
    (log_real + log_fake).mean().neg()
}

fn scalar_value<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}

fn mean_value<B: Backend>(tensor: Tensor<B, 2>) -> f64 {
    scalar_value(tensor.mean())
}

pub fn round_loss(loss: f64) -> f64 {
    (loss * 1000.0).round() / 1000.0
}

/// Renders like `2.5`, `3.0` or `1.235`.
pub fn format_loss(loss: f64) -> String {
    format!("{loss:?}")
}

/// Appends `<identifier>\t<loss>` to the result file in `output_dir`.
pub fn append_result(output_dir: &Path, identifier: &str, loss: f64) -> Result<PathBuf> {
    let path = output_dir.join(RESULT_FILE);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    writeln!(file, "{identifier}\t{}", format_loss(loss))
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::constants::{CHANNELS, HEIGHT, LATENT_DIM, TRAIN_SIZE, WIDTH};
    use crate::model::data::tests::{truncate_file, write_images};
    use crate::model::test_support::backend_rng_guard;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    fn small_config(stop_epoch: usize, num_epochs: usize) -> TrainingConfig {
        let mut config = TrainingConfig::celeba()
            .with_train_size(3)
            .with_batch_size(2)
            .with_num_workers(1)
            .with_num_epochs(num_epochs)
            .with_stop_epoch(stop_epoch);
        config.discriminator = DiscriminatorConfig::new().with_base_channels(8);
        config
    }

    fn train_on(images: &Path, config: TrainingConfig) -> (Result<TrainingOutcome>, tempfile::TempDir) {
        let _guard = backend_rng_guard();
        let output = tempfile::tempdir().unwrap();
        let outcome = train::<TestAutodiffBackend>(
            images,
            output.path(),
            "run",
            config,
            Default::default(),
        );
        (outcome, output)
    }

    fn run(stop_epoch: usize, num_epochs: usize) -> (TrainingOutcome, tempfile::TempDir) {
        let images = tempfile::tempdir().unwrap();
        write_images(images.path(), 5);
        let (outcome, output) = train_on(images.path(), small_config(stop_epoch, num_epochs));
        (outcome.unwrap(), output)
    }

    fn result_lines(dir: &Path) -> Vec<String> {
        std::fs::read_to_string(dir.join(RESULT_FILE))
            .unwrap()
            .lines()
            .map(str::to_owned)
            .collect()
    }

    struct Nets {
        generator: Generator<TestAutodiffBackend>,
        discriminator: Discriminator<TestAutodiffBackend>,
        fixed_noise: Tensor<TestBackend, 2>,
        fixed_images: Tensor<TestBackend, 4>,
    }

    impl Nets {
        fn new() -> Self {
            let device = Default::default();
            TestAutodiffBackend::seed(5);
            Self {
                generator: GeneratorConfig::new().init(&device),
                discriminator: DiscriminatorConfig::new().with_base_channels(8).init(&device),
                fixed_noise: Tensor::random([2, LATENT_DIM], Distribution::Normal(0.0, 1.0), &device),
                fixed_images: Tensor::random(
                    [2, CHANNELS, HEIGHT, WIDTH],
                    Distribution::Uniform(-1.0, 1.0),
                    &device,
                ),
            }
        }

        fn generator_output(&self) -> TensorData {
            self.generator.valid().forward(self.fixed_noise.clone()).into_data()
        }

        fn discriminator_output(&self) -> TensorData {
            self.discriminator
                .valid()
                .forward(self.fixed_images.clone())
                .into_data()
        }
    }

    #[test]
    fn discriminator_step_leaves_generator_untouched() {
        let _guard = backend_rng_guard();
        let device = Default::default();
        let mut nets = Nets::new();
        let mut optim_d = adamw().init::<TestAutodiffBackend, Discriminator<TestAutodiffBackend>>();
        let mut noise = NoiseSource::new(0, LATENT_DIM);
        let mut stats = BatchStats::default();

        let generator_before = nets.generator_output();
        let discriminator_before = nets.discriminator_output();

        let real = Tensor::<TestAutodiffBackend, 4>::from_inner(nets.fixed_images.clone());
        let fake = nets
            .generator
            .forward(noise.next::<TestAutodiffBackend>(2, &device));
        nets.discriminator =
            discriminator_step(nets.discriminator, &mut optim_d, 1e-2, real, fake, &mut stats);

        assert_eq!(nets.generator_output(), generator_before);
        assert_ne!(nets.discriminator_output(), discriminator_before);
        assert!(stats.loss_d.is_finite());
    }

    #[test]
    fn generator_step_leaves_discriminator_untouched() {
        let _guard = backend_rng_guard();
        let device = Default::default();
        let mut nets = Nets::new();
        let mut optim_g = adamw().init::<TestAutodiffBackend, Generator<TestAutodiffBackend>>();
        let mut noise = NoiseSource::new(0, LATENT_DIM);
        let mut stats = BatchStats::default();

        let generator_before = nets.generator_output();
        let discriminator_before = nets.discriminator_output();

        let fake = nets
            .generator
            .forward(noise.next::<TestAutodiffBackend>(2, &device));
        nets.generator = generator_step(
            nets.generator,
            &nets.discriminator,
            &mut optim_g,
            1e-2,
            fake,
            &mut stats,
        );

        assert_ne!(nets.generator_output(), generator_before);
        assert_eq!(nets.discriminator_output(), discriminator_before);
        assert!(stats.loss_g.is_finite());
    }

    #[test]
    fn eval_pass_changes_neither_network() {
        let _guard = backend_rng_guard();
        let device = Default::default();
        let nets = Nets::new();
        let mut noise = NoiseSource::new(0, LATENT_DIM);

        let generator_before = nets.generator_output();
        let discriminator_before = nets.discriminator_output();

        let batches = vec![
            FaceBatch::<TestBackend> {
                images: nets.fixed_images.clone(),
                failures: Vec::new(),
            };
            2
        ];
        let losses = evaluate(
            &nets.generator.valid(),
            &nets.discriminator.valid(),
            batches.into_iter(),
            &mut noise,
            &device,
        )
        .unwrap();

        assert!(losses.discriminator > 0.0 && losses.generator > 0.0);
        assert_eq!(losses.total(), losses.discriminator + losses.generator);
        assert_eq!(noise.seed(), 2);
        assert_eq!(nets.generator_output(), generator_before);
        assert_eq!(nets.discriminator_output(), discriminator_before);
    }

    #[test]
    fn eval_pass_rejects_corrupt_batch() {
        let _guard = backend_rng_guard();
        let device = Default::default();
        let nets = Nets::new();
        let mut noise = NoiseSource::new(0, LATENT_DIM);
        let batch = FaceBatch::<TestBackend> {
            images: nets.fixed_images.clone(),
            failures: vec![(PathBuf::from("bad.png"), "truncated".to_string())],
        };
        let result = evaluate(
            &nets.generator.valid(),
            &nets.discriminator.valid(),
            std::iter::once(batch),
            &mut noise,
            &device,
        );
        assert!(result.is_err());
    }

    #[test]
    fn stops_at_configured_epoch_with_one_append() {
        let (outcome, output) = run(1, 5);
        assert_eq!(outcome.epochs_run, 2);

        let lines = result_lines(output.path());
        assert_eq!(lines.len(), 1);
        let (identifier, loss) = lines[0].split_once('\t').unwrap();
        assert_eq!(identifier, "run");
        let loss: f64 = loss.parse().unwrap();
        assert_eq!(Some(loss), outcome.eval_loss);
        assert!(loss.is_finite() && loss > 0.0);
    }

    #[test]
    fn stop_epoch_zero_runs_a_single_epoch() {
        let (outcome, output) = run(0, 5);
        assert_eq!(outcome.epochs_run, 1);
        assert_eq!(result_lines(output.path()).len(), 1);
    }

    #[test]
    fn unreachable_stop_epoch_writes_nothing() {
        let (outcome, output) = run(3, 2);
        assert_eq!(outcome.epochs_run, 2);
        assert_eq!(outcome.eval_loss, None);
        assert!(!output.path().join(RESULT_FILE).exists());
    }

    #[test]
    fn same_seed_reproduces_the_loss() {
        let images = tempfile::tempdir().unwrap();
        write_images(images.path(), 5);
        let config = || small_config(1, 5).with_seed(3);

        let (first, _first_dir) = train_on(images.path(), config());
        let (second, _second_dir) = train_on(images.path(), config());
        let (first, second) = (first.unwrap(), second.unwrap());
        assert!(first.eval_loss.is_some());
        assert_eq!(first.eval_loss, second.eval_loss);
    }

    #[test]
    fn truncated_image_fails_the_run() {
        let images = tempfile::tempdir().unwrap();
        write_images(images.path(), 5);
        truncate_file(&images.path().join("000001.png"), 60);

        let (outcome, output) = train_on(images.path(), small_config(0, 1));
        let err = outcome.unwrap_err();
        assert!(format!("{err:#}").contains("000001.png"));
        assert!(!output.path().join(RESULT_FILE).exists());
    }

    #[test]
    fn missing_image_directory_fails() {
        let output = tempfile::tempdir().unwrap();
        let (outcome, _) = train_on(&output.path().join("celeba"), small_config(0, 1));
        assert!(outcome.is_err());
    }

    #[test]
    fn bce_matches_closed_form() {
        let device = Default::default();
        let probs =
            Tensor::<TestBackend, 2>::from_data(TensorData::from([[0.8f32], [0.4]]), &device);

        let real = scalar_value(bce_with_label(probs.clone(), REAL_LABEL));
        let expected = -(0.8f64.ln() + 0.4f64.ln()) / 2.0;
        assert!((real - expected).abs() < 1e-5);

        let fake = scalar_value(bce_with_label(probs, FAKE_LABEL));
        let expected = -(0.2f64.ln() + 0.6f64.ln()) / 2.0;
        assert!((fake - expected).abs() < 1e-5);
    }

    #[test]
    fn bce_stays_finite_on_saturated_scores() {
        let device = Default::default();
        let probs =
            Tensor::<TestBackend, 2>::from_data(TensorData::from([[0.0f32], [1.0]]), &device);
        assert!(scalar_value(bce_with_label(probs.clone(), REAL_LABEL)).is_finite());
        assert!(scalar_value(bce_with_label(probs, FAKE_LABEL)).is_finite());
    }

    #[test]
    fn loss_is_rounded_to_three_decimals() {
        assert_eq!(format_loss(round_loss(2.5)), "2.5");
        assert_eq!(format_loss(round_loss(3.0)), "3.0");
        assert_eq!(format_loss(round_loss(1.23456)), "1.235");
        assert_eq!(format_loss(round_loss(0.0004)), "0.0");
    }

    #[test]
    fn result_lines_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        append_result(dir.path(), "a", 1.5).unwrap();
        append_result(dir.path(), "b", 2.25).unwrap();
        assert_eq!(result_lines(dir.path()), ["a\t1.5", "b\t2.25"]);
    }

    #[test]
    fn config_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = TrainingConfig::celeba().with_stop_epoch(3).with_seed(9);
        config.save(&path).unwrap();

        let loaded = TrainingConfig::load(&path).unwrap();
        assert_eq!(loaded.stop_epoch, 3);
        assert_eq!(loaded.seed, 9);
        assert_eq!(loaded.eval_num_workers, 1);
        assert_eq!(loaded.train_size, TRAIN_SIZE);
        assert_eq!(loaded.generator.latent_dim, 100);
    }
}
