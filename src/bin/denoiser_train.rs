//! # Denoiser Training CLI
//!
//! Train or evaluate a denoiser described by a JSON configuration.
//!
//! ## Usage
//!
//! ```bash
//! # Train, evaluating after every epoch
//! denoiser_train configs/diffuse.json
//!
//! # Evaluate the checkpoint in the model directory
//! denoiser_train configs/diffuse.json --validate
//!
//! # Shorter run with a fixed seed
//! denoiser_train configs/diffuse.json --train-epochs 20 --validation-interval 5 --seed 7
//! ```
//!
//! Training resumes from the checkpoint in `model_directory` when one exists
//! and saves there when it finishes.

use candle_core::Device;
use clap::Parser;
use std::path::PathBuf;

use deep_denoiser::checkpoint::{checkpoint_exists, load_weights, save_checkpoint, CheckpointMetadata};
use deep_denoiser::dataset::{stack_examples, DataLoader, DenoiserDataset, LoaderOptions, Split};
use deep_denoiser::{DenoiserConfig, DenoiserModel, Trainer, TrainingConfig};

/// Train a kernel-predicting denoiser
#[derive(Parser, Debug)]
#[command(name = "denoiser_train")]
#[command(about = "Train a kernel-predicting denoiser on rendered passes")]
#[command(version)]
struct Args {
    /// JSON configuration
    config: PathBuf,

    /// Only evaluate the stored checkpoint on the validation split
    #[arg(long)]
    validate: bool,

    /// Total number of training epochs
    #[arg(long, default_value = "10000")]
    train_epochs: usize,

    /// Training epochs between evaluations
    #[arg(long, default_value = "1")]
    validation_interval: usize,

    /// Worker threads of the data pipeline (defaults to every core)
    #[arg(long)]
    threads: Option<usize>,

    /// Random seed
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Log frequency (steps)
    #[arg(long, default_value = "100")]
    log_every: usize,

    /// Use CUDA if available
    #[arg(long)]
    cuda: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if let Some(threads) = args.threads {
        rayon::ThreadPoolBuilder::new().num_threads(threads).build_global()?;
    }

    let device = if args.cuda {
        Device::cuda_if_available(0)?
    } else {
        Device::Cpu
    };
    log::info!("Using device: {:?}", device);

    let config = DenoiserConfig::from_file(&args.config)?;
    log::info!("Loaded configuration from {:?}", args.config);

    let validation = DenoiserDataset::from_split(&config, Split::Validation)?;
    log::info!("Validation examples: {}", validation.len());

    let mut model = DenoiserModel::new(&config, device.clone())?;
    let model_directory = config.model_directory.clone();
    let weights = model_directory.join("model.safetensors");

    let mut resumed_step = 0;
    if checkpoint_exists(&model_directory) {
        // one batch materializes every variable before the weights are copied in
        let options = LoaderOptions::evaluation(&config, args.seed);
        let mut loader = DataLoader::new(validation.clone(), model.passes(), options, device.clone());
        let batch = match loader.next() {
            Some(batch) => batch?,
            None => {
                let example = validation.get(0)?;
                stack_examples(&[example], &device)?
            }
        };
        load_weights(&mut model, &weights, &batch)?;
        let metadata = CheckpointMetadata::from_file(model_directory.join("config.json"))?;
        resumed_step = metadata.step.unwrap_or(0);
        log::info!("Resuming from step {}", resumed_step);
    } else if args.validate {
        anyhow::bail!("no checkpoint in {:?} to validate", model_directory);
    }

    let training_config = TrainingConfig {
        train_epochs: args.train_epochs,
        validation_interval: args.validation_interval,
        log_every: args.log_every,
        seed: args.seed,
        ..TrainingConfig::from_denoiser_config(&config)
    };
    let mut trainer = Trainer::new(model, training_config)
        .resume_from(resumed_step)
        .with_loggers(&config)?;

    if args.validate {
        let options = LoaderOptions::evaluation(&config, args.seed);
        let loader = DataLoader::new(validation, trainer.model().passes(), options, device);
        let summary = trainer.evaluate(loader)?;
        log::info!("Validation loss: {:.6} over {} batches", summary.loss, summary.batches);
        for (name, value) in &summary.metrics {
            log::info!("  {}: {:.6}", name, value);
        }
        return Ok(());
    }

    let training = DenoiserDataset::from_split(&config, Split::Training)?;
    log::info!("Training examples: {}", training.len());

    let summaries = trainer.fit(&config, &training, &validation)?;
    let final_loss = summaries.last().map(|s| s.loss);

    if trainer.model().is_initialized() {
        save_checkpoint(
            &config,
            trainer.model(),
            &model_directory,
            Some(trainer.global_step()),
            final_loss,
        )?;
    } else {
        log::warn!("No batch was seen, nothing to save");
    }

    log::info!("Training complete after {} steps", trainer.global_step());
    Ok(())
}
