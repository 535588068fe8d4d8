//! # Denoiser Prediction CLI
//!
//! Denoise one example and store the predicted passes.
//!
//! ```bash
//! denoiser_predict configs/diffuse.json --input noisy.safetensors \
//!     --weights models/diffuse/model.safetensors --output denoised.safetensors
//! ```
//!
//! The output holds `<pass>/prediction` for every target pass and, when every
//! constituent was predicted, the recombined `combined/prediction` image.

use candle_core::{Device, Tensor};
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;

use deep_denoiser::checkpoint::load_weights;
use deep_denoiser::dataset::{load_example, stack_examples};
use deep_denoiser::naming::prediction_feature_name;
use deep_denoiser::{compose_image, DenoiserConfig, DenoiserModel, Mode, ModelOutput, RenderPass};

/// Denoise rendered passes with a trained model
#[derive(Parser, Debug)]
#[command(name = "denoiser_predict")]
#[command(about = "Denoise one example with a trained model")]
#[command(version)]
struct Args {
    /// JSON configuration the model was trained with
    config: PathBuf,

    /// Example with `<pass>/source/0` tensors
    #[arg(long)]
    input: PathBuf,

    /// Trained weights (defaults to the model directory's)
    #[arg(long)]
    weights: Option<PathBuf>,

    /// Output file
    #[arg(long, default_value = "prediction.safetensors")]
    output: PathBuf,

    /// Use CUDA if available
    #[arg(long)]
    cuda: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let device = if args.cuda {
        Device::cuda_if_available(0)?
    } else {
        Device::Cpu
    };

    let config = DenoiserConfig::from_file(&args.config)?;
    let example = load_example(&args.input)?;
    let batch = stack_examples(&[example], &device)?;
    log::info!("Loaded {} tensors from {:?}", batch.len(), args.input);

    let weights = args
        .weights
        .unwrap_or_else(|| config.model_directory.join("model.safetensors"));
    let mut model = DenoiserModel::new(&config, device)?;
    load_weights(&mut model, &weights, &batch)?;

    let predictions = match model.run(&batch, Mode::Predict)? {
        ModelOutput::Predictions(predictions) => predictions,
        ModelOutput::Loss { .. } => anyhow::bail!("model returned a loss in prediction mode"),
    };

    let mut tensors: HashMap<String, Tensor> = HashMap::new();
    for (pass, prediction) in &predictions {
        tensors.insert(prediction_feature_name(*pass), prediction.squeeze(0)?);
    }
    match compose_image(&predictions) {
        Ok(image) => {
            tensors.insert(prediction_feature_name(RenderPass::Combined), image.squeeze(0)?);
        }
        Err(error) => log::warn!("Skipping the combined image: {}", error),
    }

    candle_core::safetensors::save(&tensors, &args.output)?;
    log::info!("Wrote {} predictions to {:?}", tensors.len(), args.output);
    Ok(())
}
