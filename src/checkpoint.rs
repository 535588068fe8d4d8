//! # Model Checkpointing
//!
//! Save and load denoiser weights together with the configuration that
//! produced them.
//!
//! ## File Format
//!
//! A checkpoint is a directory containing:
//! - `config.json` - configuration and training metadata
//! - `model.safetensors` - every variable of the model
//!
//! Parameters are created lazily on the first forward pass, so loading needs
//! one batch to materialize them before the stored values are copied in.

use std::fs;
use std::path::Path;

use crate::config::DenoiserConfig;
use crate::error::DenoiserError;
use crate::model::{Batch, DenoiserModel};
use crate::DenoiserResult;

/// Metadata stored with checkpoints
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CheckpointMetadata {
    pub config: DenoiserConfig,
    /// Training step when saved
    pub step: Option<usize>,
    /// Training loss when saved
    pub loss: Option<f64>,
    pub timestamp: String,
    pub version: String,
}

impl CheckpointMetadata {
    pub fn new(config: DenoiserConfig) -> Self {
        Self {
            config,
            step: None,
            loss: None,
            timestamp: chrono::Local::now().to_rfc3339(),
            version: crate::VERSION.to_string(),
        }
    }

    pub fn with_training_info(mut self, step: usize, loss: f64) -> Self {
        self.step = Some(step);
        self.loss = Some(loss);
        self
    }

    pub fn from_file(path: impl AsRef<Path>) -> DenoiserResult<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| DenoiserError::Io(format!("Failed to read checkpoint metadata: {}", e)))?;
        serde_json::from_str(&content).map_err(|e| DenoiserError::SerializationError(e.to_string()))
    }
}

/// Save the model's weights to a directory
///
/// ```text
/// checkpoint_dir/
/// ├── config.json       # configuration and metadata
/// └── model.safetensors # weights
/// ```
pub fn save_checkpoint(
    config: &DenoiserConfig,
    model: &DenoiserModel,
    checkpoint_dir: impl AsRef<Path>,
    step: Option<usize>,
    loss: Option<f64>,
) -> DenoiserResult<()> {
    let dir = checkpoint_dir.as_ref();
    if !model.is_initialized() {
        return Err(DenoiserError::configuration(
            "cannot save a model before its first forward pass",
        ));
    }

    fs::create_dir_all(dir).map_err(|e| DenoiserError::Io(format!("Failed to create checkpoint dir: {}", e)))?;

    let mut metadata = CheckpointMetadata::new(config.clone());
    if let (Some(s), Some(l)) = (step, loss) {
        metadata = metadata.with_training_info(s, l);
    }
    let config_json =
        serde_json::to_string_pretty(&metadata).map_err(|e| DenoiserError::SerializationError(e.to_string()))?;
    fs::write(dir.join("config.json"), config_json)
        .map_err(|e| DenoiserError::Io(format!("Failed to write config: {}", e)))?;

    model
        .varmap()
        .save(dir.join("model.safetensors"))
        .map_err(|e| DenoiserError::SerializationError(format!("Failed to save model: {}", e)))?;

    log::info!("Saved checkpoint to {:?}", dir);
    Ok(())
}

/// Load weights from `weights` into `model`, materializing it with `batch`
pub fn load_weights(model: &mut DenoiserModel, weights: impl AsRef<Path>, batch: &Batch) -> DenoiserResult<()> {
    if !model.is_initialized() {
        model.forward(batch, false)?;
    }
    model
        .varmap_mut()
        .load(weights.as_ref())
        .map_err(|e| DenoiserError::SerializationError(format!("Failed to load model: {}", e)))?;
    log::info!("Loaded weights from {:?}", weights.as_ref());
    Ok(())
}

/// Build a model from a checkpoint directory
pub fn load_checkpoint(
    checkpoint_dir: impl AsRef<Path>,
    batch: &Batch,
    device: candle_core::Device,
) -> DenoiserResult<(DenoiserModel, CheckpointMetadata)> {
    let dir = checkpoint_dir.as_ref();
    let metadata = CheckpointMetadata::from_file(dir.join("config.json"))?;
    let mut model = DenoiserModel::new(&metadata.config, device)?;
    load_weights(&mut model, dir.join("model.safetensors"), batch)?;
    Ok((model, metadata))
}

pub fn checkpoint_exists(checkpoint_dir: impl AsRef<Path>) -> bool {
    let dir = checkpoint_dir.as_ref();
    dir.join("config.json").exists() && dir.join("model.safetensors").exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{stack_examples, DenoiserDataset};
    use crate::model::{Mode, ModelOutput};
    use crate::render_passes::RenderPass;
    use candle_core::Device;
    use tempfile::TempDir;

    fn config() -> DenoiserConfig {
        DenoiserConfig::from_json_str(
            r#"{
                "model_directory": "models/test",
                "base_dataset_directory": "data",
                "neural_network": {
                    "number_of_filters_for_convolution_blocks": [4, 4],
                    "number_of_convolutions_per_block": 1,
                    "kernel_size": 3
                },
                "features": {
                    "diffuse_color": { "is_target": true, "loss_weights": { "mean": 1.0 } },
                    "normal": {}
                }
            }"#,
        )
        .unwrap()
    }

    fn predictions(model: &mut DenoiserModel, batch: &Batch) -> Vec<f32> {
        match model.run(batch, Mode::Predict).unwrap() {
            ModelOutput::Predictions(p) => p[&RenderPass::DiffuseColor].flatten_all().unwrap().to_vec1().unwrap(),
            ModelOutput::Loss { .. } => panic!("expected predictions"),
        }
    }

    #[test]
    fn test_checkpoint_metadata() {
        let metadata = CheckpointMetadata::new(config()).with_training_info(1000, 0.5);
        assert_eq!(metadata.step, Some(1000));
        assert_eq!(metadata.loss, Some(0.5));
        assert_eq!(metadata.version, crate::VERSION);
    }

    #[test]
    fn test_uninitialized_model_is_not_saved() {
        let temp_dir = TempDir::new().unwrap();
        let model = DenoiserModel::new(&config(), Device::Cpu).unwrap();
        assert!(save_checkpoint(&config(), &model, temp_dir.path(), None, None).is_err());
    }

    #[test]
    fn test_save_and_load_checkpoint() {
        let device = Device::Cpu;
        let config = config();
        let dataset = DenoiserDataset::synthetic(&config, 2, 8, 1, 0).unwrap();
        let examples = vec![dataset.get(0).unwrap(), dataset.get(1).unwrap()];
        let batch = stack_examples(&examples, &device).unwrap();

        let mut model = DenoiserModel::new(&config, device.clone()).unwrap();
        let expected = predictions(&mut model, &batch);

        let temp_dir = TempDir::new().unwrap();
        let checkpoint_path = temp_dir.path().join("test-checkpoint");
        save_checkpoint(&config, &model, &checkpoint_path, Some(100), Some(0.25)).unwrap();
        assert!(checkpoint_exists(&checkpoint_path));

        let (mut loaded, metadata) = load_checkpoint(&checkpoint_path, &batch, device).unwrap();
        assert_eq!(metadata.step, Some(100));
        assert_eq!(metadata.loss, Some(0.25));
        let actual = predictions(&mut loaded, &batch);
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert!((a - e).abs() < 1e-5);
        }
    }
}
