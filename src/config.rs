//! # Configuration
//!
//! JSON configuration of the denoiser: the network, every render-pass feature
//! and the loss weights of the three hierarchy levels. Everything is checked
//! once in [`DenoiserConfig::validate`] so that inconsistent setups abort
//! before any tensor is touched.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::DenoiserError;
use crate::loss_difference::LossDifference;
use crate::render_passes::{RenderPass, COMBINED_MATERIAL_PASSES};
use crate::variance::VarianceMode;
use crate::DenoiserResult;

/// Backbone family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    Tiramisu,
    #[serde(rename = "unet")]
    UNet,
}

/// Network and prediction-pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NeuralNetworkConfig {
    pub architecture: Architecture,
    /// One entry per pyramid level, finest first
    pub number_of_filters_for_convolution_blocks: Vec<usize>,
    pub number_of_convolutions_per_block: usize,
    pub use_batch_normalization: bool,
    pub dropout_rate: f64,
    /// One shared network invoked once per target pass
    pub use_single_feature_prediction: bool,
    /// Ordered flag names available to single-feature prediction
    pub feature_flags: Vec<String>,
    pub use_multiscale_predictions: bool,
    pub invert_standardization_after_multiscale_predictions: bool,
    pub use_multiscale_loss: bool,
    pub use_multiscale_metrics: bool,
    pub use_kernel_prediction: bool,
    pub kernel_size: usize,
}

impl Default for NeuralNetworkConfig {
    fn default() -> Self {
        Self {
            architecture: Architecture::Tiramisu,
            number_of_filters_for_convolution_blocks: vec![32, 48, 64],
            number_of_convolutions_per_block: 3,
            use_batch_normalization: false,
            dropout_rate: 0.0,
            use_single_feature_prediction: false,
            feature_flags: Vec::new(),
            use_multiscale_predictions: true,
            invert_standardization_after_multiscale_predictions: false,
            use_multiscale_loss: true,
            use_multiscale_metrics: true,
            use_kernel_prediction: true,
            kernel_size: 5,
        }
    }
}

impl NeuralNetworkConfig {
    /// Number of pyramid scales the backbone emits
    pub fn number_of_scales(&self) -> usize {
        if self.use_multiscale_predictions {
            self.number_of_filters_for_convolution_blocks.len()
        } else {
            1
        }
    }

    /// Channels the backbone emits per target pass
    pub fn output_channels(&self, number_of_channels: usize) -> usize {
        if self.use_kernel_prediction {
            self.kernel_size * self.kernel_size
        } else {
            number_of_channels
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StandardizationConfig {
    pub use_log1p: bool,
    pub mean: f64,
    pub variance: f64,
}

impl Default for StandardizationConfig {
    fn default() -> Self {
        Self {
            use_log1p: false,
            mean: 0.0,
            variance: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureVarianceConfig {
    pub use_variance: bool,
    pub variance_mode: VarianceMode,
    pub relative_variance: bool,
    pub compute_before_standardization: bool,
    pub compress_to_one_channel: bool,
}

impl Default for FeatureVarianceConfig {
    fn default() -> Self {
        Self {
            use_variance: false,
            variance_mode: VarianceMode::Homogeneous5x5,
            relative_variance: false,
            compute_before_standardization: true,
            compress_to_one_channel: true,
        }
    }
}

/// Weights of the three loss terms; a weight ≤ 0 disables its term
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossWeights {
    pub mean: f64,
    pub variation: f64,
    pub ms_ssim: f64,
}

impl LossWeights {
    pub fn is_active(&self) -> bool {
        self.mean > 0.0 || self.variation > 0.0 || self.ms_ssim > 0.0
    }
}

/// Which metrics are tracked for a feature
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Statistics {
    pub track_mean: bool,
    pub track_variation: bool,
    pub track_ms_ssim: bool,
    pub track_difference_histogram: bool,
    pub track_variation_difference_histogram: bool,
}

impl Statistics {
    pub fn is_active(&self) -> bool {
        self.track_mean
            || self.track_variation
            || self.track_ms_ssim
            || self.track_difference_histogram
            || self.track_variation_difference_histogram
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub is_source: bool,
    pub is_target: bool,
    /// Defaults to the pass's natural channel count
    pub number_of_channels: Option<usize>,
    pub feature_flags: Vec<String>,
    pub standardization: Option<StandardizationConfig>,
    pub invert_standardization: bool,
    pub feature_variance: FeatureVarianceConfig,
    pub loss_weights: LossWeights,
    pub loss_weights_masked: LossWeights,
    pub statistics: Statistics,
    pub statistics_masked: Statistics,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            is_source: true,
            is_target: false,
            number_of_channels: None,
            feature_flags: Vec::new(),
            standardization: None,
            invert_standardization: true,
            feature_variance: FeatureVarianceConfig::default(),
            loss_weights: LossWeights::default(),
            loss_weights_masked: LossWeights::default(),
            statistics: Statistics::default(),
            statistics_masked: Statistics::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CombinedFeatureConfig {
    pub loss_weights: LossWeights,
    pub loss_weights_masked: LossWeights,
    pub statistics: Statistics,
    pub statistics_masked: Statistics,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CombinedImageConfig {
    pub loss_weights: LossWeights,
    pub statistics: Statistics,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DataAugmentationConfig {
    pub use_rotate_90: bool,
    pub use_flip_left_right: bool,
    pub use_rgb_permutation: bool,
}

impl Default for DataAugmentationConfig {
    fn default() -> Self {
        Self {
            use_rotate_90: true,
            use_flip_left_right: true,
            use_rgb_permutation: true,
        }
    }
}

/// Statistics stored next to a dataset split
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetStatistics {
    pub tiles_height_width: usize,
    pub number_of_sources_per_example: usize,
}

impl DatasetStatistics {
    pub fn from_file(path: impl AsRef<Path>) -> DenoiserResult<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| DenoiserError::Io(format!("Failed to read dataset statistics: {}", e)))?;
        serde_json::from_str(&content).map_err(|e| DenoiserError::SerializationError(e.to_string()))
    }
}

/// Complete denoiser configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenoiserConfig {
    pub model_directory: PathBuf,
    pub base_dataset_directory: PathBuf,
    #[serde(default)]
    pub neural_network: NeuralNetworkConfig,
    #[serde(default = "default_one")]
    pub number_of_sources_per_target: usize,
    #[serde(default = "default_one")]
    pub number_of_source_index_tuples: usize,
    #[serde(default)]
    pub data_augmentation: DataAugmentationConfig,
    #[serde(default)]
    pub loss_difference: LossDifference,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    pub features: BTreeMap<String, FeatureConfig>,
    #[serde(default)]
    pub combined_features: BTreeMap<String, CombinedFeatureConfig>,
    #[serde(default)]
    pub combined_image: CombinedImageConfig,
}

fn default_one() -> usize {
    1
}

fn default_learning_rate() -> f64 {
    1e-3
}

fn default_batch_size() -> usize {
    8
}

impl DenoiserConfig {
    /// Load and validate a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> DenoiserResult<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| DenoiserError::Io(format!("Failed to read config: {}", e)))?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> DenoiserResult<Self> {
        let config: DenoiserConfig = serde_json::from_str(content)
            .map_err(|e| DenoiserError::configuration(format!("invalid configuration json: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Features keyed by pass
    pub fn feature_passes(&self) -> DenoiserResult<BTreeMap<RenderPass, &FeatureConfig>> {
        self.features
            .iter()
            .map(|(name, feature)| -> DenoiserResult<_> { Ok((name.parse::<RenderPass>()?, feature)) })
            .collect()
    }

    /// Combined feature configs keyed by pass
    pub fn combined_feature_passes(&self) -> DenoiserResult<BTreeMap<RenderPass, &CombinedFeatureConfig>> {
        self.combined_features
            .iter()
            .map(|(name, feature)| -> DenoiserResult<_> {
                let pass = name.parse::<RenderPass>()?;
                if pass.combined_constituents().is_none() {
                    return Err(DenoiserError::configuration(format!(
                        "'{}' is not a combined material pass",
                        name
                    )));
                }
                Ok((pass, feature))
            })
            .collect()
    }

    pub fn validate(&self) -> DenoiserResult<()> {
        let network = &self.neural_network;
        if network.number_of_filters_for_convolution_blocks.is_empty() {
            return Err(DenoiserError::configuration(
                "number_of_filters_for_convolution_blocks must not be empty",
            ));
        }
        if network.use_kernel_prediction && network.kernel_size % 2 == 0 {
            return Err(DenoiserError::configuration(format!(
                "kernel_size must be odd, got {}",
                network.kernel_size
            )));
        }
        if !(0.0..1.0).contains(&network.dropout_rate) {
            return Err(DenoiserError::configuration("dropout_rate must be in [0, 1)"));
        }
        if self.number_of_sources_per_target == 0 {
            return Err(DenoiserError::configuration("number_of_sources_per_target must be positive"));
        }
        if self.batch_size == 0 {
            return Err(DenoiserError::configuration("batch_size must be positive"));
        }
        if self.learning_rate <= 0.0 {
            return Err(DenoiserError::configuration("learning_rate must be positive"));
        }

        let features = self.feature_passes()?;
        let mut targets = Vec::new();
        for (pass, feature) in &features {
            self.validate_feature(*pass, feature)?;
            if feature.is_source && feature.is_target {
                targets.push(*pass);
            }
        }
        if targets.is_empty() {
            return Err(DenoiserError::configuration("at least one feature must be a target"));
        }
        for (pass, feature) in features.iter().filter(|(p, _)| targets.contains(p)) {
            let masked_requested = feature.loss_weights_masked.is_active() || feature.statistics_masked.is_active();
            if let Some(source) = pass.mask_source().filter(|_| masked_requested) {
                if !targets.contains(&source) {
                    return Err(DenoiserError::configuration(format!(
                        "masked metrics of '{}' require '{}' to be a target",
                        pass, source
                    )));
                }
            }
        }

        if network.use_single_feature_prediction {
            self.validate_single_feature_inputs(&features)?;
        }

        for (pass, combined) in self.combined_feature_passes()? {
            validate_masked_ms_ssim(pass, &combined.loss_weights_masked, &combined.statistics_masked)?;
            if combined.loss_weights.is_active() || combined.loss_weights_masked.is_active() {
                require_combined_constituents(pass, &targets)?;
            }
        }

        if self.combined_image.loss_weights.is_active() || self.combined_image.statistics.is_active() {
            for pass in COMBINED_MATERIAL_PASSES {
                require_combined_constituents(pass, &targets)?;
            }
            for pass in [RenderPass::Emission, RenderPass::Environment] {
                if !targets.contains(&pass) {
                    return Err(DenoiserError::configuration(format!(
                        "combined image requires '{}' to be a target",
                        pass
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_feature(&self, pass: RenderPass, feature: &FeatureConfig) -> DenoiserResult<()> {
        if feature.is_target && !feature.is_source {
            return Err(DenoiserError::configuration(format!(
                "'{}' is a target but not a source",
                pass
            )));
        }
        if feature.is_target && !pass.is_predictable() {
            return Err(DenoiserError::configuration(format!("'{}' cannot be predicted directly", pass)));
        }
        if feature.number_of_channels == Some(0) {
            return Err(DenoiserError::configuration(format!("'{}' has zero channels", pass)));
        }
        if let Some(standardization) = &feature.standardization {
            if standardization.variance <= 0.0 {
                return Err(DenoiserError::configuration(format!(
                    "'{}' standardization variance must be positive",
                    pass
                )));
            }
        }
        for flag in &feature.feature_flags {
            if !self.neural_network.feature_flags.contains(flag) {
                return Err(DenoiserError::configuration(format!(
                    "'{}' uses unknown feature flag '{}'",
                    pass, flag
                )));
            }
        }
        validate_masked_ms_ssim(pass, &feature.loss_weights_masked, &feature.statistics_masked)?;
        let masked_requested = feature.loss_weights_masked.is_active() || feature.statistics_masked.is_active();
        if feature.is_target && masked_requested && pass.mask_source().is_none() {
            return Err(DenoiserError::configuration(format!(
                "'{}' has no corresponding color pass to derive a mask from",
                pass
            )));
        }
        Ok(())
    }

    /// A shared network needs the same input and output layout for every target
    fn validate_single_feature_inputs(&self, features: &BTreeMap<RenderPass, &FeatureConfig>) -> DenoiserResult<()> {
        let mut layout: Option<(RenderPass, usize, usize)> = None;
        for (pass, feature) in features.iter().filter(|(_, f)| f.is_source && f.is_target) {
            let channels = feature.number_of_channels.unwrap_or_else(|| pass.number_of_channels());
            let variance_channels = if !feature.feature_variance.use_variance {
                0
            } else if feature.feature_variance.compress_to_one_channel {
                1
            } else {
                channels
            };
            let output = self.neural_network.output_channels(channels);
            match layout {
                None => layout = Some((*pass, channels + variance_channels, output)),
                Some((first, input, expected_output)) => {
                    if input != channels + variance_channels || output != expected_output {
                        return Err(DenoiserError::configuration(format!(
                            "single feature prediction requires '{}' and '{}' to share their channel layout",
                            first, pass
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

fn validate_masked_ms_ssim(pass: RenderPass, weights: &LossWeights, statistics: &Statistics) -> DenoiserResult<()> {
    if weights.ms_ssim > 0.0 || statistics.track_ms_ssim {
        return Err(DenoiserError::configuration(format!(
            "masked MS-SSIM is not implemented ('{}')",
            pass
        )));
    }
    Ok(())
}

fn require_combined_constituents(pass: RenderPass, targets: &[RenderPass]) -> DenoiserResult<()> {
    let (color, direct, indirect) = pass
        .combined_constituents()
        .ok_or_else(|| DenoiserError::configuration(format!("'{}' is not a combined material pass", pass)))?;
    for constituent in [color, direct, indirect] {
        if !targets.contains(&constituent) {
            return Err(DenoiserError::configuration(format!(
                "'{}' requires '{}' to be a target",
                pass, constituent
            )));
        }
    }
    Ok(())
}
