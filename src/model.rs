//! # Denoiser Model
//!
//! Forward pipeline of one batch:
//!
//! ```text
//! standardize ─▶ backbone ─▶ kernel filter ─▶ invert* ─▶ compose scales ─▶ invert*
//! ```
//!
//! `invert*` runs exactly once, before or after composition. The backbone is
//! either called once over every pass (combined features) or once per target
//! pass with shared weights (single feature).

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use std::collections::BTreeMap;

use crate::backbone::Backbone;
use crate::config::{DenoiserConfig, NeuralNetworkConfig};
use crate::error::DenoiserError;
use crate::feature_flags::FeatureFlags;
use crate::kernel_prediction::kernel_prediction;
use crate::multiscale::{scale_down, scale_pyramid, MultiscaleComposition};
use crate::naming;
use crate::prediction_feature::PredictionFeature;
use crate::render_passes::RenderPass;
use crate::training_feature::{MetricValue, PredictedTarget, TrainingFeatureSet};
use crate::DenoiserResult;

/// Named tensors of one batch, `[B, C, H, W]`
pub type Batch = BTreeMap<String, Tensor>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Loss and metrics, dropout and batch statistics active
    Train,
    /// Loss and metrics in inference mode
    Evaluate,
    /// Finest-scale predictions only
    Predict,
}

impl Mode {
    pub fn is_training(&self) -> bool {
        matches!(self, Mode::Train)
    }
}

#[derive(Debug)]
pub enum ModelOutput {
    Loss {
        loss: Tensor,
        metrics: Vec<(String, MetricValue)>,
    },
    Predictions(BTreeMap<RenderPass, Tensor>),
}

pub struct DenoiserModel {
    network: NeuralNetworkConfig,
    features: BTreeMap<RenderPass, PredictionFeature>,
    feature_flags: Option<FeatureFlags>,
    training_features: TrainingFeatureSet,
    backbone: Option<Backbone>,
    composition: MultiscaleComposition,
    varmap: VarMap,
    device: Device,
}

impl DenoiserModel {
    pub fn new(config: &DenoiserConfig, device: Device) -> DenoiserResult<Self> {
        config.validate()?;
        let network = config.neural_network.clone();
        let number_of_scales = network.number_of_scales();

        let features: BTreeMap<RenderPass, PredictionFeature> = config
            .feature_passes()?
            .into_iter()
            .filter(|(_, feature)| feature.is_source)
            .map(|(pass, feature)| {
                let prediction_feature =
                    PredictionFeature::new(pass, feature, config.number_of_sources_per_target, number_of_scales);
                (pass, prediction_feature)
            })
            .collect();

        let feature_flags = if network.use_single_feature_prediction && !network.feature_flags.is_empty() {
            let mut flags = FeatureFlags::new(network.feature_flags.clone());
            for feature in features.values().filter(|f| f.is_target) {
                flags.add_render_pass(feature.pass, &feature.feature_flag_names)?;
            }
            flags.freeze();
            Some(flags)
        } else {
            None
        };

        let training_features = TrainingFeatureSet::new(config)?;
        log::info!(
            "Denoiser model with {} features ({} targets), {} scales",
            features.len(),
            features.values().filter(|f| f.is_target).count(),
            number_of_scales
        );

        Ok(Self {
            network,
            features,
            feature_flags,
            training_features,
            backbone: None,
            composition: MultiscaleComposition::new(),
            varmap: VarMap::new(),
            device,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Every trainable variable, including lazily created ones
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn varmap_mut(&mut self) -> &mut VarMap {
        &mut self.varmap
    }

    pub fn is_initialized(&self) -> bool {
        self.backbone.is_some()
    }

    pub fn training_features(&self) -> &TrainingFeatureSet {
        &self.training_features
    }

    /// Every source pass, targets included
    pub fn passes(&self) -> Vec<RenderPass> {
        self.features.keys().copied().collect()
    }

    pub fn target_passes(&self) -> Vec<RenderPass> {
        self.features.values().filter(|f| f.is_target).map(|f| f.pass).collect()
    }

    fn non_target_passes(&self) -> Vec<RenderPass> {
        self.features.values().filter(|f| !f.is_target).map(|f| f.pass).collect()
    }

    fn feature(&self, pass: RenderPass) -> DenoiserResult<&PredictionFeature> {
        self.features
            .get(&pass)
            .ok_or_else(|| DenoiserError::configuration(format!("unknown feature '{}'", pass)))
    }

    fn var_builder(&self) -> VarBuilder<'static> {
        VarBuilder::from_varmap(&self.varmap, DType::F32, &self.device)
    }

    /// Run one batch in `mode`.
    ///
    /// Training leaves the metrics empty; [`DenoiserModel::metrics`] computes
    /// them from the same forward pass when they are logged.
    pub fn run(&mut self, batch: &Batch, mode: Mode) -> DenoiserResult<ModelOutput> {
        self.forward(batch, mode.is_training())?;
        match mode {
            Mode::Predict => Ok(ModelOutput::Predictions(self.finest_predictions()?)),
            Mode::Train => {
                let resolved = self.resolve_targets(batch)?;
                let loss = self.training_features.total_loss(&resolved, &self.device)?;
                Ok(ModelOutput::Loss {
                    loss,
                    metrics: Vec::new(),
                })
            }
            Mode::Evaluate => {
                let resolved = self.resolve_targets(batch)?;
                let loss = self.training_features.total_loss(&resolved, &self.device)?;
                let metrics = self.training_features.metrics(&resolved)?;
                Ok(ModelOutput::Loss { loss, metrics })
            }
        }
    }

    /// Prediction dictionary at scale 0
    pub fn finest_predictions(&self) -> DenoiserResult<BTreeMap<RenderPass, Tensor>> {
        let mut dictionary = BTreeMap::new();
        for feature in self.features.values() {
            feature.add_prediction_to_dictionary(0, &mut dictionary)?;
        }
        Ok(dictionary)
    }

    /// Scales the loss and metrics look at
    fn number_of_target_scales(&self) -> usize {
        if self.network.use_multiscale_loss || self.network.use_multiscale_metrics {
            self.network.number_of_scales()
        } else {
            1
        }
    }

    /// Tracked metrics of the last forward pass against the targets of `batch`
    pub fn metrics(&self, batch: &Batch) -> DenoiserResult<Vec<(String, MetricValue)>> {
        let resolved = self.resolve_targets(batch)?;
        self.training_features.metrics(&resolved)
    }

    fn resolve_targets(&self, batch: &Batch) -> DenoiserResult<BTreeMap<RenderPass, PredictedTarget>> {
        let scales = self.number_of_target_scales();
        let mut predictions = BTreeMap::new();
        let mut targets = BTreeMap::new();
        for pass in self.target_passes() {
            let name = naming::target_feature_name(pass);
            let target = batch
                .get(&name)
                .ok_or_else(|| DenoiserError::configuration(format!("missing target tensor '{}'", name)))?;
            targets.insert(pass, scale_pyramid(target, scales)?);
            let mut feature_predictions = self.feature(pass)?.predictions()?;
            feature_predictions.truncate(scales);
            predictions.insert(pass, feature_predictions);
        }
        self.training_features.resolve(&predictions, &targets)
    }

    /// Fill every target feature's per-scale predictions
    pub fn forward(&mut self, batch: &Batch, train: bool) -> DenoiserResult<()> {
        for feature in self.features.values_mut() {
            feature.initialize_sources(batch)?;
            feature.standardize()?;
            feature.clear_predictions();
        }

        let outputs = if self.network.use_single_feature_prediction {
            self.predict_single_features(train)?
        } else {
            self.predict_combined_features(train)?
        };

        let vb = self.var_builder();
        for (pass, per_scale) in outputs {
            let feature = self
                .features
                .get_mut(&pass)
                .ok_or_else(|| DenoiserError::configuration(format!("unknown feature '{}'", pass)))?;
            finish_predictions(&self.network, feature, per_scale, &mut self.composition, &vb)?;
        }
        Ok(())
    }

    /// Backbone outputs for `input`, creating the backbone on first use
    fn run_backbone(&mut self, input: &Tensor, output_channels: usize, train: bool) -> DenoiserResult<Vec<Tensor>> {
        if self.backbone.is_none() {
            let vb = self.var_builder();
            let backbone = Backbone::new(&self.network, input.dim(1)?, output_channels, vb.pp("backbone"))?;
            self.backbone = Some(backbone);
        }
        let backbone = self
            .backbone
            .as_ref()
            .ok_or_else(|| DenoiserError::configuration("backbone unavailable"))?;
        if backbone.output_channels() != output_channels {
            return Err(DenoiserError::shape_mismatch(
                "backbone output channels",
                &[backbone.output_channels()],
                &[output_channels],
            ));
        }
        backbone.forward_t(input, train)
    }

    /// Every target's first source, then the targets' remaining sources,
    /// then all non-target sources, each followed by its variance
    fn combined_feature_inputs(&self) -> DenoiserResult<Vec<Tensor>> {
        let targets = self.target_passes();
        let mut inputs = Vec::new();
        for pass in &targets {
            inputs.extend(self.feature(*pass)?.network_inputs(0)?);
        }
        for pass in &targets {
            let feature = self.feature(*pass)?;
            for index in 1..feature.number_of_sources {
                inputs.extend(feature.network_inputs(index)?);
            }
        }
        for pass in self.non_target_passes() {
            let feature = self.feature(pass)?;
            for index in 0..feature.number_of_sources {
                inputs.extend(feature.network_inputs(index)?);
            }
        }
        Ok(inputs)
    }

    /// One call over all passes, split per target in pass order
    fn predict_combined_features(&mut self, train: bool) -> DenoiserResult<BTreeMap<RenderPass, Vec<Tensor>>> {
        let targets = self.target_passes();
        let input = Tensor::cat(&self.combined_feature_inputs()?, 1)?;

        let widths = targets
            .iter()
            .map(|pass| -> DenoiserResult<usize> {
                Ok(self.network.output_channels(self.feature(*pass)?.number_of_channels))
            })
            .collect::<DenoiserResult<Vec<_>>>()?;
        let outputs = self.run_backbone(&input, widths.iter().sum(), train)?;

        let mut split = BTreeMap::new();
        let mut offset = 0;
        for (pass, width) in targets.into_iter().zip(widths) {
            let slices = outputs
                .iter()
                .map(|output| output.narrow(1, offset, width))
                .collect::<candle_core::Result<Vec<_>>>()?;
            split.insert(pass, slices);
            offset += width;
        }
        Ok(split)
    }

    /// One call per target over its flags, own sources and non-target sources
    fn predict_single_features(&mut self, train: bool) -> DenoiserResult<BTreeMap<RenderPass, Vec<Tensor>>> {
        let non_targets = self.non_target_passes();
        let mut outputs = BTreeMap::new();
        for pass in self.target_passes() {
            let feature = self.feature(pass)?;
            let mut inputs = Vec::new();
            if let Some(flags) = &self.feature_flags {
                let (batch, _, height, width) = feature.source(0)?.dims4()?;
                inputs.push(flags.feature_flags(pass, batch, height, width, &self.device)?);
            }
            for index in 0..feature.number_of_sources {
                inputs.extend(feature.network_inputs(index)?);
                for other in &non_targets {
                    inputs.extend(self.feature(*other)?.network_inputs(index)?);
                }
            }
            let input = Tensor::cat(&inputs, 1)?;
            let width = self.network.output_channels(feature.number_of_channels);
            outputs.insert(pass, self.run_backbone(&input, width, train)?);
        }
        Ok(outputs)
    }
}

/// Kernel filter, invert and compose the backbone outputs of one feature.
///
/// Inversion runs once, before or after composition as configured.
fn finish_predictions(
    network: &NeuralNetworkConfig,
    feature: &mut PredictionFeature,
    per_scale: Vec<Tensor>,
    composition: &mut MultiscaleComposition,
    vb: &VarBuilder,
) -> DenoiserResult<()> {
    for (scale_index, output) in per_scale.into_iter().enumerate() {
        let prediction = if network.use_kernel_prediction {
            let source = scale_down(feature.source(0)?, 1 << scale_index)?;
            kernel_prediction(&source, &output, network.kernel_size)?
        } else {
            output
        };
        feature.add_prediction(scale_index, prediction)?;
    }

    let invert_after_composition = network.invert_standardization_after_multiscale_predictions;
    if !invert_after_composition {
        feature.invert_predictions()?;
    }
    if network.use_multiscale_predictions {
        let composed = composition.compose(&feature.predictions()?, vb)?;
        for (scale_index, prediction) in composed.into_iter().enumerate() {
            feature.add_prediction(scale_index, prediction)?;
        }
    }
    if invert_after_composition {
        feature.invert_predictions()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(single_feature: bool) -> DenoiserConfig {
        let json = format!(
            r#"{{
                "model_directory": "models/test",
                "base_dataset_directory": "data",
                "batch_size": 2,
                "neural_network": {{
                    "number_of_filters_for_convolution_blocks": [4, 6],
                    "number_of_convolutions_per_block": 1,
                    "use_single_feature_prediction": {},
                    "feature_flags": ["color", "direct"],
                    "kernel_size": 3
                }},
                "features": {{
                    "diffuse_color": {{ "is_target": true, "feature_flags": ["color"],
                        "standardization": {{ "use_log1p": true }},
                        "loss_weights": {{ "mean": 1.0 }} }},
                    "diffuse_direct": {{ "is_target": true, "feature_flags": ["direct"],
                        "loss_weights": {{ "mean": 1.0, "variation": 0.5 }},
                        "loss_weights_masked": {{ "mean": 1.0 }} }},
                    "normal": {{ "feature_variance": {{ "use_variance": true }} }}
                }}
            }}"#,
            single_feature
        );
        DenoiserConfig::from_json_str(&json).unwrap()
    }

    fn batch(device: &Device) -> Batch {
        let mut batch = Batch::new();
        for pass in [RenderPass::DiffuseColor, RenderPass::DiffuseDirect, RenderPass::Normal] {
            let source = Tensor::rand(0f32, 1.0, (2, 3, 8, 8), device).unwrap();
            batch.insert(naming::source_feature_name(pass, 0), source);
            batch.insert(
                naming::target_feature_name(pass),
                Tensor::rand(0f32, 1.0, (2, 3, 8, 8), device).unwrap(),
            );
        }
        batch
    }

    fn assert_runs(single_feature: bool) {
        let device = Device::Cpu;
        let mut model = DenoiserModel::new(&config(single_feature), device.clone()).unwrap();
        let batch = batch(&device);
        match model.run(&batch, Mode::Train).unwrap() {
            ModelOutput::Loss { loss, .. } => {
                let loss: f32 = loss.to_scalar().unwrap();
                assert!(loss.is_finite());
            }
            ModelOutput::Predictions(_) => panic!("expected a loss"),
        }
        let variables = model.varmap().all_vars().len();
        match model.run(&batch, Mode::Predict).unwrap() {
            ModelOutput::Predictions(predictions) => {
                assert_eq!(predictions.len(), 2);
                assert_eq!(predictions[&RenderPass::DiffuseColor].dims(), &[2, 3, 8, 8]);
            }
            ModelOutput::Loss { .. } => panic!("expected predictions"),
        }
        assert_eq!(model.varmap().all_vars().len(), variables);
    }

    #[test]
    fn test_combined_features_forward() {
        assert_runs(false);
    }

    #[test]
    fn test_single_feature_forward_shares_weights() {
        assert_runs(true);
    }

    #[test]
    fn test_missing_source_is_reported() {
        let device = Device::Cpu;
        let mut model = DenoiserModel::new(&config(false), device.clone()).unwrap();
        let mut batch = batch(&device);
        batch.remove(&naming::source_feature_name(RenderPass::Normal, 0));
        assert!(matches!(
            model.run(&batch, Mode::Predict),
            Err(DenoiserError::Configuration(_))
        ));
    }

    fn max_difference(a: &Tensor, b: &Tensor) -> f32 {
        (a - b).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap()
    }

    fn standardized_target() -> PredictionFeature {
        let config = crate::config::FeatureConfig {
            is_target: true,
            standardization: Some(crate::config::StandardizationConfig {
                use_log1p: true,
                mean: 0.5,
                variance: 2.0,
            }),
            ..Default::default()
        };
        PredictionFeature::new(RenderPass::DiffuseColor, &config, 1, 2)
    }

    #[test]
    fn test_inversion_order() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut composition = MultiscaleComposition::new();

        let fine = Tensor::rand(-1f32, 1.0, (1, 3, 8, 8), &device).unwrap();
        let coarse = Tensor::rand(-1f32, 1.0, (1, 3, 4, 4), &device).unwrap();
        let standardization = standardized_target().standardization.unwrap();

        let inverted = [
            standardization.invert(&fine).unwrap(),
            standardization.invert(&coarse).unwrap(),
        ];
        let invert_then_compose = composition.compose(&inverted, &vb).unwrap().remove(0);
        let composed = composition.compose(&[fine.clone(), coarse.clone()], &vb).unwrap();
        let compose_then_invert = standardization.invert(&composed[0]).unwrap();
        assert!(max_difference(&invert_then_compose, &compose_then_invert) > 1e-4);

        for (invert_after, expected) in [(false, &invert_then_compose), (true, &compose_then_invert)] {
            let network = NeuralNetworkConfig {
                use_kernel_prediction: false,
                use_multiscale_predictions: true,
                invert_standardization_after_multiscale_predictions: invert_after,
                ..Default::default()
            };
            let mut feature = standardized_target();
            finish_predictions(
                &network,
                &mut feature,
                vec![fine.clone(), coarse.clone()],
                &mut composition,
                &vb,
            )
            .unwrap();
            let finest = feature.prediction(0).unwrap();
            assert!(max_difference(finest, expected) < 1e-5, "invert_after = {}", invert_after);
        }
    }

    #[test]
    fn test_direct_output_channels() {
        let device = Device::Cpu;
        let mut config = config(false);
        config.neural_network.use_kernel_prediction = false;
        let mut model = DenoiserModel::new(&config, device.clone()).unwrap();
        let batch = batch(&device);
        match model.run(&batch, Mode::Predict).unwrap() {
            ModelOutput::Predictions(predictions) => {
                for prediction in predictions.values() {
                    assert_eq!(prediction.dims(), &[2, 3, 8, 8]);
                }
            }
            ModelOutput::Loss { .. } => panic!("expected predictions"),
        }
        let backbone = model.backbone.as_ref().unwrap();
        assert_eq!(backbone.output_channels(), 6);
    }

    fn backbone_variables(targets: &[&str]) -> usize {
        let features = targets
            .iter()
            .map(|name| {
                let flag = name.trim_start_matches("diffuse_");
                format!(
                    r#""{}": {{ "is_target": true, "feature_flags": ["{}"], "loss_weights": {{ "mean": 1.0 }} }},"#,
                    name, flag
                )
            })
            .collect::<String>();
        let json = format!(
            r#"{{
                "model_directory": "models/test",
                "base_dataset_directory": "data",
                "neural_network": {{
                    "number_of_filters_for_convolution_blocks": [4, 6],
                    "number_of_convolutions_per_block": 1,
                    "use_single_feature_prediction": true,
                    "feature_flags": ["color", "direct"],
                    "kernel_size": 3
                }},
                "features": {{
                    {}
                    "normal": {{}}
                }}
            }}"#,
            features
        );
        let device = Device::Cpu;
        let mut model = DenoiserModel::new(&DenoiserConfig::from_json_str(&json).unwrap(), device.clone()).unwrap();
        model.forward(&batch(&device), false).unwrap();
        let data = model.varmap().data().lock().unwrap();
        let count = data.keys().filter(|name| name.starts_with("backbone.")).count();
        count
    }

    #[test]
    fn test_single_feature_backbone_is_shared() {
        let one = backbone_variables(&["diffuse_color"]);
        let two = backbone_variables(&["diffuse_color", "diffuse_direct"]);
        assert!(one > 0);
        assert_eq!(one, two);
    }

    #[test]
    fn test_combined_input_order() {
        let json = r#"{
            "model_directory": "models/test",
            "base_dataset_directory": "data",
            "number_of_sources_per_target": 2,
            "neural_network": {
                "number_of_filters_for_convolution_blocks": [4, 6],
                "number_of_convolutions_per_block": 1,
                "kernel_size": 3
            },
            "features": {
                "diffuse_color": { "is_target": true, "loss_weights": { "mean": 1.0 } },
                "diffuse_direct": { "is_target": true, "loss_weights": { "mean": 1.0 } },
                "normal": {}
            }
        }"#;
        let device = Device::Cpu;
        let mut model = DenoiserModel::new(&DenoiserConfig::from_json_str(json).unwrap(), device.clone()).unwrap();

        let mut batch = Batch::new();
        for (pass, base) in [
            (RenderPass::DiffuseColor, 10f32),
            (RenderPass::DiffuseDirect, 20.0),
            (RenderPass::Normal, 30.0),
        ] {
            for index in 0..2 {
                let source = Tensor::full(base + index as f32, (1, 3, 8, 8), &device).unwrap();
                batch.insert(naming::source_feature_name(pass, index), source);
            }
        }
        model.forward(&batch, false).unwrap();

        let order: Vec<f32> = model
            .combined_feature_inputs()
            .unwrap()
            .iter()
            .map(|input| input.mean_all().unwrap().to_scalar().unwrap())
            .collect();
        // targets iterate in pass order, direct before color
        assert_eq!(order, vec![20.0, 10.0, 21.0, 11.0, 30.0, 31.0]);
    }

    #[test]
    fn test_training_defers_metrics() {
        let device = Device::Cpu;
        let mut config = config(false);
        for feature in config.features.values_mut().filter(|f| f.is_target) {
            feature.statistics.track_mean = true;
        }
        let mut model = DenoiserModel::new(&config, device.clone()).unwrap();
        let batch = batch(&device);
        match model.run(&batch, Mode::Train).unwrap() {
            ModelOutput::Loss { metrics, .. } => assert!(metrics.is_empty()),
            ModelOutput::Predictions(_) => panic!("expected a loss"),
        }
        assert!(!model.metrics(&batch).unwrap().is_empty());
        match model.run(&batch, Mode::Evaluate).unwrap() {
            ModelOutput::Loss { metrics, .. } => assert!(!metrics.is_empty()),
            ModelOutput::Predictions(_) => panic!("expected a loss"),
        }
    }
}
