//! # Prediction Features
//!
//! One render pass as seen by the network: its noisy source realizations,
//! their standardized form and variance channels, and the predictions the
//! pipeline produces for it at every pyramid scale (index 0 = finest).

use candle_core::Tensor;
use std::collections::BTreeMap;

use crate::config::FeatureConfig;
use crate::error::DenoiserError;
use crate::naming;
use crate::render_passes::RenderPass;
use crate::standardization::FeatureStandardization;
use crate::variance::{FeatureVariance, DEFAULT_EPSILON};
use crate::DenoiserResult;

#[derive(Debug, Clone)]
pub struct PredictionFeature {
    pub pass: RenderPass,
    pub number_of_sources: usize,
    pub is_target: bool,
    pub standardization: Option<FeatureStandardization>,
    pub invert_standardization: bool,
    pub feature_variance: FeatureVariance,
    pub feature_flag_names: Vec<String>,
    pub number_of_channels: usize,
    number_of_scales: usize,
    sources: Vec<Tensor>,
    variances: Vec<Tensor>,
    predictions: Vec<Option<Tensor>>,
}

impl PredictionFeature {
    pub fn new(
        pass: RenderPass,
        config: &FeatureConfig,
        number_of_sources: usize,
        number_of_scales: usize,
    ) -> Self {
        Self {
            pass,
            number_of_sources,
            is_target: config.is_target,
            standardization: config.standardization.as_ref().map(FeatureStandardization::from_config),
            invert_standardization: config.invert_standardization,
            feature_variance: FeatureVariance::from_config(&config.feature_variance),
            feature_flag_names: config.feature_flags.clone(),
            number_of_channels: config.number_of_channels.unwrap_or_else(|| pass.number_of_channels()),
            number_of_scales,
            sources: Vec::new(),
            variances: Vec::new(),
            predictions: Vec::new(),
        }
    }

    /// Channels this feature contributes to the network input per source index
    pub fn input_channels(&self) -> usize {
        self.number_of_channels + self.feature_variance.output_channels(self.number_of_channels)
    }

    /// Load `"<pass>/source/<i>"` tensors for every source index
    pub fn initialize_sources(&mut self, batch: &BTreeMap<String, Tensor>) -> DenoiserResult<()> {
        let mut sources = Vec::with_capacity(self.number_of_sources);
        for index in 0..self.number_of_sources {
            let name = naming::source_feature_name(self.pass, index);
            let source = batch
                .get(&name)
                .ok_or_else(|| DenoiserError::configuration(format!("missing source tensor '{}'", name)))?;
            let channels = source.dim(1)?;
            if channels != self.number_of_channels {
                return Err(DenoiserError::shape_mismatch(
                    name,
                    &[self.number_of_channels],
                    &[channels],
                ));
            }
            sources.push(source.clone());
        }
        self.sources = sources;
        self.variances.clear();
        Ok(())
    }

    /// Standardize every source and compute variance channels before or after
    pub fn standardize(&mut self) -> DenoiserResult<()> {
        let variance_first = self.feature_variance.compute_before_standardization;
        if self.feature_variance.use_variance && variance_first {
            self.compute_variances()?;
        }
        if let Some(standardization) = &self.standardization {
            self.sources = self
                .sources
                .iter()
                .map(|source| standardization.standardize(source))
                .collect::<candle_core::Result<Vec<_>>>()?;
        }
        if self.feature_variance.use_variance && !variance_first {
            self.compute_variances()?;
        }
        Ok(())
    }

    fn compute_variances(&mut self) -> DenoiserResult<()> {
        self.variances = self
            .sources
            .iter()
            .map(|source| self.feature_variance.variance(source, DEFAULT_EPSILON))
            .collect::<DenoiserResult<Vec<_>>>()?;
        Ok(())
    }

    pub fn sources(&self) -> &[Tensor] {
        &self.sources
    }

    pub fn source(&self, index: usize) -> DenoiserResult<&Tensor> {
        self.sources.get(index).ok_or_else(|| {
            DenoiserError::configuration(format!("'{}' has no source with index {}", self.pass, index))
        })
    }

    /// Source at `index` followed by its variance channels, if any
    pub fn network_inputs(&self, index: usize) -> DenoiserResult<Vec<Tensor>> {
        let mut inputs = vec![self.source(index)?.clone()];
        if self.feature_variance.use_variance {
            let variance = self.variances.get(index).ok_or_else(|| {
                DenoiserError::configuration(format!("variance of '{}' was not computed", self.pass))
            })?;
            inputs.push(variance.clone());
        }
        Ok(inputs)
    }

    pub fn add_prediction(&mut self, scale_index: usize, prediction: Tensor) -> DenoiserResult<()> {
        if !self.is_target {
            return Err(DenoiserError::configuration(format!(
                "cannot add a prediction to '{}', it is not a target",
                self.pass
            )));
        }
        if scale_index >= self.number_of_scales {
            return Err(DenoiserError::shape_mismatch(
                format!("prediction scales of '{}'", self.pass),
                &[self.number_of_scales],
                &[scale_index + 1],
            ));
        }
        if self.predictions.len() <= scale_index {
            self.predictions.resize(scale_index + 1, None);
        }
        self.predictions[scale_index] = Some(prediction);
        Ok(())
    }

    pub fn clear_predictions(&mut self) {
        self.predictions.clear();
    }

    pub fn number_of_predictions(&self) -> usize {
        self.predictions.len()
    }

    pub fn prediction(&self, scale_index: usize) -> DenoiserResult<&Tensor> {
        self.predictions
            .get(scale_index)
            .and_then(|p| p.as_ref())
            .ok_or_else(|| {
                DenoiserError::configuration(format!(
                    "'{}' has no prediction at scale {}",
                    self.pass, scale_index
                ))
            })
    }

    /// All predictions, finest first; every scale must be filled
    pub fn predictions(&self) -> DenoiserResult<Vec<Tensor>> {
        (0..self.predictions.len())
            .map(|scale_index| self.prediction(scale_index).cloned())
            .collect()
    }

    /// Undo standardization on every prediction
    pub fn invert_predictions(&mut self) -> DenoiserResult<()> {
        if !self.invert_standardization {
            return Ok(());
        }
        if let Some(standardization) = &self.standardization {
            for prediction in self.predictions.iter_mut().flatten() {
                *prediction = standardization.invert(prediction)?;
            }
        }
        Ok(())
    }

    pub fn add_prediction_to_dictionary(
        &self,
        scale_index: usize,
        dictionary: &mut BTreeMap<RenderPass, Tensor>,
    ) -> DenoiserResult<()> {
        if self.is_target {
            dictionary.insert(self.pass, self.prediction(scale_index)?.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeatureVarianceConfig, StandardizationConfig};
    use candle_core::Device;

    fn target_config() -> FeatureConfig {
        FeatureConfig {
            is_target: true,
            standardization: Some(StandardizationConfig {
                use_log1p: true,
                mean: 0.5,
                variance: 2.0,
            }),
            feature_variance: FeatureVarianceConfig {
                use_variance: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn batch(device: &Device, sources: usize) -> BTreeMap<String, Tensor> {
        (0..sources)
            .map(|i| {
                (
                    naming::source_feature_name(RenderPass::DiffuseColor, i),
                    Tensor::full(i as f32 + 1.0, (2, 3, 4, 4), device).unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_initialize_and_standardize() {
        let device = Device::Cpu;
        let mut feature = PredictionFeature::new(RenderPass::DiffuseColor, &target_config(), 2, 3);
        feature.initialize_sources(&batch(&device, 2)).unwrap();
        feature.standardize().unwrap();

        let inputs = feature.network_inputs(1).unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[1].dims(), &[2, 1, 4, 4]);
        assert_eq!(feature.input_channels(), 4);
    }

    #[test]
    fn test_missing_source_is_error() {
        let device = Device::Cpu;
        let mut feature = PredictionFeature::new(RenderPass::DiffuseColor, &target_config(), 3, 1);
        assert!(feature.initialize_sources(&batch(&device, 2)).is_err());
    }

    #[test]
    fn test_prediction_rules() {
        let device = Device::Cpu;
        let prediction = Tensor::zeros((1, 3, 2, 2), candle_core::DType::F32, &device).unwrap();

        let mut source_only = PredictionFeature::new(RenderPass::Normal, &FeatureConfig::default(), 1, 2);
        assert!(source_only.add_prediction(0, prediction.clone()).is_err());

        let mut target = PredictionFeature::new(RenderPass::DiffuseColor, &target_config(), 1, 2);
        target.add_prediction(1, prediction.clone()).unwrap();
        assert_eq!(target.number_of_predictions(), 2);
        assert!(target.predictions().is_err());
        target.add_prediction(0, prediction.clone()).unwrap();
        assert_eq!(target.predictions().unwrap().len(), 2);
        assert!(target.add_prediction(2, prediction).is_err());

        target.clear_predictions();
        assert_eq!(target.number_of_predictions(), 0);
    }

    fn max_difference(a: &Tensor, b: &Tensor) -> f32 {
        (a - b).unwrap().abs().unwrap().flatten_all().unwrap().max(0).unwrap().to_scalar().unwrap()
    }

    fn variance_input(before_standardization: bool, raw: &Tensor) -> (PredictionFeature, Tensor) {
        let mut config = target_config();
        config.feature_variance.compute_before_standardization = before_standardization;
        let mut feature = PredictionFeature::new(RenderPass::DiffuseColor, &config, 1, 1);
        let mut batch = BTreeMap::new();
        batch.insert(naming::source_feature_name(RenderPass::DiffuseColor, 0), raw.clone());
        feature.initialize_sources(&batch).unwrap();
        feature.standardize().unwrap();
        let variance = feature.network_inputs(0).unwrap()[1].clone();
        (feature, variance)
    }

    #[test]
    fn test_variance_timing() {
        let device = Device::Cpu;
        let raw = Tensor::rand(0f32, 4.0, (1, 3, 8, 8), &device).unwrap();

        let (feature, before) = variance_input(true, &raw);
        let standardization = feature.standardization.clone().unwrap();
        let of_raw = feature.feature_variance.variance(&raw, DEFAULT_EPSILON).unwrap();
        let of_standardized = feature
            .feature_variance
            .variance(&standardization.standardize(&raw).unwrap(), DEFAULT_EPSILON)
            .unwrap();
        assert!(max_difference(&of_raw, &of_standardized) > 1e-3);
        assert!(max_difference(&before, &of_raw) < 1e-6);

        let (_, after) = variance_input(false, &raw);
        assert!(max_difference(&after, &of_standardized) < 1e-6);

        // sources are standardized either way
        let standardized = standardization.standardize(&raw).unwrap();
        assert!(max_difference(feature.source(0).unwrap(), &standardized) < 1e-6);
    }
}
