//! # Multiscale Prediction
//!
//! Pyramid helpers: box downsampling of sources and targets, and the learned
//! merge of a coarse prediction into the next finer one.
//!
//! ```text
//! scale 2 ──upsample──┐
//!                     ├─ concat ─ 1×1 conv ─▶ scale 1' ──upsample──┐
//! scale 1 ────────────┘                                            ├─ … ─▶ scale 0'
//! scale 0 ─────────────────────────────────────────────────────────┘
//! ```
//!
//! The merge parameters are shared by every transition and every pass with
//! the same channel count.

use candle_core::Tensor;
use candle_nn::{Conv2d, ConvTranspose2d, ConvTranspose2dConfig, Module, VarBuilder};
use std::collections::BTreeMap;

use crate::error::DenoiserError;
use crate::DenoiserResult;

/// Average pool with window and stride `factor`
pub fn scale_down(x: &Tensor, factor: usize) -> candle_core::Result<Tensor> {
    if factor <= 1 {
        Ok(x.clone())
    } else {
        x.avg_pool2d(factor)
    }
}

/// Targets at every pyramid scale: `scale_down(target, 2^s)`
pub fn scale_pyramid(x: &Tensor, number_of_scales: usize) -> candle_core::Result<Vec<Tensor>> {
    (0..number_of_scales).map(|s| scale_down(x, 1 << s)).collect()
}

/// Learned 2× upsample and merge
#[derive(Debug, Clone)]
pub struct ComposeScalesParams {
    upsample: ConvTranspose2d,
    combine: Conv2d,
}

impl ComposeScalesParams {
    pub fn new(channels: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let upsample = candle_nn::conv_transpose2d(
            channels,
            channels,
            2,
            ConvTranspose2dConfig {
                stride: 2,
                ..Default::default()
            },
            vb.pp("upsample"),
        )?;
        let combine = candle_nn::conv2d(2 * channels, channels, 1, Default::default(), vb.pp("combine"))?;
        Ok(Self { upsample, combine })
    }

    /// Merge `small` (`[B, C, H/2, W/2]`) into `large` (`[B, C, H, W]`)
    pub fn compose(&self, small: &Tensor, large: &Tensor) -> DenoiserResult<Tensor> {
        let upsampled = self.upsample.forward(small)?;
        let (_, _, height, width) = large.dims4()?;
        let (_, _, up_height, up_width) = upsampled.dims4()?;
        if (up_height, up_width) != (height, width) {
            return Err(DenoiserError::shape_mismatch(
                "compose scales",
                &[height, width],
                &[up_height, up_width],
            ));
        }
        let merged = Tensor::cat(&[large, &upsampled], 1)?;
        Ok(self.combine.forward(&merged)?)
    }
}

/// Merge operator for one channel count, created on first use
#[derive(Debug, Default)]
pub struct ScaleComposer {
    params: Option<ComposeScalesParams>,
}

impl ScaleComposer {
    fn params(&mut self, channels: usize, vb: &VarBuilder) -> DenoiserResult<&ComposeScalesParams> {
        if self.params.is_none() {
            log::debug!("Creating compose scales parameters for {} channels", channels);
            self.params = Some(ComposeScalesParams::new(
                channels,
                vb.pp(format!("compose_scales_{}", channels)),
            )?);
        }
        self.params
            .as_ref()
            .ok_or_else(|| DenoiserError::configuration("compose scales parameters unavailable"))
    }

    pub fn is_initialized(&self) -> bool {
        self.params.is_some()
    }
}

/// Coarse-to-fine composition of per-scale predictions
#[derive(Debug, Default)]
pub struct MultiscaleComposition {
    composers: BTreeMap<usize, ScaleComposer>,
}

impl MultiscaleComposition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refine `predictions` (finest first) from the coarsest scale down.
    ///
    /// The list keeps its length; index 0 holds the composed result.
    pub fn compose(&mut self, predictions: &[Tensor], vb: &VarBuilder) -> DenoiserResult<Vec<Tensor>> {
        let mut result = predictions.to_vec();
        if result.len() < 2 {
            return Ok(result);
        }
        let channels = result[0].dim(1)?;
        let params = self.composers.entry(channels).or_default().params(channels, vb)?;
        for scale_index in (1..result.len()).rev() {
            let composed = params.compose(&result[scale_index], &result[scale_index - 1])?;
            result[scale_index - 1] = composed;
        }
        Ok(result)
    }

    /// Channel counts with materialized parameters
    pub fn initialized_channels(&self) -> Vec<usize> {
        self.composers
            .iter()
            .filter(|(_, composer)| composer.is_initialized())
            .map(|(channels, _)| *channels)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_scale_down_averages() {
        let device = Device::Cpu;
        let x = Tensor::arange(0f32, 16.0, &device).unwrap().reshape((1, 1, 4, 4)).unwrap();
        let y: Vec<f32> = scale_down(&x, 2).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(y, vec![2.5, 4.5, 10.5, 12.5]);
        assert_eq!(scale_down(&x, 1).unwrap().dims(), &[1, 1, 4, 4]);
    }

    #[test]
    fn test_compose_keeps_length_and_finest_resolution() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let predictions: Vec<Tensor> = (0..3)
            .map(|s| Tensor::randn(0f32, 1.0, (2, 3, 16 >> s, 16 >> s), &device).unwrap())
            .collect();

        let mut composition = MultiscaleComposition::new();
        let composed = composition.compose(&predictions, &vb).unwrap();
        assert_eq!(composed.len(), 3);
        assert_eq!(composed[0].dims(), &[2, 3, 16, 16]);
        assert_eq!(composed[2].dims(), predictions[2].dims());

        // Second call reuses the same variables.
        let vars = varmap.all_vars().len();
        composition.compose(&predictions, &vb).unwrap();
        assert_eq!(varmap.all_vars().len(), vars);
        assert_eq!(composition.initialized_channels(), vec![3]);
    }

    #[test]
    fn test_compose_rejects_mismatched_scales() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let predictions = vec![
            Tensor::zeros((1, 1, 10, 10), DType::F32, &device).unwrap(),
            Tensor::zeros((1, 1, 4, 4), DType::F32, &device).unwrap(),
        ];
        let err = MultiscaleComposition::new().compose(&predictions, &vb).unwrap_err();
        assert!(matches!(err, DenoiserError::ShapeMismatch { .. }));
    }
}
