//! # Feature Variance
//!
//! Local variance of a feature over a square spatial window, fed to the
//! network as an auxiliary noise estimate:
//!
//! ```text
//! var(x)      = E_w[x²] − E_w[x]²
//! relative(x) = var(x) / (E_w[x]² + ε)
//! ```
//!
//! Borders are zero padded and normalized by the full window size.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::config::FeatureVarianceConfig;
use crate::error::DenoiserError;
use crate::DenoiserResult;

pub const DEFAULT_EPSILON: f64 = 1e-4;

/// Window used for the local statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarianceMode {
    #[serde(rename = "homogeneous_3x3")]
    Homogeneous3x3,
    #[serde(rename = "homogeneous_5x5")]
    Homogeneous5x5,
    #[serde(rename = "homogeneous_7x7")]
    Homogeneous7x7,
}

impl VarianceMode {
    pub fn window_size(&self) -> usize {
        match self {
            VarianceMode::Homogeneous3x3 => 3,
            VarianceMode::Homogeneous5x5 => 5,
            VarianceMode::Homogeneous7x7 => 7,
        }
    }
}

/// Mean over a `window × window` neighbourhood, same spatial shape as `x`
pub fn local_mean(x: &Tensor, window: usize) -> candle_core::Result<Tensor> {
    let pad = window / 2;
    x.pad_with_zeros(2, pad, pad)?
        .pad_with_zeros(3, pad, pad)?
        .avg_pool2d_with_stride((window, window), (1, 1))
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVariance {
    pub use_variance: bool,
    pub mode: VarianceMode,
    pub relative_variance: bool,
    pub compute_before_standardization: bool,
    pub compress_to_one_channel: bool,
}

impl FeatureVariance {
    pub fn from_config(config: &FeatureVarianceConfig) -> Self {
        Self {
            use_variance: config.use_variance,
            mode: config.variance_mode,
            relative_variance: config.relative_variance,
            compute_before_standardization: config.compute_before_standardization,
            compress_to_one_channel: config.compress_to_one_channel,
        }
    }

    pub fn disabled() -> Self {
        Self::from_config(&FeatureVarianceConfig::default())
    }

    /// Channels produced for an input with `number_of_channels` channels
    pub fn output_channels(&self, number_of_channels: usize) -> usize {
        if !self.use_variance {
            0
        } else if self.compress_to_one_channel {
            1
        } else {
            number_of_channels
        }
    }

    /// Local variance of `x` (`[B, C, H, W]`).
    ///
    /// Returns `[B, C, H, W]`, or `[B, 1, H, W]` when compressing.
    pub fn variance(&self, x: &Tensor, epsilon: f64) -> DenoiserResult<Tensor> {
        if !self.use_variance {
            return Err(DenoiserError::configuration(
                "variance requested for a feature with use_variance disabled",
            ));
        }
        let window = self.mode.window_size();
        let mean = local_mean(x, window)?;
        let mean_of_squares = local_mean(&x.sqr()?, window)?;
        let squared_mean = mean.sqr()?;
        // Rounding can push E[x²] − E[x]² slightly below zero.
        let mut variance = (mean_of_squares - &squared_mean)?.relu()?;
        if self.relative_variance {
            variance = variance.div(&squared_mean.affine(1.0, epsilon)?)?;
        }
        if self.compress_to_one_channel {
            variance = variance.mean_keepdim(1)?;
        }
        Ok(variance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn enabled(compress: bool, relative: bool) -> FeatureVariance {
        FeatureVariance {
            use_variance: true,
            mode: VarianceMode::Homogeneous3x3,
            relative_variance: relative,
            compute_before_standardization: true,
            compress_to_one_channel: compress,
        }
    }

    #[test]
    fn test_disabled_variance_is_configuration_error() {
        let device = Device::Cpu;
        let x = Tensor::zeros((1, 3, 4, 4), candle_core::DType::F32, &device).unwrap();
        let err = FeatureVariance::disabled().variance(&x, DEFAULT_EPSILON).unwrap_err();
        assert!(matches!(err, DenoiserError::Configuration(_)));
    }

    #[test]
    fn test_constant_interior_has_zero_variance() {
        let device = Device::Cpu;
        let x = Tensor::full(2.0f32, (1, 3, 6, 6), &device).unwrap();
        let v = enabled(false, false).variance(&x, DEFAULT_EPSILON).unwrap();
        assert_eq!(v.dims(), &[1, 3, 6, 6]);
        let interior: f32 = v
            .narrow(2, 1, 4)
            .unwrap()
            .narrow(3, 1, 4)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(interior < 1e-5);
    }

    #[test]
    fn test_compressed_shape() {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (2, 3, 8, 8), &device).unwrap();
        let variance = enabled(true, true);
        let v = variance.variance(&x, DEFAULT_EPSILON).unwrap();
        assert_eq!(v.dims(), &[2, 1, 8, 8]);
        assert_eq!(variance.output_channels(3), 1);
    }

    #[test]
    fn test_checkerboard_variance() {
        let device = Device::Cpu;
        // Alternating 0/2 columns: interior 3x3 windows hold three or six 2s.
        let row: Vec<f32> = (0..5).map(|i| if i % 2 == 0 { 0.0 } else { 2.0 }).collect();
        let data: Vec<f32> = row.iter().cycle().take(25).copied().collect();
        let x = Tensor::from_vec(data, (1, 1, 5, 5), &device).unwrap();
        let v = enabled(false, false).variance(&x, DEFAULT_EPSILON).unwrap();
        let center: f32 = v.get(0).unwrap().get(0).unwrap().get(2).unwrap().get(2).unwrap().to_scalar().unwrap();
        // Column 2 is 0, neighbours 1 and 3 are 2: mean 4/3, E[x²] 8/3
        let expected = 8.0 / 3.0 - (4.0f32 / 3.0).powi(2);
        assert!((center - expected).abs() < 1e-5);
    }

    #[test]
    fn test_mode_names() {
        let mode: VarianceMode = serde_json::from_str("\"homogeneous_7x7\"").unwrap();
        assert_eq!(mode.window_size(), 7);
    }
}
