//! # Multiscale Structural Similarity
//!
//! ```text
//! l(x, y)  = (2 μx μy + c1) / (μx² + μy² + c1)
//! cs(x, y) = (2 σxy + c2) / (σx² + σy² + c2)
//! MS-SSIM  = Π_{j<M} cs_j^{p_j} · (l_M · cs_M)^{p_M}
//! ```
//!
//! Statistics use an 11×11 Gaussian window (σ = 1.5) without padding; images
//! are halved with a 2×2 average pool between levels.

use candle_core::{DType, Device, Tensor};

use crate::error::DenoiserError;
use crate::DenoiserResult;

#[derive(Debug, Clone, PartialEq)]
pub struct MsSsimConfig {
    pub window_size: usize,
    pub sigma: f64,
    pub k1: f64,
    pub k2: f64,
    pub max_value: f64,
    /// One factor per level, finest first
    pub power_factors: Vec<f64>,
}

impl Default for MsSsimConfig {
    fn default() -> Self {
        Self {
            window_size: 11,
            sigma: 1.5,
            k1: 0.01,
            k2: 0.03,
            max_value: 1.0,
            // Tiles are too small for the full five-factor pyramid.
            power_factors: vec![0.0448, 0.2856, 0.3001],
        }
    }
}

impl MsSsimConfig {
    /// Smallest height/width that survives every level
    pub fn minimum_size(&self) -> usize {
        self.window_size << self.power_factors.len().saturating_sub(1)
    }
}

/// `[channels, 1, w, w]` depthwise Gaussian kernel
fn gaussian_window(config: &MsSsimConfig, channels: usize, device: &Device) -> candle_core::Result<Tensor> {
    let size = config.window_size;
    let center = (size / 2) as f64;
    let weights: Vec<f32> = (0..size)
        .map(|i| (-(i as f64 - center).powi(2) / (2.0 * config.sigma * config.sigma)).exp() as f32)
        .collect();
    let total: f32 = weights.iter().sum();
    let weights: Vec<f32> = weights.iter().map(|w| w / total).collect();
    let column = Tensor::from_vec(weights.clone(), (size, 1), device)?;
    let row = Tensor::from_vec(weights, (1, size), device)?;
    column
        .matmul(&row)?
        .reshape((1, 1, size, size))?
        .repeat((channels, 1, 1, 1))
}

/// Spatial means of the SSIM and contrast-structure maps, each `[B, C]`
fn ssim_and_cs(x: &Tensor, y: &Tensor, window: &Tensor, config: &MsSsimConfig) -> candle_core::Result<(Tensor, Tensor)> {
    let channels = x.dim(1)?;
    let filter = |t: &Tensor| t.conv2d(window, 0, 1, 1, channels);
    let c1 = (config.k1 * config.max_value).powi(2);
    let c2 = (config.k2 * config.max_value).powi(2);

    let mean_x = filter(x)?;
    let mean_y = filter(y)?;
    let mean_xy = (&mean_x * &mean_y)?;
    let mean_sq = (mean_x.sqr()? + mean_y.sqr()?)?;
    let luminance = ((&mean_xy * 2.0)? + c1)?.div(&(&mean_sq + c1)?)?;

    let cross = (filter(&(x * y)?)? * 2.0)?;
    let squares = filter(&(x.sqr()? + y.sqr()?)?)?;
    let cs = ((cross - (&mean_xy * 2.0)?)? + c2)?.div(&((squares - &mean_sq)? + c2)?)?;
    let ssim = (&luminance * &cs)?;

    Ok((ssim.mean((2, 3))?, cs.mean((2, 3))?))
}

/// MS-SSIM per image (`[B]`), averaged over channels
pub fn ms_ssim(x: &Tensor, y: &Tensor, config: &MsSsimConfig) -> DenoiserResult<Tensor> {
    if x.dims() != y.dims() {
        return Err(DenoiserError::shape_mismatch("ms-ssim", x.dims(), y.dims()));
    }
    let (_, channels, height, width) = x.dims4()?;
    let minimum = config.minimum_size();
    if height < minimum || width < minimum {
        return Err(DenoiserError::shape_mismatch("ms-ssim image size", &[minimum, minimum], &[height, width]));
    }

    let x = x.to_dtype(DType::F32)?;
    let y = y.to_dtype(DType::F32)?;
    let window = gaussian_window(config, channels, x.device())?;
    let levels = config.power_factors.len();

    let mut x = x;
    let mut y = y;
    let mut result: Option<Tensor> = None;
    for (level, &power) in config.power_factors.iter().enumerate() {
        let (ssim, cs) = ssim_and_cs(&x, &y, &window, config)?;
        let value = if level + 1 == levels { ssim } else { cs };
        // relu, kept strictly positive so the power stays differentiable
        let factor = value.relu()?.maximum(1e-12)?.powf(power)?;
        result = Some(match result {
            Some(product) => (product * factor)?,
            None => factor,
        });
        if level + 1 < levels {
            x = x.avg_pool2d(2)?;
            y = y.avg_pool2d(2)?;
        }
    }
    let result = result.ok_or_else(|| DenoiserError::configuration("ms-ssim needs at least one power factor"))?;
    Ok(result.mean(1)?)
}

/// `1 − mean(MS-SSIM)` with the default settings
pub fn ms_ssim_loss(predicted: &Tensor, target: &Tensor) -> DenoiserResult<Tensor> {
    let similarity = ms_ssim(predicted, target, &MsSsimConfig::default())?;
    Ok(similarity.mean_all()?.affine(-1.0, 1.0)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_images_have_zero_loss() {
        let device = Device::Cpu;
        let x = Tensor::rand(0f32, 1.0, (2, 3, 48, 48), &device).unwrap();
        let loss: f32 = ms_ssim_loss(&x, &x).unwrap().to_scalar().unwrap();
        assert!(loss.abs() < 1e-4, "loss was {}", loss);
    }

    #[test]
    fn test_noise_increases_loss() {
        let device = Device::Cpu;
        let x = Tensor::rand(0f32, 1.0, (1, 3, 48, 48), &device).unwrap();
        let noise = Tensor::randn(0f32, 0.3, (1, 3, 48, 48), &device).unwrap();
        let y = (&x + noise).unwrap();
        let loss: f32 = ms_ssim_loss(&y, &x).unwrap().to_scalar().unwrap();
        assert!(loss > 0.01 && loss <= 1.0, "loss was {}", loss);
    }

    #[test]
    fn test_small_images_are_rejected() {
        let device = Device::Cpu;
        assert_eq!(MsSsimConfig::default().minimum_size(), 44);
        let x = Tensor::rand(0f32, 1.0, (1, 3, 32, 32), &device).unwrap();
        assert!(matches!(
            ms_ssim_loss(&x, &x),
            Err(DenoiserError::ShapeMismatch { .. })
        ));
    }
}
