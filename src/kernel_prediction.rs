//! # Kernel Prediction
//!
//! Adaptive per-pixel filtering: the network predicts a `k×k` kernel for
//! every pixel, which is applied to the noisy source.
//!
//! ```text
//! out[b, c, y, x] = Σ_{dy,dx} raw[b, dy·k + dx, y, x] · src[b, c, y + dy − k/2, x + dx − k/2]
//! ```
//!
//! Kernels are used as predicted (no softmax), the source is zero padded.

use candle_core::Tensor;

use crate::error::DenoiserError;
use crate::DenoiserResult;

/// Filter `source` (`[B, C, H, W]`) with per-pixel kernels `raw` (`[B, k², H, W]`)
pub fn kernel_prediction(source: &Tensor, raw: &Tensor, kernel_size: usize) -> DenoiserResult<Tensor> {
    if kernel_size % 2 == 0 {
        return Err(DenoiserError::configuration(format!(
            "kernel size must be odd, got {}",
            kernel_size
        )));
    }
    let (batch, _channels, height, width) = source.dims4()?;
    let (raw_batch, raw_channels, raw_height, raw_width) = raw.dims4()?;
    if raw_batch != batch || raw_channels != kernel_size * kernel_size || raw_height != height || raw_width != width {
        return Err(DenoiserError::shape_mismatch(
            "kernel prediction",
            &[batch, kernel_size * kernel_size, height, width],
            raw.dims(),
        ));
    }

    let half = kernel_size / 2;
    let padded = source
        .pad_with_zeros(2, half, half)?
        .pad_with_zeros(3, half, half)?;

    let mut result: Option<Tensor> = None;
    for dy in 0..kernel_size {
        let rows = padded.narrow(2, dy, height)?;
        for dx in 0..kernel_size {
            let shifted = rows.narrow(3, dx, width)?;
            let weight = raw.narrow(1, dy * kernel_size + dx, 1)?;
            let term = shifted.broadcast_mul(&weight)?;
            result = Some(match result {
                Some(sum) => (sum + term)?,
                None => term,
            });
        }
    }
    // kernel_size ≥ 1, so at least one term was accumulated
    result.ok_or_else(|| DenoiserError::configuration("kernel size must be positive"))
}
