//! # Feature Standardization
//!
//! Reversible per-feature normalization with fixed, offline statistics.
//!
//! ```text
//! standardize(x) = (signed_log1p(x) - mean) / sqrt(variance)
//! invert(y)      = signed_expm1(y * sqrt(variance) + mean)
//! ```
//!
//! The mean step is skipped for `mean == 0` and the variance step for
//! `variance == 1`; the skip is observable in floating point and kept exact.

use candle_core::{Result as CandleResult, Tensor};

use crate::config::StandardizationConfig;

/// `sign(x) * ln(1 + |x|)`
pub fn signed_log1p(x: &Tensor) -> CandleResult<Tensor> {
    let sign = sign(x)?;
    let magnitude = x.abs()?.affine(1.0, 1.0)?.log()?;
    sign.mul(&magnitude)
}

/// `sign(x) * (exp(|x|) - 1)`, the inverse of [`signed_log1p`]
pub fn signed_expm1(x: &Tensor) -> CandleResult<Tensor> {
    let sign = sign(x)?;
    let magnitude = x.abs()?.exp()?.affine(1.0, -1.0)?;
    sign.mul(&magnitude)
}

/// +1 for non-negative entries, -1 otherwise; carries no gradient
fn sign(x: &Tensor) -> CandleResult<Tensor> {
    x.ge(0.0)?.to_dtype(x.dtype())?.affine(2.0, -1.0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureStandardization {
    pub use_log1p: bool,
    pub mean: f64,
    pub variance: f64,
}

impl FeatureStandardization {
    pub fn new(use_log1p: bool, mean: f64, variance: f64) -> Self {
        Self {
            use_log1p,
            mean,
            variance,
        }
    }

    pub fn from_config(config: &StandardizationConfig) -> Self {
        Self::new(config.use_log1p, config.mean, config.variance)
    }

    pub fn use_mean(&self) -> bool {
        self.mean != 0.0
    }

    pub fn use_variance(&self) -> bool {
        self.variance != 1.0
    }

    pub fn standardize(&self, feature: &Tensor) -> CandleResult<Tensor> {
        let mut feature = feature.clone();
        if self.use_log1p {
            feature = signed_log1p(&feature)?;
        }
        if self.use_mean() {
            feature = feature.affine(1.0, -self.mean)?;
        }
        if self.use_variance() {
            feature = feature.affine(1.0 / self.variance.sqrt(), 0.0)?;
        }
        Ok(feature)
    }

    pub fn invert(&self, feature: &Tensor) -> CandleResult<Tensor> {
        let mut feature = feature.clone();
        if self.use_variance() {
            feature = feature.affine(self.variance.sqrt(), 0.0)?;
        }
        if self.use_mean() {
            feature = feature.affine(1.0, self.mean)?;
        }
        if self.use_log1p {
            feature = signed_expm1(&feature)?;
        }
        Ok(feature)
    }
}
