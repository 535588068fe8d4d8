//! Elementwise difference used by every loss term and tracked metric

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::DenoiserResult;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossDifference {
    #[default]
    Absolute,
    Squared,
    /// Smooth L1 with β = 1
    SmoothAbsolute,
}

impl LossDifference {
    pub fn difference(&self, predicted: &Tensor, target: &Tensor) -> DenoiserResult<Tensor> {
        let diff = (predicted - target)?;
        let result = match self {
            LossDifference::Absolute => diff.abs()?,
            LossDifference::Squared => diff.sqr()?,
            LossDifference::SmoothAbsolute => {
                let abs = diff.abs()?;
                // |d| < 1: 0.5·d², otherwise |d| − 0.5
                let small = abs.lt(1.0)?.to_dtype(abs.dtype())?;
                let large = abs.ge(1.0)?.to_dtype(abs.dtype())?;
                let quadratic = (abs.sqr()? * 0.5)?;
                let linear = (&abs - 0.5)?;
                (small.mul(&quadratic)? + large.mul(&linear)?)?
            }
        };
        Ok(result)
    }
}
