//! # Feature Flags
//!
//! Constant indicator channels prepended to the input of the shared
//! single-feature network so it knows which pass it is predicting.
//!
//! ```text
//! flags = [diffuse, glossy, direct, indirect]
//! diffuse_direct → [1, 0, 1, 0]   (one constant H×W plane per flag)
//! ```

use candle_core::{DType, Device, Tensor};
use std::collections::BTreeMap;

use crate::error::DenoiserError;
use crate::render_passes::RenderPass;
use crate::DenoiserResult;

#[derive(Debug, Clone, Default)]
pub struct FeatureFlags {
    names: Vec<String>,
    passes: BTreeMap<RenderPass, Vec<f32>>,
    frozen: bool,
}

impl FeatureFlags {
    pub fn new(names: Vec<String>) -> Self {
        Self {
            names,
            passes: BTreeMap::new(),
            frozen: false,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Register the flags a pass sets
    pub fn add_render_pass(&mut self, pass: RenderPass, flag_names: &[String]) -> DenoiserResult<()> {
        if self.frozen {
            return Err(DenoiserError::configuration(format!(
                "feature flags are frozen, cannot add '{}'",
                pass
            )));
        }
        let mut indicator = vec![0.0f32; self.names.len()];
        for flag in flag_names {
            let index = self
                .names
                .iter()
                .position(|name| name == flag)
                .ok_or_else(|| DenoiserError::configuration(format!("unknown feature flag '{}'", flag)))?;
            indicator[index] = 1.0;
        }
        self.passes.insert(pass, indicator);
        Ok(())
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// `[batch, n_flags, height, width]` indicator planes for `pass`
    pub fn feature_flags(
        &self,
        pass: RenderPass,
        batch: usize,
        height: usize,
        width: usize,
        device: &Device,
    ) -> DenoiserResult<Tensor> {
        let indicator = self
            .passes
            .get(&pass)
            .ok_or_else(|| DenoiserError::configuration(format!("no feature flags registered for '{}'", pass)))?;
        let flags = Tensor::from_slice(indicator.as_slice(), (1, indicator.len(), 1, 1), device)?
            .to_dtype(DType::F32)?
            .broadcast_as((batch, indicator.len(), height, width))?
            .contiguous()?;
        Ok(flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags() -> FeatureFlags {
        FeatureFlags::new(vec!["diffuse".into(), "glossy".into(), "direct".into(), "indirect".into()])
    }

    #[test]
    fn test_indicator_planes() {
        let device = Device::Cpu;
        let mut flags = flags();
        flags
            .add_render_pass(RenderPass::DiffuseDirect, &["diffuse".into(), "direct".into()])
            .unwrap();
        flags.freeze();

        let planes = flags.feature_flags(RenderPass::DiffuseDirect, 2, 3, 5, &device).unwrap();
        assert_eq!(planes.dims(), &[2, 4, 3, 5]);
        let per_flag: Vec<f32> = planes
            .mean((0, 2, 3))
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(per_flag, vec![1.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_frozen_and_unknown() {
        let mut flags = flags();
        assert!(flags.add_render_pass(RenderPass::GlossyColor, &["specular".into()]).is_err());
        flags.freeze();
        assert!(flags.add_render_pass(RenderPass::GlossyColor, &["glossy".into()]).is_err());
        assert!(flags
            .feature_flags(RenderPass::GlossyColor, 1, 1, 1, &Device::Cpu)
            .is_err());
    }
}
