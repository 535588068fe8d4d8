//! # Data Augmentation
//!
//! One [`AugmentationChoice`] is drawn per example and applied to every source
//! and target of that example, so all passes stay aligned. Tensors are single
//! examples, `[C, H, W]`.

use candle_core::{Device, Tensor};
use rand::Rng;

use crate::config::DataAugmentationConfig;
use crate::dataset::Example;
use crate::render_passes::RenderPass;
use crate::DenoiserResult;

/// The six orderings of three color channels
pub const RGB_PERMUTATIONS: [[u32; 3]; 6] = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AugmentationChoice {
    pub flip: bool,
    /// Counterclockwise quarter turns, 0..4
    pub rotation: usize,
    /// Index into [`RGB_PERMUTATIONS`]
    pub permutation: usize,
}

impl AugmentationChoice {
    /// Leaves every tensor untouched
    pub fn identity() -> Self {
        Self::default()
    }

    /// Draw a choice; disabled primitives stay at identity
    pub fn random<R: Rng + ?Sized>(rng: &mut R, config: &DataAugmentationConfig) -> Self {
        Self {
            flip: config.use_flip_left_right && rng.gen_bool(0.5),
            rotation: if config.use_rotate_90 { rng.gen_range(0..4) } else { 0 },
            permutation: if config.use_rgb_permutation {
                rng.gen_range(0..RGB_PERMUTATIONS.len())
            } else {
                0
            },
        }
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::identity()
    }
}

fn reversed_indices(length: usize, device: &Device) -> candle_core::Result<Tensor> {
    let indices: Vec<u32> = (0..length as u32).rev().collect();
    Tensor::from_vec(indices, length, device)
}

/// Mirror along the width axis
pub fn flip_left_right(x: &Tensor) -> candle_core::Result<Tensor> {
    let width = x.dim(2)?;
    x.index_select(&reversed_indices(width, x.device())?, 2)
}

/// Rotate counterclockwise by `k` quarter turns
pub fn rotate_90(x: &Tensor, k: usize) -> candle_core::Result<Tensor> {
    let mut x = x.clone();
    for _ in 0..k % 4 {
        x = flip_left_right(&x)?.transpose(1, 2)?.contiguous()?;
    }
    Ok(x)
}

pub fn permute_rgb(x: &Tensor, permutation: usize) -> candle_core::Result<Tensor> {
    let order = RGB_PERMUTATIONS[permutation % RGB_PERMUTATIONS.len()];
    let indices = Tensor::new(&order, x.device())?;
    x.index_select(&indices, 0)
}

/// Pass a stored tensor belongs to, from its `"<pass>/…"` key
fn key_pass(key: &str) -> Option<RenderPass> {
    key.split('/').next().and_then(|name| name.parse().ok())
}

/// Apply `choice` to every tensor of `example`
pub fn augment(example: &Example, choice: &AugmentationChoice) -> DenoiserResult<Example> {
    if choice.is_identity() {
        return Ok(example.clone());
    }
    let mut augmented = Example::new();
    for (key, tensor) in example {
        let mut tensor = tensor.clone();
        if choice.flip {
            tensor = flip_left_right(&tensor)?;
        }
        tensor = rotate_90(&tensor, choice.rotation)?;
        let is_rgb = key_pass(key).is_some_and(|pass| pass.is_rgb_color()) && tensor.dim(0)? == 3;
        if choice.permutation != 0 && is_rgb {
            tensor = permute_rgb(&tensor, choice.permutation)?;
        }
        augmented.insert(key.clone(), tensor);
    }
    Ok(augmented)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ramp(channels: usize, height: usize, width: usize) -> Tensor {
        let values: Vec<f32> = (0..channels * height * width).map(|v| v as f32).collect();
        Tensor::from_vec(values, (channels, height, width), &Device::Cpu).unwrap()
    }

    fn to_vec(x: &Tensor) -> Vec<f32> {
        x.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn test_flip_left_right() {
        let x = ramp(1, 2, 3);
        assert_eq!(to_vec(&flip_left_right(&x).unwrap()), vec![2.0, 1.0, 0.0, 5.0, 4.0, 3.0]);
    }

    #[test]
    fn test_rotate_90_counterclockwise() {
        // 0 1      1 3
        // 2 3  ->  0 2
        let x = ramp(1, 2, 2);
        assert_eq!(to_vec(&rotate_90(&x, 1).unwrap()), vec![1.0, 3.0, 0.0, 2.0]);
        let x = ramp(2, 3, 5);
        assert_eq!(rotate_90(&x, 1).unwrap().dims(), &[2, 5, 3]);
        assert_eq!(to_vec(&rotate_90(&x, 4).unwrap()), to_vec(&x));
    }

    #[test]
    fn test_permutation_only_on_rgb_passes() {
        let mut example = Example::new();
        example.insert(naming::source_feature_name(RenderPass::DiffuseColor, 0), ramp(3, 1, 1));
        example.insert(naming::target_feature_name(RenderPass::DiffuseColor), ramp(3, 1, 1));
        example.insert(naming::source_feature_name(RenderPass::Normal, 0), ramp(3, 1, 1));
        let choice = AugmentationChoice {
            permutation: 5,
            ..Default::default()
        };
        let augmented = augment(&example, &choice).unwrap();
        let color = naming::source_feature_name(RenderPass::DiffuseColor, 0);
        let normal = naming::source_feature_name(RenderPass::Normal, 0);
        assert_eq!(to_vec(&augmented[&color]), vec![2.0, 1.0, 0.0]);
        assert_eq!(to_vec(&augmented[&normal]), vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_sources_and_targets_stay_aligned() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut example = Example::new();
        let image = ramp(3, 4, 6);
        example.insert(naming::source_feature_name(RenderPass::GlossyColor, 0), image.clone());
        example.insert(naming::target_feature_name(RenderPass::GlossyColor), image);
        for _ in 0..8 {
            let choice = AugmentationChoice::random(&mut rng, &DataAugmentationConfig::default());
            let augmented = augment(&example, &choice).unwrap();
            let source = &augmented[&naming::source_feature_name(RenderPass::GlossyColor, 0)];
            let target = &augmented[&naming::target_feature_name(RenderPass::GlossyColor)];
            assert_eq!(to_vec(source), to_vec(target));
        }
    }

    #[test]
    fn test_disabled_augmentation_is_identity() {
        let mut rng = StdRng::seed_from_u64(0);
        let config = DataAugmentationConfig {
            use_rotate_90: false,
            use_flip_left_right: false,
            use_rgb_permutation: false,
        };
        for _ in 0..4 {
            assert!(AugmentationChoice::random(&mut rng, &config).is_identity());
        }
    }
}
