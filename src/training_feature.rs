//! # Training Features
//!
//! Losses and tracked metrics over a three-level composition hierarchy:
//!
//! ```text
//! base pass            diffuse_color, diffuse_direct, …
//!     │  color · (direct + indirect)
//! combined pass        combined_diffuse, …
//!     │  Σ materials + emission + environment
//! combined image       combined
//! ```
//!
//! Every level resolves to a [`PredictedTarget`] and shares the same loss and
//! metric functions. Per-scale loss weights follow
//!
//! ```text
//! w(s) = 4^-s / Σ_{i<n} 4^-i
//! ```
//!
//! and any term whose weight is ≤ 0 is skipped without being evaluated.

use candle_core::{DType, Device, Tensor};
use std::collections::BTreeMap;

use crate::config::{DenoiserConfig, LossWeights, Statistics};
use crate::error::DenoiserError;
use crate::loss_difference::LossDifference;
use crate::naming;
use crate::render_passes::{RenderPass, COMBINED_MATERIAL_PASSES};
use crate::ssim;
use crate::DenoiserResult;

// ═══════════════════════════════════════════════════════════════════════════
// PREDICTED / TARGET PAIRS
// ═══════════════════════════════════════════════════════════════════════════

/// One-channel mask, 1 where the mask source's target is non-zero
#[derive(Debug, Clone)]
pub struct Mask {
    pub values: Tensor,
    pub sum: f32,
}

impl Mask {
    pub fn from_target(target: &Tensor) -> DenoiserResult<Self> {
        let values = target.ne(0.0)?.to_dtype(DType::F32)?.max_keepdim(1)?;
        let sum = values.sum_all()?.to_scalar::<f32>()?;
        Ok(Self { values, sum })
    }
}

/// Per-scale predictions and targets, finest first
#[derive(Debug, Clone)]
pub struct PredictedTarget {
    pub predicted: Vec<Tensor>,
    pub target: Vec<Tensor>,
    pub mask: Option<Vec<Mask>>,
}

impl PredictedTarget {
    pub fn new(predicted: Vec<Tensor>, target: Vec<Tensor>, mask: Option<Vec<Mask>>) -> DenoiserResult<Self> {
        if predicted.len() != target.len() {
            return Err(DenoiserError::shape_mismatch(
                "number of prediction scales",
                &[target.len()],
                &[predicted.len()],
            ));
        }
        for (p, t) in predicted.iter().zip(target.iter()) {
            if p.dims() != t.dims() {
                return Err(DenoiserError::shape_mismatch("predicted and target", t.dims(), p.dims()));
            }
        }
        if let Some(masks) = &mask {
            if masks.len() != predicted.len() {
                return Err(DenoiserError::shape_mismatch(
                    "number of mask scales",
                    &[predicted.len()],
                    &[masks.len()],
                ));
            }
            for (m, p) in masks.iter().zip(predicted.iter()) {
                let (b, _, h, w) = p.dims4()?;
                if m.values.dims() != [b, 1, h, w] {
                    return Err(DenoiserError::shape_mismatch("mask", &[b, 1, h, w], m.values.dims()));
                }
            }
        }
        Ok(Self { predicted, target, mask })
    }

    pub fn number_of_scales(&self) -> usize {
        self.target.len()
    }

    fn scale(&self, scale_index: usize) -> DenoiserResult<(&Tensor, &Tensor)> {
        match (self.predicted.get(scale_index), self.target.get(scale_index)) {
            (Some(p), Some(t)) => Ok((p, t)),
            _ => Err(DenoiserError::shape_mismatch(
                "scale index",
                &[self.number_of_scales()],
                &[scale_index + 1],
            )),
        }
    }

    fn mask(&self, scale_index: usize) -> DenoiserResult<&Mask> {
        self.mask
            .as_ref()
            .and_then(|masks| masks.get(scale_index))
            .ok_or_else(|| DenoiserError::configuration("masked metric requested without a mask"))
    }
}

/// `color · (direct + indirect)` per scale, mask from the color target
pub fn combine_material(color: &PredictedTarget, direct: &PredictedTarget, indirect: &PredictedTarget) -> DenoiserResult<PredictedTarget> {
    let combine = |c: &[Tensor], d: &[Tensor], i: &[Tensor]| -> DenoiserResult<Vec<Tensor>> {
        if c.len() != d.len() || c.len() != i.len() {
            return Err(DenoiserError::shape_mismatch(
                "combined constituent scales",
                &[c.len(), c.len()],
                &[d.len(), i.len()],
            ));
        }
        c.iter()
            .zip(d.iter().zip(i.iter()))
            .map(|(c, (d, i))| Ok(c.mul(&(d + i)?)?))
            .collect()
    };
    let predicted = combine(&color.predicted, &direct.predicted, &indirect.predicted)?;
    let target = combine(&color.target, &direct.target, &indirect.target)?;
    let mask = color
        .target
        .iter()
        .map(Mask::from_target)
        .collect::<DenoiserResult<Vec<_>>>()?;
    PredictedTarget::new(predicted, target, Some(mask))
}

/// Sum of constituents per scale, no mask
pub fn sum_constituents(parts: &[&PredictedTarget]) -> DenoiserResult<PredictedTarget> {
    let first = parts
        .first()
        .ok_or_else(|| DenoiserError::configuration("combined image has no constituents"))?;
    let scales = first.number_of_scales();
    let mut predicted = Vec::with_capacity(scales);
    let mut target = Vec::with_capacity(scales);
    for scale_index in 0..scales {
        let mut p = first.predicted[scale_index].clone();
        let mut t = first.target[scale_index].clone();
        for part in &parts[1..] {
            let (pp, tt) = part.scale(scale_index)?;
            p = (p + pp)?;
            t = (t + tt)?;
        }
        predicted.push(p);
        target.push(t);
    }
    PredictedTarget::new(predicted, target, None)
}

// ═══════════════════════════════════════════════════════════════════════════
// METRICS
// ═══════════════════════════════════════════════════════════════════════════

fn zero(like: &Tensor) -> DenoiserResult<Tensor> {
    Ok(Tensor::zeros((), DType::F32, like.device())?)
}

pub fn difference(pt: &PredictedTarget, scale_index: usize, loss_difference: LossDifference) -> DenoiserResult<Tensor> {
    let (predicted, target) = pt.scale(scale_index)?;
    loss_difference.difference(predicted, target)
}

pub fn masked_difference(pt: &PredictedTarget, scale_index: usize, loss_difference: LossDifference) -> DenoiserResult<Tensor> {
    let mask = pt.mask(scale_index)?;
    Ok(difference(pt, scale_index, loss_difference)?.broadcast_mul(&mask.values)?)
}

pub fn mean(pt: &PredictedTarget, scale_index: usize, loss_difference: LossDifference) -> DenoiserResult<Tensor> {
    Ok(difference(pt, scale_index, loss_difference)?.mean_all()?)
}

/// Σ(diff · mask) / mask_sum, exactly 0 for an empty mask
pub fn masked_mean(pt: &PredictedTarget, scale_index: usize, loss_difference: LossDifference) -> DenoiserResult<Tensor> {
    let mask = pt.mask(scale_index)?;
    if mask.sum <= 0.0 {
        return zero(&mask.values);
    }
    let masked = masked_difference(pt, scale_index, loss_difference)?;
    Ok(masked.sum_all()?.affine(1.0 / mask.sum as f64, 0.0)?)
}

fn horizontal_variation(x: &Tensor) -> candle_core::Result<Tensor> {
    let width = x.dim(3)?;
    x.narrow(3, 1, width - 1)? - x.narrow(3, 0, width - 1)?
}

fn vertical_variation(x: &Tensor) -> candle_core::Result<Tensor> {
    let height = x.dim(2)?;
    x.narrow(2, 1, height - 1)? - x.narrow(2, 0, height - 1)?
}

/// Differences of horizontal and vertical variations
fn variation_differences(
    pt: &PredictedTarget,
    scale_index: usize,
    loss_difference: LossDifference,
) -> DenoiserResult<(Tensor, Tensor)> {
    let (predicted, target) = pt.scale(scale_index)?;
    let (_, _, height, width) = predicted.dims4()?;
    if height < 2 || width < 2 {
        return Err(DenoiserError::shape_mismatch("variation", &[2, 2], &[height, width]));
    }
    let horizontal = loss_difference.difference(&horizontal_variation(predicted)?, &horizontal_variation(target)?)?;
    let vertical = loss_difference.difference(&vertical_variation(predicted)?, &vertical_variation(target)?)?;
    Ok((horizontal, vertical))
}

/// Masks of the pixel pairs compared by the variations
fn variation_masks(mask: &Mask) -> candle_core::Result<(Tensor, Tensor)> {
    let values = &mask.values;
    let width = values.dim(3)?;
    let height = values.dim(2)?;
    let horizontal = values.narrow(3, 1, width - 1)?.mul(&values.narrow(3, 0, width - 1)?)?;
    let vertical = values.narrow(2, 1, height - 1)?.mul(&values.narrow(2, 0, height - 1)?)?;
    Ok((horizontal, vertical))
}

/// All variation differences, flattened per batch entry
pub fn variation_difference(pt: &PredictedTarget, scale_index: usize, loss_difference: LossDifference) -> DenoiserResult<Tensor> {
    let (horizontal, vertical) = variation_differences(pt, scale_index, loss_difference)?;
    Ok(Tensor::cat(&[horizontal.flatten_from(1)?, vertical.flatten_from(1)?], 1)?)
}

pub fn masked_variation_difference(
    pt: &PredictedTarget,
    scale_index: usize,
    loss_difference: LossDifference,
) -> DenoiserResult<Tensor> {
    let mask = pt.mask(scale_index)?;
    let (horizontal, vertical) = variation_differences(pt, scale_index, loss_difference)?;
    let (horizontal_mask, vertical_mask) = variation_masks(mask)?;
    let horizontal = horizontal.broadcast_mul(&horizontal_mask)?;
    let vertical = vertical.broadcast_mul(&vertical_mask)?;
    Ok(Tensor::cat(&[horizontal.flatten_from(1)?, vertical.flatten_from(1)?], 1)?)
}

/// Mean over both variation directions together
pub fn variation_mean(pt: &PredictedTarget, scale_index: usize, loss_difference: LossDifference) -> DenoiserResult<Tensor> {
    Ok(variation_difference(pt, scale_index, loss_difference)?.mean_all()?)
}

pub fn masked_variation_mean(
    pt: &PredictedTarget,
    scale_index: usize,
    loss_difference: LossDifference,
) -> DenoiserResult<Tensor> {
    let mask = pt.mask(scale_index)?;
    if mask.sum <= 0.0 {
        return zero(&mask.values);
    }
    let masked = masked_variation_difference(pt, scale_index, loss_difference)?;
    Ok(masked.sum_all()?.affine(1.0 / mask.sum as f64, 0.0)?)
}

/// `1 − mean(MS-SSIM)` on the finest scale
pub fn ms_ssim(pt: &PredictedTarget) -> DenoiserResult<Tensor> {
    let (predicted, target) = pt.scale(0)?;
    ssim::ms_ssim_loss(predicted, target)
}

pub fn masked_ms_ssim(_pt: &PredictedTarget) -> DenoiserResult<Tensor> {
    Err(DenoiserError::configuration("masked MS-SSIM is not implemented"))
}

// ═══════════════════════════════════════════════════════════════════════════
// LOSS
// ═══════════════════════════════════════════════════════════════════════════

/// Normalized `4^-s` weights for `count` scales
pub fn scale_weights(count: usize) -> Vec<f64> {
    let raw: Vec<f64> = (0..count).map(|s| 0.25f64.powi(s as i32)).collect();
    let total: f64 = raw.iter().sum();
    raw.iter().map(|w| w / total).collect()
}

fn accumulate(total: Option<Tensor>, weight: f64, term: Tensor) -> DenoiserResult<Option<Tensor>> {
    let weighted = term.affine(weight, 0.0)?;
    Ok(Some(match total {
        Some(total) => (total + weighted)?,
        None => weighted,
    }))
}

/// Weighted loss of one feature.
///
/// `n = 1` without multiscale loss, otherwise the pyramid depth.
pub fn loss(
    pt: &PredictedTarget,
    weights: &LossWeights,
    masked_weights: &LossWeights,
    loss_difference: LossDifference,
    use_multiscale_loss: bool,
) -> DenoiserResult<Tensor> {
    let count = if use_multiscale_loss { pt.number_of_scales() } else { 1 };
    let scales = scale_weights(count);
    let mut total: Option<Tensor> = None;

    for (scale_index, &scale_weight) in scales.iter().enumerate() {
        if weights.mean > 0.0 {
            total = accumulate(total, weights.mean * scale_weight, mean(pt, scale_index, loss_difference)?)?;
        }
        if weights.variation > 0.0 {
            let term = variation_mean(pt, scale_index, loss_difference)?;
            total = accumulate(total, weights.variation * scale_weight, term)?;
        }
    }
    if weights.ms_ssim > 0.0 {
        total = accumulate(total, weights.ms_ssim, ms_ssim(pt)?)?;
    }

    for (scale_index, &scale_weight) in scales.iter().enumerate() {
        if masked_weights.mean > 0.0 {
            let term = masked_mean(pt, scale_index, loss_difference)?;
            total = accumulate(total, masked_weights.mean * scale_weight, term)?;
        }
        if masked_weights.variation > 0.0 {
            let term = masked_variation_mean(pt, scale_index, loss_difference)?;
            total = accumulate(total, masked_weights.variation * scale_weight, term)?;
        }
    }
    if masked_weights.ms_ssim > 0.0 {
        total = accumulate(total, masked_weights.ms_ssim, masked_ms_ssim(pt)?)?;
    }

    match total {
        Some(total) => Ok(total),
        None => {
            let (predicted, _) = pt.scale(0)?;
            zero(predicted)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TRACKED METRICS
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Scalar(f64),
    Histogram(Vec<f64>),
}

fn scalar(tensor: Tensor) -> DenoiserResult<MetricValue> {
    Ok(MetricValue::Scalar(tensor.to_dtype(DType::F64)?.to_scalar::<f64>()?))
}

fn histogram(tensor: Tensor) -> DenoiserResult<MetricValue> {
    Ok(MetricValue::Histogram(tensor.flatten_all()?.to_dtype(DType::F64)?.to_vec1::<f64>()?))
}

/// Metrics requested by `statistics`, named by [`naming`]
pub fn tracked_metrics(
    pass: RenderPass,
    pt: &PredictedTarget,
    statistics: &Statistics,
    masked: bool,
    loss_difference: LossDifference,
    use_multiscale_metrics: bool,
) -> DenoiserResult<Vec<(String, MetricValue)>> {
    let mut metrics = Vec::new();
    if !statistics.is_active() {
        return Ok(metrics);
    }
    let count = if use_multiscale_metrics { pt.number_of_scales() } else { 1 };
    for scale_index in 0..count {
        if statistics.track_mean {
            let value = if masked {
                masked_mean(pt, scale_index, loss_difference)?
            } else {
                mean(pt, scale_index, loss_difference)?
            };
            metrics.push((naming::mean_name(pass, masked, scale_index), scalar(value)?));
        }
        if statistics.track_variation {
            let value = if masked {
                masked_variation_mean(pt, scale_index, loss_difference)?
            } else {
                variation_mean(pt, scale_index, loss_difference)?
            };
            metrics.push((naming::variation_mean_name(pass, masked, scale_index), scalar(value)?));
        }
        if statistics.track_difference_histogram {
            let value = if masked {
                masked_difference(pt, scale_index, loss_difference)?
            } else {
                difference(pt, scale_index, loss_difference)?
            };
            metrics.push((naming::difference_name(pass, masked, scale_index), histogram(value)?));
        }
        if statistics.track_variation_difference_histogram {
            let value = if masked {
                masked_variation_difference(pt, scale_index, loss_difference)?
            } else {
                variation_difference(pt, scale_index, loss_difference)?
            };
            metrics.push((naming::variation_difference_name(pass, masked, scale_index), histogram(value)?));
        }
    }
    if statistics.track_ms_ssim {
        let value = if masked { masked_ms_ssim(pt)? } else { ms_ssim(pt)? };
        metrics.push((naming::ms_ssim_name(pass, masked), scalar(value)?));
    }
    Ok(metrics)
}

// ═══════════════════════════════════════════════════════════════════════════
// FEATURE SET
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingFeatureKind {
    Base,
    Combined {
        color: RenderPass,
        direct: RenderPass,
        indirect: RenderPass,
    },
    CombinedImage,
}

#[derive(Debug, Clone)]
pub struct TrainingFeature {
    pub pass: RenderPass,
    pub kind: TrainingFeatureKind,
    pub loss_weights: LossWeights,
    pub loss_weights_masked: LossWeights,
    pub statistics: Statistics,
    pub statistics_masked: Statistics,
}

impl TrainingFeature {
    pub fn has_loss(&self) -> bool {
        self.loss_weights.is_active() || self.loss_weights_masked.is_active()
    }
}

/// Every training feature of a configuration, keyed by pass
#[derive(Debug, Clone)]
pub struct TrainingFeatureSet {
    features: BTreeMap<RenderPass, TrainingFeature>,
    pub loss_difference: LossDifference,
    pub use_multiscale_loss: bool,
    pub use_multiscale_metrics: bool,
}

impl TrainingFeatureSet {
    pub fn new(config: &DenoiserConfig) -> DenoiserResult<Self> {
        let mut features = BTreeMap::new();
        let feature_passes = config.feature_passes()?;
        let targets: Vec<RenderPass> = feature_passes
            .iter()
            .filter(|(_, f)| f.is_source && f.is_target)
            .map(|(pass, _)| *pass)
            .collect();

        for (&pass, feature) in feature_passes.iter().filter(|(p, _)| targets.contains(p)) {
            let masked = feature.loss_weights_masked.is_active() || feature.statistics_masked.is_active();
            if masked && !pass.mask_source().is_some_and(|source| targets.contains(&source)) {
                return Err(DenoiserError::configuration(format!(
                    "masked metrics of '{}' need its color pass as a target",
                    pass
                )));
            }
            features.insert(
                pass,
                TrainingFeature {
                    pass,
                    kind: TrainingFeatureKind::Base,
                    loss_weights: feature.loss_weights,
                    loss_weights_masked: feature.loss_weights_masked,
                    statistics: feature.statistics,
                    statistics_masked: feature.statistics_masked,
                },
            );
        }

        for (pass, combined) in config.combined_feature_passes()? {
            let Some((color, direct, indirect)) = pass.combined_constituents() else {
                continue;
            };
            if ![color, direct, indirect].iter().all(|p| targets.contains(p)) {
                if combined.loss_weights.is_active() || combined.loss_weights_masked.is_active() {
                    return Err(DenoiserError::configuration(format!(
                        "'{}' needs '{}', '{}' and '{}' as targets",
                        pass, color, direct, indirect
                    )));
                }
                log::warn!("Skipping '{}', its constituents are not all targets", pass);
                continue;
            }
            features.insert(
                pass,
                TrainingFeature {
                    pass,
                    kind: TrainingFeatureKind::Combined { color, direct, indirect },
                    loss_weights: combined.loss_weights,
                    loss_weights_masked: combined.loss_weights_masked,
                    statistics: combined.statistics,
                    statistics_masked: combined.statistics_masked,
                },
            );
        }

        let image = &config.combined_image;
        if image.loss_weights.is_active() || image.statistics.is_active() {
            features.insert(
                RenderPass::Combined,
                TrainingFeature {
                    pass: RenderPass::Combined,
                    kind: TrainingFeatureKind::CombinedImage,
                    loss_weights: image.loss_weights,
                    loss_weights_masked: LossWeights::default(),
                    statistics: image.statistics,
                    statistics_masked: Statistics::default(),
                },
            );
        }

        Ok(Self {
            features,
            loss_difference: config.loss_difference,
            use_multiscale_loss: config.neural_network.use_multiscale_loss,
            use_multiscale_metrics: config.neural_network.use_multiscale_metrics,
        })
    }

    pub fn get(&self, pass: RenderPass) -> Option<&TrainingFeature> {
        self.features.get(&pass)
    }

    pub fn features(&self) -> impl Iterator<Item = &TrainingFeature> {
        self.features.values()
    }

    /// Resolve every feature against one forward pass.
    ///
    /// `predictions` and `targets` hold per-scale tensors of base passes.
    pub fn resolve(
        &self,
        predictions: &BTreeMap<RenderPass, Vec<Tensor>>,
        targets: &BTreeMap<RenderPass, Vec<Tensor>>,
    ) -> DenoiserResult<BTreeMap<RenderPass, PredictedTarget>> {
        let mut resolved: BTreeMap<RenderPass, PredictedTarget> = BTreeMap::new();
        // Base passes sort before combined passes, combined image last.
        for (pass, feature) in &self.features {
            let pt = match feature.kind {
                TrainingFeatureKind::Base => resolve_base(*pass, predictions, targets)?,
                TrainingFeatureKind::Combined { color, direct, indirect } => {
                    let base = |p: RenderPass| {
                        resolved
                            .get(&p)
                            .ok_or_else(|| DenoiserError::configuration(format!("'{}' was not resolved", p)))
                    };
                    combine_material(base(color)?, base(direct)?, base(indirect)?)?
                }
                TrainingFeatureKind::CombinedImage => resolve_image(&resolved, predictions, targets)?,
            };
            resolved.insert(*pass, pt);
        }
        Ok(resolved)
    }

    /// Sum of every feature's weighted loss, 0 when no weight is positive
    pub fn total_loss(&self, resolved: &BTreeMap<RenderPass, PredictedTarget>, device: &Device) -> DenoiserResult<Tensor> {
        let mut total: Option<Tensor> = None;
        for feature in self.features().filter(|f| f.has_loss()) {
            let pt = resolved
                .get(&feature.pass)
                .ok_or_else(|| DenoiserError::configuration(format!("'{}' was not resolved", feature.pass)))?;
            let term = loss(
                pt,
                &feature.loss_weights,
                &feature.loss_weights_masked,
                self.loss_difference,
                self.use_multiscale_loss,
            )?;
            total = Some(match total {
                Some(total) => (total + term)?,
                None => term,
            });
        }
        match total {
            Some(total) => Ok(total),
            None => Ok(Tensor::zeros((), DType::F32, device)?),
        }
    }

    /// Every tracked metric of every feature
    pub fn metrics(&self, resolved: &BTreeMap<RenderPass, PredictedTarget>) -> DenoiserResult<Vec<(String, MetricValue)>> {
        let mut metrics = Vec::new();
        for feature in self.features() {
            let Some(pt) = resolved.get(&feature.pass) else {
                continue;
            };
            for (statistics, masked) in [(&feature.statistics, false), (&feature.statistics_masked, true)] {
                metrics.extend(tracked_metrics(
                    feature.pass,
                    pt,
                    statistics,
                    masked,
                    self.loss_difference,
                    self.use_multiscale_metrics,
                )?);
            }
        }
        Ok(metrics)
    }
}

fn per_scale<'a>(map: &'a BTreeMap<RenderPass, Vec<Tensor>>, pass: RenderPass, what: &str) -> DenoiserResult<&'a Vec<Tensor>> {
    map.get(&pass)
        .ok_or_else(|| DenoiserError::configuration(format!("missing {} for '{}'", what, pass)))
}

fn resolve_base(
    pass: RenderPass,
    predictions: &BTreeMap<RenderPass, Vec<Tensor>>,
    targets: &BTreeMap<RenderPass, Vec<Tensor>>,
) -> DenoiserResult<PredictedTarget> {
    let predicted = per_scale(predictions, pass, "prediction")?.clone();
    let target = per_scale(targets, pass, "target")?.clone();
    let mask = match pass.mask_source().and_then(|source| targets.get(&source)) {
        Some(source_targets) => Some(
            source_targets
                .iter()
                .take(target.len())
                .map(Mask::from_target)
                .collect::<DenoiserResult<Vec<_>>>()?,
        ),
        None => None,
    };
    PredictedTarget::new(predicted, target, mask)
}

fn resolve_image(
    resolved: &BTreeMap<RenderPass, PredictedTarget>,
    predictions: &BTreeMap<RenderPass, Vec<Tensor>>,
    targets: &BTreeMap<RenderPass, Vec<Tensor>>,
) -> DenoiserResult<PredictedTarget> {
    let base = |pass: RenderPass| -> DenoiserResult<PredictedTarget> {
        match resolved.get(&pass) {
            Some(pt) => Ok(pt.clone()),
            None => resolve_base(pass, predictions, targets),
        }
    };
    let mut parts = Vec::with_capacity(COMBINED_MATERIAL_PASSES.len() + 2);
    for material in COMBINED_MATERIAL_PASSES {
        let pt = match resolved.get(&material) {
            Some(pt) => pt.clone(),
            None => {
                let (color, direct, indirect) = material.combined_constituents().ok_or_else(|| {
                    DenoiserError::configuration(format!("'{}' is not a combined material pass", material))
                })?;
                combine_material(&base(color)?, &base(direct)?, &base(indirect)?)?
            }
        };
        parts.push(pt);
    }
    parts.push(base(RenderPass::Emission)?);
    parts.push(base(RenderPass::Environment)?);
    let references: Vec<&PredictedTarget> = parts.iter().collect();
    sum_constituents(&references)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(value: f32, device: &Device) -> Tensor {
        Tensor::full(value, (1, 3, 4, 4), device).unwrap()
    }

    fn single(predicted: Tensor, target: Tensor) -> PredictedTarget {
        PredictedTarget::new(vec![predicted], vec![target], None).unwrap()
    }

    fn value(t: Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_scale_weights() {
        let weights = scale_weights(3);
        assert!((weights.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!((weights[0] / weights[1] - 4.0).abs() < 1e-12);
        assert!((weights[1] / weights[2] - 4.0).abs() < 1e-12);
        assert_eq!(scale_weights(1), vec![1.0]);
    }

    #[test]
    fn test_empty_mask_gives_exact_zero() {
        let device = Device::Cpu;
        let zeros = Tensor::zeros((1, 3, 4, 4), DType::F32, &device).unwrap();
        let mask = Mask::from_target(&zeros).unwrap();
        assert_eq!(mask.sum, 0.0);
        let pt = PredictedTarget::new(vec![constant(2.0, &device)], vec![constant(1.0, &device)], Some(vec![mask])).unwrap();
        assert_eq!(value(masked_mean(&pt, 0, LossDifference::Absolute).unwrap()), 0.0);
        assert_eq!(value(masked_variation_mean(&pt, 0, LossDifference::Absolute).unwrap()), 0.0);
    }

    #[test]
    fn test_masked_mean_counts_mask_pixels() {
        let device = Device::Cpu;
        // Left half of the mask source is non-zero in one channel only.
        let mut data = vec![0f32; 3 * 16];
        for y in 0..4 {
            for x in 0..2 {
                data[16 + y * 4 + x] = 1.0;
            }
        }
        let source = Tensor::from_vec(data, (1, 3, 4, 4), &device).unwrap();
        let mask = Mask::from_target(&source).unwrap();
        assert_eq!(mask.sum, 8.0);
        let pt = PredictedTarget::new(vec![constant(1.5, &device)], vec![constant(1.0, &device)], Some(vec![mask])).unwrap();
        // 8 pixels · 3 channels · 0.5 / 8
        let masked: f32 = value(masked_mean(&pt, 0, LossDifference::Absolute).unwrap());
        assert!((masked - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_variation_mean_ignores_constant_offset() {
        let device = Device::Cpu;
        let pt = single(constant(3.0, &device), constant(1.0, &device));
        assert!(value(variation_mean(&pt, 0, LossDifference::Absolute).unwrap()).abs() < 1e-6);
        assert!((value(mean(&pt, 0, LossDifference::Absolute).unwrap()) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_combined_algebra() {
        let device = Device::Cpu;
        let color = single(constant(2.0, &device), constant(2.0, &device));
        let direct = single(constant(0.3, &device), constant(0.3, &device));
        let indirect = single(constant(0.1, &device), constant(0.1, &device));
        let combined = combine_material(&color, &direct, &indirect).unwrap();
        let values: Vec<f32> = combined.predicted[0].flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| (v - 0.8).abs() < 1e-6));
        assert_eq!(combined.mask.as_ref().unwrap()[0].sum, 16.0);
    }

    #[test]
    fn test_combined_image_sums_six_parts() {
        let device = Device::Cpu;
        let parts: Vec<PredictedTarget> = (0..6).map(|_| single(constant(1.0, &device), constant(0.0, &device))).collect();
        let references: Vec<&PredictedTarget> = parts.iter().collect();
        let image = sum_constituents(&references).unwrap();
        let values: Vec<f32> = image.predicted[0].flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| (v - 6.0).abs() < 1e-6));
        assert!(image.mask.is_none());
    }

    #[test]
    fn test_disabled_masked_ms_ssim_is_never_evaluated() {
        let device = Device::Cpu;
        let pt = single(constant(1.0, &device), constant(0.5, &device));
        let weights = LossWeights {
            mean: 1.0,
            ..Default::default()
        };
        let masked = LossWeights {
            ms_ssim: 0.0,
            ..Default::default()
        };
        let total = loss(&pt, &weights, &masked, LossDifference::Absolute, false).unwrap();
        assert!((value(total) - 0.5).abs() < 1e-6);

        let enabled = LossWeights {
            ms_ssim: 1.0,
            ..Default::default()
        };
        assert!(matches!(
            loss(&pt, &weights, &enabled, LossDifference::Absolute, false),
            Err(DenoiserError::Configuration(_))
        ));
    }

    #[test]
    fn test_multiscale_loss_weights_scales() {
        let device = Device::Cpu;
        let predicted = vec![
            Tensor::full(1.0f32, (1, 1, 4, 4), &device).unwrap(),
            Tensor::full(5.0f32, (1, 1, 2, 2), &device).unwrap(),
        ];
        let target = vec![
            Tensor::zeros((1, 1, 4, 4), DType::F32, &device).unwrap(),
            Tensor::zeros((1, 1, 2, 2), DType::F32, &device).unwrap(),
        ];
        let pt = PredictedTarget::new(predicted, target, None).unwrap();
        let weights = LossWeights {
            mean: 1.0,
            ..Default::default()
        };
        let single_scale = value(loss(&pt, &weights, &LossWeights::default(), LossDifference::Absolute, false).unwrap());
        assert!((single_scale - 1.0).abs() < 1e-6);
        // 0.8 · 1 + 0.2 · 5
        let multiscale = value(loss(&pt, &weights, &LossWeights::default(), LossDifference::Absolute, true).unwrap());
        assert!((multiscale - 1.8).abs() < 1e-5);
    }

    #[test]
    fn test_mismatched_scales_are_rejected() {
        let device = Device::Cpu;
        let result = PredictedTarget::new(vec![constant(1.0, &device)], vec![], None);
        assert!(matches!(result, Err(DenoiserError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_tracked_metric_names() {
        let device = Device::Cpu;
        let pt = single(constant(1.0, &device), constant(0.5, &device));
        let statistics = Statistics {
            track_mean: true,
            track_difference_histogram: true,
            ..Default::default()
        };
        let metrics = tracked_metrics(
            RenderPass::DiffuseColor,
            &pt,
            &statistics,
            false,
            LossDifference::Squared,
            true,
        )
        .unwrap();
        assert_eq!(metrics[0].0, "diffuse_color/mean");
        assert_eq!(metrics[0].1, MetricValue::Scalar(0.25));
        assert!(matches!(&metrics[1].1, MetricValue::Histogram(values) if values.len() == 48));
    }
}
