//! Keys for stored tensors and tags for tracked metrics

use crate::render_passes::RenderPass;

pub fn source_feature_name(pass: RenderPass, index: usize) -> String {
    format!("{}/source/{}", pass, index)
}

pub fn target_feature_name(pass: RenderPass) -> String {
    format!("{}/target", pass)
}

pub fn prediction_feature_name(pass: RenderPass) -> String {
    format!("{}/prediction", pass)
}

fn metric_name(pass: RenderPass, metric: &str, masked: bool, scale_index: usize) -> String {
    let masked = if masked { "masked_" } else { "" };
    if scale_index == 0 {
        format!("{}/{}{}", pass, masked, metric)
    } else {
        format!("{}/{}{}_scale_{}", pass, masked, metric, scale_index)
    }
}

pub fn mean_name(pass: RenderPass, masked: bool, scale_index: usize) -> String {
    metric_name(pass, "mean", masked, scale_index)
}

pub fn variation_mean_name(pass: RenderPass, masked: bool, scale_index: usize) -> String {
    metric_name(pass, "variation_mean", masked, scale_index)
}

pub fn difference_name(pass: RenderPass, masked: bool, scale_index: usize) -> String {
    metric_name(pass, "difference", masked, scale_index)
}

pub fn variation_difference_name(pass: RenderPass, masked: bool, scale_index: usize) -> String {
    metric_name(pass, "variation_difference", masked, scale_index)
}

pub fn ms_ssim_name(pass: RenderPass, masked: bool) -> String {
    metric_name(pass, "ms_ssim", masked, 0)
}
