//! # Render Passes
//!
//! The closed set of light-transport passes a renderer emits, plus the
//! auxiliary passes used only as network input.
//!
//! ```text
//! combined = Σ_material color · (direct + indirect)
//!          + volume_direct + volume_indirect + emission + environment
//! ```

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::DenoiserError;
use crate::DenoiserResult;

/// A named render pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderPass {
    DiffuseDirect,
    DiffuseIndirect,
    DiffuseColor,
    GlossyDirect,
    GlossyIndirect,
    GlossyColor,
    SubsurfaceDirect,
    SubsurfaceIndirect,
    SubsurfaceColor,
    TransmissionDirect,
    TransmissionIndirect,
    TransmissionColor,
    VolumeDirect,
    VolumeIndirect,
    Emission,
    Environment,
    Normal,
    Depth,
    Alpha,
    CombinedDiffuse,
    CombinedGlossy,
    CombinedSubsurface,
    CombinedTransmission,
    Combined,
}

/// Per-material passes that are recombined as `color * (direct + indirect)`
pub const COMBINED_MATERIAL_PASSES: [RenderPass; 4] = [
    RenderPass::CombinedDiffuse,
    RenderPass::CombinedGlossy,
    RenderPass::CombinedSubsurface,
    RenderPass::CombinedTransmission,
];

impl RenderPass {
    pub const ALL: [RenderPass; 24] = [
        RenderPass::DiffuseDirect,
        RenderPass::DiffuseIndirect,
        RenderPass::DiffuseColor,
        RenderPass::GlossyDirect,
        RenderPass::GlossyIndirect,
        RenderPass::GlossyColor,
        RenderPass::SubsurfaceDirect,
        RenderPass::SubsurfaceIndirect,
        RenderPass::SubsurfaceColor,
        RenderPass::TransmissionDirect,
        RenderPass::TransmissionIndirect,
        RenderPass::TransmissionColor,
        RenderPass::VolumeDirect,
        RenderPass::VolumeIndirect,
        RenderPass::Emission,
        RenderPass::Environment,
        RenderPass::Normal,
        RenderPass::Depth,
        RenderPass::Alpha,
        RenderPass::CombinedDiffuse,
        RenderPass::CombinedGlossy,
        RenderPass::CombinedSubsurface,
        RenderPass::CombinedTransmission,
        RenderPass::Combined,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RenderPass::DiffuseDirect => "diffuse_direct",
            RenderPass::DiffuseIndirect => "diffuse_indirect",
            RenderPass::DiffuseColor => "diffuse_color",
            RenderPass::GlossyDirect => "glossy_direct",
            RenderPass::GlossyIndirect => "glossy_indirect",
            RenderPass::GlossyColor => "glossy_color",
            RenderPass::SubsurfaceDirect => "subsurface_direct",
            RenderPass::SubsurfaceIndirect => "subsurface_indirect",
            RenderPass::SubsurfaceColor => "subsurface_color",
            RenderPass::TransmissionDirect => "transmission_direct",
            RenderPass::TransmissionIndirect => "transmission_indirect",
            RenderPass::TransmissionColor => "transmission_color",
            RenderPass::VolumeDirect => "volume_direct",
            RenderPass::VolumeIndirect => "volume_indirect",
            RenderPass::Emission => "emission",
            RenderPass::Environment => "environment",
            RenderPass::Normal => "normal",
            RenderPass::Depth => "depth",
            RenderPass::Alpha => "alpha",
            RenderPass::CombinedDiffuse => "combined_diffuse",
            RenderPass::CombinedGlossy => "combined_glossy",
            RenderPass::CombinedSubsurface => "combined_subsurface",
            RenderPass::CombinedTransmission => "combined_transmission",
            RenderPass::Combined => "combined",
        }
    }

    /// Depth and alpha are scalar passes, everything else is RGB
    pub fn number_of_channels(&self) -> usize {
        match self {
            RenderPass::Depth | RenderPass::Alpha => 1,
            _ => 3,
        }
    }

    pub fn is_color(&self) -> bool {
        matches!(
            self,
            RenderPass::DiffuseColor
                | RenderPass::GlossyColor
                | RenderPass::SubsurfaceColor
                | RenderPass::TransmissionColor
        )
    }

    pub fn is_direct_or_indirect(&self) -> bool {
        self.direct_or_indirect_to_color().is_some()
    }

    /// Color pass that scales a direct or indirect lighting pass
    pub fn direct_or_indirect_to_color(&self) -> Option<RenderPass> {
        match self {
            RenderPass::DiffuseDirect | RenderPass::DiffuseIndirect => Some(RenderPass::DiffuseColor),
            RenderPass::GlossyDirect | RenderPass::GlossyIndirect => Some(RenderPass::GlossyColor),
            RenderPass::SubsurfaceDirect | RenderPass::SubsurfaceIndirect => {
                Some(RenderPass::SubsurfaceColor)
            }
            RenderPass::TransmissionDirect | RenderPass::TransmissionIndirect => {
                Some(RenderPass::TransmissionColor)
            }
            _ => None,
        }
    }

    /// `(color, direct, indirect)` constituents of a combined material pass
    pub fn combined_constituents(&self) -> Option<(RenderPass, RenderPass, RenderPass)> {
        match self {
            RenderPass::CombinedDiffuse => Some((
                RenderPass::DiffuseColor,
                RenderPass::DiffuseDirect,
                RenderPass::DiffuseIndirect,
            )),
            RenderPass::CombinedGlossy => Some((
                RenderPass::GlossyColor,
                RenderPass::GlossyDirect,
                RenderPass::GlossyIndirect,
            )),
            RenderPass::CombinedSubsurface => Some((
                RenderPass::SubsurfaceColor,
                RenderPass::SubsurfaceDirect,
                RenderPass::SubsurfaceIndirect,
            )),
            RenderPass::CombinedTransmission => Some((
                RenderPass::TransmissionColor,
                RenderPass::TransmissionDirect,
                RenderPass::TransmissionIndirect,
            )),
            _ => None,
        }
    }

    pub fn combined_to_color(&self) -> Option<RenderPass> {
        self.combined_constituents().map(|(color, _, _)| color)
    }

    /// Pass whose non-zero target pixels define the mask of this pass, if any
    pub fn mask_source(&self) -> Option<RenderPass> {
        if self.is_color() || matches!(self, RenderPass::Emission | RenderPass::Environment) {
            Some(*self)
        } else if let Some(color) = self.direct_or_indirect_to_color() {
            Some(color)
        } else {
            self.combined_to_color()
        }
    }

    /// Passes whose three channels are RGB radiance or albedo
    pub fn is_rgb_color(&self) -> bool {
        !matches!(
            self,
            RenderPass::Normal | RenderPass::Depth | RenderPass::Alpha
        )
    }

    /// Passes the network can predict directly
    pub fn is_predictable(&self) -> bool {
        !matches!(
            self,
            RenderPass::CombinedDiffuse
                | RenderPass::CombinedGlossy
                | RenderPass::CombinedSubsurface
                | RenderPass::CombinedTransmission
                | RenderPass::Combined
        )
    }
}

impl fmt::Display for RenderPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RenderPass {
    type Err = DenoiserError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RenderPass::ALL
            .iter()
            .copied()
            .find(|pass| pass.as_str() == s)
            .ok_or_else(|| DenoiserError::configuration(format!("unknown render pass '{}'", s)))
    }
}

/// Recombine predicted passes into the final image.
///
/// Every material needs its color, direct and indirect pass; volume, emission
/// and environment are added when present.
pub fn compose_image(predictions: &BTreeMap<RenderPass, Tensor>) -> DenoiserResult<Tensor> {
    let fetch = |pass: RenderPass| {
        predictions.get(&pass).ok_or_else(|| {
            DenoiserError::configuration(format!("prediction for '{}' is required to compose the image", pass))
        })
    };

    let mut image: Option<Tensor> = None;
    for combined in COMBINED_MATERIAL_PASSES {
        if let Some((color, direct, indirect)) = combined.combined_constituents() {
            let material = fetch(color)?.mul(&(fetch(direct)? + fetch(indirect)?)?)?;
            image = Some(match image {
                Some(sum) => (sum + material)?,
                None => material,
            });
        }
    }

    let mut image = image.ok_or_else(|| DenoiserError::configuration("no material passes"))?;
    for pass in [
        RenderPass::VolumeDirect,
        RenderPass::VolumeIndirect,
        RenderPass::Environment,
        RenderPass::Emission,
    ] {
        if let Some(prediction) = predictions.get(&pass) {
            image = (image + prediction)?;
        }
    }
    Ok(image)
}
