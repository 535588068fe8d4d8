//! # Backbones
//!
//! Pluggable multiscale encoders plus the per-scale output heads that bring
//! every feature map to the channel count the pipeline needs.
//!
//! ```text
//! input ─▶ MultiscaleEncoder ─▶ [coarse … fine] ─▶ heads ─▶ reverse ─▶ [fine … coarse]
//! head = 1×1 conv ─▶ ReLU ─▶ 1×1 conv
//! ```

pub mod tiramisu;
pub mod unet;

use candle_core::Tensor;
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, Dropout, Module, ModuleT, VarBuilder};

use crate::config::{Architecture, NeuralNetworkConfig};
use crate::DenoiserResult;

pub use tiramisu::Tiramisu;
pub use unet::UNet;

/// A network producing one feature map per pyramid scale
pub trait MultiscaleEncoder: std::fmt::Debug + Send {
    /// Feature maps ordered coarse → fine
    fn forward_t(&self, xs: &Tensor, train: bool) -> DenoiserResult<Vec<Tensor>>;

    /// Channels of each returned feature map, coarse → fine
    fn output_channels(&self) -> &[usize];
}

/// Build the encoder selected by `config.architecture`
pub fn build_encoder(
    config: &NeuralNetworkConfig,
    input_channels: usize,
    vb: VarBuilder,
) -> DenoiserResult<Box<dyn MultiscaleEncoder>> {
    let encoder: Box<dyn MultiscaleEncoder> = match config.architecture {
        Architecture::Tiramisu => Box::new(Tiramisu::new(config, input_channels, vb.pp("tiramisu"))?),
        Architecture::UNet => Box::new(UNet::new(config, input_channels, vb.pp("unet"))?),
    };
    Ok(encoder)
}

/// Convolution with optional batch normalization and dropout
#[derive(Debug)]
pub(crate) struct ConvLayer {
    norm: Option<BatchNorm>,
    conv: Conv2d,
    dropout: Option<Dropout>,
    pre_activation: bool,
}

impl ConvLayer {
    pub(crate) fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        config: &NeuralNetworkConfig,
        pre_activation: bool,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let conv = candle_nn::conv2d(
            in_channels,
            out_channels,
            kernel_size,
            Conv2dConfig {
                padding: kernel_size / 2,
                ..Default::default()
            },
            vb.pp("conv"),
        )?;
        let norm_channels = if pre_activation { in_channels } else { out_channels };
        let norm = if config.use_batch_normalization {
            Some(candle_nn::batch_norm(norm_channels, 1e-5, vb.pp("norm"))?)
        } else {
            None
        };
        let dropout = (config.dropout_rate > 0.0).then(|| Dropout::new(config.dropout_rate as f32));
        Ok(Self {
            norm,
            conv,
            dropout,
            pre_activation,
        })
    }

    fn normalize(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        match &self.norm {
            Some(norm) => norm.forward_t(xs, train),
            None => Ok(xs.clone()),
        }
    }

    /// `norm → relu → conv` when pre-activated, `conv → norm → relu` otherwise
    pub(crate) fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let ys = if self.pre_activation {
            let ys = self.normalize(xs, train)?.relu()?;
            self.conv.forward(&ys)?
        } else {
            let ys = self.conv.forward(xs)?;
            self.normalize(&ys, train)?.relu()?
        };
        match &self.dropout {
            Some(dropout) => dropout.forward(&ys, train),
            None => Ok(ys),
        }
    }
}

/// Maps a feature map to the requested channel count
#[derive(Debug)]
struct OutputHead {
    hidden: Conv2d,
    output: Conv2d,
}

impl OutputHead {
    fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let hidden = candle_nn::conv2d(in_channels, out_channels, 1, Default::default(), vb.pp("hidden"))?;
        let output = candle_nn::conv2d(out_channels, out_channels, 1, Default::default(), vb.pp("output"))?;
        Ok(Self { hidden, output })
    }
}

impl Module for OutputHead {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.output.forward(&self.hidden.forward(xs)?.relu()?)
    }
}

/// Encoder plus output heads, returning predictions finest first
#[derive(Debug)]
pub struct Backbone {
    encoder: Box<dyn MultiscaleEncoder>,
    heads: Vec<OutputHead>,
    output_channels: usize,
}

impl Backbone {
    pub fn new(
        config: &NeuralNetworkConfig,
        input_channels: usize,
        output_channels: usize,
        vb: VarBuilder,
    ) -> DenoiserResult<Self> {
        let encoder = build_encoder(config, input_channels, vb.clone())?;
        let heads = encoder
            .output_channels()
            .iter()
            .enumerate()
            .map(|(i, &channels)| OutputHead::new(channels, output_channels, vb.pp(format!("postprocess_{}", i))))
            .collect::<candle_core::Result<Vec<_>>>()?;
        log::debug!(
            "Backbone {:?}: {} input channels, {} output channels, {} scales",
            config.architecture,
            input_channels,
            output_channels,
            heads.len()
        );
        Ok(Self {
            encoder,
            heads,
            output_channels,
        })
    }

    pub fn output_channels(&self) -> usize {
        self.output_channels
    }

    pub fn number_of_scales(&self) -> usize {
        self.heads.len()
    }

    /// Per-scale outputs, index 0 = finest
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> DenoiserResult<Vec<Tensor>> {
        let features = self.encoder.forward_t(xs, train)?;
        let mut outputs = features
            .iter()
            .zip(self.heads.iter())
            .map(|(feature, head)| head.forward(feature))
            .collect::<candle_core::Result<Vec<_>>>()?;
        outputs.reverse();
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_config(architecture: Architecture, multiscale: bool) -> NeuralNetworkConfig {
        NeuralNetworkConfig {
            architecture,
            number_of_filters_for_convolution_blocks: vec![4, 6, 8],
            number_of_convolutions_per_block: 2,
            use_multiscale_predictions: multiscale,
            ..Default::default()
        }
    }

    fn assert_pyramid(architecture: Architecture) {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let backbone = Backbone::new(&small_config(architecture, true), 5, 9, vb).unwrap();
        let xs = Tensor::randn(0f32, 1.0, (2, 5, 16, 16), &device).unwrap();
        let outputs = backbone.forward_t(&xs, true).unwrap();
        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs[0].dims(), &[2, 9, 16, 16]);
        assert_eq!(outputs[1].dims(), &[2, 9, 8, 8]);
        assert_eq!(outputs[2].dims(), &[2, 9, 4, 4]);
    }

    #[test]
    fn test_tiramisu_pyramid() {
        assert_pyramid(Architecture::Tiramisu);
    }

    #[test]
    fn test_unet_pyramid() {
        assert_pyramid(Architecture::UNet);
    }

    #[test]
    fn test_single_scale_output() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut config = small_config(Architecture::UNet, false);
        config.use_batch_normalization = true;
        config.dropout_rate = 0.1;
        let backbone = Backbone::new(&config, 3, 3, vb).unwrap();
        let xs = Tensor::randn(0f32, 1.0, (1, 3, 8, 8), &device).unwrap();
        let outputs = backbone.forward_t(&xs, false).unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].dims(), &[1, 3, 8, 8]);
    }
}
