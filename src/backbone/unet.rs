//! U-Net encoder/decoder with skip connections

use candle_core::Tensor;
use candle_nn::{ConvTranspose2d, ConvTranspose2dConfig, Module, VarBuilder};

use super::{ConvLayer, MultiscaleEncoder};
use crate::config::NeuralNetworkConfig;
use crate::DenoiserResult;

#[derive(Debug)]
struct ConvBlock {
    layers: Vec<ConvLayer>,
}

impl ConvBlock {
    fn new(in_channels: usize, filters: usize, config: &NeuralNetworkConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let layers = (0..config.number_of_convolutions_per_block.max(1))
            .map(|i| {
                let channels = if i == 0 { in_channels } else { filters };
                ConvLayer::new(channels, filters, 3, config, false, vb.pp(format!("layer_{}", i)))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let mut xs = xs.clone();
        for layer in &self.layers {
            xs = layer.forward_t(&xs, train)?;
        }
        Ok(xs)
    }
}

#[derive(Debug)]
pub struct UNet {
    encoder_blocks: Vec<ConvBlock>,
    bottleneck: ConvBlock,
    /// Coarsest first
    upsamples: Vec<ConvTranspose2d>,
    decoder_blocks: Vec<ConvBlock>,
    use_multiscale_output: bool,
    output_channels: Vec<usize>,
}

impl UNet {
    pub fn new(config: &NeuralNetworkConfig, input_channels: usize, vb: VarBuilder) -> DenoiserResult<Self> {
        let filters = &config.number_of_filters_for_convolution_blocks;
        let depth = filters.len().saturating_sub(1);

        let mut channels = input_channels;
        let mut encoder_blocks = Vec::with_capacity(depth);
        for (index, &block_filters) in filters.iter().take(depth).enumerate() {
            encoder_blocks.push(ConvBlock::new(channels, block_filters, config, vb.pp(format!("encoder_{}", index)))?);
            channels = block_filters;
        }

        let bottleneck = ConvBlock::new(channels, filters[depth], config, vb.pp("bottleneck"))?;
        channels = filters[depth];
        let mut output_channels = Vec::new();
        if config.use_multiscale_predictions && depth > 0 {
            output_channels.push(channels);
        }

        let mut upsamples = Vec::with_capacity(depth);
        let mut decoder_blocks = Vec::with_capacity(depth);
        for index in (0..depth).rev() {
            upsamples.push(candle_nn::conv_transpose2d(
                channels,
                filters[index],
                2,
                ConvTranspose2dConfig {
                    stride: 2,
                    ..Default::default()
                },
                vb.pp(format!("upsample_{}", index)),
            )?);
            decoder_blocks.push(ConvBlock::new(
                2 * filters[index],
                filters[index],
                config,
                vb.pp(format!("decoder_{}", index)),
            )?);
            channels = filters[index];
            if config.use_multiscale_predictions || index == 0 {
                output_channels.push(channels);
            }
        }
        if depth == 0 {
            output_channels.push(channels);
        }

        Ok(Self {
            encoder_blocks,
            bottleneck,
            upsamples,
            decoder_blocks,
            use_multiscale_output: config.use_multiscale_predictions,
            output_channels,
        })
    }
}

impl MultiscaleEncoder for UNet {
    fn forward_t(&self, xs: &Tensor, train: bool) -> DenoiserResult<Vec<Tensor>> {
        let mut results = Vec::with_capacity(self.output_channels.len());
        let mut skips = Vec::with_capacity(self.encoder_blocks.len());
        let mut xs = xs.clone();
        for block in &self.encoder_blocks {
            xs = block.forward_t(&xs, train)?;
            skips.push(xs.clone());
            xs = xs.max_pool2d(2)?;
        }

        xs = self.bottleneck.forward_t(&xs, train)?;
        let depth = self.decoder_blocks.len();
        if depth == 0 || self.use_multiscale_output {
            results.push(xs.clone());
        }

        for (i, (upsample, block)) in self.upsamples.iter().zip(self.decoder_blocks.iter()).enumerate() {
            let upsampled = upsample.forward(&xs)?;
            let skip = skips.pop().ok_or_else(|| candle_core::Error::Msg("missing skip connection".into()))?;
            xs = block.forward_t(&Tensor::cat(&[&skip, &upsampled], 1)?, train)?;
            if self.use_multiscale_output || i + 1 == depth {
                results.push(xs.clone());
            }
        }
        Ok(results)
    }

    fn output_channels(&self) -> &[usize] {
        &self.output_channels
    }
}
