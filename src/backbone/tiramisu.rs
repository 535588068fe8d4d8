//! Fully convolutional DenseNet ("One Hundred Layers Tiramisu").
//!
//! Every convolution block concatenates each layer's output onto its input,
//! so the channel count grows by `filters` per convolution.

use candle_core::Tensor;
use candle_nn::{Conv2d, ConvTranspose2d, ConvTranspose2dConfig, Module, VarBuilder};

use super::{ConvLayer, MultiscaleEncoder};
use crate::config::NeuralNetworkConfig;
use crate::DenoiserResult;

#[derive(Debug)]
struct DenseBlock {
    layers: Vec<ConvLayer>,
}

impl DenseBlock {
    /// Returns the block and its output channel count
    fn new(
        in_channels: usize,
        filters: usize,
        config: &NeuralNetworkConfig,
        vb: VarBuilder,
    ) -> candle_core::Result<(Self, usize)> {
        let mut channels = in_channels;
        let mut layers = Vec::with_capacity(config.number_of_convolutions_per_block);
        for i in 0..config.number_of_convolutions_per_block {
            layers.push(ConvLayer::new(channels, filters, 3, config, true, vb.pp(format!("layer_{}", i)))?);
            channels += filters;
        }
        Ok((Self { layers }, channels))
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let mut xs = xs.clone();
        for layer in &self.layers {
            let ys = layer.forward_t(&xs, train)?;
            xs = Tensor::cat(&[&xs, &ys], 1)?;
        }
        Ok(xs)
    }
}

#[derive(Debug)]
struct TransitionDown {
    layer: ConvLayer,
}

impl TransitionDown {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        self.layer.forward_t(xs, train)?.max_pool2d(2)
    }
}

#[derive(Debug)]
pub struct Tiramisu {
    preprocessing: Conv2d,
    down_blocks: Vec<DenseBlock>,
    transitions_down: Vec<TransitionDown>,
    /// Coarsest first
    up_blocks: Vec<DenseBlock>,
    transitions_up: Vec<ConvTranspose2d>,
    last_block: DenseBlock,
    use_multiscale_output: bool,
    output_channels: Vec<usize>,
}

impl Tiramisu {
    pub fn new(config: &NeuralNetworkConfig, input_channels: usize, vb: VarBuilder) -> DenoiserResult<Self> {
        let filters = &config.number_of_filters_for_convolution_blocks;
        let sampling_steps = filters.len().saturating_sub(1);

        let preprocessing = candle_nn::conv2d(
            input_channels,
            filters[0],
            3,
            candle_nn::Conv2dConfig {
                padding: 1,
                ..Default::default()
            },
            vb.pp("preprocessing"),
        )?;
        let mut channels = filters[0];

        let mut down_blocks = Vec::with_capacity(sampling_steps);
        let mut transitions_down = Vec::with_capacity(sampling_steps);
        let mut skip_channels = Vec::with_capacity(sampling_steps);
        for (index, &block_filters) in filters.iter().take(sampling_steps).enumerate() {
            let (block, out) = DenseBlock::new(channels, block_filters, config, vb.pp(format!("down_{}", index)))?;
            down_blocks.push(block);
            skip_channels.push(out);
            channels = out;
            let layer = ConvLayer::new(channels, channels, 1, config, true, vb.pp(format!("transition_down_{}", index)))?;
            transitions_down.push(TransitionDown { layer });
        }

        let mut up_blocks = Vec::with_capacity(sampling_steps);
        let mut transitions_up = Vec::with_capacity(sampling_steps);
        let mut output_channels = Vec::new();
        for index in (1..=sampling_steps).rev() {
            let (block, out) = DenseBlock::new(channels, filters[index], config, vb.pp(format!("up_{}", index)))?;
            up_blocks.push(block);
            if config.use_multiscale_predictions {
                output_channels.push(out);
            }
            let upsample = candle_nn::conv_transpose2d(
                out,
                filters[index - 1],
                3,
                ConvTranspose2dConfig {
                    padding: 1,
                    output_padding: 1,
                    stride: 2,
                    dilation: 1,
                },
                vb.pp(format!("transition_up_{}", index)),
            )?;
            transitions_up.push(upsample);
            channels = skip_channels[index - 1] + filters[index - 1];
        }

        let (last_block, out) = DenseBlock::new(channels, filters[0], config, vb.pp("up_0"))?;
        output_channels.push(out);

        Ok(Self {
            preprocessing,
            down_blocks,
            transitions_down,
            up_blocks,
            transitions_up,
            last_block,
            use_multiscale_output: config.use_multiscale_predictions,
            output_channels,
        })
    }
}

impl MultiscaleEncoder for Tiramisu {
    fn forward_t(&self, xs: &Tensor, train: bool) -> DenoiserResult<Vec<Tensor>> {
        let mut results = Vec::with_capacity(self.output_channels.len());
        let mut xs = self.preprocessing.forward(xs)?.relu()?;

        let mut skips = Vec::with_capacity(self.down_blocks.len());
        for (block, transition) in self.down_blocks.iter().zip(self.transitions_down.iter()) {
            xs = block.forward_t(&xs, train)?;
            skips.push(xs.clone());
            xs = transition.forward_t(&xs, train)?;
        }

        for (block, upsample) in self.up_blocks.iter().zip(self.transitions_up.iter()) {
            xs = block.forward_t(&xs, train)?;
            if self.use_multiscale_output {
                results.push(xs.clone());
            }
            let upsampled = upsample.forward(&xs)?.relu()?;
            // skips are consumed finest last
            let skip = skips.pop().ok_or_else(|| candle_core::Error::Msg("missing skip connection".into()))?;
            xs = Tensor::cat(&[&skip, &upsampled], 1)?;
        }

        results.push(self.last_block.forward_t(&xs, train)?);
        Ok(results)
    }

    fn output_channels(&self) -> &[usize] {
        &self.output_channels
    }
}
