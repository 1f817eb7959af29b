use crate::{
    autograd::{ParameterD, Variable4},
    config::CascadedGazeConfig,
    layer::{
        ChannelAttention, Conv2, DepthwiseSeparableConv, Dropout, Forward, Layer, LayerNorm2d,
        PixelShuffle, SimpleGate,
    },
    result::Result,
};
use anyhow::{bail, ensure, Context};
use ndarray::ArrayD;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};

fn zeros_parameter(channels: usize) -> ParameterD {
    ParameterD::from(ArrayD::zeros(vec![1, channels, 1, 1]))
}

fn conv1x1<R: Rng>(inputs: usize, outputs: usize, rng: &mut R) -> Result<Conv2> {
    Conv2::builder()
        .inputs(inputs)
        .outputs(outputs)
        .bias(true)
        .build_with_rng(rng)
}

fn conv3x3_depthwise<R: Rng>(channels: usize, rng: &mut R) -> Result<Conv2> {
    Conv2::builder()
        .inputs(channels)
        .outputs(channels)
        .filter([3, 3])
        .padding([1, 1])
        .groups(channels)
        .bias(true)
        .build_with_rng(rng)
}

/// Global context extractor.
///
/// A cascade of strided depthwise separable convolutions, each followed by GELU. Every
/// intermediate is returned, from the highest to the lowest resolution.
#[derive(Layer, Clone, Debug, Serialize, Deserialize)]
#[layer(crate)]
pub struct GlobalContextExtractor {
    #[layer]
    depthwise_separable_convs: Vec<DepthwiseSeparableConv>,
}

impl GlobalContextExtractor {
    /// A cascade with one convolution per `(kernel_sizes[i], strides[i])`, without padding or
    /// bias.
    pub fn new(channels: usize, kernel_sizes: &[usize], strides: &[usize]) -> Result<Self> {
        Self::new_with_rng(channels, kernel_sizes, strides, &mut thread_rng())
    }
    fn new_with_rng<R: Rng>(
        channels: usize,
        kernel_sizes: &[usize],
        strides: &[usize],
        rng: &mut R,
    ) -> Result<Self> {
        ensure!(
            kernel_sizes.len() == strides.len(),
            "GlobalContextExtractor kernel sizes {kernel_sizes:?} and strides {strides:?} differ in length!"
        );
        let depthwise_separable_convs = kernel_sizes
            .iter()
            .zip(strides)
            .map(|(kernel, stride)| {
                DepthwiseSeparableConv::new_with_rng(
                    channels, channels, *kernel, 0, *stride, false, rng,
                )
            })
            .collect::<Result<_>>()?;
        Ok(Self {
            depthwise_separable_convs,
        })
    }
    /// The 3 convolution (kernels and strides 2, 4, 4) or 2 convolution (kernels 3, 3 and
    /// strides 2, 3) variant.
    pub fn with_convs(channels: usize, convs: usize) -> Result<Self> {
        Self::with_convs_with_rng(channels, convs, &mut thread_rng())
    }
    fn with_convs_with_rng<R: Rng>(channels: usize, convs: usize, rng: &mut R) -> Result<Self> {
        match convs {
            3 => Self::new_with_rng(channels, &[2, 4, 4], &[2, 4, 4], rng),
            2 => Self::new_with_rng(channels, &[3, 3], &[2, 3], rng),
            _ => bail!("GlobalContextExtractor with {convs} convolutions is not supported!"),
        }
    }
    fn len(&self) -> usize {
        self.depthwise_separable_convs.len()
    }
}

impl Forward<Variable4> for GlobalContextExtractor {
    type Output = Vec<Variable4>;
    fn forward(&self, mut input: Variable4) -> Result<Vec<Variable4>> {
        let mut outputs = Vec::with_capacity(self.len());
        for conv in self.depthwise_separable_convs.iter() {
            input = input.forward(conv)?.gelu_tanh();
            outputs.push(input.clone());
        }
        Ok(outputs)
    }
}

/// Block with a global context extractor.
///
/// The spatial branch fuses the block input with contexts gathered at several coarser
/// resolutions, the channel branch is a gated feed forward network. Both are residual, scaled
/// by `beta` and `gamma`, which start at zero so that a new block is the identity.
#[derive(Layer, Clone, Debug, Serialize, Deserialize)]
#[layer(crate)]
pub struct CascadedGazeBlock {
    #[layer]
    conv1: Conv2,
    #[layer]
    conv2: Conv2,
    #[layer(name = "GCE")]
    gce: GlobalContextExtractor,
    #[layer]
    project_out: Conv2,
    #[layer]
    sca: ChannelAttention,
    #[layer]
    sg: SimpleGate,
    #[layer]
    conv4: Conv2,
    #[layer]
    conv5: Conv2,
    #[layer]
    norm1: LayerNorm2d,
    #[layer]
    norm2: LayerNorm2d,
    #[layer]
    dropout1: Dropout,
    #[layer]
    dropout2: Dropout,
    #[layer(parameter)]
    beta: ParameterD,
    #[layer(parameter)]
    gamma: ParameterD,
}

impl CascadedGazeBlock {
    /// A block over `channels`.
    ///
    /// `gce_convs` selects the [`GlobalContextExtractor`] variant.
    pub fn new(
        channels: usize,
        gce_convs: usize,
        dw_expand: usize,
        ffn_expand: usize,
        drop_out_rate: f32,
    ) -> Result<Self> {
        Self::new_with_rng(
            channels,
            gce_convs,
            dw_expand,
            ffn_expand,
            drop_out_rate,
            &mut thread_rng(),
        )
    }
    fn new_with_rng<R: Rng>(
        channels: usize,
        gce_convs: usize,
        dw_expand: usize,
        ffn_expand: usize,
        drop_out_rate: f32,
        rng: &mut R,
    ) -> Result<Self> {
        let dw_channels = channels * dw_expand;
        let ffn_channels = channels * ffn_expand;
        ensure!(
            dw_channels % 2 == 0 && ffn_channels % 2 == 0,
            "CascadedGazeBlock expansions must give an even number of channels!"
        );
        let gce = GlobalContextExtractor::with_convs_with_rng(dw_channels / 2, gce_convs, rng)?;
        let fused_channels = dw_channels + gce.len() * dw_channels / 2;
        Ok(Self {
            conv1: conv1x1(channels, dw_channels, rng)?,
            conv2: conv3x3_depthwise(dw_channels, rng)?,
            gce,
            project_out: conv1x1(fused_channels, channels, rng)?,
            sca: ChannelAttention::new_with_rng(fused_channels, rng)?,
            sg: SimpleGate,
            conv4: conv1x1(channels, ffn_channels, rng)?,
            conv5: conv1x1(ffn_channels / 2, channels, rng)?,
            norm1: LayerNorm2d::new(channels),
            norm2: LayerNorm2d::new(channels),
            dropout1: Dropout::new(drop_out_rate)?,
            dropout2: Dropout::new(drop_out_rate)?,
            beta: zeros_parameter(channels),
            gamma: zeros_parameter(channels),
        })
    }
}

impl Forward<Variable4> for CascadedGazeBlock {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        let (_, _, h, w) = input.dim();
        let x = input
            .clone()
            .forward(&self.norm1)?
            .forward(&self.conv1)?
            .forward(&self.conv2)?
            .gelu_tanh();
        let halves = x.chunk(2)?;
        let contexts = halves[0].add(&halves[1])?.forward(&self.gce)?;
        let mut fused = Vec::with_capacity(1 + contexts.len());
        fused.push(x);
        for context in contexts {
            fused.push(context.upsample_nearest([h, w])?);
        }
        let x = Variable4::concat_channels(&fused)?;
        let attention = x.clone().forward(&self.sca)?;
        let x = x
            .mul(&attention)?
            .forward(&self.project_out)?
            .forward(&self.dropout1)?;
        let y = input.add(&x.mul(&self.beta.to_variable())?)?;
        let x = y
            .clone()
            .forward(&self.norm2)?
            .forward(&self.conv4)?
            .forward(&self.sg)?
            .forward(&self.conv5)?
            .forward(&self.dropout2)?;
        y.add(&x.mul(&self.gamma.to_variable())?)
    }
}

/// Block without a global context extractor.
///
/// Like [`CascadedGazeBlock`], the spatial branch is a gated depthwise convolution with channel
/// attention.
#[derive(Layer, Clone, Debug, Serialize, Deserialize)]
#[layer(crate)]
pub struct NafBlock {
    #[layer]
    conv1: Conv2,
    #[layer]
    conv2: Conv2,
    #[layer]
    conv3: Conv2,
    #[layer]
    sca: ChannelAttention,
    #[layer]
    sg: SimpleGate,
    #[layer]
    conv4: Conv2,
    #[layer]
    conv5: Conv2,
    #[layer]
    norm1: LayerNorm2d,
    #[layer]
    norm2: LayerNorm2d,
    #[layer]
    dropout1: Dropout,
    #[layer]
    dropout2: Dropout,
    #[layer(parameter)]
    beta: ParameterD,
    #[layer(parameter)]
    gamma: ParameterD,
}

impl NafBlock {
    /// A block over `channels`.
    pub fn new(
        channels: usize,
        dw_expand: usize,
        ffn_expand: usize,
        drop_out_rate: f32,
    ) -> Result<Self> {
        Self::new_with_rng(
            channels,
            dw_expand,
            ffn_expand,
            drop_out_rate,
            &mut thread_rng(),
        )
    }
    fn new_with_rng<R: Rng>(
        channels: usize,
        dw_expand: usize,
        ffn_expand: usize,
        drop_out_rate: f32,
        rng: &mut R,
    ) -> Result<Self> {
        let dw_channels = channels * dw_expand;
        let ffn_channels = channels * ffn_expand;
        ensure!(
            dw_channels % 2 == 0 && ffn_channels % 2 == 0,
            "NafBlock expansions must give an even number of channels!"
        );
        Ok(Self {
            conv1: conv1x1(channels, dw_channels, rng)?,
            conv2: conv3x3_depthwise(dw_channels, rng)?,
            conv3: conv1x1(dw_channels / 2, channels, rng)?,
            sca: ChannelAttention::new_with_rng(dw_channels / 2, rng)?,
            sg: SimpleGate,
            conv4: conv1x1(channels, ffn_channels, rng)?,
            conv5: conv1x1(ffn_channels / 2, channels, rng)?,
            norm1: LayerNorm2d::new(channels),
            norm2: LayerNorm2d::new(channels),
            dropout1: Dropout::new(drop_out_rate)?,
            dropout2: Dropout::new(drop_out_rate)?,
            beta: zeros_parameter(channels),
            gamma: zeros_parameter(channels),
        })
    }
}

impl Forward<Variable4> for NafBlock {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        let x = input
            .clone()
            .forward(&self.norm1)?
            .forward(&self.conv1)?
            .forward(&self.conv2)?
            .forward(&self.sg)?;
        let attention = x.clone().forward(&self.sca)?;
        let x = x
            .mul(&attention)?
            .forward(&self.conv3)?
            .forward(&self.dropout1)?;
        let y = input.add(&x.mul(&self.beta.to_variable())?)?;
        let x = y
            .clone()
            .forward(&self.norm2)?
            .forward(&self.conv4)?
            .forward(&self.sg)?
            .forward(&self.conv5)?
            .forward(&self.dropout2)?;
        y.add(&x.mul(&self.gamma.to_variable())?)
    }
}

/// Doubles the resolution and halves the channels.
///
/// A 1x1 convolution without bias to twice the channels, then a pixel shuffle by 2.
#[derive(Layer, Clone, Debug, Serialize, Deserialize)]
#[layer(crate)]
pub struct Up(#[layer] Conv2, #[layer] PixelShuffle);

impl Up {
    fn new_with_rng<R: Rng>(channels: usize, rng: &mut R) -> Result<Self> {
        let conv = Conv2::builder()
            .inputs(channels)
            .outputs(2 * channels)
            .build_with_rng(rng)?;
        Ok(Self(conv, PixelShuffle::new(2)))
    }
}

impl Forward<Variable4> for Up {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        input.forward(&self.0)?.forward(&self.1)
    }
}

/// CascadedGaze.
///
/// An encoder decoder network predicting a residual that is added to the input image. Inputs
/// `[n, img_channel, h, w]` of any size large enough for the global context extractors are
/// padded to a multiple of [`padder_size()`](CascadedGazeConfig::padder_size) and the output is
/// cropped back to `h x w`.
#[derive(Layer, Clone, Debug, Serialize, Deserialize)]
#[layer(crate)]
pub struct CascadedGaze {
    #[layer]
    intro: Conv2,
    #[layer]
    ending: Conv2,
    #[layer]
    encoders: Vec<Vec<CascadedGazeBlock>>,
    #[layer]
    decoders: Vec<Vec<NafBlock>>,
    #[layer]
    middle_blks: Vec<NafBlock>,
    #[layer]
    ups: Vec<Up>,
    #[layer]
    downs: Vec<Conv2>,
    config: CascadedGazeConfig,
}

impl CascadedGaze {
    /// Creates a new randomly initialized network.
    ///
    /// **Errors**
    ///
    /// If the config is not valid, see [`CascadedGazeConfig::validate()`].
    pub fn from_config(config: &CascadedGazeConfig) -> Result<Self> {
        Self::from_config_with_rng(config, &mut thread_rng())
    }
    /// Creates a new network, drawing the initial parameters from `rng`.
    ///
    /// See [`from_config()`](Self::from_config).
    pub fn from_config_with_rng<R: Rng>(config: &CascadedGazeConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let CascadedGazeConfig {
            img_channel,
            width,
            dw_expand,
            ffn_expand,
            drop_out_rate,
            ..
        } = *config;
        let intro = Conv2::builder()
            .inputs(img_channel)
            .outputs(width)
            .filter([3, 3])
            .padding([1, 1])
            .bias(true)
            .build_with_rng(rng)?;
        let ending = Conv2::builder()
            .inputs(width)
            .outputs(img_channel)
            .filter([3, 3])
            .padding([1, 1])
            .bias(true)
            .build_with_rng(rng)?;
        let mut channels = width;
        let mut encoders = Vec::with_capacity(config.levels());
        let mut downs = Vec::with_capacity(config.levels());
        for (blocks, gce_convs) in config.enc_blk_nums.iter().zip(config.gce_convs.iter()) {
            let encoder = (0..*blocks)
                .map(|_| {
                    CascadedGazeBlock::new_with_rng(
                        channels,
                        *gce_convs,
                        dw_expand,
                        ffn_expand,
                        drop_out_rate,
                        rng,
                    )
                })
                .collect::<Result<Vec<_>>>()?;
            encoders.push(encoder);
            downs.push(
                Conv2::builder()
                    .inputs(channels)
                    .outputs(2 * channels)
                    .filter([2, 2])
                    .stride([2, 2])
                    .bias(true)
                    .build_with_rng(rng)?,
            );
            channels *= 2;
        }
        let middle_blks = (0..config.middle_blk_num)
            .map(|_| NafBlock::new_with_rng(channels, dw_expand, ffn_expand, drop_out_rate, rng))
            .collect::<Result<Vec<_>>>()?;
        let mut decoders = Vec::with_capacity(config.levels());
        let mut ups = Vec::with_capacity(config.levels());
        for blocks in config.dec_blk_nums.iter().copied() {
            ups.push(Up::new_with_rng(channels, rng)?);
            channels /= 2;
            let decoder = (0..blocks)
                .map(|_| {
                    NafBlock::new_with_rng(channels, dw_expand, ffn_expand, drop_out_rate, rng)
                })
                .collect::<Result<Vec<_>>>()?;
            decoders.push(decoder);
        }
        let model = Self {
            intro,
            ending,
            encoders,
            decoders,
            middle_blks,
            ups,
            downs,
            config: config.clone(),
        };
        log::debug!(
            "CascadedGaze levels: {} width: {} parameters: {}",
            config.levels(),
            width,
            model.parameter_count()
        );
        Ok(model)
    }
    /// The config.
    pub fn config(&self) -> &CascadedGazeConfig {
        &self.config
    }
}

impl Forward<Variable4> for CascadedGaze {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        let (_, channels, h, w) = input.dim();
        ensure!(
            channels == self.config.img_channel,
            "CascadedGaze expected {} channels, found input {:?}!",
            self.config.img_channel,
            input.shape()
        );
        let padder_size = self.config.padder_size();
        let pad_h = (padder_size - h % padder_size) % padder_size;
        let pad_w = (padder_size - w % padder_size) % padder_size;
        if pad_h > 0 || pad_w > 0 {
            log::debug!("padding {h}x{w} input by ({pad_h}, {pad_w})");
        }
        let input = input.pad(pad_h, pad_w, self.config.padding)?;
        let mut x = input.clone().forward(&self.intro)?;
        let mut skips = Vec::with_capacity(self.encoders.len());
        for (level, (encoder, down)) in self.encoders.iter().zip(self.downs.iter()).enumerate() {
            let (_, _, level_h, level_w) = x.dim();
            x = x.forward(encoder).with_context(|| {
                format!("encoder level {level} at {level_h}x{level_w} for input {h}x{w}")
            })?;
            skips.push(x.clone());
            x = x.forward(down)?;
        }
        x = x.forward(&self.middle_blks)?;
        for ((decoder, up), skip) in self
            .decoders
            .iter()
            .zip(self.ups.iter())
            .zip(skips.iter().rev())
        {
            x = x.forward(up)?.add(skip)?.forward(decoder)?;
        }
        x.forward(&self.ending)?.add(&input)?.crop([h, w])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;
    use rand::{distributions::Uniform, prelude::Distribution, rngs::StdRng, SeedableRng};

    fn small_config() -> CascadedGazeConfig {
        CascadedGazeConfig {
            width: 4,
            enc_blk_nums: vec![1, 1],
            middle_blk_num: 1,
            dec_blk_nums: vec![1, 1],
            gce_convs: vec![3, 2],
            ..Default::default()
        }
    }

    fn random_image(shape: [usize; 4], seed: u64) -> Variable4 {
        let mut rng = StdRng::seed_from_u64(seed);
        let dist = Uniform::new(0f32, 1.);
        Variable4::from(Array::from_shape_simple_fn(shape, || dist.sample(&mut rng)))
    }

    #[test]
    fn global_context_extractor_shapes() {
        let gce = GlobalContextExtractor::with_convs(2, 3).unwrap();
        let contexts = random_image([1, 2, 32, 40], 0).forward(&gce).unwrap();
        let shapes: Vec<_> = contexts.iter().map(|x| x.shape().to_vec()).collect();
        assert_eq!(shapes, [[1, 2, 16, 20], [1, 2, 4, 5], [1, 2, 1, 1]]);
        let gce = GlobalContextExtractor::with_convs(2, 2).unwrap();
        let contexts = random_image([1, 2, 16, 16], 0).forward(&gce).unwrap();
        assert_eq!(contexts[1].shape(), [1, 2, 2, 2]);
        assert!(GlobalContextExtractor::with_convs(2, 4).is_err());
        assert!(random_image([1, 2, 12, 12], 0).forward(&gce).is_ok());
        assert!(random_image([1, 2, 6, 6], 0).forward(&gce).is_err());
    }

    #[test]
    fn new_blocks_are_identity() {
        let x = random_image([1, 4, 32, 32], 1);
        let block = CascadedGazeBlock::new(4, 3, 2, 2, 0.).unwrap();
        let y = x.clone().forward(&block).unwrap();
        assert_eq!(y.value(), x.value());
        let block = NafBlock::new(4, 2, 2, 0.).unwrap();
        let y = x.clone().forward(&block).unwrap();
        assert_eq!(y.value(), x.value());
    }

    #[test]
    fn block_parameter_names() {
        let block = CascadedGazeBlock::new(4, 2, 2, 2, 0.).unwrap();
        let names: Vec<_> = block
            .named_parameters()
            .into_iter()
            .map(|(name, parameter)| (name, parameter.shape().to_vec()))
            .collect();
        let find = |name: &str| {
            names
                .iter()
                .find(|(x, _)| x == name)
                .map(|(_, shape)| shape.clone())
        };
        assert_eq!(find("conv2.weight"), Some(vec![8, 1, 3, 3]));
        assert_eq!(
            find("GCE.depthwise_separable_convs.1.depthwise.weight"),
            Some(vec![4, 1, 3, 3])
        );
        assert_eq!(
            find("GCE.depthwise_separable_convs.0.pointwise.weight"),
            Some(vec![4, 4, 1, 1])
        );
        assert_eq!(find("GCE.depthwise_separable_convs.0.pointwise.bias"), None);
        // 8 + 2 x 4 fused channels
        assert_eq!(find("project_out.weight"), Some(vec![4, 16, 1, 1]));
        assert_eq!(find("sca.1.weight"), Some(vec![16, 16, 1, 1]));
        assert_eq!(find("conv5.weight"), Some(vec![4, 4, 1, 1]));
        assert_eq!(find("beta"), Some(vec![1, 4, 1, 1]));
    }

    #[test]
    fn forward_preserves_shape() {
        let model = CascadedGaze::from_config(&small_config()).unwrap();
        let x = random_image([2, 3, 33, 35], 2);
        let y = x.clone().forward(&model).unwrap();
        assert_eq!(y.shape(), [2, 3, 33, 35]);
        assert!(y.value().iter().all(|y| y.is_finite()));
    }

    #[test]
    fn forward_errors() {
        let model = CascadedGaze::from_config(&small_config()).unwrap();
        assert!(random_image([1, 1, 32, 32], 3).forward(&model).is_err());
        assert!(random_image([1, 3, 8, 8], 3).forward(&model).is_err());
        let invalid = CascadedGazeConfig {
            dec_blk_nums: vec![1],
            ..small_config()
        };
        assert!(CascadedGaze::from_config(&invalid).is_err());
    }

    #[test]
    fn reflect_padding() {
        let config = CascadedGazeConfig {
            padding: crate::config::PaddingMode::Reflect,
            ..small_config()
        };
        let model = CascadedGaze::from_config(&config).unwrap();
        let y = random_image([1, 3, 34, 33], 4).forward(&model).unwrap();
        assert_eq!(y.shape(), [1, 3, 34, 33]);
    }

    #[test]
    fn default_parameter_count() {
        let mut rng = StdRng::seed_from_u64(0);
        let model =
            CascadedGaze::from_config_with_rng(&CascadedGazeConfig::default(), &mut rng).unwrap();
        let names = model.named_parameters();
        assert!(names
            .iter()
            .any(|(name, _)| name == "encoders.3.5.GCE.depthwise_separable_convs.1.pointwise.weight"));
        assert!(names.iter().any(|(name, _)| name == "middle_blks.9.conv3.bias"));
        assert!(names.iter().any(|(name, _)| name == "ups.3.0.weight"));
        assert!(names.iter().all(|(name, _)| name != "ups.3.0.bias"));
        assert_eq!(model.downs[3].outputs(), 960);
        assert_eq!(model.decoders[3][0].conv1.outputs(), 120);
    }
}
