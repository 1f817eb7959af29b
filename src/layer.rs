use crate::{
    autograd::{ParameterD, Variable4},
    ops::Conv2Options,
    result::Result,
};
use anyhow::ensure;
use rand::thread_rng;
use serde::{Deserialize, Serialize};

/// Layer builders.
pub mod builders;
use builders::Conv2Builder;

mod conv;
mod norm;
#[cfg(test)]
mod tests;

/// Derive for [`Layer`].
///
/// See [`cascaded_gaze_derive`].
pub use cascaded_gaze_derive::Layer;

/// Joins a parameter path, `prefix.name`, or `name` if `prefix` is empty.
pub fn join_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Layer.
///
/// Layers own parameters and other layers. Implement with `#[derive(Layer)]`.
///
/// Parameter names are the dot separated field path, with elements of a `Vec` named by their
/// index, for example `encoders.0.1.norm1.weight`.
pub trait Layer: Send + Sync + 'static {
    #[doc(hidden)]
    #[allow(unused_variables)]
    fn collect_parameters(&self, parameters: &mut Vec<ParameterD>) {}
    #[doc(hidden)]
    #[allow(unused_variables)]
    fn collect_parameters_mut<'layer>(
        &'layer mut self,
        parameters: &mut Vec<&'layer mut ParameterD>,
    ) {
    }
    #[doc(hidden)]
    #[allow(unused_variables)]
    fn collect_named_parameters(&self, prefix: &str, parameters: &mut Vec<(String, ParameterD)>) {}
    #[doc(hidden)]
    #[allow(unused_variables)]
    fn collect_named_parameters_mut<'layer>(
        &'layer mut self,
        prefix: &str,
        parameters: &mut Vec<(String, &'layer mut ParameterD)>,
    ) {
    }
    /// Parameters of the layer.
    fn parameters(&self) -> Vec<ParameterD> {
        let mut parameters = Vec::new();
        self.collect_parameters(&mut parameters);
        parameters
    }
    /// Mutable parameters of the layer.
    fn parameters_mut(&mut self) -> Vec<&mut ParameterD> {
        let mut parameters = Vec::new();
        self.collect_parameters_mut(&mut parameters);
        parameters
    }
    /// Parameters of the layer with their names.
    fn named_parameters(&self) -> Vec<(String, ParameterD)> {
        let mut parameters = Vec::new();
        self.collect_named_parameters("", &mut parameters);
        parameters
    }
    /// Mutable parameters of the layer with their names.
    fn named_parameters_mut(&mut self) -> Vec<(String, &mut ParameterD)> {
        let mut parameters = Vec::new();
        self.collect_named_parameters_mut("", &mut parameters);
        parameters
    }
    /// The total number of elements of all parameters.
    fn parameter_count(&self) -> usize {
        self.parameters().iter().map(ParameterD::len).sum()
    }
    /// Enables / disables training.
    ///
    /// See [`Parameter::set_training()`](crate::autograd::Parameter::set_training).
    fn set_training(&mut self, training: bool) -> Result<()> {
        for parameter in self.parameters_mut() {
            parameter.set_training(training);
        }
        Ok(())
    }
}

/// Forward.
pub trait Forward<X> {
    /// The type of the output.
    type Output;
    /// Executes the forward pass given `input`.
    fn forward(&self, input: X) -> Result<Self::Output>;
}

impl<L: Layer> Layer for Vec<L> {
    fn collect_parameters(&self, parameters: &mut Vec<ParameterD>) {
        for layer in self.iter() {
            layer.collect_parameters(parameters);
        }
    }
    fn collect_parameters_mut<'layer>(
        &'layer mut self,
        parameters: &mut Vec<&'layer mut ParameterD>,
    ) {
        for layer in self.iter_mut() {
            layer.collect_parameters_mut(parameters);
        }
    }
    fn collect_named_parameters(&self, prefix: &str, parameters: &mut Vec<(String, ParameterD)>) {
        for (i, layer) in self.iter().enumerate() {
            layer.collect_named_parameters(&join_name(prefix, &i.to_string()), parameters);
        }
    }
    fn collect_named_parameters_mut<'layer>(
        &'layer mut self,
        prefix: &str,
        parameters: &mut Vec<(String, &'layer mut ParameterD)>,
    ) {
        for (i, layer) in self.iter_mut().enumerate() {
            layer.collect_named_parameters_mut(&join_name(prefix, &i.to_string()), parameters);
        }
    }
    fn set_training(&mut self, training: bool) -> Result<()> {
        for layer in self.iter_mut() {
            layer.set_training(training)?;
        }
        Ok(())
    }
}

impl<X, L: Forward<X, Output = X>> Forward<X> for Vec<L> {
    type Output = X;
    fn forward(&self, mut input: X) -> Result<X> {
        for layer in self.iter() {
            input = layer.forward(input)?;
        }
        Ok(input)
    }
}

impl<L: Layer> Layer for Option<L> {
    fn collect_parameters(&self, parameters: &mut Vec<ParameterD>) {
        if let Some(layer) = self.as_ref() {
            layer.collect_parameters(parameters);
        }
    }
    fn collect_parameters_mut<'layer>(
        &'layer mut self,
        parameters: &mut Vec<&'layer mut ParameterD>,
    ) {
        if let Some(layer) = self.as_mut() {
            layer.collect_parameters_mut(parameters);
        }
    }
    fn collect_named_parameters(&self, prefix: &str, parameters: &mut Vec<(String, ParameterD)>) {
        if let Some(layer) = self.as_ref() {
            layer.collect_named_parameters(prefix, parameters);
        }
    }
    fn collect_named_parameters_mut<'layer>(
        &'layer mut self,
        prefix: &str,
        parameters: &mut Vec<(String, &'layer mut ParameterD)>,
    ) {
        if let Some(layer) = self.as_mut() {
            layer.collect_named_parameters_mut(prefix, parameters);
        }
    }
    fn set_training(&mut self, training: bool) -> Result<()> {
        if let Some(layer) = self.as_mut() {
            layer.set_training(training)?;
        }
        Ok(())
    }
}

impl<X, L: Forward<X, Output = X>> Forward<X> for Option<L> {
    type Output = X;
    fn forward(&self, input: X) -> Result<X> {
        if let Some(layer) = self.as_ref() {
            layer.forward(input)
        } else {
            Ok(input)
        }
    }
}

/// Convolution.
///
/// Implemented for 2 dimensional inputs `[n, c, h, w]`, with grouping, stride, padding and
/// dilation.
///
///```no_run
/// # use cascaded_gaze::{layer::Conv2, result::Result};
/// # fn main() -> Result<()> {
/// let conv = Conv2::builder()
///     .inputs(16)
///     .outputs(16)
///     .filter([3, 3])
///     .padding([1, 1])
///     .groups(16)
///     .bias(true)
///     .build()?;
/// # Ok(())
/// # }
///```
#[derive(Layer, Clone, Debug, Serialize, Deserialize)]
#[layer(crate)]
pub struct Conv2 {
    #[layer(parameter)]
    weight: ParameterD,
    #[layer(optional_parameter)]
    bias: Option<ParameterD>,
    options: Conv2Options,
}

impl Conv2 {
    /// Returns a builder for creating a [`Conv2`].
    pub fn builder() -> Conv2Builder {
        Conv2Builder::new()
    }
    /// The weight, `[outputs, inputs / groups, fh, fw]`.
    pub fn weight(&self) -> &ParameterD {
        &self.weight
    }
    /// The bias, `[outputs]`.
    pub fn bias(&self) -> Option<&ParameterD> {
        self.bias.as_ref()
    }
    /// The convolution options.
    pub fn options(&self) -> &Conv2Options {
        &self.options
    }
    /// The number of input channels.
    pub fn inputs(&self) -> usize {
        self.weight.shape()[1] * self.options.groups
    }
    /// The number of output channels.
    pub fn outputs(&self) -> usize {
        self.weight.shape()[0]
    }
}

/// Layer normalization over the channels of each pixel.
///
/// `y = (x - mean) / sqrt(var + eps)`, then scaled by `weight` and shifted by `bias` per channel.
#[derive(Layer, Clone, Debug, Serialize, Deserialize)]
#[layer(crate)]
pub struct LayerNorm2d {
    #[layer(parameter)]
    weight: ParameterD,
    #[layer(parameter)]
    bias: ParameterD,
    eps: f32,
}

impl LayerNorm2d {
    /// Ones for the weight, zeros for the bias and eps = 1e-6.
    pub fn new(channels: usize) -> Self {
        Self {
            weight: ParameterD::from(ndarray::ArrayD::ones(vec![channels])),
            bias: ParameterD::from(ndarray::ArrayD::zeros(vec![channels])),
            eps: 1e-6,
        }
    }
    /// Sets eps.
    pub fn with_eps(self, eps: f32) -> Self {
        Self { eps, ..self }
    }
    /// The number of channels.
    pub fn channels(&self) -> usize {
        self.weight.len()
    }
    /// Epsilon added to the variance.
    pub fn eps(&self) -> f32 {
        self.eps
    }
}

/// Splits the channels in half and multiplies the halves.
#[derive(Layer, Default, Clone, Copy, Debug, Serialize, Deserialize)]
#[layer(crate)]
pub struct SimpleGate;

impl Forward<Variable4> for SimpleGate {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        let chunks = input.chunk(2)?;
        chunks[0].mul(&chunks[1])
    }
}

/// Pixel shuffle.
///
/// See [`Variable4::pixel_shuffle()`].
#[derive(Layer, Clone, Copy, Debug, Serialize, Deserialize)]
#[layer(crate)]
pub struct PixelShuffle {
    factor: usize,
}

impl PixelShuffle {
    /// Upscales by `factor`.
    pub fn new(factor: usize) -> Self {
        Self { factor }
    }
}

impl Forward<Variable4> for PixelShuffle {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        input.pixel_shuffle(self.factor)
    }
}

/// Mean over height and width.
#[derive(Layer, Default, Clone, Copy, Debug, Serialize, Deserialize)]
#[layer(crate)]
pub struct GlobalMeanPool;

impl Forward<Variable4> for GlobalMeanPool {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        input.global_mean_pool()
    }
}

/// Dropout.
///
/// Only active while training, see [`Layer::set_training()`].
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Dropout {
    rate: f32,
    #[serde(skip)]
    training: bool,
}

impl Dropout {
    /// Drops elements with probability `rate`.
    ///
    /// **Errors**
    ///
    /// If `rate` is not in `[0, 1)`.
    pub fn new(rate: f32) -> Result<Self> {
        ensure!(
            (0. ..1.).contains(&rate),
            "Dropout rate {rate} must be in [0, 1)!"
        );
        Ok(Self {
            rate,
            training: false,
        })
    }
    /// The rate.
    pub fn rate(&self) -> f32 {
        self.rate
    }
}

impl Layer for Dropout {
    fn set_training(&mut self, training: bool) -> Result<()> {
        self.training = training;
        Ok(())
    }
}

impl Forward<Variable4> for Dropout {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        if self.training && self.rate > 0. {
            input.dropout(self.rate, &mut thread_rng())
        } else {
            Ok(input)
        }
    }
}

/// A depthwise convolution followed by a pointwise (1x1) convolution.
#[derive(Layer, Clone, Debug, Serialize, Deserialize)]
#[layer(crate)]
pub struct DepthwiseSeparableConv {
    #[layer]
    pointwise: Conv2,
    #[layer]
    depthwise: Conv2,
}

impl DepthwiseSeparableConv {
    /// A depthwise convolution `inputs -> inputs` with `filter`, `padding` and `stride`, then a
    /// 1x1 convolution `inputs -> outputs`.
    pub fn new(
        inputs: usize,
        outputs: usize,
        filter: usize,
        padding: usize,
        stride: usize,
        bias: bool,
    ) -> Result<Self> {
        Self::new_with_rng(
            inputs,
            outputs,
            filter,
            padding,
            stride,
            bias,
            &mut thread_rng(),
        )
    }
    pub(crate) fn new_with_rng<R: rand::Rng>(
        inputs: usize,
        outputs: usize,
        filter: usize,
        padding: usize,
        stride: usize,
        bias: bool,
        rng: &mut R,
    ) -> Result<Self> {
        let pointwise = Conv2::builder()
            .inputs(inputs)
            .outputs(outputs)
            .bias(bias)
            .build_with_rng(rng)?;
        let depthwise = Conv2::builder()
            .inputs(inputs)
            .outputs(inputs)
            .filter([filter, filter])
            .padding([padding, padding])
            .stride([stride, stride])
            .groups(inputs)
            .bias(bias)
            .build_with_rng(rng)?;
        Ok(Self {
            pointwise,
            depthwise,
        })
    }
    /// The depthwise convolution.
    pub fn depthwise(&self) -> &Conv2 {
        &self.depthwise
    }
}

impl Forward<Variable4> for DepthwiseSeparableConv {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        input.forward(&self.depthwise)?.forward(&self.pointwise)
    }
}

/// Simplified channel attention.
///
/// Mean pools each channel and mixes the channels with a 1x1 convolution, returning per channel
/// weights `[n, c, 1, 1]`.
#[derive(Layer, Clone, Debug, Serialize, Deserialize)]
#[layer(crate)]
pub struct ChannelAttention(#[layer] GlobalMeanPool, #[layer] Conv2);

impl ChannelAttention {
    /// Attention over `channels`.
    pub fn new(channels: usize) -> Result<Self> {
        Self::new_with_rng(channels, &mut thread_rng())
    }
    pub(crate) fn new_with_rng<R: rand::Rng>(channels: usize, rng: &mut R) -> Result<Self> {
        let conv = Conv2::builder()
            .inputs(channels)
            .outputs(channels)
            .bias(true)
            .build_with_rng(rng)?;
        Ok(Self(GlobalMeanPool, conv))
    }
}

impl Forward<Variable4> for ChannelAttention {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        input.forward(&self.0)?.forward(&self.1)
    }
}
