use super::Conv2;
use crate::{autograd::ParameterD, ops::Conv2Options, result::Result};
use anyhow::ensure;
use ndarray::Array;
use rand::{distributions::Uniform, prelude::Distribution, thread_rng, Rng};

/// Builder for creating a [`Conv2`].
#[derive(Clone, Debug)]
pub struct Conv2Builder {
    inputs: usize,
    outputs: usize,
    options: Conv2Options,
    bias: bool,
}

impl Conv2Builder {
    pub(super) fn new() -> Self {
        Self {
            inputs: 0,
            outputs: 0,
            options: Conv2Options::default(),
            bias: false,
        }
    }
    /// The number of input channels.
    pub fn inputs(self, inputs: usize) -> Self {
        Self { inputs, ..self }
    }
    /// The number of output channels.
    pub fn outputs(self, outputs: usize) -> Self {
        Self { outputs, ..self }
    }
    /// The size of the filter. Defaults to 1x1.
    pub fn filter(mut self, filter: [usize; 2]) -> Self {
        self.options.filter = filter;
        self
    }
    /// Zero padding. Defaults to 0.
    pub fn padding(mut self, padding: [usize; 2]) -> Self {
        self.options.padding = padding;
        self
    }
    /// The stride. Defaults to 1.
    pub fn stride(mut self, stride: [usize; 2]) -> Self {
        self.options.stride = stride;
        self
    }
    /// The dilation. Defaults to 1.
    pub fn dilation(mut self, dilation: [usize; 2]) -> Self {
        self.options.dilation = dilation;
        self
    }
    /// Splits the channels into `groups`. Defaults to 1.
    ///
    /// Groups equal to the channels is a depthwise convolution.
    pub fn groups(mut self, groups: usize) -> Self {
        self.options.groups = groups;
        self
    }
    /// Adds a bias. Defaults to false.
    pub fn bias(self, bias: bool) -> Self {
        Self { bias, ..self }
    }
    /// Builds the layer.
    ///
    /// Weight and bias are drawn from `U(-k, k)`, `k = 1 / sqrt(inputs / groups * fh * fw)`.
    ///
    /// **Errors**
    ///
    /// - The inputs or outputs are 0 or not divisible by the groups.
    /// - The filter, stride or dilation is 0.
    pub fn build(self) -> Result<Conv2> {
        self.build_with_rng(&mut thread_rng())
    }
    /// Builds the layer, drawing the initial values from `rng`.
    ///
    /// See [`.build()`](Self::build).
    pub fn build_with_rng<R: Rng>(self, rng: &mut R) -> Result<Conv2> {
        let Self {
            inputs,
            outputs,
            options,
            bias,
        } = self;
        let groups = options.groups;
        ensure!(
            inputs > 0 && outputs > 0,
            "Conv2 inputs {inputs} and outputs {outputs} must be positive!"
        );
        ensure!(
            groups > 0 && inputs % groups == 0 && outputs % groups == 0,
            "Conv2 inputs {inputs} and outputs {outputs} must be divisible by groups {groups}!"
        );
        ensure!(
            options
                .filter
                .iter()
                .chain(options.stride.iter())
                .chain(options.dilation.iter())
                .all(|x| *x > 0),
            "Invalid Conv2 {options:?}!"
        );
        let [fh, fw] = options.filter;
        let fan_in = inputs / groups * fh * fw;
        let k = 1. / (fan_in as f32).sqrt();
        let dist = Uniform::new_inclusive(-k, k);
        let weight = Array::from_shape_simple_fn([outputs, inputs / groups, fh, fw], || {
            dist.sample(rng)
        });
        let bias = if bias {
            let bias = Array::from_shape_simple_fn(outputs, || dist.sample(rng));
            Some(ParameterD::from(bias.into_dyn()))
        } else {
            None
        };
        Ok(Conv2 {
            weight: ParameterD::from(weight.into_dyn()),
            bias,
            options,
        })
    }
}
