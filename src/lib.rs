/*!
# CascadedGaze
A CPU implementation of the CascadedGaze (CGNet) image restoration network.

The crate is made of a small reverse mode [autograd](autograd) over [`ndarray`] values, a set of
[layers](layer) that compose into the [model], and [weight](weights) loading and saving
compatible with the parameter names of the reference network.

# Example
```no_run
# use cascaded_gaze::result::Result;
# fn main() -> Result<()> {
use cascaded_gaze::{
    autograd::Variable4,
    config::CascadedGazeConfig,
    layer::Forward,
    model::CascadedGaze,
};
use ndarray::Array;

let config = CascadedGazeConfig::default();
let model = CascadedGaze::from_config(&config)?;
let image = Variable4::from(Array::zeros([1, 3, 100, 150]));
let restored = image.forward(&model)?;
assert_eq!(restored.shape(), [1, 3, 100, 150]);
# Ok(())
# }
```

# Training
[`Layer::set_training(true)`](layer::Layer::set_training) attaches gradients to every parameter.
A scalar computed from the output can then be back propagated with
[`Variable0::backward()`](autograd::Variable0::backward) and the gradients read with
[`Parameter::grad()`](autograd::Parameter::grad).
*/
#![forbid(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

/// Autograd.
pub mod autograd;
/// Configuration.
pub mod config;
/// Differentiable 4 dimensional operations.
pub mod functional;
/// Layers.
pub mod layer;
/// The CascadedGaze network.
pub mod model;
/// Convolution lowering.
pub mod ops;
/// Tensor aliases and helpers.
pub mod tensor;
/// Weight files.
pub mod weights;

/// Result.
pub mod result {
    /// Result.
    pub use anyhow::{Error, Result};
}
