use crate::{autograd::ParameterD, layer::Layer, result::Result};
use anyhow::{bail, ensure, Context};
use bytemuck::Pod;
use half::{bf16, f16};
use ndarray::{ArrayD, IxDyn};
use safetensors::{tensor::TensorView, Dtype, SafeTensors};
use std::{collections::HashSet, fs, path::Path};

/// Prefix added to every key by `torch.nn.DataParallel` checkpoints.
const DATA_PARALLEL_PREFIX: &str = "module.";

/// Copies the little endian `bytes` into a new vec, which may not be aligned for `T`.
fn cast_bytes<T: Pod>(bytes: &[u8]) -> Vec<T> {
    let mut vec = vec![T::zeroed(); bytes.len() / std::mem::size_of::<T>()];
    bytemuck::cast_slice_mut(vec.as_mut_slice()).copy_from_slice(bytes);
    vec
}

fn tensor_to_array(name: &str, tensor: &TensorView) -> Result<ArrayD<f32>> {
    let data = tensor.data();
    let vec: Vec<f32> = match tensor.dtype() {
        Dtype::F32 => cast_bytes(data),
        Dtype::F64 => cast_bytes::<f64>(data).into_iter().map(|x| x as f32).collect(),
        Dtype::F16 => cast_bytes::<f16>(data).into_iter().map(f32::from).collect(),
        Dtype::BF16 => cast_bytes::<bf16>(data).into_iter().map(f32::from).collect(),
        dtype => bail!("Tensor {name:?} has unsupported dtype {dtype:?}!"),
    };
    Ok(ArrayD::from_shape_vec(IxDyn(tensor.shape()), vec)?)
}

/// Serializes the named parameters of `layer` as F32 safetensors.
pub fn to_safetensors_bytes<L: Layer>(layer: &L) -> Result<Vec<u8>> {
    let parameters = layer.named_parameters();
    let data: Vec<Vec<u8>> = parameters
        .iter()
        .map(|(_, parameter)| {
            let value = parameter.value().as_standard_layout().into_owned();
            bytemuck::cast_slice(value.as_slice().unwrap_or_default()).to_vec()
        })
        .collect();
    let views = parameters
        .iter()
        .zip(data.iter())
        .map(|((name, parameter), data)| {
            Ok((
                name.as_str(),
                TensorView::new(Dtype::F32, parameter.shape().to_vec(), data)?,
            ))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(safetensors::serialize(views, &None)?)
}

/// Writes the named parameters of `layer` to a safetensors file.
///
/// See [`Layer::named_parameters()`].
pub fn save_safetensors<L: Layer>(layer: &L, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let bytes = to_safetensors_bytes(layer)?;
    fs::write(path, bytes).with_context(|| format!("writing {path:?}"))?;
    log::info!(
        "saved {} tensors to {path:?}",
        layer.named_parameters().len()
    );
    Ok(())
}

/// Loads parameters from serialized safetensors.
///
/// Each parameter is read from the tensor with the same name, optionally prefixed with
/// `module.`. F32, F64, F16 and BF16 tensors are converted to f32.
///
/// Returns the number of tensors loaded.
///
/// **Errors**
/// - A parameter has no tensor.
/// - A tensor has a different shape than its parameter.
/// - A tensor is not used by any parameter and `strict` is true. Otherwise unused tensors are
///   logged as warnings.
pub fn load_safetensors_bytes<L: Layer>(layer: &mut L, bytes: &[u8], strict: bool) -> Result<usize> {
    let tensors = SafeTensors::deserialize(bytes)?;
    let names: HashSet<String> = tensors.names().into_iter().cloned().collect();
    let mut used = HashSet::with_capacity(names.len());
    let mut loaded = 0;
    for (name, parameter) in layer.named_parameters_mut() {
        let key = if names.contains(&name) {
            name.clone()
        } else {
            format!("{DATA_PARALLEL_PREFIX}{name}")
        };
        let tensor = tensors
            .tensor(&key)
            .with_context(|| format!("Missing tensor for parameter {name:?}!"))?;
        let value = tensor_to_array(&key, &tensor)?;
        load_parameter(&name, parameter, value)?;
        used.insert(key);
        loaded += 1;
    }
    let mut unused: Vec<_> = names.difference(&used).collect();
    unused.sort();
    if !unused.is_empty() {
        if strict {
            bail!("Unused tensors {unused:?}!");
        }
        for name in unused {
            log::warn!("unused tensor {name:?}");
        }
    }
    Ok(loaded)
}

fn load_parameter(name: &str, parameter: &mut ParameterD, value: ArrayD<f32>) -> Result<()> {
    ensure!(
        parameter.shape() == value.shape(),
        "Parameter {name:?} has shape {:?}, found tensor {:?}!",
        parameter.shape(),
        value.shape()
    );
    parameter.set_value(value.into_shared())
}

/// Loads parameters from a safetensors file.
///
/// See [`load_safetensors_bytes()`].
pub fn load_safetensors<L: Layer>(
    layer: &mut L,
    path: impl AsRef<Path>,
    strict: bool,
) -> Result<()> {
    let path = path.as_ref();
    let bytes = fs::read(path).with_context(|| format!("reading {path:?}"))?;
    let loaded = load_safetensors_bytes(layer, &bytes, strict)
        .with_context(|| format!("loading {path:?}"))?;
    log::info!("loaded {loaded} tensors from {path:?}");
    Ok(())
}
