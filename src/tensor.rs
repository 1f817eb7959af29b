use anyhow::{ensure, Result};
use ndarray::{ArcArray, Array, ArrayViewD, Axis, Dimension, Ix0, Ix1, Ix2, Ix4, IxDyn};

/// Shared tensor.
///
/// Cheap to clone, copy on write.
pub type ArcTensor<D> = ArcArray<f32, D>;
/// Shared tensor with 1 element.
pub type ArcTensor0 = ArcTensor<Ix0>;
/// Shared tensor with 1 dimension.
pub type ArcTensor1 = ArcTensor<Ix1>;
/// Shared tensor with 2 dimensions.
pub type ArcTensor2 = ArcTensor<Ix2>;
/// Shared tensor with 4 dimensions.
pub type ArcTensor4 = ArcTensor<Ix4>;
/// Shared tensor with dynamic dimensions.
pub type ArcTensorD = ArcTensor<IxDyn>;

/// Sums `input` over the axes that were broadcasted from `dim`.
///
/// Leading axes of `input` not present in `dim` are summed away, axes where `dim` is 1 are summed
/// and kept.
///
/// **Errors**
///
/// If `dim` could not have been broadcasted to the shape of `input`.
pub fn reduce_to<D: Dimension>(input: ArrayViewD<f32>, dim: D) -> Result<Array<f32, D>> {
    ensure!(
        input.ndim() >= dim.ndim(),
        "Can not reduce {:?} -> {:?}!",
        input.shape(),
        dim.slice()
    );
    let mut output = input.to_owned();
    while output.ndim() > dim.ndim() {
        output = output.sum_axis(Axis(0));
    }
    for (axis, n) in dim.slice().iter().copied().enumerate() {
        let x = output.shape()[axis];
        if x != n {
            ensure!(
                n == 1,
                "Can not reduce {:?} -> {:?}!",
                input.shape(),
                dim.slice()
            );
            output = output.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }
    Ok(output.into_dimensionality()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr2, Array3};

    #[test]
    fn reduce_to_sums_broadcast_axes() {
        let x = Array3::<f32>::ones([2, 3, 4]);
        let y = reduce_to(x.view().into_dyn(), Ix2(1, 4)).unwrap();
        assert_eq!(y, Array::from_elem((1, 4), 6f32));
        let y = reduce_to(x.view().into_dyn(), Ix1(1)).unwrap();
        assert_eq!(y[0], 24.);
    }

    #[test]
    fn reduce_to_rejects_incompatible() {
        let x = arr2(&[[1f32, 2.], [3., 4.]]);
        assert!(reduce_to(x.view().into_dyn(), Ix2(3, 2)).is_err());
        assert!(reduce_to(x.view().into_dyn(), ndarray::Ix3(1, 2, 2)).is_err());
    }
}
