use anyhow::{ensure, Result};
use ndarray::{Array, Array2, Array4, ArrayView2, ArrayView4, Axis};
use serde::{Deserialize, Serialize};

/// Options for 2 dimensional convolution.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Conv2Options {
    /// The filter size.
    pub filter: [usize; 2],
    /// Zero padding on each side.
    pub padding: [usize; 2],
    /// The stride.
    pub stride: [usize; 2],
    /// The dilation.
    pub dilation: [usize; 2],
    /// The number of channel groups.
    pub groups: usize,
}

impl Default for Conv2Options {
    fn default() -> Self {
        Self {
            filter: [1, 1],
            padding: [0, 0],
            stride: [1, 1],
            dilation: [1, 1],
            groups: 1,
        }
    }
}

impl Conv2Options {
    /// The output height and width for an input of `shape`.
    ///
    /// **Errors**
    ///
    /// If the stride or dilation is 0, or the padded input is smaller than the dilated filter.
    pub fn output_shape(&self, shape: [usize; 2]) -> Result<[usize; 2]> {
        let mut output = [0; 2];
        for (i, output) in output.iter_mut().enumerate() {
            let (x, f, p, s, d) = (
                shape[i],
                self.filter[i],
                self.padding[i],
                self.stride[i],
                self.dilation[i],
            );
            ensure!(
                s > 0 && d > 0 && f > 0,
                "Invalid convolution {self:?}!"
            );
            let extent = d * (f - 1) + 1;
            ensure!(
                x + 2 * p >= extent,
                "Input {shape:?} is too small for convolution with filter {:?}, padding {:?} and dilation {:?}!",
                self.filter,
                self.padding,
                self.dilation,
            );
            *output = (x + 2 * p - extent) / s + 1;
        }
        Ok(output)
    }
}

/// Lowers `input` into a matrix such that convolution is a matrix product.
///
/// The output is `[bs * oh * ow, c * fh * fw]`, the rows ordered by (batch, output row, output
/// column) and the columns by (channel, filter row, filter column). Taps that fall into the
/// padding are zero.
///
/// Groups are ignored, slice the channels of `input` to lower a single group.
pub fn im2col_conv2(input: ArrayView4<f32>, options: &Conv2Options) -> Result<Array2<f32>> {
    let (bs, c, ih, iw) = input.dim();
    let [oh, ow] = options.output_shape([ih, iw])?;
    let Conv2Options {
        filter: [fh, fw],
        padding: [ph, pw],
        stride: [sh, sw],
        dilation: [dh, dw],
        ..
    } = options.clone();
    let mut output = Array::zeros([bs, oh, ow, c, fh * fw]);
    for (input, mut output) in input.outer_iter().zip(output.outer_iter_mut()) {
        for (input, mut output) in input.outer_iter().zip(output.axis_iter_mut(Axis(2))) {
            for (hid, mut output) in output.outer_iter_mut().enumerate() {
                for (wid, mut output) in output.outer_iter_mut().enumerate() {
                    for fi in 0..fh {
                        for fj in 0..fw {
                            let hidx = -(ph as isize) + (fi * dh + sh * hid) as isize;
                            let widx = -(pw as isize) + (fj * dw + sw * wid) as isize;
                            if hidx >= 0 && hidx < ih as isize && widx >= 0 && widx < iw as isize
                            {
                                output[fi * fw + fj] = input[(hidx as usize, widx as usize)];
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(output.into_shape([bs * oh * ow, c * fh * fw])?)
}

/// The adjoint of [`im2col_conv2`].
///
/// Accumulates the columns of `input` (`[bs * oh * ow, c * fh * fw]`) into an image of `shape`,
/// returning `[bs, c, ih, iw]`.
pub fn col2im_conv2(
    input: ArrayView2<f32>,
    shape: [usize; 2],
    options: &Conv2Options,
) -> Result<Array4<f32>> {
    let [ih, iw] = shape;
    let [oh, ow] = options.output_shape(shape)?;
    let Conv2Options {
        filter: [fh, fw],
        padding: [ph, pw],
        stride: [sh, sw],
        dilation: [dh, dw],
        ..
    } = options.clone();
    let (rows, cols) = input.dim();
    ensure!(
        rows % (oh * ow) == 0 && cols % (fh * fw) == 0,
        "col2im input {:?} does not match output {:?} and filter {:?}!",
        input.shape(),
        [oh, ow],
        options.filter
    );
    let bs = rows / (oh * ow);
    let c = cols / (fh * fw);
    let input = input.as_standard_layout();
    let input = input.view().into_shape([bs, oh, ow, c, fh * fw])?;
    let mut output = Array::zeros([bs, c, ih, iw]);
    for (input, mut output) in input.outer_iter().zip(output.outer_iter_mut()) {
        for (input, mut output) in input.axis_iter(Axis(2)).zip(output.outer_iter_mut()) {
            for (hid, input) in input.outer_iter().enumerate() {
                for (wid, input) in input.outer_iter().enumerate() {
                    for fi in 0..fh {
                        for fj in 0..fw {
                            let hidx = -(ph as isize) + (fi * dh + sh * hid) as isize;
                            let widx = -(pw as isize) + (fj * dw + sw * wid) as isize;
                            if hidx >= 0 && hidx < ih as isize && widx >= 0 && widx < iw as isize
                            {
                                output[(hidx as usize, widx as usize)] += input[fi * fw + fj];
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn seq(shape: [usize; 4]) -> Array4<f32> {
        let len = shape.iter().product::<usize>();
        Array::from_iter((0..len).map(|x| ((x * 7 % 11) as f32) - 5.))
            .into_shape(shape)
            .unwrap()
    }

    #[test]
    fn output_shape() {
        let options = Conv2Options {
            filter: [3, 3],
            padding: [1, 1],
            ..Conv2Options::default()
        };
        assert_eq!(options.output_shape([7, 5]).unwrap(), [7, 5]);
        let options = Conv2Options {
            filter: [4, 4],
            stride: [4, 4],
            ..Conv2Options::default()
        };
        assert_eq!(options.output_shape([16, 9]).unwrap(), [4, 2]);
        assert!(options.output_shape([3, 16]).is_err());
        let options = Conv2Options {
            stride: [0, 1],
            ..Conv2Options::default()
        };
        assert!(options.output_shape([3, 3]).is_err());
    }

    #[test]
    fn im2col_layout() {
        let input = Array::from_iter((1..=9).map(|x| x as f32))
            .into_shape([1, 1, 3, 3])
            .unwrap();
        let options = Conv2Options {
            filter: [2, 2],
            ..Conv2Options::default()
        };
        let cols = im2col_conv2(input.view(), &options).unwrap();
        assert_eq!(cols.dim(), (4, 4));
        assert_eq!(cols.row(0).to_vec(), vec![1., 2., 4., 5.]);
        assert_eq!(cols.row(3).to_vec(), vec![5., 6., 8., 9.]);
        let options = Conv2Options {
            filter: [3, 3],
            padding: [1, 1],
            ..Conv2Options::default()
        };
        let cols = im2col_conv2(input.view(), &options).unwrap();
        assert_eq!(
            cols.row(0).to_vec(),
            vec![0., 0., 0., 0., 1., 2., 0., 4., 5.]
        );
    }

    #[test]
    fn col2im_is_adjoint_of_im2col() {
        let options = Conv2Options {
            filter: [3, 2],
            padding: [1, 0],
            stride: [2, 1],
            dilation: [1, 2],
            groups: 1,
        };
        let x = seq([2, 3, 7, 6]);
        let cols = im2col_conv2(x.view(), &options).unwrap();
        let y = Array::from_iter((0..cols.len()).map(|i| ((i * 5 % 13) as f32) * 0.25 - 1.))
            .into_shape(cols.raw_dim())
            .unwrap();
        let lhs = (&cols * &y).sum();
        let x_adjoint = col2im_conv2(y.view(), [7, 6], &options).unwrap();
        let rhs = (&x * &x_adjoint).sum();
        assert_relative_eq!(lhs, rhs, max_relative = 1e-5);
    }
}
