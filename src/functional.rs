use crate::{
    autograd::Variable4,
    config::PaddingMode,
    tensor::ArcTensor4,
};
use anyhow::{bail, ensure, format_err, Result};
use ndarray::{s, Array, Array4, ArrayView4, Axis, Zip};
use rand::{distributions::Bernoulli, prelude::Distribution, Rng};

const SQRT_2_OVER_PI: f32 = 0.797_884_6;
const GELU_COEF: f32 = 0.044_715;

fn gelu_tanh(x: f32) -> f32 {
    0.5 * x * (1. + (SQRT_2_OVER_PI * (x + GELU_COEF * x * x * x)).tanh())
}

fn gelu_tanh_grad(x: f32) -> f32 {
    let t = (SQRT_2_OVER_PI * (x + GELU_COEF * x * x * x)).tanh();
    0.5 * (1. + t) + 0.5 * x * (1. - t * t) * SQRT_2_OVER_PI * (1. + 3. * GELU_COEF * x * x)
}

/// Selects `rows` along H and `cols` along W, repeating indices as needed.
fn gather_hw(input: ArrayView4<f32>, rows: &[usize], cols: &[usize]) -> Array4<f32> {
    input.select(Axis(2), rows).select(Axis(3), cols)
}

/// The adjoint of [`gather_hw`], accumulating into an `[n, c, h, w]` array.
fn scatter_add_hw(
    input: ArrayView4<f32>,
    rows: &[usize],
    cols: &[usize],
    [h, w]: [usize; 2],
) -> Array4<f32> {
    let (n, c, _, ow) = input.dim();
    let mut tmp = Array::zeros([n, c, h, ow]);
    for (i, src) in rows.iter().copied().enumerate() {
        let mut dst = tmp.index_axis_mut(Axis(2), src);
        dst += &input.index_axis(Axis(2), i);
    }
    let mut output = Array::zeros([n, c, h, w]);
    for (j, src) in cols.iter().copied().enumerate() {
        let mut dst = output.index_axis_mut(Axis(3), src);
        dst += &tmp.index_axis(Axis(3), j);
    }
    output
}

fn nearest_indices(input: usize, output: usize) -> Vec<usize> {
    let scale = input as f32 / output as f32;
    (0..output)
        .map(|dst| ((dst as f32 * scale).floor() as usize).min(input - 1))
        .collect()
}

fn reflect_indices(input: usize, pad: usize) -> Vec<usize> {
    (0..input + pad)
        .map(|i| if i < input { i } else { 2 * (input - 1) - i })
        .collect()
}

impl Variable4 {
    /// Splits along the channel axis into pieces with `sizes` channels.
    ///
    /// **Errors**
    ///
    /// If `sizes` does not sum to the number of channels.
    pub fn split_channels(&self, sizes: &[usize]) -> Result<Vec<Self>> {
        let channels = self.shape()[1];
        ensure!(
            sizes.iter().sum::<usize>() == channels,
            "Can not split {channels} channels into {sizes:?}!"
        );
        let mut outputs = Vec::with_capacity(sizes.len());
        let mut start = 0;
        for size in sizes.iter().copied() {
            let end = start + size;
            let mut builder = Self::builder();
            if let Some(node) = self.node() {
                let dim = self.raw_dim();
                builder.edge(node, move |output_grad: ArcTensor4| {
                    let mut input_grad = Array::zeros(dim);
                    input_grad
                        .slice_mut(s![.., start..end, .., ..])
                        .assign(&output_grad);
                    Ok(input_grad.into_shared())
                });
            }
            let value = self.value().slice(s![.., start..end, .., ..]).to_owned();
            outputs.push(builder.build(value.into_shared()));
            start = end;
        }
        Ok(outputs)
    }
    /// Splits along the channel axis into `n` equal pieces.
    ///
    /// **Errors**
    ///
    /// If the channels are not divisible by `n`.
    pub fn chunk(&self, n: usize) -> Result<Vec<Self>> {
        let channels = self.shape()[1];
        ensure!(
            n > 0 && channels % n == 0,
            "Can not chunk {channels} channels into {n} pieces!"
        );
        self.split_channels(&vec![channels / n; n])
    }
    /// Concatenates `inputs` along the channel axis.
    ///
    /// **Errors**
    ///
    /// If `inputs` is empty or the batch and spatial dimensions differ.
    pub fn concat_channels(inputs: &[Self]) -> Result<Self> {
        let first = inputs
            .first()
            .ok_or_else(|| format_err!("Can not concatenate 0 variables!"))?;
        let (n, _, h, w) = first.dim();
        for input in inputs.iter() {
            let (n2, _, h2, w2) = input.dim();
            ensure!(
                (n2, h2, w2) == (n, h, w),
                "Can not concatenate {:?} with {:?}!",
                first.shape(),
                input.shape()
            );
        }
        let views: Vec<_> = inputs.iter().map(|x| x.value().view()).collect();
        let value = ndarray::concatenate(Axis(1), &views)?;
        let mut builder = Self::builder();
        let mut start = 0;
        for input in inputs.iter() {
            let end = start + input.shape()[1];
            if let Some(node) = input.node() {
                builder.edge(node, move |output_grad: ArcTensor4| {
                    Ok(output_grad
                        .slice(s![.., start..end, .., ..])
                        .to_owned()
                        .into_shared())
                });
            }
            start = end;
        }
        Ok(builder.build(value.into_shared()))
    }
    /// GELU with the tanh approximation.
    pub fn gelu_tanh(&self) -> Self {
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            let input = self.value().clone();
            builder.edge(node, move |output_grad: ArcTensor4| {
                let mut input_grad = output_grad.into_owned();
                Zip::from(&mut input_grad)
                    .and(&input)
                    .par_for_each(|dx, x| *dx *= gelu_tanh_grad(*x));
                Ok(input_grad.into_shared())
            });
        }
        let mut value = self.value().to_owned();
        value.par_mapv_inplace(gelu_tanh);
        builder.build(value.into_shared())
    }
    /// Averages over height and width, returning `[n, c, 1, 1]`.
    pub fn global_mean_pool(&self) -> Result<Self> {
        let (n, c, h, w) = self.dim();
        ensure!(h * w > 0, "Can not pool empty input {:?}!", self.shape());
        let len = (h * w) as f32;
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            let dim = self.raw_dim();
            builder.edge(node, move |output_grad: ArcTensor4| {
                let input_grad = output_grad
                    .broadcast(dim)
                    .ok_or_else(|| format_err!("Can not broadcast {:?}!", output_grad.shape()))?
                    .mapv(|dy| dy / len);
                Ok(input_grad.into_shared())
            });
        }
        let value = self
            .value()
            .sum_axis(Axis(3))
            .sum_axis(Axis(2))
            .mapv(|x| x / len)
            .into_shape([n, c, 1, 1])?;
        Ok(builder.build(value.into_shared()))
    }
    /// Nearest neighbor resize to `[h, w]`.
    ///
    /// Output pixel `dst` reads input pixel `min(floor(dst * in / out), in - 1)` on each axis.
    pub fn upsample_nearest(&self, [h, w]: [usize; 2]) -> Result<Self> {
        let (_, _, ih, iw) = self.dim();
        ensure!(
            ih > 0 && iw > 0 && h > 0 && w > 0,
            "Can not resize {:?} to {:?}!",
            self.shape(),
            [h, w]
        );
        if (ih, iw) == (h, w) {
            return Ok(self.clone());
        }
        let rows = nearest_indices(ih, h);
        let cols = nearest_indices(iw, w);
        let value = gather_hw(self.value().view(), &rows, &cols);
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            builder.edge(node, move |output_grad: ArcTensor4| {
                Ok(scatter_add_hw(output_grad.view(), &rows, &cols, [ih, iw]).into_shared())
            });
        }
        Ok(builder.build(value.into_shared()))
    }
    /// Rearranges `[b, c r^2, h, w]` into `[b, c, h r, w r]`.
    ///
    /// **Errors**
    ///
    /// If the channels are not divisible by `r^2`.
    pub fn pixel_shuffle(&self, r: usize) -> Result<Self> {
        let (b, c, h, w) = self.dim();
        ensure!(
            r > 0 && c % (r * r) == 0,
            "Can not pixel shuffle {c} channels with factor {r}!"
        );
        let c2 = c / (r * r);
        let input = self.value().as_standard_layout();
        let value = input
            .view()
            .into_shape([b, c2, r, r, h, w])?
            .permuted_axes([0, 1, 4, 2, 5, 3])
            .as_standard_layout()
            .into_owned()
            .into_shape([b, c2, h * r, w * r])?;
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            builder.edge(node, move |output_grad: ArcTensor4| {
                let output_grad = output_grad.as_standard_layout();
                Ok(output_grad
                    .view()
                    .into_shape([b, c2, h, r, w, r])?
                    .permuted_axes([0, 1, 3, 5, 2, 4])
                    .as_standard_layout()
                    .into_owned()
                    .into_shape([b, c, h, w])?
                    .into_shared())
            });
        }
        Ok(builder.build(value.into_shared()))
    }
    /// Pads `bottom` rows and `right` columns.
    ///
    /// **Errors**
    ///
    /// With [`PaddingMode::Reflect`], if a pad is not smaller than the size of its axis.
    pub fn pad(&self, bottom: usize, right: usize, mode: PaddingMode) -> Result<Self> {
        if bottom == 0 && right == 0 {
            return Ok(self.clone());
        }
        let (n, c, h, w) = self.dim();
        let mut builder = Self::builder();
        let value = match mode {
            PaddingMode::Zeros => {
                let mut value = Array::zeros([n, c, h + bottom, w + right]);
                value.slice_mut(s![.., .., ..h, ..w]).assign(self.value());
                if let Some(node) = self.node() {
                    builder.edge(node, move |output_grad: ArcTensor4| {
                        Ok(output_grad.slice(s![.., .., ..h, ..w]).to_owned().into_shared())
                    });
                }
                value
            }
            PaddingMode::Reflect => {
                if bottom >= h || right >= w {
                    bail!(
                        "Reflect padding ({bottom}, {right}) must be smaller than the input {:?}!",
                        [h, w]
                    );
                }
                let rows = reflect_indices(h, bottom);
                let cols = reflect_indices(w, right);
                let value = gather_hw(self.value().view(), &rows, &cols);
                if let Some(node) = self.node() {
                    builder.edge(node, move |output_grad: ArcTensor4| {
                        Ok(scatter_add_hw(output_grad.view(), &rows, &cols, [h, w]).into_shared())
                    });
                }
                value
            }
        };
        Ok(builder.build(value.into_shared()))
    }
    /// Keeps the top left `[h, w]` window.
    ///
    /// **Errors**
    ///
    /// If the window is larger than the input.
    pub fn crop(&self, [h, w]: [usize; 2]) -> Result<Self> {
        let (_, _, ih, iw) = self.dim();
        ensure!(
            h <= ih && w <= iw,
            "Can not crop {:?} to {:?}!",
            self.shape(),
            [h, w]
        );
        if (ih, iw) == (h, w) {
            return Ok(self.clone());
        }
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            let dim = self.raw_dim();
            builder.edge(node, move |output_grad: ArcTensor4| {
                let mut input_grad = Array::zeros(dim);
                input_grad
                    .slice_mut(s![.., .., ..h, ..w])
                    .assign(&output_grad);
                Ok(input_grad.into_shared())
            });
        }
        let value = self.value().slice(s![.., .., ..h, ..w]).to_owned();
        Ok(builder.build(value.into_shared()))
    }
    /// Zeroes elements with probability `rate` and scales the rest by `1 / (1 - rate)`.
    ///
    /// **Errors**
    ///
    /// If `rate` is not in `[0, 1)`.
    pub fn dropout<R: Rng>(&self, rate: f32, rng: &mut R) -> Result<Self> {
        ensure!(
            (0. ..1.).contains(&rate),
            "Dropout rate {rate} must be in [0, 1)!"
        );
        if rate == 0. {
            return Ok(self.clone());
        }
        let bernoulli = Bernoulli::new(f64::from(1. - rate))?;
        let scale = 1. / (1. - rate);
        let mask: ArcTensor4 = Array::from_shape_simple_fn(self.raw_dim(), || {
            if bernoulli.sample(rng) {
                scale
            } else {
                0.
            }
        })
        .into_shared();
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            let mask = mask.clone();
            builder.edge(node, move |output_grad: ArcTensor4| {
                let mut input_grad = output_grad.into_owned();
                input_grad.zip_mut_with(&mask, |dx, m| *dx *= *m);
                Ok(input_grad.into_shared())
            });
        }
        let mut value = self.value().to_owned();
        value.zip_mut_with(&mask, |x, m| *x *= *m);
        Ok(builder.build(value.into_shared()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::Variable;
    use approx::assert_relative_eq;
    use ndarray::Array1;

    fn seq(shape: [usize; 4]) -> Array4<f32> {
        let len = shape.iter().product::<usize>();
        Array1::range(0., len as f32, 1.).into_shape(shape).unwrap()
    }

    fn with_node(x: Array4<f32>) -> Variable4 {
        Variable::builder().node().build(x.into_shared())
    }

    #[test]
    fn pixel_shuffle_layout() {
        let x = Variable4::from(seq([1, 4, 1, 2]));
        let y = x.pixel_shuffle(2).unwrap();
        assert_eq!(y.shape(), [1, 1, 2, 4]);
        // channel k = 2 i + j lands at (i, 2 w + j)
        let expected = Array1::from(vec![0f32, 2., 1., 3., 4., 6., 5., 7.])
            .into_shape([1, 1, 2, 4])
            .unwrap();
        assert_eq!(y.value(), &expected);
        assert!(Variable4::from(seq([1, 3, 1, 1])).pixel_shuffle(2).is_err());
    }

    #[test]
    fn pixel_shuffle_backward_inverts_forward() {
        let x = with_node(Array::zeros([2, 8, 3, 2]));
        let y = x.pixel_shuffle(2).unwrap();
        let g = seq([2, 2, 6, 4]);
        y.node()
            .unwrap()
            .backward_grad(g.clone().into_shared())
            .unwrap();
        let dx = x.grad().unwrap();
        let roundtrip = Variable4::from(dx).pixel_shuffle(2).unwrap();
        assert_eq!(roundtrip.value(), &g);
    }

    #[test]
    fn upsample_nearest_indices() {
        assert_eq!(nearest_indices(2, 5), vec![0, 0, 0, 1, 1]);
        assert_eq!(nearest_indices(3, 6), vec![0, 0, 1, 1, 2, 2]);
        assert_eq!(nearest_indices(4, 2), vec![0, 2]);
        let x = with_node(seq([1, 1, 2, 2]));
        let y = x.upsample_nearest([4, 3]).unwrap();
        assert_eq!(y.value().slice(s![0, 0, 0, ..]).to_vec(), vec![0., 0., 1.]);
        assert_eq!(y.value()[[0, 0, 3, 2]], 3.);
        y.sum().backward().unwrap();
        // every input pixel is read 2 x (2 or 1) times
        assert_eq!(
            x.grad().unwrap().iter().copied().collect::<Vec<_>>(),
            vec![4., 2., 4., 2.]
        );
    }

    #[test]
    fn pad_zeros_and_reflect() {
        let x = with_node(seq([1, 1, 3, 3]));
        let y = x.pad(1, 2, PaddingMode::Zeros).unwrap();
        assert_eq!(y.shape(), [1, 1, 4, 5]);
        assert_eq!(y.value()[[0, 0, 3, 4]], 0.);
        assert_eq!(y.value()[[0, 0, 2, 2]], 8.);
        let y = x.pad(1, 2, PaddingMode::Reflect).unwrap();
        assert_eq!(
            y.value().slice(s![0, 0, 3, ..]).to_vec(),
            vec![3., 4., 5., 4., 3.]
        );
        y.sum().backward().unwrap();
        let dx = x.grad().unwrap();
        // rows 0, 1, 2 are read 1, 2, 1 times and columns 2, 2, 1 times
        assert_eq!(dx[[0, 0, 0, 0]], 2.);
        assert_eq!(dx[[0, 0, 0, 2]], 1.);
        assert_eq!(dx[[0, 0, 1, 1]], 4.);
        assert!(x.pad(3, 0, PaddingMode::Reflect).is_err());
    }

    #[test]
    fn crop_and_pad_are_adjoint() {
        let x = with_node(seq([1, 2, 2, 3]));
        let y = x.pad(2, 1, PaddingMode::Zeros).unwrap().crop([2, 3]).unwrap();
        assert_eq!(y.value(), x.value());
        y.sum().backward().unwrap();
        assert_eq!(x.grad().unwrap(), Array::<f32, _>::ones([1, 2, 2, 3]));
        assert!(x.crop([3, 3]).is_err());
    }

    #[test]
    fn split_concat() {
        let x = with_node(seq([2, 5, 1, 2]));
        let parts = x.split_channels(&[2, 3]).unwrap();
        assert_eq!(parts[1].shape(), [2, 3, 1, 2]);
        let y = Variable4::concat_channels(&[parts[1].clone(), parts[0].clone()]).unwrap();
        assert_eq!(y.value()[[1, 3, 0, 1]], x.value()[[1, 0, 0, 1]]);
        y.mul(&y).unwrap().sum().backward().unwrap();
        assert_eq!(x.grad().unwrap(), x.value().mapv(|x| 2. * x));
        assert!(x.chunk(2).is_err());
        assert!(x.split_channels(&[1, 1]).is_err());
    }

    #[test]
    fn gelu_tanh_values() {
        let x = Variable4::from(
            Array1::from(vec![-3f32, -1., 0., 1., 3.])
                .into_shape([1, 5, 1, 1])
                .unwrap(),
        );
        let y = x.gelu_tanh();
        let expected = Array::from_shape_vec(
            [1, 5, 1, 1],
            vec![-0.003_637_392_4f32, -0.158_808, 0., 0.841_192, 2.996_362_6],
        )
        .unwrap();
        assert_relative_eq!(*y.value(), expected, epsilon = 1e-5);
        for x in [-2f32, -0.5, 0.3, 1.7] {
            let h = 1e-2;
            let fd = (gelu_tanh(x + h) - gelu_tanh(x - h)) / (2. * h);
            assert_relative_eq!(gelu_tanh_grad(x), fd, epsilon = 1e-3);
        }
    }

    #[test]
    fn global_mean_pool_grad() {
        let x = with_node(seq([1, 2, 2, 2]));
        let y = x.global_mean_pool().unwrap();
        assert_eq!(y.value().iter().copied().collect::<Vec<_>>(), vec![1.5, 5.5]);
        y.sum().backward().unwrap();
        assert_eq!(x.grad().unwrap(), Array::from_elem([1, 2, 2, 2], 0.25f32));
    }

    #[test]
    fn dropout_scales_kept() {
        use rand::{rngs::StdRng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(0);
        let x = with_node(Array::ones([1, 4, 8, 8]));
        let y = x.dropout(0.5, &mut rng).unwrap();
        assert!(y.value().iter().all(|y| *y == 0. || *y == 2.));
        y.sum().backward().unwrap();
        assert_eq!(&x.grad().unwrap(), y.value());
        assert!(x.dropout(1., &mut rng).is_err());
        let z = x.dropout(0., &mut rng).unwrap();
        assert_eq!(z.value(), x.value());
    }
}
