use super::{Forward, LayerNorm2d};
use crate::{
    autograd::{Variable1, Variable4},
    result::Result,
    tensor::{ArcTensor1, ArcTensor4},
};
use anyhow::ensure;
use ndarray::{Array4, ArrayView4, Axis, Zip};

fn channel_mean(x: ArrayView4<f32>) -> Array4<f32> {
    let c = x.shape()[1] as f32;
    x.sum_axis(Axis(1)).insert_axis(Axis(1)) / c
}

fn sum_nhw(x: ArrayView4<f32>) -> ArcTensor1 {
    x.sum_axis(Axis(3))
        .sum_axis(Axis(2))
        .sum_axis(Axis(0))
        .into_shared()
}

pub(super) fn layer_norm2d(
    input: &Variable4,
    weight: Variable1,
    bias: Variable1,
    eps: f32,
) -> Result<Variable4> {
    let (_, c, _, _) = input.dim();
    ensure!(
        weight.shape() == [c] && bias.shape() == [c],
        "LayerNorm2d with weight {:?} and bias {:?} can not be applied to input {:?}!",
        weight.shape(),
        bias.shape(),
        input.shape()
    );
    let x = input.value().view();
    let mean = channel_mean(x);
    let mut y = x.to_owned();
    y.zip_mut_with(&mean, |y, mean| *y -= *mean);
    let mut inv_std = channel_mean(y.mapv(|y| y * y).view());
    inv_std.mapv_inplace(|var| 1. / (var + eps).sqrt());
    y.zip_mut_with(&inv_std, |y, s| *y *= *s);
    let y = y.into_shared();
    let weight4 = weight.value().view().into_shape([1, c, 1, 1])?.to_owned();
    let bias4 = bias.value().view().into_shape([1, c, 1, 1])?;
    let mut output = y.to_owned();
    Zip::from(&mut output)
        .and_broadcast(&weight4)
        .and_broadcast(&bias4)
        .par_for_each(|y, w, b| *y = *w * *y + *b);
    let mut builder = Variable4::builder();
    if let Some(node) = input.node() {
        let y = y.clone();
        builder.edge(node, move |output_grad: ArcTensor4| {
            let mut g = output_grad.into_owned();
            g.zip_mut_with(&weight4, |g, w| *g *= *w);
            let mean_g = channel_mean(g.view());
            let mean_gy = channel_mean((&g * &y).view());
            Zip::from(&mut g)
                .and(&y)
                .and_broadcast(&mean_gy)
                .and_broadcast(&mean_g)
                .and_broadcast(&inv_std)
                .par_for_each(|g, y, mean_gy, mean_g, s| *g = *s * (*g - *y * *mean_gy - *mean_g));
            Ok(g.into_shared())
        });
    }
    if let Some(node) = weight.node() {
        let y = y.clone();
        builder.edge(node, move |output_grad: ArcTensor4| {
            Ok(sum_nhw((&output_grad * &y).view()))
        });
    }
    if let Some(node) = bias.node() {
        builder.edge(node, |output_grad: ArcTensor4| Ok(sum_nhw(output_grad.view())));
    }
    Ok(builder.build(output.into_shared()))
}

impl Forward<Variable4> for LayerNorm2d {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        let weight = self.weight.to_variable().into_dimensionality()?;
        let bias = self.bias.to_variable().into_dimensionality()?;
        layer_norm2d(&input, weight, bias, self.eps)
    }
}
