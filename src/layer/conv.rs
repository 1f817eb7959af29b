use super::{Conv2, Forward};
use crate::{
    autograd::{Variable1, Variable4},
    ops::{col2im_conv2, im2col_conv2, Conv2Options},
    result::Result,
    tensor::{ArcTensor1, ArcTensor4},
};
use anyhow::ensure;
use ndarray::{s, Array, Array2, Array4, ArrayView4, Axis};
use rayon::prelude::*;

/// The filters of `group` as `[outputs / groups, inputs / groups * fh * fw]`.
fn group_weight(weight: ArrayView4<f32>, group: usize, ocg: usize) -> Result<Array2<f32>> {
    let (_, icg, fh, fw) = weight.dim();
    let weight = weight.slice(s![group * ocg..(group + 1) * ocg, .., .., ..]);
    Ok(weight
        .as_standard_layout()
        .into_owned()
        .into_shape([ocg, icg * fh * fw])?)
}

/// The gradient of the output channels of `group` as `[bs * oh * ow, outputs / groups]`.
fn group_output_grad(output_grad: ArrayView4<f32>, group: usize, ocg: usize) -> Result<Array2<f32>> {
    let (bs, _, oh, ow) = output_grad.dim();
    let output_grad = output_grad
        .slice(s![.., group * ocg..(group + 1) * ocg, .., ..])
        .permuted_axes([0, 2, 3, 1]);
    Ok(output_grad
        .as_standard_layout()
        .into_owned()
        .into_shape([bs * oh * ow, ocg])?)
}

fn group_input(input: ArrayView4<f32>, group: usize, icg: usize) -> ArrayView4<f32> {
    input.slice_move(s![.., group * icg..(group + 1) * icg, .., ..])
}

pub(super) fn conv2(
    input: &Variable4,
    weight: Variable4,
    bias: Option<Variable1>,
    options: &Conv2Options,
) -> Result<Variable4> {
    let (bs, ic, ih, iw) = input.dim();
    let (oc, icg, fh, fw) = weight.dim();
    let groups = options.groups;
    ensure!(
        groups > 0 && ic == icg * groups && oc % groups == 0,
        "Conv2 with weight {:?} and {groups} groups can not be applied to input {:?}!",
        weight.shape(),
        input.shape()
    );
    ensure!(
        [fh, fw] == options.filter,
        "Conv2 weight {:?} does not match filter {:?}!",
        weight.shape(),
        options.filter
    );
    if let Some(bias) = bias.as_ref() {
        ensure!(
            bias.shape() == [oc],
            "Conv2 bias {:?} does not match outputs {oc}!",
            bias.shape()
        );
    }
    let [oh, ow] = options.output_shape([ih, iw])?;
    let ocg = oc / groups;
    let (input_value, weight_value) = (input.value().view(), weight.value().view());
    let parts = (0..groups)
        .into_par_iter()
        .map(|group| {
            let cols = im2col_conv2(group_input(input_value, group, icg), options)?;
            let weight = group_weight(weight_value, group, ocg)?;
            Ok(cols.dot(&weight.t()))
        })
        .collect::<Result<Vec<_>>>()?;
    let mut output = Array4::zeros([bs, oc, oh, ow]);
    for (group, part) in parts.into_iter().enumerate() {
        let part = part.into_shape([bs, oh, ow, ocg])?.permuted_axes([0, 3, 1, 2]);
        output
            .slice_mut(s![.., group * ocg..(group + 1) * ocg, .., ..])
            .assign(&part);
    }
    if let Some(bias) = bias.as_ref() {
        let bias = bias.value().view().into_shape([1, oc, 1, 1])?;
        output.zip_mut_with(&bias, |y, b| *y += *b);
    }
    let mut builder = Variable4::builder();
    if let Some(node) = input.node() {
        let weight = weight.value().clone();
        let options = options.clone();
        builder.edge(node, move |output_grad: ArcTensor4| {
            let parts = (0..groups)
                .into_par_iter()
                .map(|group| {
                    let output_grad = group_output_grad(output_grad.view(), group, ocg)?;
                    let weight = group_weight(weight.view(), group, ocg)?;
                    col2im_conv2(output_grad.dot(&weight).view(), [ih, iw], &options)
                })
                .collect::<Result<Vec<_>>>()?;
            let mut input_grad = Array::zeros([bs, ic, ih, iw]);
            for (group, part) in parts.into_iter().enumerate() {
                input_grad
                    .slice_mut(s![.., group * icg..(group + 1) * icg, .., ..])
                    .assign(&part);
            }
            Ok(input_grad.into_shared())
        });
    }
    if let Some(node) = weight.node() {
        let input = input.value().clone();
        let options = options.clone();
        builder.edge(node, move |output_grad: ArcTensor4| {
            let parts = (0..groups)
                .into_par_iter()
                .map(|group| {
                    let cols = im2col_conv2(group_input(input.view(), group, icg), &options)?;
                    let output_grad = group_output_grad(output_grad.view(), group, ocg)?;
                    Ok(output_grad.t().dot(&cols))
                })
                .collect::<Result<Vec<_>>>()?;
            let mut weight_grad = Array::zeros([oc, icg, fh, fw]);
            for (group, part) in parts.into_iter().enumerate() {
                let part = part.into_shape([ocg, icg, fh, fw])?;
                weight_grad
                    .slice_mut(s![group * ocg..(group + 1) * ocg, .., .., ..])
                    .assign(&part);
            }
            Ok(weight_grad.into_shared())
        });
    }
    if let Some(node) = bias.as_ref().and_then(Variable1::node) {
        builder.edge(node, |output_grad: ArcTensor4| -> Result<ArcTensor1> {
            Ok(output_grad
                .sum_axis(Axis(3))
                .sum_axis(Axis(2))
                .sum_axis(Axis(0))
                .into_shared())
        });
    }
    Ok(builder.build(output.into_shared()))
}

impl Forward<Variable4> for Conv2 {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        let weight = self.weight.to_variable().into_dimensionality()?;
        let bias = self
            .bias
            .as_ref()
            .map(|bias| bias.to_variable().into_dimensionality())
            .transpose()?;
        conv2(&input, weight, bias, &self.options)
    }
}
