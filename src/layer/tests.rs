use super::*;
use crate::autograd::{Variable, Variable4};
use approx::assert_relative_eq;
use ndarray::{Array, Array1, Array4, Axis};
use rand::{distributions::Uniform, prelude::Distribution, rngs::StdRng, SeedableRng};

fn random(shape: [usize; 4], rng: &mut StdRng) -> Array4<f32> {
    let dist = Uniform::new(-1f32, 1.);
    Array::from_shape_simple_fn(shape, || dist.sample(rng))
}

fn conv2_naive(
    x: &Array4<f32>,
    weight: &Array4<f32>,
    bias: Option<&Array1<f32>>,
    options: &Conv2Options,
) -> Array4<f32> {
    let (bs, _, ih, iw) = x.dim();
    let (oc, icg, fh, fw) = weight.dim();
    let [oh, ow] = options.output_shape([ih, iw]).unwrap();
    let ocg = oc / options.groups;
    let mut y = Array4::zeros([bs, oc, oh, ow]);
    for ((b, o, i, j), y) in y.indexed_iter_mut() {
        let group = o / ocg;
        let mut acc = bias.map_or(0., |bias| bias[o]);
        for c in 0..icg {
            for fi in 0..fh {
                for fj in 0..fw {
                    let hi = (i * options.stride[0] + fi * options.dilation[0]) as isize
                        - options.padding[0] as isize;
                    let wj = (j * options.stride[1] + fj * options.dilation[1]) as isize
                        - options.padding[1] as isize;
                    if hi >= 0 && wj >= 0 && (hi as usize) < ih && (wj as usize) < iw {
                        acc += weight[(o, c, fi, fj)]
                            * x[(b, group * icg + c, hi as usize, wj as usize)];
                    }
                }
            }
        }
        *y = acc;
    }
    y
}

fn conv_weight(conv: &Conv2) -> Array4<f32> {
    conv.weight()
        .value()
        .to_owned()
        .into_dimensionality()
        .unwrap()
}

fn conv_bias(conv: &Conv2) -> Option<Array1<f32>> {
    conv.bias()
        .map(|bias| bias.value().to_owned().into_dimensionality().unwrap())
}

fn check_conv(builder: Conv2Builder, input: [usize; 4]) {
    let mut rng = StdRng::seed_from_u64(11);
    let conv = builder.build_with_rng(&mut rng).unwrap();
    let x = random(input, &mut rng);
    let y = Variable4::from(x.clone()).forward(&conv).unwrap();
    let expected = conv2_naive(
        &x,
        &conv_weight(&conv),
        conv_bias(&conv).as_ref(),
        conv.options(),
    );
    assert_relative_eq!(*y.value(), expected, epsilon = 1e-5);
}

#[test]
fn conv2_1x1() {
    check_conv(Conv2::builder().inputs(3).outputs(5).bias(true), [2, 3, 4, 3]);
}

#[test]
fn conv2_3x3_padded() {
    check_conv(
        Conv2::builder()
            .inputs(4)
            .outputs(6)
            .filter([3, 3])
            .padding([1, 1]),
        [1, 4, 5, 7],
    );
}

#[test]
fn conv2_depthwise_strided() {
    check_conv(
        Conv2::builder()
            .inputs(6)
            .outputs(6)
            .filter([4, 4])
            .stride([4, 4])
            .groups(6),
        [2, 6, 8, 12],
    );
}

#[test]
fn conv2_grouped_dilated() {
    check_conv(
        Conv2::builder()
            .inputs(4)
            .outputs(6)
            .filter([3, 2])
            .padding([1, 0])
            .stride([2, 1])
            .dilation([1, 2])
            .groups(2)
            .bias(true),
        [1, 4, 7, 6],
    );
}

#[test]
fn conv2_builder_errors() {
    assert!(Conv2::builder().inputs(3).outputs(4).groups(3).build().is_err());
    assert!(Conv2::builder().inputs(0).outputs(4).build().is_err());
    assert!(Conv2::builder()
        .inputs(2)
        .outputs(2)
        .stride([0, 1])
        .build()
        .is_err());
    let conv = Conv2::builder().inputs(2).outputs(2).build().unwrap();
    let x = Variable4::from(Array::zeros([1, 3, 2, 2]));
    assert!(x.forward(&conv).is_err());
}

#[test]
fn conv2_init_bounds() {
    let conv = Conv2::builder()
        .inputs(8)
        .outputs(4)
        .filter([3, 3])
        .bias(true)
        .build()
        .unwrap();
    let k = 1. / 72f32.sqrt();
    assert_eq!(conv.weight().shape(), [4, 8, 3, 3]);
    assert!(conv.weight().value().iter().all(|w| w.abs() <= k));
    assert!(conv.bias().unwrap().value().iter().all(|b| b.abs() <= k));
}

/// Returns the analytic and central difference gradients of `sum(f(x) * r)` w.r.t. x.
fn grad_check(
    x: Array4<f32>,
    f: impl Fn(Variable4) -> Result<Variable4>,
    h: f32,
) -> (Array4<f32>, Array4<f32>) {
    let mut rng = StdRng::seed_from_u64(5);
    let input = Variable::builder().node().build(x.clone().into_shared());
    let y = f(input.clone()).unwrap();
    let (n, c, h_out, w_out) = y.dim();
    let r = Variable4::from(random([n, c, h_out, w_out], &mut rng));
    y.mul(&r).unwrap().sum().backward().unwrap();
    let grad = input.grad().unwrap().to_owned();
    let loss = |x: Array4<f32>| -> f32 {
        let y = f(Variable4::from(x)).unwrap();
        (y.value() * r.value()).sum()
    };
    let mut numeric = Array4::zeros(x.raw_dim());
    for (index, numeric) in numeric.indexed_iter_mut() {
        let mut plus = x.clone();
        plus[index] += h;
        let mut minus = x.clone();
        minus[index] -= h;
        *numeric = (loss(plus) - loss(minus)) / (2. * h);
    }
    (grad, numeric)
}

#[test]
fn conv2_backward() {
    let mut rng = StdRng::seed_from_u64(1);
    let mut conv = Conv2::builder()
        .inputs(4)
        .outputs(4)
        .filter([3, 3])
        .padding([1, 1])
        .stride([2, 1])
        .groups(2)
        .bias(true)
        .build_with_rng(&mut rng)
        .unwrap();
    let x = random([2, 4, 5, 4], &mut rng);
    let (grad, numeric) = grad_check(x.clone(), |x| x.forward(&conv), 1e-2);
    assert_relative_eq!(grad, numeric, epsilon = 2e-2);
    // weight and bias
    conv.set_training(true).unwrap();
    let y = Variable4::from(x.clone()).forward(&conv).unwrap();
    y.sum().backward().unwrap();
    let weight_grad = conv.weight().grad().unwrap();
    let bias_grad = conv.bias().unwrap().grad().unwrap();
    let (_, _, oh, ow) = y.dim();
    for b in bias_grad.iter() {
        assert_relative_eq!(*b, (2 * oh * ow) as f32);
    }
    // with a gradient of ones, the filter tap (0, 0, 1, 1) sees every strided input
    let expected: f32 = x
        .index_axis(Axis(1), 0)
        .slice(ndarray::s![.., ..;2, ..])
        .sum();
    assert_relative_eq!(weight_grad[[0, 0, 1, 1]], expected, epsilon = 1e-4);
    conv.set_training(false).unwrap();
    assert!(conv.weight().grad().is_none());
}

#[test]
fn layer_norm2d_normalizes_channels() {
    let mut rng = StdRng::seed_from_u64(2);
    let norm = LayerNorm2d::new(6);
    let x = random([2, 6, 3, 4], &mut rng).mapv(|x| 3. * x + 1.);
    let y = Variable4::from(x).forward(&norm).unwrap();
    let mean = y.value().mean_axis(Axis(1)).unwrap();
    let var = y.value().mapv(|y| y * y).mean_axis(Axis(1)).unwrap();
    assert_relative_eq!(mean, Array::<f32, _>::zeros(mean.raw_dim()), epsilon = 1e-5);
    assert_relative_eq!(var, Array::<f32, _>::ones(var.raw_dim()), epsilon = 1e-3);
    assert!(Variable4::from(Array::zeros([1, 5, 2, 2]))
        .forward(&norm)
        .is_err());
}

#[test]
fn layer_norm2d_backward() {
    let mut rng = StdRng::seed_from_u64(3);
    let mut norm = LayerNorm2d::new(4);
    for (i, parameter) in norm.parameters_mut().into_iter().enumerate() {
        let value = Array::from_shape_fn(4, |c| 0.5 + 0.25 * (c + i) as f32).into_dyn();
        parameter.set_value(value.into_shared()).unwrap();
    }
    let x = random([2, 4, 2, 3], &mut rng);
    let (grad, numeric) = grad_check(x.clone(), |x| x.forward(&norm), 5e-3);
    assert_relative_eq!(grad, numeric, epsilon = 2e-2);
    norm.set_training(true).unwrap();
    let y = Variable4::from(x).forward(&norm).unwrap();
    y.sum().backward().unwrap();
    let bias_grad = norm.parameters()[1].grad().unwrap();
    assert!(bias_grad.iter().all(|b| *b == 12.));
}

#[test]
fn simple_gate_multiplies_halves() {
    let x = Array::from_shape_vec([1, 4, 1, 1], vec![2f32, 3., 5., 7.]).unwrap();
    let y = Variable4::from(x).forward(&SimpleGate).unwrap();
    assert_eq!(y.value().iter().copied().collect::<Vec<_>>(), vec![10f32, 21.]);
}

#[test]
fn dropout_is_identity_unless_training() {
    let mut dropout = Dropout::new(0.5).unwrap();
    let x = Variable4::from(Array::ones([1, 2, 8, 8]));
    let y = x.clone().forward(&dropout).unwrap();
    assert_eq!(y.value(), x.value());
    dropout.set_training(true).unwrap();
    let y = x.clone().forward(&dropout).unwrap();
    assert!(y.value().iter().all(|y| *y == 0. || *y == 2.));
    assert!(Dropout::new(1.).is_err());
}

#[test]
fn named_parameters() {
    #[derive(Layer)]
    #[layer(crate)]
    struct Block {
        #[layer]
        sca: ChannelAttention,
        #[layer(name = "dw")]
        conv: DepthwiseSeparableConv,
        #[layer]
        norms: Vec<LayerNorm2d>,
        #[layer(parameter)]
        beta: ParameterD,
    }
    let mut block = Block {
        sca: ChannelAttention::new(4).unwrap(),
        conv: DepthwiseSeparableConv::new(4, 4, 3, 1, 1, false).unwrap(),
        norms: vec![LayerNorm2d::new(4), LayerNorm2d::new(4)],
        beta: ParameterD::from(ndarray::ArrayD::zeros(vec![1, 4, 1, 1])),
    };
    let names: Vec<_> = block
        .named_parameters()
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert_eq!(
        names,
        [
            "sca.1.weight",
            "sca.1.bias",
            "dw.pointwise.weight",
            "dw.depthwise.weight",
            "norms.0.weight",
            "norms.0.bias",
            "norms.1.weight",
            "norms.1.bias",
            "beta",
        ]
    );
    assert_eq!(
        block.parameter_count(),
        4 * 4 + 4 + 4 * 4 + 4 * 9 + 4 * 4 + 4
    );
    assert_eq!(block.named_parameters_mut().len(), names.len());
    block.set_training(true).unwrap();
    assert!(block.parameters().iter().all(ParameterD::is_training));
}
