// Convolution building blocks shared by the feature network and the heads.

use {
    crate::config::ActType,
    candle_core::{Result, Tensor},
    candle_nn::{
        BatchNorm, Conv2d, Conv2dConfig, Init, Module, ModuleT, VarBuilder, batch_norm,
        conv2d_no_bias, init::DEFAULT_KAIMING_NORMAL,
    },
};

impl ActType {
    pub fn apply(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            ActType::Swish => xs.silu(),
            ActType::Relu => xs.relu(),
            ActType::Relu6 => xs.clamp(0f64, 6f64),
            ActType::HardSwish => xs * ((xs + 3.0)?.clamp(0f64, 6f64)? / 6.0)?,
            ActType::Mish => {
                let softplus = (xs.exp()? + 1.0)?.log()?;
                xs * softplus.tanh()?
            }
            ActType::Gelu => xs.gelu_erf(),
        }
    }
}

/// Batch norm with the network-wide epsilon.
pub fn norm_layer(channels: usize, eps: f64, vb: VarBuilder) -> Result<BatchNorm> {
    batch_norm(channels, eps, vb)
}

/// Square "same" convolution (stride 1) with explicit initializers.
pub fn same_conv(
    vb: VarBuilder,
    c_in: usize,
    c_out: usize,
    kernel: usize,
    groups: usize,
    weight_init: Init,
    bias: Option<f64>,
) -> Result<Conv2d> {
    let config = Conv2dConfig {
        padding: kernel / 2,
        groups,
        ..Default::default()
    };
    let weight = vb.get_with_hints((c_out, c_in / groups, kernel, kernel), "weight", weight_init)?;
    let bias = bias
        .map(|b| vb.get_with_hints(c_out, "bias", Init::Const(b)))
        .transpose()?;
    Ok(Conv2d::new(weight, bias, config))
}

/// Depthwise conv followed by a 1x1 pointwise conv.
#[derive(Debug)]
pub struct SeparableConv2d {
    depthwise: Conv2d,
    pointwise: Conv2d,
}

impl SeparableConv2d {
    pub fn load(vb: VarBuilder, c_in: usize, c_out: usize, kernel: usize, bias: Option<f64>) -> Result<Self> {
        let depthwise = same_conv(vb.pp("depthwise"), c_in, c_in, kernel, c_in, DEFAULT_KAIMING_NORMAL, None)?;
        let pointwise = same_conv(vb.pp("pointwise"), c_in, c_out, 1, 1, DEFAULT_KAIMING_NORMAL, bias)?;
        Ok(Self {
            depthwise,
            pointwise,
        })
    }
}

impl Module for SeparableConv2d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.depthwise)?.apply(&self.pointwise)
    }
}

/// A 3x3-style "same" conv, either regular or depthwise-separable.
#[derive(Debug)]
pub enum ConvOp {
    Regular(Conv2d),
    Separable(SeparableConv2d),
}

impl ConvOp {
    pub fn load(
        vb: VarBuilder,
        separable: bool,
        c_in: usize,
        c_out: usize,
        kernel: usize,
        weight_init: Init,
        bias: Option<f64>,
    ) -> Result<Self> {
        if separable {
            Ok(ConvOp::Separable(SeparableConv2d::load(vb, c_in, c_out, kernel, bias)?))
        } else {
            Ok(ConvOp::Regular(same_conv(vb, c_in, c_out, kernel, 1, weight_init, bias)?))
        }
    }
}

impl Module for ConvOp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            ConvOp::Regular(conv) => conv.forward(xs),
            ConvOp::Separable(conv) => conv.forward(xs),
        }
    }
}

/// Convolution block: Conv2d + BatchNorm + activation
#[derive(Debug)]
pub struct ConvBlock {
    conv: Conv2d,
    bn: BatchNorm,
    act: ActType,
}

impl ConvBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn load(
        vb: VarBuilder,
        c1: usize,
        c2: usize,
        k: usize,
        stride: usize,
        padding: usize,
        act: ActType,
        eps: f64,
    ) -> Result<Self> {
        let conv = conv2d_no_bias(
            c1,
            c2,
            k,
            Conv2dConfig {
                stride,
                padding,
                ..Default::default()
            },
            vb.pp("conv"),
        )?;
        let bn = norm_layer(c2, eps, vb.pp("bn"))?;
        Ok(Self { conv, bn, act })
    }
}

impl ModuleT for ConvBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = xs.apply(&self.conv)?.apply_t(&self.bn, train)?;
        self.act.apply(&xs)
    }
}

/// Stochastic depth: drops the whole residual branch per batch element with
/// probability `1 - survival_prob` during training and rescales what is kept.
pub fn drop_connect(xs: &Tensor, train: bool, survival_prob: f64) -> Result<Tensor> {
    if !train {
        return Ok(xs.clone());
    }
    let batch = xs.dim(0)?;
    let keep = (Tensor::rand(0f32, 1f32, (batch, 1, 1, 1), xs.device())?.to_dtype(xs.dtype())? + survival_prob)?
        .floor()?;
    xs.affine(1.0 / survival_prob, 0.0)?.broadcast_mul(&keep)
}
