//! Building blocks of the secondary model: conv blocks, Fourier time
//! features and the nested skip levels

use burn::module::Param;
use burn::nn::{
    conv::{Conv2d, Conv2dConfig},
    pool::{AvgPool2d, AvgPool2dConfig},
    PaddingConfig2d,
};
use burn::prelude::*;
use burn::tensor::activation::relu;

use burn_disco_core::resize::upsample_bilinear;

/// 3x3 convolution with unit padding followed by ReLU
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            conv: conv3x3(in_channels, out_channels, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        relu(self.conv.forward(x))
    }
}

pub(crate) fn conv3x3<B: Backend>(in_channels: usize, out_channels: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [3, 3])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init(device)
}

/// Random Fourier features of a scalar input
///
/// `weight` is `[out_features / 2, in_features]`; the output is
/// `cat(cos(2 pi t W^T), sin(2 pi t W^T))`.
#[derive(Module, Debug)]
pub struct FourierFeatures<B: Backend> {
    pub weight: Param<Tensor<B, 2>>,
}

impl<B: Backend> FourierFeatures<B> {
    pub fn new(in_features: usize, out_features: usize, device: &B::Device) -> Self {
        let weight = Tensor::random(
            [out_features / 2, in_features],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            device,
        );
        Self {
            weight: Param::from_tensor(weight),
        }
    }

    /// Features for inputs `[batch, in_features]`, shape `[batch, out_features]`
    pub fn forward(&self, t: Tensor<B, 2>) -> Tensor<B, 2> {
        let f = t.matmul(self.weight.val().transpose()) * (2.0 * std::f64::consts::PI);
        Tensor::cat(vec![f.clone().cos(), f.sin()], 1)
    }
}

/// One resolution of the U-shaped network
///
/// Runs at half the resolution of its parent: pools, applies `down`, wraps
/// the next level as a skip connection, applies `up`, then upsamples back.
#[derive(Module, Debug)]
pub struct SkipLevel<B: Backend> {
    pub down: Vec<ConvBlock<B>>,
    pub up: Vec<ConvBlock<B>>,
}

impl<B: Backend> SkipLevel<B> {
    /// A level between `outer` and `inner` channels with a nested level below
    pub fn nested(outer: usize, inner: usize, device: &B::Device) -> Self {
        Self {
            down: vec![ConvBlock::new(outer, inner, device), ConvBlock::new(inner, inner, device)],
            up: vec![ConvBlock::new(inner * 2, inner, device), ConvBlock::new(inner, outer, device)],
        }
    }

    /// The innermost level
    pub fn innermost(outer: usize, inner: usize, device: &B::Device) -> Self {
        Self {
            down: vec![ConvBlock::new(outer, inner, device), ConvBlock::new(inner, inner, device)],
            up: vec![ConvBlock::new(inner, inner, device), ConvBlock::new(inner, outer, device)],
        }
    }
}

/// Runs `levels[0]` on `x`, recursing into deeper levels as skip blocks
///
/// Returns the level's main path only; callers concatenate it with `x`.
pub fn forward_levels<B: Backend>(levels: &[SkipLevel<B>], pool: &AvgPool2d, x: Tensor<B, 4>) -> Tensor<B, 4> {
    let Some((level, deeper)) = levels.split_first() else {
        return x;
    };

    let mut h = pool.forward(x);
    for block in &level.down {
        h = block.forward(h);
    }
    if !deeper.is_empty() {
        let inner = forward_levels(deeper, pool, h.clone());
        h = Tensor::cat(vec![inner, h], 1);
    }
    for block in &level.up {
        h = block.forward(h);
    }

    upsample_bilinear(h, 2)
}

pub fn downsample() -> AvgPool2d {
    AvgPool2dConfig::new([2, 2]).with_strides([2, 2]).init()
}
