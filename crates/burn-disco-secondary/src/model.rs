//! Secondary diffusion model
//!
//! A small v-predicting U-Net trained alongside the ImageNet diffusion
//! models. Guidance uses it as a fast clean-image estimator: one forward
//! pass at a continuous time `t` in `[0, 1]` gives `pred` directly.

use std::f64::consts::FRAC_PI_2;

use burn::nn::{conv::Conv2d, pool::AvgPool2d};
use burn::prelude::*;
use burn::tensor::Int;

use burn_disco_samplers::{Denoiser, PredictionType, StepCoefficients};

use crate::blocks::{conv3x3, downsample, forward_levels, ConvBlock, FourierFeatures, SkipLevel};

/// Channel layout of the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryConfig {
    /// Channels per resolution, outermost first
    pub channels: Vec<usize>,
    /// Width of the time embedding
    pub time_features: usize,
}

impl SecondaryConfig {
    /// The released ImageNet secondary model
    pub fn imagenet2() -> Self {
        let c = 64;
        Self {
            channels: vec![c, c * 2, c * 2, c * 4, c * 4, c * 8],
            time_features: 16,
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> SecondaryDiffusion<B> {
        SecondaryDiffusion::new(self, device)
    }
}

/// Network outputs at one time
#[derive(Debug, Clone)]
pub struct SecondaryOutput<B: Backend> {
    pub v: Tensor<B, 4>,
    pub pred: Tensor<B, 4>,
    pub eps: Tensor<B, 4>,
}

#[derive(Module, Debug)]
pub struct SecondaryDiffusion<B: Backend> {
    pub timestep_embed: FourierFeatures<B>,
    pub stem: Vec<ConvBlock<B>>,
    pub levels: Vec<SkipLevel<B>>,
    pub head: ConvBlock<B>,
    pub out: Conv2d<B>,
    pool: AvgPool2d,
}

impl<B: Backend> SecondaryDiffusion<B> {
    pub fn new(config: &SecondaryConfig, device: &B::Device) -> Self {
        let cs = &config.channels;
        let c0 = cs[0];

        let levels = cs
            .windows(2)
            .enumerate()
            .map(|(i, pair)| {
                if i + 2 == cs.len() {
                    SkipLevel::innermost(pair[0], pair[1], device)
                } else {
                    SkipLevel::nested(pair[0], pair[1], device)
                }
            })
            .collect();

        Self {
            timestep_embed: FourierFeatures::new(1, config.time_features, device),
            stem: vec![ConvBlock::new(3 + config.time_features, c0, device), ConvBlock::new(c0, c0, device)],
            levels,
            head: ConvBlock::new(c0 * 2, c0, device),
            out: conv3x3(c0, 3, device),
            pool: downsample(),
        }
    }

    /// Runs the network at continuous time `t`
    ///
    /// # Arguments
    ///
    /// * `x` - Noisy images `[batch, 3, height, width]`; sides must be
    ///   divisible by `2^levels`
    /// * `t` - Time in `[0, 1]`, shared by the batch
    pub fn forward(&self, x: Tensor<B, 4>, t: f64) -> SecondaryOutput<B> {
        let v = self.forward_v(x.clone(), t);
        let (alpha, sigma) = t_to_alpha_sigma(t);

        SecondaryOutput {
            pred: x.clone() * alpha - v.clone() * sigma,
            eps: x * sigma + v.clone() * alpha,
            v,
        }
    }

    /// Raw velocity prediction
    pub fn forward_v(&self, x: Tensor<B, 4>, t: f64) -> Tensor<B, 4> {
        let [batch, _, height, width] = x.dims();
        let device = x.device();

        let t = Tensor::<B, 2>::from_data(TensorData::new(vec![t as f32], [1, 1]), &device);
        let embed = self.timestep_embed.forward(t);
        let [_, features] = embed.dims();
        let embed = embed
            .reshape([1, features, 1, 1])
            .repeat_dim(0, batch)
            .repeat_dim(2, height)
            .repeat_dim(3, width);

        let mut h = Tensor::cat(vec![x, embed], 1);
        for block in &self.stem {
            h = block.forward(h);
        }
        let main = forward_levels(&self.levels, &self.pool, h.clone());
        let h = self.head.forward(Tensor::cat(vec![main, h], 1));
        self.out.forward(h)
    }

    /// Side lengths must be multiples of this
    pub fn size_multiple(&self) -> usize {
        1 << self.levels.len()
    }
}

/// Signal and noise levels at continuous time `t`
pub fn t_to_alpha_sigma(t: f64) -> (f64, f64) {
    ((t * FRAC_PI_2).cos(), (t * FRAC_PI_2).sin())
}

impl<B: Backend> Denoiser<B> for SecondaryDiffusion<B> {
    fn prediction_type(&self) -> PredictionType {
        PredictionType::VPrediction
    }

    fn forward(&self, x: Tensor<B, 4>, step: &StepCoefficients, _labels: Option<&Tensor<B, 1, Int>>) -> Tensor<B, 4> {
        self.forward_v(x, step.continuous_time())
    }
}
