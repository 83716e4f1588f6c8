//! Guided DDIM (Denoising Diffusion Implicit Models) sampler
//!
//! Guidance enters through the score: the noise estimate is shifted by
//! `-sigma * grad` before the update, so the clean-image estimate moves
//! with it.

use burn::prelude::*;
use burn::tensor::Int;
use burn_disco_core::random::randn;
use rand::Rng;

use crate::denoiser::{ConditionFn, Denoiser};
use crate::progressive::{GuidedStep, SampleOutput};
use crate::scheduler::SpacedSchedule;

/// DDIM sampler configuration
#[derive(Debug, Clone)]
pub struct DdimConfig {
    /// 0.0 is deterministic DDIM, 1.0 matches ancestral sampling
    pub eta: f64,
    /// Clamp the clean-image estimate to `[-1, 1]` before guidance
    pub clip_denoised: bool,
}

impl Default for DdimConfig {
    fn default() -> Self {
        Self {
            eta: 0.8,
            clip_denoised: false,
        }
    }
}

/// Guided DDIM sampler
#[derive(Debug, Clone, Default)]
pub struct DdimSampler {
    config: DdimConfig,
}

impl DdimSampler {
    pub fn new(config: DdimConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DdimConfig {
        &self.config
    }

    /// Standard deviation of the noise injected at a step
    pub fn sigma(&self, alpha_cumprod: f64, alpha_cumprod_prev: f64) -> f64 {
        self.config.eta
            * ((1.0 - alpha_cumprod_prev) / (1.0 - alpha_cumprod)).sqrt()
            * (1.0 - alpha_cumprod / alpha_cumprod_prev).sqrt()
    }
}

impl<B: Backend> GuidedStep<B> for DdimSampler {
    fn step<D, C, R>(
        &self,
        schedule: &SpacedSchedule,
        denoiser: &D,
        cond_fn: &mut C,
        x: Tensor<B, 4>,
        index: usize,
        labels: Option<&Tensor<B, 1, Int>>,
        rng: &mut R,
    ) -> Result<SampleOutput<B>, C::Error>
    where
        D: Denoiser<B>,
        C: ConditionFn<B>,
        R: Rng,
    {
        let coeffs = schedule.coefficients(index);
        let (alpha, sigma) = (coeffs.alpha(), coeffs.sigma());

        let mut pred = denoiser.predict_start(x.clone(), &coeffs, labels);
        if self.config.clip_denoised {
            pred = pred.clamp(-1.0, 1.0);
        }

        let grad = cond_fn.gradient(x.clone(), &coeffs, labels)?;
        let eps = (x.clone() - pred * alpha) / sigma - grad * sigma;
        let pred_xstart = (x.clone() - eps.clone() * sigma) / alpha;

        let ac_prev = coeffs.alpha_cumprod_prev;
        let sigma_t = self.sigma(coeffs.alpha_cumprod, ac_prev);
        let dir_xt = (1.0 - ac_prev - sigma_t * sigma_t).max(0.0).sqrt();
        let mean = pred_xstart.clone() * ac_prev.sqrt() + eps * dir_xt;

        let sample = if index > 0 && sigma_t > 0.0 {
            let noise: Tensor<B, 4> = randn(rng, x.dims(), &x.device());
            mean + noise * sigma_t
        } else {
            mean
        };

        Ok(SampleOutput {
            sample,
            pred_xstart,
            index,
        })
    }
}
