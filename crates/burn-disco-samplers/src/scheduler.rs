//! Noise schedules and timestep respacing
//!
//! Schedules are kept on the host as `f64` vectors. Samplers read scalar
//! coefficients per step, so nothing here allocates device memory.

use std::str::FromStr;

use burn::prelude::*;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("cannot create exactly {count} steps with an integer stride over {total} timesteps")]
    NoDdimStride { count: usize, total: usize },

    #[error("cannot take {count} steps from {total} timesteps")]
    TooManySteps { count: usize, total: usize },

    #[error("invalid timestep spacing '{0}'")]
    InvalidSpacing(String),

    #[error("skip_timesteps ({skip}) must be below the number of sampling steps ({steps})")]
    SkipTooLarge { skip: usize, steps: usize },
}

// ============================================================================
// Prediction Type
// ============================================================================

/// What a denoiser network outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PredictionType {
    /// The noise added to the sample
    #[default]
    Epsilon,
    /// The velocity `v = alpha * eps - sigma * x0`
    VPrediction,
    /// The clean sample itself
    Sample,
}

/// Converts a model output to a clean-sample prediction
///
/// `alpha` and `sigma` are `sqrt(alpha_bar)` and `sqrt(1 - alpha_bar)`.
pub fn to_sample<B: Backend>(
    model_output: Tensor<B, 4>,
    sample: Tensor<B, 4>,
    alpha: f64,
    sigma: f64,
    prediction_type: PredictionType,
) -> Tensor<B, 4> {
    match prediction_type {
        PredictionType::Epsilon => (sample - model_output * sigma) / alpha,
        PredictionType::VPrediction => sample * alpha - model_output * sigma,
        PredictionType::Sample => model_output,
    }
}

// ============================================================================
// Schedules
// ============================================================================

/// Training-time noise schedule
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    pub betas: Vec<f64>,
    /// Cumulative product of alphas: ᾱₜ
    pub alphas_cumprod: Vec<f64>,
}

impl NoiseSchedule {
    /// Betas evenly spaced from `beta_start` to `beta_end`
    pub fn linear(num_steps: usize, beta_start: f64, beta_end: f64) -> Self {
        let betas: Vec<f64> = (0..num_steps)
            .map(|i| {
                let t = if num_steps > 1 { i as f64 / (num_steps - 1) as f64 } else { 0.0 };
                beta_start + t * (beta_end - beta_start)
            })
            .collect();
        Self::from_betas(betas)
    }

    /// The linear schedule of the ImageNet diffusion models, rescaled so
    /// any step count covers the same noise range as 1000 steps
    pub fn guided_linear(num_steps: usize) -> Self {
        let scale = 1000.0 / num_steps as f64;
        Self::linear(num_steps, scale * 0.0001, scale * 0.02)
    }

    pub fn from_betas(betas: Vec<f64>) -> Self {
        let alphas_cumprod = betas
            .iter()
            .scan(1.0, |acc, beta| {
                *acc *= 1.0 - beta;
                Some(*acc)
            })
            .collect();
        Self { betas, alphas_cumprod }
    }

    pub fn num_train_steps(&self) -> usize {
        self.betas.len()
    }

    /// Keeps only `use_timesteps` (ascending), recomputing betas so the
    /// retained steps have the same cumulative alphas
    pub fn respace(&self, use_timesteps: &[usize]) -> SpacedSchedule {
        let mut last = 1.0;
        let mut betas = Vec::with_capacity(use_timesteps.len());
        let mut alphas_cumprod = Vec::with_capacity(use_timesteps.len());
        let mut timestep_map = Vec::with_capacity(use_timesteps.len());

        for (t, &ac) in self.alphas_cumprod.iter().enumerate() {
            if use_timesteps.binary_search(&t).is_ok() {
                betas.push(1.0 - ac / last);
                alphas_cumprod.push(ac);
                timestep_map.push(t);
                last = ac;
            }
        }

        SpacedSchedule {
            betas,
            alphas_cumprod,
            timestep_map,
            original_num_steps: self.num_train_steps(),
        }
    }
}

/// Training steps used for a run of `steps` sampling steps
///
/// Short runs use the largest multiple of `steps` not above 1000 so DDIM
/// strides divide evenly.
pub fn train_steps_for(steps: usize) -> usize {
    if steps == 0 || steps >= 1000 {
        steps.max(1)
    } else {
        (1000 / steps) * steps
    }
}

/// How sampling steps are picked from the training steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestepSpacing {
    /// Integer stride giving exactly this many steps (`ddimN`)
    Ddim(usize),
    /// This many steps spread evenly, rounding to integers (`N`)
    Uniform(usize),
}

impl TimestepSpacing {
    pub fn count(&self) -> usize {
        match self {
            TimestepSpacing::Ddim(n) | TimestepSpacing::Uniform(n) => *n,
        }
    }

    /// Ascending training timesteps to keep
    pub fn timesteps(&self, total: usize) -> Result<Vec<usize>, SchedulerError> {
        match *self {
            TimestepSpacing::Ddim(count) => (1..=total)
                .find(|stride| total.div_ceil(*stride) == count)
                .map(|stride| (0..total).step_by(stride).collect())
                .ok_or(SchedulerError::NoDdimStride { count, total }),
            TimestepSpacing::Uniform(count) => {
                if count == 0 || count > total {
                    return Err(SchedulerError::TooManySteps { count, total });
                }
                if count == 1 {
                    return Ok(vec![0]);
                }
                let stride = (total - 1) as f64 / (count - 1) as f64;
                let mut steps: Vec<usize> = (0..count).map(|i| (i as f64 * stride).round() as usize).collect();
                steps.dedup();
                Ok(steps)
            }
        }
    }
}

impl FromStr for TimestepSpacing {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SchedulerError::InvalidSpacing(s.to_string());
        match s.strip_prefix("ddim") {
            Some(rest) => rest.parse().map(TimestepSpacing::Ddim).map_err(|_| invalid()),
            None => s.parse().map(TimestepSpacing::Uniform).map_err(|_| invalid()),
        }
    }
}

/// A schedule restricted to the sampling steps
#[derive(Debug, Clone)]
pub struct SpacedSchedule {
    pub betas: Vec<f64>,
    pub alphas_cumprod: Vec<f64>,
    /// Respaced index to training timestep
    pub timestep_map: Vec<usize>,
    pub original_num_steps: usize,
}

impl SpacedSchedule {
    /// Builds the schedule for `spacing` over a guided linear schedule
    pub fn guided(num_train_steps: usize, spacing: TimestepSpacing) -> Result<Self, SchedulerError> {
        let base = NoiseSchedule::guided_linear(num_train_steps);
        let timesteps = spacing.timesteps(num_train_steps)?;
        Ok(base.respace(&timesteps))
    }

    pub fn len(&self) -> usize {
        self.alphas_cumprod.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alphas_cumprod.is_empty()
    }

    /// Scalars for respaced step `index`
    pub fn coefficients(&self, index: usize) -> StepCoefficients {
        StepCoefficients {
            index,
            timestep: self.timestep_map[index],
            original_num_steps: self.original_num_steps,
            alpha_cumprod: self.alphas_cumprod[index],
            alpha_cumprod_prev: if index > 0 { self.alphas_cumprod[index - 1] } else { 1.0 },
            beta: self.betas[index],
        }
    }

    /// Noises a clean sample to step `index`
    pub fn q_sample<B: Backend>(&self, x0: Tensor<B, 4>, index: usize, noise: Tensor<B, 4>) -> Tensor<B, 4> {
        let ac = self.alphas_cumprod[index];
        x0 * ac.sqrt() + noise * (1.0 - ac).sqrt()
    }
}

/// Noise-schedule scalars at one sampling step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepCoefficients {
    /// Respaced step index; counts down during sampling
    pub index: usize,
    /// Training timestep this step maps to
    pub timestep: usize,
    pub original_num_steps: usize,
    pub alpha_cumprod: f64,
    pub alpha_cumprod_prev: f64,
    pub beta: f64,
}

impl StepCoefficients {
    /// Signal coefficient `sqrt(alpha_bar)`
    pub fn alpha(&self) -> f64 {
        self.alpha_cumprod.sqrt()
    }

    /// Noise coefficient `sqrt(1 - alpha_bar)`
    pub fn sigma(&self) -> f64 {
        (1.0 - self.alpha_cumprod).sqrt()
    }

    /// Training timestep on a 1000-step clock
    pub fn scaled_timestep(&self) -> f64 {
        self.timestep as f64 * 1000.0 / self.original_num_steps as f64
    }

    /// Time in `[0, 1]` for models parameterized by angle:
    /// `atan2(sigma, alpha) * 2 / pi`
    pub fn continuous_time(&self) -> f64 {
        self.sigma().atan2(self.alpha()) * 2.0 / std::f64::consts::PI
    }

    /// Variance of `q(x_{t-1} | x_t, x_0)`
    pub fn posterior_variance(&self) -> f64 {
        self.beta * (1.0 - self.alpha_cumprod_prev) / (1.0 - self.alpha_cumprod)
    }

    /// Coefficients `(c0, ct)` of the posterior mean `c0 * x0 + ct * x_t`
    pub fn posterior_mean_coefficients(&self) -> (f64, f64) {
        let denom = 1.0 - self.alpha_cumprod;
        (
            self.beta * self.alpha_cumprod_prev.sqrt() / denom,
            (1.0 - self.alpha_cumprod_prev) * (1.0 - self.beta).sqrt() / denom,
        )
    }
}
