//! CLIP guidance
//!
//! [`ClipGuidance`] is the per-step condition function handed to the
//! samplers. For a noisy sample `x` it:
//!
//! 1. predicts the clean image, either with the secondary model or from
//!    the denoiser itself ([`CleanPredictor`]),
//! 2. blends `x_in = pred * fac + x * (1 - fac)` with `fac = sqrt(1 - alpha_bar)`,
//! 3. scores crops of `x_in` against every model's targets, `cutn_batches`
//!    times, backpropagating each crop batch on its own into a detached
//!    copy of `x_in`,
//! 4. adds the pixel penalties on `x_in` and the range penalty on `pred`,
//! 5. carries the accumulated gradient back through the blend to `x`.
//!
//! Non-finite gradients are replaced by zeros so one bad step does not
//! ruin a run. With `clamp_grad` the gradient RMS is capped at `clamp_max`.

use std::collections::HashSet;
use std::path::PathBuf;

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Int};
use burn_disco_core::image_io::tensor_to_rgb;
use burn_disco_core::random::RunRng;
use burn_disco_samplers::{ConditionFn, Denoiser, StepCoefficients};
use burn_disco_secondary::SecondaryDiffusion;
use tracing::{debug, warn};

use crate::artifact::save_png;
use crate::config::RunConfig;
use crate::error::{ConfigError, GuidanceError};
use crate::regularizers::Regularizers;
use crate::schedule::CropSchedule;
use crate::scorer::{CropSettings, EmbeddingScorer};

/// Estimates the clean image from a noisy sample
pub trait CleanPredictor<B: Backend> {
    fn predict(&self, x: Tensor<B, 4>, step: &StepCoefficients, labels: Option<&Tensor<B, 1, Int>>) -> Tensor<B, 4>;
}

/// Fast path: one pass of the secondary model at continuous time
pub struct SecondaryPredictor<'a, B: Backend> {
    model: &'a SecondaryDiffusion<B>,
}

impl<'a, B: Backend> SecondaryPredictor<'a, B> {
    pub fn new(model: &'a SecondaryDiffusion<B>) -> Self {
        Self { model }
    }
}

impl<B: Backend> CleanPredictor<B> for SecondaryPredictor<'_, B> {
    fn predict(&self, x: Tensor<B, 4>, step: &StepCoefficients, _labels: Option<&Tensor<B, 1, Int>>) -> Tensor<B, 4> {
        self.model.forward(x, step.continuous_time()).pred
    }
}

/// Accurate path: the denoiser's own clean-image estimate
pub struct PosteriorMeanPredictor<'a, D> {
    denoiser: &'a D,
}

impl<'a, D> PosteriorMeanPredictor<'a, D> {
    pub fn new(denoiser: &'a D) -> Self {
        Self { denoiser }
    }
}

impl<B: Backend, D: Denoiser<B>> CleanPredictor<B> for PosteriorMeanPredictor<'_, D> {
    fn predict(&self, x: Tensor<B, 4>, step: &StepCoefficients, labels: Option<&Tensor<B, 1, Int>>) -> Tensor<B, 4> {
        self.denoiser.predict_start(x, step, labels)
    }
}

/// Guidance weights of a run
#[derive(Debug, Clone)]
pub struct GuidanceSettings {
    pub clip_guidance_scale: f64,
    pub cutn_batches: usize,
    pub clamp_grad: bool,
    pub clamp_max: f64,
    pub crops: CropSettings,
}

impl From<&RunConfig> for GuidanceSettings {
    fn from(config: &RunConfig) -> Self {
        Self {
            clip_guidance_scale: config.clip_guidance_scale,
            cutn_batches: config.cutn_batches,
            clamp_grad: config.clamp_grad,
            clamp_max: config.clamp_max,
            crops: CropSettings {
                inner_size_power: config.cut_ic_pow,
                skip_augs: config.skip_augs,
                ..Default::default()
            },
        }
    }
}

/// What one guidance evaluation computed
#[derive(Debug, Clone, PartialEq)]
pub struct GuidanceReport {
    /// Timestep on the 1000-step clock
    pub timestep: f64,
    /// Batch-summed embedding loss per model and crop batch, model-major
    pub clip_losses: Vec<f64>,
    /// Weighted pixel and range penalties
    pub aux_loss: f64,
    /// The gradient was non-finite and replaced by zeros
    pub nan_fallback: bool,
    /// RMS of the returned gradient
    pub grad_rms: f64,
}

impl GuidanceReport {
    pub fn clip_loss(&self) -> f64 {
        self.clip_losses.iter().sum()
    }
}

/// Writes the first crop batch of each model once
struct CutoutPreview {
    dir: PathBuf,
    written: HashSet<String>,
}

impl CutoutPreview {
    fn write<B: Backend>(&mut self, model: &str, crops: &Tensor<B, 4>) -> Result<(), GuidanceError> {
        if !self.written.insert(model.to_string()) {
            return Ok(());
        }
        let stem: String = model
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        let crops = crops.clone().detach().mul_scalar(2.0).sub_scalar(1.0);
        let [rows, _, _, _] = crops.dims();
        for k in 0..rows {
            save_png(&self.dir.join(format!("{stem}_{k:02}.png")), &tensor_to_rgb(crops.clone(), k))?;
        }
        debug!(model, crops = rows, dir = %self.dir.display(), "wrote cutout preview");
        Ok(())
    }
}

/// The CLIP-guided condition function
pub struct ClipGuidance<'a, B: AutodiffBackend> {
    settings: GuidanceSettings,
    predictor: Box<dyn CleanPredictor<B> + 'a>,
    scorers: Vec<EmbeddingScorer<'a, B>>,
    schedule: CropSchedule,
    regularizers: Regularizers<'a, B>,
    rng: RunRng,
    observer: Option<Box<dyn FnMut(&GuidanceReport) + 'a>>,
    preview: Option<CutoutPreview>,
}

impl<'a, B: AutodiffBackend> ClipGuidance<'a, B> {
    pub fn new(
        settings: GuidanceSettings,
        predictor: Box<dyn CleanPredictor<B> + 'a>,
        scorers: Vec<EmbeddingScorer<'a, B>>,
        schedule: CropSchedule,
        regularizers: Regularizers<'a, B>,
        rng: RunRng,
    ) -> Result<Self, ConfigError> {
        if scorers.is_empty() {
            return Err(ConfigError::NoEmbedders);
        }
        if settings.cutn_batches == 0 {
            return Err(ConfigError::NotPositive("cutn_batches"));
        }

        Ok(Self {
            settings,
            predictor,
            scorers,
            schedule,
            regularizers,
            rng,
            observer: None,
            preview: None,
        })
    }

    /// Receives a [`GuidanceReport`] after every evaluation
    pub fn with_observer(mut self, observer: impl FnMut(&GuidanceReport) + 'a) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Writes the first crop batch of each model into `dir`
    pub fn with_cutout_preview(mut self, dir: PathBuf) -> Self {
        self.preview = Some(CutoutPreview {
            dir,
            written: HashSet::new(),
        });
        self
    }

    pub fn settings(&self) -> &GuidanceSettings {
        &self.settings
    }

    /// Embedding-loss gradient with respect to `x_in`, scaled and
    /// accumulated over models and crop batches
    fn embedding_gradient(
        &mut self,
        leaf: &Tensor<B, 4>,
        step: &StepCoefficients,
        losses: &mut Vec<f64>,
    ) -> Result<Tensor<B::InnerBackend, 4>, GuidanceError> {
        let [batch, _, _, _] = leaf.dims();
        let entry = self.schedule.at_timestep(step.scaled_timestep())?;
        let weight = self.settings.clip_guidance_scale / self.settings.cutn_batches as f64;
        let mut grad = leaf.clone().inner().zeros_like();

        for scorer in &self.scorers {
            for _ in 0..self.settings.cutn_batches {
                let crops = scorer.crops(leaf.clone(), &entry, &self.settings.crops, &mut self.rng)?;
                if let Some(preview) = self.preview.as_mut() {
                    preview.write(scorer.name(), &crops)?;
                }

                let loss = scorer.score(crops, batch).sum();
                losses.push(scalar(&loss));

                let grads = (loss * weight).backward();
                if let Some(g) = leaf.grad(&grads) {
                    grad = grad + g;
                }
            }
        }

        Ok(grad)
    }
}

impl<B: AutodiffBackend> ConditionFn<B> for ClipGuidance<'_, B> {
    type Error = GuidanceError;

    fn gradient(
        &mut self,
        x: Tensor<B, 4>,
        step: &StepCoefficients,
        labels: Option<&Tensor<B, 1, Int>>,
    ) -> Result<Tensor<B, 4>, GuidanceError> {
        let x = x.detach().require_grad();
        let pred = self.predictor.predict(x.clone(), step, labels);
        let fac = step.sigma();
        let x_in = pred.clone() * fac + x.clone() * (1.0 - fac);

        // Losses are taken at a detached copy so each crop batch frees its graph
        let leaf = x_in.clone().detach().require_grad();
        let mut clip_losses = Vec::with_capacity(self.scorers.len() * self.settings.cutn_batches);
        let mut x_in_grad = self.embedding_gradient(&leaf, step, &mut clip_losses)?;

        let mut aux_loss = 0.0;
        if self.regularizers.has_pixel_terms() {
            let loss = self.regularizers.pixel_terms(leaf.clone());
            aux_loss += scalar(&loss);
            if let Some(g) = leaf.grad(&loss.backward()) {
                x_in_grad = x_in_grad + g;
            }
        }

        // d/dx of <x_in, g> is the vector-Jacobian product of the blend
        let mut surrogate = (x_in * Tensor::from_inner(x_in_grad)).sum();
        if self.regularizers.has_range_term() {
            let range = self.regularizers.range_term(pred);
            aux_loss += scalar(&range);
            surrogate = surrogate + range;
        }
        let grads = surrogate.backward();
        let grad = match x.grad(&grads) {
            Some(g) => -g,
            None => x.clone().inner().zeros_like(),
        };

        let (grad, rms, nan_fallback) = match finite_rms(&grad) {
            Some(rms) => (grad, rms, false),
            None => {
                warn!(timestep = step.scaled_timestep(), "non-finite guidance gradient, using zeros");
                (grad.zeros_like(), 0.0, true)
            }
        };

        let (grad, grad_rms) = if self.settings.clamp_grad && !nan_fallback {
            let clamped = clamp_by_rms(grad, rms, self.settings.clamp_max);
            (clamped, rms.min(self.settings.clamp_max))
        } else {
            (grad, rms)
        };

        let report = GuidanceReport {
            timestep: step.scaled_timestep(),
            clip_losses,
            aux_loss,
            nan_fallback,
            grad_rms,
        };
        debug!(
            timestep = report.timestep,
            clip_loss = report.clip_loss(),
            aux_loss = report.aux_loss,
            grad_rms = report.grad_rms,
            "guidance"
        );
        if let Some(observer) = self.observer.as_mut() {
            observer(&report);
        }

        Ok(Tensor::from_inner(grad))
    }
}

fn scalar<B: AutodiffBackend>(loss: &Tensor<B, 1>) -> f64 {
    loss.clone().inner().into_scalar().elem::<f64>()
}

/// Root mean square of `t`, or `None` if any element is not finite
pub fn finite_rms<B: Backend, const D: usize>(t: &Tensor<B, D>) -> Option<f64> {
    let data = t.clone().into_data();
    let mut sum = 0.0;
    let mut len = 0usize;
    for v in data.iter::<f64>() {
        if !v.is_finite() {
            return None;
        }
        sum += v * v;
        len += 1;
    }
    Some(if len == 0 { 0.0 } else { (sum / len as f64).sqrt() })
}

/// Rescales `grad` so its RMS is at most `max`, keeping its direction
///
/// `rms` is the current RMS of `grad`; a zero gradient stays zero.
pub fn clamp_by_rms<B: Backend, const D: usize>(grad: Tensor<B, D>, rms: f64, max: f64) -> Tensor<B, D> {
    if rms <= 0.0 {
        return grad.zeros_like();
    }
    grad * (rms.min(max) / rms)
}
