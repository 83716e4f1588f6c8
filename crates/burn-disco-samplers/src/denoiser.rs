//! Seams between samplers, denoising networks and guidance

use std::convert::Infallible;

use burn::prelude::*;
use burn::tensor::Int;

use crate::scheduler::{to_sample, PredictionType, StepCoefficients};

/// A network that predicts noise, velocity or the clean image from `x_t`
pub trait Denoiser<B: Backend> {
    fn prediction_type(&self) -> PredictionType;

    /// Raw network output at `step`
    fn forward(&self, x: Tensor<B, 4>, step: &StepCoefficients, labels: Option<&Tensor<B, 1, Int>>) -> Tensor<B, 4>;

    /// Clean-image estimate at `step`
    fn predict_start(
        &self,
        x: Tensor<B, 4>,
        step: &StepCoefficients,
        labels: Option<&Tensor<B, 1, Int>>,
    ) -> Tensor<B, 4> {
        let output = self.forward(x.clone(), step, labels);
        to_sample(output, x, step.alpha(), step.sigma(), self.prediction_type())
    }
}

impl<B: Backend, D: Denoiser<B> + ?Sized> Denoiser<B> for &D {
    fn prediction_type(&self) -> PredictionType {
        (**self).prediction_type()
    }

    fn forward(&self, x: Tensor<B, 4>, step: &StepCoefficients, labels: Option<&Tensor<B, 1, Int>>) -> Tensor<B, 4> {
        (**self).forward(x, step, labels)
    }
}

/// Per-step guidance callback
///
/// Returns the gradient of a log-likelihood-like objective with respect to
/// the noisy sample. Samplers decide how it moves the step.
pub trait ConditionFn<B: Backend> {
    type Error;

    fn gradient(
        &mut self,
        x: Tensor<B, 4>,
        step: &StepCoefficients,
        labels: Option<&Tensor<B, 1, Int>>,
    ) -> Result<Tensor<B, 4>, Self::Error>;
}

/// Guidance that never pushes
#[derive(Debug, Clone, Copy, Default)]
pub struct Unguided;

impl<B: Backend> ConditionFn<B> for Unguided {
    type Error = Infallible;

    fn gradient(
        &mut self,
        x: Tensor<B, 4>,
        _step: &StepCoefficients,
        _labels: Option<&Tensor<B, 1, Int>>,
    ) -> Result<Tensor<B, 4>, Self::Error> {
        Ok(x.zeros_like())
    }
}
