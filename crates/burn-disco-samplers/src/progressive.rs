//! Step-by-step sampling loop shared by the guided samplers

use std::iter::Rev;
use std::ops::Range;

use burn::prelude::*;
use burn::tensor::Int;
use burn_disco_core::random::randn;
use rand::Rng;

use crate::denoiser::{ConditionFn, Denoiser};
use crate::scheduler::{SchedulerError, SpacedSchedule};

/// Result of one reverse step
#[derive(Debug, Clone)]
pub struct SampleOutput<B: Backend> {
    /// `x_{t-1}`
    pub sample: Tensor<B, 4>,
    /// Clean-image estimate after guidance
    pub pred_xstart: Tensor<B, 4>,
    /// Respaced step index that produced this output
    pub index: usize,
}

/// A reverse-process update rule with a guidance hook
pub trait GuidedStep<B: Backend> {
    #[allow(clippy::too_many_arguments)]
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
        R: Rng;
}

/// Iterator over guided reverse steps
///
/// Yields one [`SampleOutput`] per step, from the noisiest retained step down
/// to step 0. After a guidance error the iterator is exhausted.
pub struct ProgressiveSampler<'a, B, S, D, C, R>
where
    B: Backend,
{
    stepper: &'a S,
    schedule: &'a SpacedSchedule,
    denoiser: &'a D,
    cond_fn: &'a mut C,
    rng: &'a mut R,
    labels: Option<Tensor<B, 1, Int>>,
    current: Option<Tensor<B, 4>>,
    indices: Rev<Range<usize>>,
}

/// Starting point for [`sample_progressive`]
pub struct SampleInit<B: Backend> {
    pub shape: [usize; 4],
    /// Image in `[-1, 1]` to noise up to the first step
    pub init_image: Option<Tensor<B, 4>>,
    /// Number of noisiest steps to skip
    pub skip_timesteps: usize,
    pub labels: Option<Tensor<B, 1, Int>>,
}

impl<B: Backend> SampleInit<B> {
    pub fn noise(shape: [usize; 4]) -> Self {
        Self {
            shape,
            init_image: None,
            skip_timesteps: 0,
            labels: None,
        }
    }
}

/// Starts a guided progressive sampling loop
///
/// Without an init image the loop starts from pure noise. With one, the
/// image is noised to the first retained step.
pub fn sample_progressive<'a, B, S, D, C, R>(
    stepper: &'a S,
    schedule: &'a SpacedSchedule,
    denoiser: &'a D,
    cond_fn: &'a mut C,
    rng: &'a mut R,
    init: SampleInit<B>,
    device: &B::Device,
) -> Result<ProgressiveSampler<'a, B, S, D, C, R>, SchedulerError>
where
    B: Backend,
    S: GuidedStep<B>,
    D: Denoiser<B>,
    C: ConditionFn<B>,
    R: Rng,
{
    let steps = schedule.len();
    if init.skip_timesteps >= steps {
        return Err(SchedulerError::SkipTooLarge {
            skip: init.skip_timesteps,
            steps,
        });
    }

    let first = steps - init.skip_timesteps - 1;
    let noise: Tensor<B, 4> = randn(rng, init.shape, device);
    let start = match init.init_image {
        Some(image) => schedule.q_sample(image, first, noise),
        None => noise,
    };

    Ok(ProgressiveSampler {
        stepper,
        schedule,
        denoiser,
        cond_fn,
        rng,
        labels: init.labels,
        current: Some(start),
        indices: (0..first + 1).rev(),
    })
}

impl<B, S, D, C, R> ProgressiveSampler<'_, B, S, D, C, R>
where
    B: Backend,
{
    /// Steps left to run
    pub fn remaining(&self) -> usize {
        self.indices.len()
    }
}

impl<B, S, D, C, R> Iterator for ProgressiveSampler<'_, B, S, D, C, R>
where
    B: Backend,
    S: GuidedStep<B>,
    D: Denoiser<B>,
    C: ConditionFn<B>,
    R: Rng,
{
    type Item = Result<SampleOutput<B>, C::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.indices.next()?;
        let x = self.current.take()?;

        let result = self.stepper.step(
            self.schedule,
            self.denoiser,
            self.cond_fn,
            x,
            index,
            self.labels.as_ref(),
            self.rng,
        );

        match result {
            Ok(output) => {
                self.current = Some(output.sample.clone());
                Some(Ok(output))
            }
            Err(err) => {
                self.indices = (0..0).rev();
                Some(Err(err))
            }
        }
    }
}
