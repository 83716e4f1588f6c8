//! Run controller
//!
//! Drives `n_batches` guided sampling loops one after another and decides
//! at every step whether to save. Per batch:
//!
//! ```text
//! BatchStart -> Stepping -> CheckpointDecision -> Stepping ... -> BatchEnd
//! ```
//!
//! A step is a save point when it is a multiple of `display_rate`, when it
//! is the last step, or when the checkpoint policy picks it. Cancellation
//! is checked after every step; a cancelled run still reports its seed and
//! returns a [`RunSummary`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn_disco_clip::ImageTextEmbedder;
use burn_disco_core::image_io::{fit_image, rgb_to_tensor, tensor_to_rgb};
use burn_disco_core::perlin::perlin_init;
use burn_disco_core::random::{random_seed, seeded_rng, stream_rng, RunRng};
use burn_disco_samplers::{
    sample_progressive, DdimConfig, DdimSampler, DdpmConfig, DdpmSampler, Denoiser, GuidedStep, SampleInit,
    SpacedSchedule,
};
use burn_disco_secondary::SecondaryDiffusion;
use tracing::{debug, info};

use crate::artifact::{artifact_key, ArtifactSink, Location, MarkerMode, SaveState};
use crate::config::{IntermediateSaves, RunConfig, SamplingMethod};
use crate::error::{ConfigError, RunError};
use crate::guidance::{
    CleanPredictor, ClipGuidance, GuidanceReport, GuidanceSettings, PosteriorMeanPredictor, SecondaryPredictor,
};
use crate::regularizers::{PerceptualDistance, Regularizers, SquaredError};
use crate::scorer::EmbeddingScorer;
use crate::targets::{parse_prompts, TargetSet};

/// Guidance of batch `i` draws from stream `GUIDANCE_STREAM + i`
const GUIDANCE_STREAM: u64 = 1;

/// Shared flag for stopping a run between steps
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Which steps get an intermediate image
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointPolicy {
    /// Every `n`th step after the first
    Every(usize),
    /// These step indices
    Steps(Vec<usize>),
}

impl CheckpointPolicy {
    /// `Count(c)` saves every `max(1, (steps - skip - 1) / (c + 1))` steps
    pub fn new(saves: &IntermediateSaves, steps: usize, skip_timesteps: usize) -> Self {
        match saves {
            IntermediateSaves::Count(count) => {
                let span = steps.saturating_sub(skip_timesteps + 1);
                Self::Every((span / (count + 1)).max(1))
            }
            IntermediateSaves::Steps(steps) => Self::Steps(steps.clone()),
        }
    }

    pub fn is_checkpoint(&self, step: usize) -> bool {
        match self {
            Self::Every(n) => step > 0 && step % n == 0,
            Self::Steps(steps) => steps.contains(&step),
        }
    }

    pub fn marker_mode(&self) -> MarkerMode {
        match self {
            Self::Every(_) => MarkerMode::Percent,
            Self::Steps(_) => MarkerMode::Step,
        }
    }
}

/// What to write at a save point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavePlan {
    /// Folders receiving the image
    pub locations: Vec<Location>,
    /// Write the settings snapshot
    pub settings: bool,
}

/// Decides whether `step` is a save point and what it writes
///
/// Every save point refreshes the progress image. Checkpoints go to the
/// partials folder when `intermediates_in_subfolder`, finished images to
/// the batch folder, and the first batch's finished image brings the
/// settings snapshot with it.
pub fn save_plan(
    step: usize,
    finished: bool,
    batch_index: usize,
    policy: &CheckpointPolicy,
    display_rate: usize,
    intermediates_in_subfolder: bool,
) -> Option<SavePlan> {
    let checkpoint = policy.is_checkpoint(step);
    if !(checkpoint || finished || step % display_rate.max(1) == 0) {
        return None;
    }

    let mut locations = Vec::new();
    if checkpoint {
        locations.push(if intermediates_in_subfolder {
            Location::Partials
        } else {
            Location::BatchFolder
        });
    }
    if finished && !locations.contains(&Location::BatchFolder) {
        locations.push(Location::BatchFolder);
    }

    Some(SavePlan {
        locations,
        settings: finished && batch_index == 0,
    })
}

/// Progress notifications from [`RunController::run`]
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    BatchStarted {
        batch_index: usize,
        steps: usize,
    },
    Step {
        batch_index: usize,
        step: usize,
        steps: usize,
        saved: bool,
    },
    BatchFinished {
        batch_index: usize,
    },
}

/// Outcome of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub seed: u64,
    pub run_number: u32,
    pub batches_completed: usize,
    pub interrupted: bool,
}

/// Models a run needs; all must already be loaded
pub struct RunModels<'a, B: AutodiffBackend, D> {
    pub denoiser: &'a D,
    /// Required when `use_secondary_model` is set
    pub secondary: Option<&'a SecondaryDiffusion<B>>,
    pub embedders: Vec<&'a dyn ImageTextEmbedder<B>>,
    /// Init-image distance; pixel MSE when unset
    pub perceptual: Option<&'a dyn PerceptualDistance<B>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchOutcome {
    Completed,
    Interrupted,
}

/// Per-run values threaded through every batch
struct RunState<'s> {
    seed: u64,
    run_number: u32,
    schedule: &'s SpacedSchedule,
    policy: CheckpointPolicy,
}

pub struct RunController<'a, B: AutodiffBackend, D> {
    config: &'a RunConfig,
    models: RunModels<'a, B, D>,
    device: B::Device,
    cancel: CancelToken,
}

impl<'a, B: AutodiffBackend, D: Denoiser<B>> RunController<'a, B, D> {
    /// Validates `config` against the loaded models
    pub fn new(config: &'a RunConfig, models: RunModels<'a, B, D>, device: B::Device) -> Result<Self, ConfigError> {
        config.validate()?;
        if models.embedders.is_empty() {
            return Err(ConfigError::NoEmbedders);
        }
        if config.use_secondary_model && models.secondary.is_none() {
            return Err(ConfigError::MissingSecondaryModel);
        }

        Ok(Self {
            config,
            models,
            device,
            cancel: CancelToken::new(),
        })
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Runs every batch, writing artifacts to `sink`
    ///
    /// `on_event` sees batch and step progress; `on_guidance` sees every
    /// guidance evaluation.
    pub fn run<S, F, G>(&self, sink: &mut S, mut on_event: F, mut on_guidance: G) -> Result<RunSummary, RunError>
    where
        S: ArtifactSink,
        F: FnMut(&RunEvent),
        G: FnMut(&GuidanceReport),
    {
        let seed = self.config.seed.unwrap_or_else(random_seed);
        info!(seed, batches = self.config.n_batches, "starting run");

        let result = self.run_batches(seed, sink, &mut on_event, &mut on_guidance);

        info!(seed, "seed used");
        if let Ok(summary) = &result {
            if summary.interrupted {
                info!(batches_completed = summary.batches_completed, "run interrupted");
            }
        }
        result
    }

    fn run_batches<S: ArtifactSink>(
        &self,
        seed: u64,
        sink: &mut S,
        on_event: &mut dyn FnMut(&RunEvent),
        on_guidance: &mut dyn FnMut(&GuidanceReport),
    ) -> Result<RunSummary, RunError> {
        let config = self.config;
        let schedule = config.spaced_schedule()?;
        let mut rng = seeded_rng(seed);

        let prompts = parse_prompts(&config.text_prompts)?;
        let fuzzy = config.fuzzy_prompt.then_some(config.rand_mag);
        let targets = self
            .models
            .embedders
            .iter()
            .map(|embedder| TargetSet::build(*embedder, &prompts, fuzzy, &mut rng))
            .collect::<Result<Vec<_>, _>>()?;

        let init_image = self.load_init_image()?;
        let state = RunState {
            seed,
            run_number: sink.run_number(&config.batch_name)?,
            schedule: &schedule,
            policy: CheckpointPolicy::new(&config.intermediate_saves, config.steps, config.skip_timesteps),
        };
        debug!(run_number = state.run_number, policy = ?state.policy, "run state");

        let mut summary = RunSummary {
            seed,
            run_number: state.run_number,
            batches_completed: 0,
            interrupted: false,
        };

        for batch_index in 0..config.n_batches {
            if self.cancel.is_cancelled() {
                summary.interrupted = true;
                break;
            }

            let init = if config.perlin_init {
                Some(perlin_init::<B, _>(
                    config.side_x(),
                    config.side_y(),
                    config.batch_size,
                    config.perlin_mode.into(),
                    &mut rng,
                    &self.device,
                ))
            } else {
                init_image.clone()
            };

            let guidance = self
                .guidance(batch_index, seed, &targets, init.clone())?
                .with_observer(|report: &GuidanceReport| on_guidance(report));

            let outcome = match config.sampling {
                SamplingMethod::Ddim => {
                    let sampler = DdimSampler::new(DdimConfig {
                        eta: config.eta,
                        clip_denoised: config.clip_denoised,
                    });
                    self.sample_batch(&sampler, guidance, init, batch_index, &state, &mut rng, sink, on_event)?
                }
                SamplingMethod::Ancestral => {
                    let sampler = DdpmSampler::new(DdpmConfig {
                        clip_denoised: config.clip_denoised,
                        ..Default::default()
                    });
                    self.sample_batch(&sampler, guidance, init, batch_index, &state, &mut rng, sink, on_event)?
                }
            };

            if outcome == BatchOutcome::Interrupted {
                summary.interrupted = true;
                break;
            }
            summary.batches_completed += 1;
            on_event(&RunEvent::BatchFinished { batch_index });
        }

        Ok(summary)
    }

    /// Guidance for one batch, with its own random stream
    fn guidance<'g>(
        &'g self,
        batch_index: usize,
        seed: u64,
        targets: &[TargetSet<B>],
        init: Option<Tensor<B, 4>>,
    ) -> Result<ClipGuidance<'g, B>, ConfigError> {
        let config = self.config;

        let predictor: Box<dyn CleanPredictor<B> + 'g> = match self.models.secondary {
            Some(model) if config.use_secondary_model => Box::new(SecondaryPredictor::new(model)),
            _ => Box::new(PosteriorMeanPredictor::new(self.models.denoiser)),
        };

        let scorers = self
            .models
            .embedders
            .iter()
            .zip(targets)
            .map(|(embedder, targets)| EmbeddingScorer::new(*embedder, targets.clone()))
            .collect();

        let mut regularizers = Regularizers::new(config.tv_scale, config.range_scale, config.sat_scale);
        if let Some(init) = init {
            let distance = self.models.perceptual.unwrap_or(&SquaredError);
            regularizers = regularizers.with_init(init, config.init_scale, distance);
        }

        let rng: RunRng = stream_rng(seed, GUIDANCE_STREAM + batch_index as u64);
        let guidance = ClipGuidance::new(
            GuidanceSettings::from(config),
            predictor,
            scorers,
            config.crop_schedule()?,
            regularizers,
            rng,
        )?;

        Ok(if config.cutout_debug {
            guidance.with_cutout_preview(format!("{}_cutouts", config.batch_name).into())
        } else {
            guidance
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn sample_batch<St, S>(
        &self,
        stepper: &St,
        mut guidance: ClipGuidance<'_, B>,
        init: Option<Tensor<B, 4>>,
        batch_index: usize,
        state: &RunState<'_>,
        rng: &mut RunRng,
        sink: &mut S,
        on_event: &mut dyn FnMut(&RunEvent),
    ) -> Result<BatchOutcome, RunError>
    where
        St: GuidedStep<B>,
        S: ArtifactSink,
    {
        let config = self.config;
        let skip = config.skip_timesteps;
        let init = SampleInit {
            shape: [config.batch_size, 3, config.side_y(), config.side_x()],
            init_image: init,
            skip_timesteps: skip,
            labels: None,
        };
        let samples = sample_progressive(
            stepper,
            state.schedule,
            self.models.denoiser,
            &mut guidance,
            rng,
            init,
            &self.device,
        )?;

        let total_steps = state.schedule.len() - skip - 1;
        let mut remaining = total_steps as i64;
        info!(batch_index, steps = total_steps + 1, "batch start");
        on_event(&RunEvent::BatchStarted {
            batch_index,
            steps: total_steps + 1,
        });

        for (step, output) in samples.enumerate() {
            let output = output?;
            remaining -= 1;
            let finished = remaining == -1;

            let plan = save_plan(
                step,
                finished,
                batch_index,
                &state.policy,
                config.display_rate,
                config.intermediates_in_subfolder,
            );
            if let Some(plan) = &plan {
                self.save(plan, output.pred_xstart, step, total_steps, finished, batch_index, state, sink)?;
            }

            on_event(&RunEvent::Step {
                batch_index,
                step,
                steps: total_steps + 1,
                saved: plan.is_some(),
            });

            if !finished && self.cancel.is_cancelled() {
                return Ok(BatchOutcome::Interrupted);
            }
        }

        Ok(BatchOutcome::Completed)
    }

    #[allow(clippy::too_many_arguments)]
    fn save<S: ArtifactSink>(
        &self,
        plan: &SavePlan,
        pred: Tensor<B, 4>,
        step: usize,
        total_steps: usize,
        finished: bool,
        batch_index: usize,
        state: &RunState<'_>,
        sink: &mut S,
    ) -> Result<(), RunError> {
        let config = self.config;
        let pred = pred.detach();

        for member in 0..config.batch_size {
            let image = tensor_to_rgb(pred.clone(), member);
            sink.save_progress(&image)?;

            let save_state = SaveState {
                batch_name: &config.batch_name,
                run_number: state.run_number,
                batch_index,
                member,
                step,
                total_steps,
                finished,
                marker_mode: state.policy.marker_mode(),
                intermediates_in_subfolder: config.intermediates_in_subfolder,
            };
            for &location in &plan.locations {
                let key = artifact_key(&save_state, location);
                debug!(file = %key.file_name(), "save point");
                sink.save_image(&key, &image)?;
            }
        }

        if plan.settings {
            sink.save_settings(&config.batch_name, state.run_number, &config.snapshot(state.seed))?;
        }
        Ok(())
    }

    /// The configured init image, resized and repeated over the batch
    fn load_init_image(&self) -> Result<Option<Tensor<B, 4>>, RunError> {
        let Some(path) = &self.config.init_image else {
            return Ok(None);
        };
        let image = image::open(path)
            .map_err(|source| RunError::InitImage {
                path: path.clone(),
                source,
            })?
            .to_rgb8();
        let image = fit_image(&image, self.config.side_x() as u32, self.config.side_y() as u32);
        let tensor = rgb_to_tensor::<B>(&image, &self.device);
        Ok(Some(tensor.repeat_dim(0, self.config.batch_size)))
    }
}
