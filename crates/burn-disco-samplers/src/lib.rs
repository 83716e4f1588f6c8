//! Guided diffusion samplers
//!
//! Noise schedules with timestep respacing, and progressive DDIM and
//! ancestral samplers that call a guidance function at every step.

pub mod ddim;
pub mod ddpm;
pub mod denoiser;
pub mod progressive;
pub mod scheduler;

pub use ddim::{DdimConfig, DdimSampler};
pub use ddpm::{DdpmConfig, DdpmSampler, VarianceType};
pub use denoiser::{ConditionFn, Denoiser, Unguided};
pub use progressive::{sample_progressive, GuidedStep, ProgressiveSampler, SampleInit, SampleOutput};
pub use scheduler::{
    to_sample, train_steps_for, NoiseSchedule, PredictionType, SchedulerError, SpacedSchedule,
    StepCoefficients, TimestepSpacing,
};
