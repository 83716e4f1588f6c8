//! Error types for configuration and runs

use std::path::PathBuf;

use burn_disco_core::cutouts::CutoutError;
use burn_disco_samplers::SchedulerError;
use thiserror::Error;

use crate::artifact::ArtifactError;

/// A run configuration that cannot be executed
///
/// All of these are raised before any tensor work starts.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("no text prompts given")]
    NoPrompts,

    #[error("prompt {prompt:?} has a non-numeric weight")]
    InvalidPromptWeight { prompt: String },

    #[error("target weights for {model} sum to {sum}; the absolute sum must be at least 1e-3")]
    DegenerateWeights { model: String, sum: f64 },

    #[error("invalid schedule run {0:?}, expected VALUExCOUNT")]
    InvalidScheduleRun(String),

    #[error("{name} schedule covers {len} timesteps, expected {expected}")]
    ScheduleLength {
        name: &'static str,
        len: usize,
        expected: usize,
    },

    #[error("crop schedule entry {index} requests no crops")]
    EmptyScheduleEntry { index: usize },

    #[error("schedule index {index} is outside 0..{len}")]
    ScheduleIndex { index: i64, len: usize },

    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),

    #[error("{name} must be finite and non-negative, got {value}")]
    Negative { name: &'static str, value: f64 },

    #[error("skip_timesteps ({skip}) must be less than steps ({steps})")]
    SkipTooLarge { skip: usize, steps: usize },

    #[error("image size {width}x{height} is below 64 pixels on a side")]
    ImageTooSmall { width: usize, height: usize },

    #[error("no embedding models registered")]
    NoEmbedders,

    #[error("use_secondary_model is set but no secondary model was loaded")]
    MissingSecondaryModel,

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Failure inside one guidance evaluation
#[derive(Debug, Error)]
pub enum GuidanceError {
    #[error(transparent)]
    Schedule(#[from] ConfigError),

    #[error(transparent)]
    Cutout(#[from] CutoutError),

    #[error("failed to write cutout preview: {0}")]
    Preview(#[from] ArtifactError),
}

/// Failure of a whole run
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Guidance(#[from] GuidanceError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("failed to read init image {path}: {source}")]
    InitImage {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}
