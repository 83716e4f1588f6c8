//! burn-disco: CLIP-guided diffusion in pure Rust
//!
//! Steers an unconditional diffusion model toward text prompts by scoring
//! random crops of each step's denoised estimate against prompt embeddings
//! and pushing the sample down the gradient of that score.
//!
//! # Crates
//!
//! - [`core`] - Crops, augmentation, losses, perlin noise, image I/O
//! - [`clip`] - CLIP text and image towers, tokenizer, [`clip::ImageTextEmbedder`]
//! - [`samplers`] - Respaced noise schedules, progressive DDIM and ancestral samplers
//! - [`secondary`] - Small fast denoiser used for guidance
//! - [`convert`] - Safetensors weight loading
//!
//! # Backend Selection
//!
//! See [`backends`]. Every backend is wrapped in `Autodiff`, since
//! guidance differentiates through the embedding models.
//!
//! # Example
//!
//! ```ignore
//! use burn_disco::{DiskArtifacts, RunConfig, RunController, RunModels};
//!
//! let config = RunConfig::from_json(&std::fs::read_to_string("run.json")?)?;
//! let models = RunModels { denoiser: &unet, secondary: Some(&secondary), embedders: vec![&vit_b32], perceptual: None };
//! let controller = RunController::new(&config, models, device)?;
//! let summary = controller.run(&mut DiskArtifacts::new("images_out"), |_| {}, |_| {})?;
//! println!("seed {}", summary.seed);
//! ```

pub use burn_disco_clip as clip;
pub use burn_disco_convert as convert;
pub use burn_disco_core as core;
pub use burn_disco_samplers as samplers;
pub use burn_disco_secondary as secondary;

pub mod artifact;
pub mod backends;
pub mod config;
pub mod error;
pub mod guidance;
pub mod regularizers;
pub mod run;
pub mod schedule;
pub mod scorer;
pub mod targets;

pub use artifact::{ArtifactKey, ArtifactSink, DiskArtifacts, Location, Marker};
pub use config::{IntermediateSaves, PerlinSetting, RunConfig, SamplingMethod};
pub use error::{ConfigError, GuidanceError, RunError};
pub use guidance::{
    CleanPredictor, ClipGuidance, GuidanceReport, GuidanceSettings, PosteriorMeanPredictor, SecondaryPredictor,
};
pub use regularizers::{PerceptualDistance, Regularizers, SquaredError};
pub use run::{CancelToken, CheckpointPolicy, RunController, RunEvent, RunModels, RunSummary};
pub use schedule::{CropSchedule, CropScheduleEntry, ScheduleSetting};
pub use scorer::{CropSettings, EmbeddingScorer};
pub use targets::{parse_prompt, parse_prompts, Prompt, TargetSet};
