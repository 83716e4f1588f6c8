//! Run configuration
//!
//! One [`RunConfig`] describes a whole run. It deserializes from JSON with
//! every field optional, is validated once with [`RunConfig::validate`],
//! and is then passed by reference to every component.

use std::path::PathBuf;

use burn_disco_core::perlin::PerlinMode;
use burn_disco_samplers::{train_steps_for, SpacedSchedule, TimestepSpacing};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;
use crate::schedule::{CropSchedule, ScheduleSetting};
use crate::targets::parse_prompt;

/// Output sides are floored to a multiple of this
pub const SIZE_MULTIPLE: usize = 64;

/// Reverse-process update rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingMethod {
    #[default]
    Ddim,
    /// Ancestral (DDPM) sampling
    Ancestral,
}

/// Perlin init colour mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerlinSetting {
    #[default]
    Mixed,
    Color,
    Gray,
}

impl From<PerlinSetting> for PerlinMode {
    fn from(setting: PerlinSetting) -> Self {
        match setting {
            PerlinSetting::Mixed => PerlinMode::Mixed,
            PerlinSetting::Color => PerlinMode::Color,
            PerlinSetting::Gray => PerlinMode::Gray,
        }
    }
}

/// Which intermediate images to keep
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntermediateSaves {
    /// Spread this many saves evenly over the run
    Count(usize),
    /// Save at these step indices
    Steps(Vec<usize>),
}

impl Default for IntermediateSaves {
    fn default() -> Self {
        Self::Count(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub batch_name: String,
    /// Prompts, each optionally suffixed with `:weight`
    pub text_prompts: Vec<String>,

    pub clip_guidance_scale: f64,
    pub tv_scale: f64,
    pub range_scale: f64,
    pub sat_scale: f64,
    /// Crop batches evaluated per step; each contributes `1/cutn_batches`
    pub cutn_batches: usize,

    pub init_image: Option<PathBuf>,
    pub init_scale: f64,
    pub skip_timesteps: usize,
    pub perlin_init: bool,
    pub perlin_mode: PerlinSetting,

    pub skip_augs: bool,
    pub clip_denoised: bool,
    pub clamp_grad: bool,
    pub clamp_max: f64,
    /// Random when unset
    pub seed: Option<u64>,
    pub fuzzy_prompt: bool,
    pub rand_mag: f64,
    pub eta: f64,
    pub sampling: SamplingMethod,

    pub width: usize,
    pub height: usize,
    /// Estimate the clean image with the secondary model instead of the
    /// denoiser
    pub use_secondary_model: bool,
    pub steps: usize,

    pub cut_overview: ScheduleSetting,
    pub cut_innercut: ScheduleSetting,
    pub cut_icgray_p: ScheduleSetting,
    pub cut_ic_pow: f64,

    pub intermediate_saves: IntermediateSaves,
    pub intermediates_in_subfolder: bool,
    pub display_rate: usize,
    pub n_batches: usize,
    pub batch_size: usize,
    /// Write the first crop batch of each model as images
    pub cutout_debug: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            batch_name: "DiscoTime".into(),
            text_prompts: vec![
                "A beautiful painting of a singular lighthouse, shining its light across a tumultuous sea of blood \
                 by greg rutkowski and thomas kinkade, Trending on artstation.:3"
                    .into(),
                "yellow color scheme:1".into(),
            ],
            clip_guidance_scale: 5000.0,
            tv_scale: 0.0,
            range_scale: 150.0,
            sat_scale: 0.0,
            cutn_batches: 4,
            init_image: None,
            init_scale: 1000.0,
            skip_timesteps: 0,
            perlin_init: false,
            perlin_mode: PerlinSetting::Mixed,
            skip_augs: false,
            clip_denoised: false,
            clamp_grad: true,
            clamp_max: 0.05,
            seed: None,
            fuzzy_prompt: false,
            rand_mag: 0.05,
            eta: 0.8,
            sampling: SamplingMethod::Ddim,
            width: 1280,
            height: 768,
            use_secondary_model: true,
            steps: 250,
            cut_overview: ScheduleSetting::runs("35x400,5x600"),
            cut_innercut: ScheduleSetting::runs("5x400,35x600"),
            cut_icgray_p: ScheduleSetting::runs("0.2x400,0x600"),
            cut_ic_pow: 2.0,
            intermediate_saves: IntermediateSaves::default(),
            intermediates_in_subfolder: true,
            display_rate: 50,
            n_batches: 50,
            batch_size: 1,
            cutout_debug: false,
        }
    }
}

impl RunConfig {
    /// Loads a config from a JSON file; missing fields take defaults
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Output width, floored to a multiple of 64
    pub fn side_x(&self) -> usize {
        self.width / SIZE_MULTIPLE * SIZE_MULTIPLE
    }

    /// Output height, floored to a multiple of 64
    pub fn side_y(&self) -> usize {
        self.height / SIZE_MULTIPLE * SIZE_MULTIPLE
    }

    /// Timestep respacing, always `ddim{steps}`
    pub fn timestep_spacing(&self) -> TimestepSpacing {
        TimestepSpacing::Ddim(self.steps)
    }

    /// Training steps the respacing is taken from
    pub fn diffusion_steps(&self) -> usize {
        train_steps_for(self.steps)
    }

    pub fn spaced_schedule(&self) -> Result<SpacedSchedule, ConfigError> {
        Ok(SpacedSchedule::guided(self.diffusion_steps(), self.timestep_spacing())?)
    }

    pub fn crop_schedule(&self) -> Result<CropSchedule, ConfigError> {
        CropSchedule::from_settings(&self.cut_overview, &self.cut_innercut, &self.cut_icgray_p)
    }

    /// Checks everything that can be checked without models
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.text_prompts.is_empty() {
            return Err(ConfigError::NoPrompts);
        }
        for prompt in &self.text_prompts {
            parse_prompt(prompt)?;
        }

        for (name, value) in [
            ("steps", self.steps),
            ("cutn_batches", self.cutn_batches),
            ("display_rate", self.display_rate),
            ("batch_size", self.batch_size),
        ] {
            if value == 0 {
                return Err(ConfigError::NotPositive(name));
            }
        }

        for (name, value) in [
            ("clip_guidance_scale", self.clip_guidance_scale),
            ("tv_scale", self.tv_scale),
            ("range_scale", self.range_scale),
            ("sat_scale", self.sat_scale),
            ("init_scale", self.init_scale),
            ("clamp_max", self.clamp_max),
            ("rand_mag", self.rand_mag),
            ("eta", self.eta),
            ("cut_ic_pow", self.cut_ic_pow),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Negative { name, value });
            }
        }

        if self.skip_timesteps >= self.steps {
            return Err(ConfigError::SkipTooLarge {
                skip: self.skip_timesteps,
                steps: self.steps,
            });
        }

        if self.side_x() == 0 || self.side_y() == 0 {
            return Err(ConfigError::ImageTooSmall {
                width: self.width,
                height: self.height,
            });
        }
        if self.side_x() != self.width || self.side_y() != self.height {
            warn!(
                width = self.side_x(),
                height = self.side_y(),
                "output size changed; dimensions must be multiples of {SIZE_MULTIPLE}"
            );
        }

        self.spaced_schedule()?;
        self.crop_schedule()?;
        Ok(())
    }

    /// Settings snapshot written next to the first finished image
    pub fn snapshot(&self, seed: u64) -> RunConfig {
        RunConfig {
            seed: Some(seed),
            width: self.side_x(),
            height: self.side_y(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = RunConfig::default();
        config.validate().unwrap();
        assert_eq!(config.side_x(), 1280);
        assert_eq!(config.diffusion_steps(), 1000);
        assert_eq!(config.spaced_schedule().unwrap().len(), 250);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = RunConfig::from_json(
            r#"{
                "text_prompts": ["a red fox:2", "snow"],
                "steps": 100,
                "intermediate_saves": [10, 20],
                "cut_overview": [4, 4],
                "sampling": "ancestral"
            }"#,
        )
        .unwrap();

        assert_eq!(config.steps, 100);
        assert_eq!(config.batch_name, "DiscoTime");
        assert_eq!(config.sampling, SamplingMethod::Ancestral);
        assert_eq!(config.intermediate_saves, IntermediateSaves::Steps(vec![10, 20]));
        assert_eq!(config.cut_overview, ScheduleSetting::Values(vec![4.0, 4.0]));

        // A two-entry table is not a full schedule
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ScheduleLength { name: "cut_overview", len: 2, .. })
        ));
    }

    #[test]
    fn test_sizes_floor_to_multiple() {
        let config = RunConfig {
            width: 1600,
            height: 900,
            ..Default::default()
        };
        assert_eq!((config.side_x(), config.side_y()), (1600, 896));
        config.validate().unwrap();

        let tiny = RunConfig {
            width: 63,
            ..Default::default()
        };
        assert!(matches!(tiny.validate(), Err(ConfigError::ImageTooSmall { .. })));
    }

    #[test]
    fn test_validation_errors() {
        let skip = RunConfig {
            steps: 50,
            skip_timesteps: 50,
            ..Default::default()
        };
        assert_eq!(skip.validate(), Err(ConfigError::SkipTooLarge { skip: 50, steps: 50 }));

        let no_prompts = RunConfig {
            text_prompts: vec![],
            ..Default::default()
        };
        assert_eq!(no_prompts.validate(), Err(ConfigError::NoPrompts));

        let bad_weight = RunConfig {
            text_prompts: vec!["a cat:heavy".into()],
            ..Default::default()
        };
        assert!(matches!(bad_weight.validate(), Err(ConfigError::InvalidPromptWeight { .. })));

        let zero_batches = RunConfig {
            cutn_batches: 0,
            ..Default::default()
        };
        assert_eq!(zero_batches.validate(), Err(ConfigError::NotPositive("cutn_batches")));

        let negative = RunConfig {
            tv_scale: -1.0,
            ..Default::default()
        };
        assert!(matches!(negative.validate(), Err(ConfigError::Negative { name: "tv_scale", .. })));
    }

    #[test]
    fn test_snapshot_records_seed_and_size() {
        let config = RunConfig {
            height: 900,
            ..Default::default()
        };
        let snapshot = config.snapshot(42);
        assert_eq!(snapshot.seed, Some(42));
        assert_eq!(snapshot.height, 896);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["seed"], 42);
        assert_eq!(json["cut_overview"], "35x400,5x600");
        assert_eq!(json["perlin_mode"], "mixed");
    }
}
