//! Per-timestep crop schedule
//!
//! Crop counts and the grayscale fraction change over the course of a run:
//! early, noisy steps favor whole-frame overview crops, late steps favor
//! small inner crops. Each quantity is a 1000-entry table built from
//! constant runs such as `35x400,5x600` (35 for the first 400 entries, 5
//! for the next 600). Entry 0 is the noisiest timestep.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Length of every schedule table, one entry per timestep on the 1000-step clock
pub const SCHEDULE_TIMESTEPS: usize = 1000;

/// A constant run inside a schedule table
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleRun {
    pub value: f64,
    pub count: usize,
}

/// Parses `VALUExCOUNT` runs separated by commas
pub fn parse_schedule_runs(s: &str) -> Result<Vec<ScheduleRun>, ConfigError> {
    s.split(',')
        .map(|part| {
            let part = part.trim();
            let invalid = || ConfigError::InvalidScheduleRun(part.to_string());
            let (value, count) = part.rsplit_once('x').ok_or_else(invalid)?;
            let value: f64 = value.trim().parse().map_err(|_| invalid())?;
            let count: usize = count.trim().parse().map_err(|_| invalid())?;
            if !value.is_finite() {
                return Err(invalid());
            }
            Ok(ScheduleRun { value, count })
        })
        .collect()
}

/// A schedule table as written in a config file
///
/// Either run notation (`"35x400,5x600"`) or the expanded table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScheduleSetting {
    Runs(String),
    Values(Vec<f64>),
}

impl ScheduleSetting {
    pub fn runs(s: &str) -> Self {
        Self::Runs(s.to_string())
    }

    /// The full table
    pub fn expand(&self) -> Result<Vec<f64>, ConfigError> {
        match self {
            Self::Runs(s) => Ok(parse_schedule_runs(s)?
                .into_iter()
                .flat_map(|run| std::iter::repeat(run.value).take(run.count))
                .collect()),
            Self::Values(values) => Ok(values.clone()),
        }
    }
}

/// Crop parameters at one timestep
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropScheduleEntry {
    pub overview: usize,
    pub inner: usize,
    pub inner_gray_fraction: f64,
}

/// The three crop tables of a run
#[derive(Debug, Clone, PartialEq)]
pub struct CropSchedule {
    overview: Vec<usize>,
    inner: Vec<usize>,
    inner_gray_fraction: Vec<f64>,
}

impl CropSchedule {
    /// Checks lengths and that every entry asks for at least one crop
    pub fn new(overview: Vec<usize>, inner: Vec<usize>, inner_gray_fraction: Vec<f64>) -> Result<Self, ConfigError> {
        check_length("cut_overview", overview.len())?;
        check_length("cut_innercut", inner.len())?;
        check_length("cut_icgray_p", inner_gray_fraction.len())?;

        if let Some(index) = overview.iter().zip(&inner).position(|(o, i)| o + i == 0) {
            return Err(ConfigError::EmptyScheduleEntry { index });
        }

        Ok(Self {
            overview,
            inner,
            inner_gray_fraction,
        })
    }

    pub fn from_settings(
        overview: &ScheduleSetting,
        inner: &ScheduleSetting,
        inner_gray_fraction: &ScheduleSetting,
    ) -> Result<Self, ConfigError> {
        Self::new(
            counts("cut_overview", overview)?,
            counts("cut_innercut", inner)?,
            inner_gray_fraction.expand()?,
        )
    }

    pub fn len(&self) -> usize {
        self.overview.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overview.is_empty()
    }

    /// Entry `index`, counted from the noisiest timestep
    pub fn at(&self, index: i64) -> Result<CropScheduleEntry, ConfigError> {
        let len = self.len();
        let i = usize::try_from(index)
            .ok()
            .filter(|&i| i < len)
            .ok_or(ConfigError::ScheduleIndex { index, len })?;

        Ok(CropScheduleEntry {
            overview: self.overview[i],
            inner: self.inner[i],
            inner_gray_fraction: self.inner_gray_fraction[i],
        })
    }

    /// Entry for a timestep on the 1000-step clock
    ///
    /// Timestep 999 maps to entry 0 and timestep 0 to entry 999.
    pub fn at_timestep(&self, scaled_timestep: f64) -> Result<CropScheduleEntry, ConfigError> {
        self.at(self.len() as i64 - (scaled_timestep.floor() as i64 + 1))
    }
}

fn check_length(name: &'static str, len: usize) -> Result<(), ConfigError> {
    if len != SCHEDULE_TIMESTEPS {
        return Err(ConfigError::ScheduleLength {
            name,
            len,
            expected: SCHEDULE_TIMESTEPS,
        });
    }
    Ok(())
}

/// Expands a table of crop counts; values must be whole and non-negative
fn counts(name: &'static str, setting: &ScheduleSetting) -> Result<Vec<usize>, ConfigError> {
    setting
        .expand()?
        .into_iter()
        .map(|v| {
            if v < 0.0 || v.fract() != 0.0 {
                Err(ConfigError::InvalidScheduleRun(format!("{name}: {v}")))
            } else {
                Ok(v as usize)
            }
        })
        .collect()
}
