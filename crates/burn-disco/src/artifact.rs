//! Saved images and settings
//!
//! Names come from [`artifact_key`], a pure function of the run state, so
//! the naming rules are testable without touching the filesystem.
//! [`DiskArtifacts`] writes them under an output directory:
//!
//! ```text
//! <out>/progress.png
//! <out>/<batch>/<batch>(<run>)_settings.txt
//! <out>/<batch>/<batch>(<run>)_0000.png
//! <out>/<batch>/partials/<batch>(<run>)_0000-25%.png
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use image::RgbImage;
use thiserror::Error;
use tracing::debug;

use crate::config::RunConfig;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to serialize settings: {0}")]
    Json(#[from] serde_json::Error),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ArtifactError + '_ {
    move |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Writes a PNG, creating parent directories
pub fn save_png(path: &Path, image: &RgbImage) -> Result<(), ArtifactError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    image.save(path).map_err(|source| ArtifactError::Image {
        path: path.to_path_buf(),
        source,
    })
}

/// Folder an image goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    BatchFolder,
    Partials,
}

/// Suffix telling images of one batch apart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// The finished image, no suffix
    Final,
    /// `-NN%`
    Percent(u32),
    /// `-NNN`, the step index
    Step(usize),
}

/// How intermediate images are labelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerMode {
    Percent,
    Step,
}

/// Identity of a saved image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactKey {
    pub batch_name: String,
    pub run_number: u32,
    pub batch_index: usize,
    /// Image within the sampled batch
    pub member: usize,
    pub marker: Marker,
    pub location: Location,
}

impl ArtifactKey {
    pub fn file_name(&self) -> String {
        let mut name = format!("{}({})_{:04}", self.batch_name, self.run_number, self.batch_index);
        if self.member > 0 {
            name.push_str(&format!("_{}", self.member));
        }
        match self.marker {
            Marker::Final => {}
            Marker::Percent(pct) => name.push_str(&format!("-{pct:02}%")),
            Marker::Step(step) => name.push_str(&format!("-{step:03}")),
        }
        name.push_str(".png");
        name
    }

    /// Path below the output directory
    pub fn relative_path(&self) -> PathBuf {
        let folder = PathBuf::from(&self.batch_name);
        let folder = match self.location {
            Location::BatchFolder => folder,
            Location::Partials => folder.join("partials"),
        };
        folder.join(self.file_name())
    }
}

/// Run state at a save point
#[derive(Debug, Clone, Copy)]
pub struct SaveState<'a> {
    pub batch_name: &'a str,
    pub run_number: u32,
    pub batch_index: usize,
    pub member: usize,
    /// Steps taken so far in this batch, minus one
    pub step: usize,
    /// Step index of the last step
    pub total_steps: usize,
    /// This is the last step
    pub finished: bool,
    pub marker_mode: MarkerMode,
    pub intermediates_in_subfolder: bool,
}

impl SaveState<'_> {
    /// `ceil(step / total_steps * 100)`
    pub fn percent(&self) -> u32 {
        if self.total_steps == 0 {
            return 100;
        }
        (self.step * 100).div_ceil(self.total_steps) as u32
    }
}

/// Names the image saved at `state` into `location`
///
/// Finished images carry no suffix when intermediates live in their own
/// folder; otherwise every image is labelled by progress.
pub fn artifact_key(state: &SaveState<'_>, location: Location) -> ArtifactKey {
    let marker = if state.finished && state.intermediates_in_subfolder {
        Marker::Final
    } else {
        match state.marker_mode {
            MarkerMode::Percent => Marker::Percent(state.percent()),
            MarkerMode::Step => Marker::Step(state.step),
        }
    };

    ArtifactKey {
        batch_name: state.batch_name.to_string(),
        run_number: state.run_number,
        batch_index: state.batch_index,
        member: state.member,
        marker,
        location,
    }
}

pub fn settings_file_name(batch_name: &str, run_number: u32) -> String {
    format!("{batch_name}({run_number})_settings.txt")
}

/// Destination for everything a run produces
pub trait ArtifactSink {
    /// Number for a new run of `batch_name`
    fn run_number(&mut self, batch_name: &str) -> Result<u32, ArtifactError>;

    fn save_image(&mut self, key: &ArtifactKey, image: &RgbImage) -> Result<(), ArtifactError>;

    /// Latest image of the run, overwritten by each batch member at every save point
    fn save_progress(&mut self, image: &RgbImage) -> Result<(), ArtifactError>;

    fn save_settings(&mut self, batch_name: &str, run_number: u32, settings: &RunConfig) -> Result<(), ArtifactError>;
}

/// Writes artifacts below an output directory
#[derive(Debug, Clone)]
pub struct DiskArtifacts {
    root: PathBuf,
}

impl DiskArtifacts {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn batch_folder(&self, batch_name: &str) -> PathBuf {
        self.root.join(batch_name)
    }

    /// Count of `*.txt` files in the batch folder, bumped past existing
    /// settings files
    pub fn next_run_number(&self, batch_name: &str) -> Result<u32, ArtifactError> {
        let folder = self.batch_folder(batch_name);
        let mut run = match fs::read_dir(&folder) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "txt"))
                .count() as u32,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
            Err(err) => return Err(io_error(&folder)(err)),
        };
        while folder.join(settings_file_name(batch_name, run)).exists() {
            run += 1;
        }
        Ok(run)
    }
}

impl ArtifactSink for DiskArtifacts {
    fn run_number(&mut self, batch_name: &str) -> Result<u32, ArtifactError> {
        let folder = self.batch_folder(batch_name);
        fs::create_dir_all(&folder).map_err(io_error(&folder))?;
        self.next_run_number(batch_name)
    }

    fn save_image(&mut self, key: &ArtifactKey, image: &RgbImage) -> Result<(), ArtifactError> {
        let path = self.root.join(key.relative_path());
        debug!(path = %path.display(), "saving image");
        save_png(&path, image)
    }

    fn save_progress(&mut self, image: &RgbImage) -> Result<(), ArtifactError> {
        save_png(&self.root.join("progress.png"), image)
    }

    fn save_settings(&mut self, batch_name: &str, run_number: u32, settings: &RunConfig) -> Result<(), ArtifactError> {
        let folder = self.batch_folder(batch_name);
        fs::create_dir_all(&folder).map_err(io_error(&folder))?;
        let path = folder.join(settings_file_name(batch_name, run_number));
        let json = serde_json::to_string_pretty(settings)?;
        fs::write(&path, json).map_err(io_error(&path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(step: usize, finished: bool, mode: MarkerMode, subfolder: bool) -> SaveState<'static> {
        SaveState {
            batch_name: "DiscoTime",
            run_number: 3,
            batch_index: 7,
            member: 0,
            step,
            total_steps: 99,
            finished,
            marker_mode: mode,
            intermediates_in_subfolder: subfolder,
        }
    }

    #[test]
    fn test_final_name_in_subfolder_mode() {
        let key = artifact_key(&state(99, true, MarkerMode::Percent, true), Location::BatchFolder);
        assert_eq!(key.file_name(), "DiscoTime(3)_0007.png");
        assert_eq!(key.relative_path(), PathBuf::from("DiscoTime/DiscoTime(3)_0007.png"));
    }

    #[test]
    fn test_percent_and_step_markers() {
        let pct = artifact_key(&state(20, false, MarkerMode::Percent, true), Location::Partials);
        assert_eq!(pct.marker, Marker::Percent(21));
        assert_eq!(pct.relative_path(), PathBuf::from("DiscoTime/partials/DiscoTime(3)_0007-21%.png"));

        let early = artifact_key(&state(1, false, MarkerMode::Percent, true), Location::Partials);
        assert_eq!(early.file_name(), "DiscoTime(3)_0007-02%.png");

        let step = artifact_key(&state(5, false, MarkerMode::Step, false), Location::BatchFolder);
        assert_eq!(step.file_name(), "DiscoTime(3)_0007-005.png");
    }

    #[test]
    fn test_final_without_subfolder_keeps_marker() {
        let key = artifact_key(&state(99, true, MarkerMode::Percent, false), Location::BatchFolder);
        assert_eq!(key.file_name(), "DiscoTime(3)_0007-100%.png");
    }

    #[test]
    fn test_batch_members_get_suffix() {
        let mut s = state(99, true, MarkerMode::Percent, true);
        s.member = 2;
        assert_eq!(artifact_key(&s, Location::BatchFolder).file_name(), "DiscoTime(3)_0007_2.png");
    }

    #[test]
    fn test_percent_of_single_step_run() {
        let mut s = state(0, true, MarkerMode::Percent, false);
        s.total_steps = 0;
        assert_eq!(s.percent(), 100);
    }

    #[test]
    fn test_run_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let mut disk = DiskArtifacts::new(dir.path());
        assert_eq!(disk.run_number("b").unwrap(), 0);

        disk.save_settings("b", 0, &RunConfig::default()).unwrap();
        fs::write(disk.batch_folder("b").join("notes.txt"), "x").unwrap();
        assert_eq!(disk.next_run_number("b").unwrap(), 2);

        // Three txt files, but b(3)_settings.txt is taken
        disk.save_settings("b", 3, &RunConfig::default()).unwrap();
        assert_eq!(disk.next_run_number("b").unwrap(), 4);
    }

    #[test]
    fn test_disk_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut disk = DiskArtifacts::new(dir.path());
        let image = RgbImage::new(4, 4);

        let key = artifact_key(&state(20, false, MarkerMode::Percent, true), Location::Partials);
        disk.save_image(&key, &image).unwrap();
        disk.save_progress(&image).unwrap();
        disk.save_settings("DiscoTime", 3, &RunConfig::default().snapshot(9)).unwrap();

        assert!(dir.path().join("DiscoTime/partials/DiscoTime(3)_0007-21%.png").exists());
        assert!(dir.path().join("progress.png").exists());

        let settings = fs::read_to_string(dir.path().join("DiscoTime/DiscoTime(3)_settings.txt")).unwrap();
        let parsed = RunConfig::from_json(&settings).unwrap();
        assert_eq!(parsed.seed, Some(9));
    }
}
