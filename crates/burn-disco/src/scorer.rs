//! Embedding-space loss of an image batch against one model's targets

use burn::prelude::*;
use burn_disco_clip::ImageTextEmbedder;
use burn_disco_core::augment::AugmentConfig;
use burn_disco_core::cutouts::{make_cutouts, CutoutError, CutoutSpec};
use burn_disco_core::losses::spherical_dist_loss;
use rand::Rng;

use crate::schedule::CropScheduleEntry;
use crate::targets::TargetSet;

/// Crop settings that stay fixed for a run
#[derive(Debug, Clone)]
pub struct CropSettings {
    pub inner_size_power: f64,
    pub skip_augs: bool,
    pub augment: AugmentConfig,
}

impl Default for CropSettings {
    fn default() -> Self {
        Self {
            inner_size_power: 2.0,
            skip_augs: false,
            augment: AugmentConfig::default(),
        }
    }
}

/// One embedding model and its targets
pub struct EmbeddingScorer<'a, B: Backend> {
    embedder: &'a dyn ImageTextEmbedder<B>,
    targets: TargetSet<B>,
}

impl<'a, B: Backend> EmbeddingScorer<'a, B> {
    pub fn new(embedder: &'a dyn ImageTextEmbedder<B>, targets: TargetSet<B>) -> Self {
        Self { embedder, targets }
    }

    pub fn name(&self) -> &str {
        self.embedder.name()
    }

    pub fn targets(&self) -> &TargetSet<B> {
        &self.targets
    }

    /// Crop request for a schedule entry at this model's input size
    pub fn cutout_spec(&self, entry: &CropScheduleEntry, settings: &CropSettings) -> CutoutSpec {
        CutoutSpec {
            cut_size: self.embedder.input_resolution(),
            overview: entry.overview,
            inner: entry.inner,
            inner_size_power: settings.inner_size_power,
            inner_gray_fraction: entry.inner_gray_fraction,
            skip_augs: settings.skip_augs,
        }
    }

    /// Crops of `x_in` (`[-1, 1]`) in `[0, 1]`, crop-major
    pub fn crops<R: Rng>(
        &self,
        x_in: Tensor<B, 4>,
        entry: &CropScheduleEntry,
        settings: &CropSettings,
        rng: &mut R,
    ) -> Result<Tensor<B, 4>, CutoutError> {
        let spec = self.cutout_spec(entry, settings);
        make_cutouts(x_in.add_scalar(1.0).div_scalar(2.0), &spec, &settings.augment, rng)
    }

    /// Weighted spherical distance per image, shape `[batch]`
    ///
    /// Distances to every target are weighted and summed, then averaged
    /// over the crops of each image.
    pub fn score(&self, crops: Tensor<B, 4>, batch: usize) -> Tensor<B, 1> {
        let [rows, _, _, _] = crops.dims();
        let count = rows / batch;
        let targets = self.targets.len();

        let normalized = self.embedder.normalization().apply(crops);
        let embeddings = self.embedder.encode_image(normalized);
        let dists = spherical_dist_loss(embeddings, self.targets.embeddings());

        dists
            .reshape([count, batch, targets])
            .mul(self.targets.weights().reshape([1, 1, targets]))
            .sum_dim(2)
            .mean_dim(0)
            .reshape([batch])
    }

    /// Crops `x_in` for `entry` and scores the crops
    pub fn losses<R: Rng>(
        &self,
        x_in: Tensor<B, 4>,
        entry: &CropScheduleEntry,
        settings: &CropSettings,
        rng: &mut R,
    ) -> Result<Tensor<B, 1>, CutoutError> {
        let [batch, _, _, _] = x_in.dims();
        let crops = self.crops(x_in, entry, settings, rng)?;
        Ok(self.score(crops, batch))
    }
}
