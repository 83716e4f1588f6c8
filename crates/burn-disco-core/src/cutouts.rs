//! Multi-crop sampler
//!
//! Turns one image batch into many square views for embedding comparison:
//! a few whole-frame "overview" variants plus randomly sized "inner" crops,
//! all resized to the embedding model's input size, then augmented as one
//! batch. Every step is differentiable in the input pixels.
//!
//! Output layout is crop-major: crop `k` of image `i` sits at row
//! `k * n + i`.

use burn::prelude::*;
use rand::Rng;
use thiserror::Error;

use crate::augment::{augment, grayscale, hflip, AugmentConfig};
use crate::resize::resize_area;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CutoutError {
    #[error("no cutouts requested: overview and inner counts are both zero")]
    Empty,
    #[error("cut size must be positive")]
    ZeroCutSize,
}

/// One kind of whole-frame view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverviewVariant {
    Plain,
    Gray,
    Flip,
    FlipGray,
}

/// Overview views by requested count (1 to 4). Larger counts repeat
/// [`OverviewVariant::Plain`] instead.
pub const OVERVIEW_VARIANTS: [&[OverviewVariant]; 4] = [
    &[OverviewVariant::Plain],
    &[OverviewVariant::Plain, OverviewVariant::Gray],
    &[OverviewVariant::Plain, OverviewVariant::Gray, OverviewVariant::Flip],
    &[
        OverviewVariant::Plain,
        OverviewVariant::Gray,
        OverviewVariant::Flip,
        OverviewVariant::FlipGray,
    ],
];

/// The overview views produced for `count`
pub fn overview_variants(count: usize) -> Vec<OverviewVariant> {
    match count {
        0 => Vec::new(),
        1..=4 => OVERVIEW_VARIANTS[count - 1].to_vec(),
        _ => vec![OverviewVariant::Plain; count],
    }
}

/// Everything that varies per call
#[derive(Debug, Clone)]
pub struct CutoutSpec {
    pub cut_size: usize,
    pub overview: usize,
    pub inner: usize,
    /// Exponent on the uniform draw for inner crop sizes; larger favors
    /// smaller crops
    pub inner_size_power: f64,
    /// Leading fraction of inner crops converted to grayscale
    pub inner_gray_fraction: f64,
    pub skip_augs: bool,
}

impl CutoutSpec {
    /// Number of crops per input image
    pub fn count(&self) -> usize {
        overview_variants(self.overview).len() + self.inner
    }
}

/// Zero-pads `[n, c, h, w]` to a centered square of side `max(h, w)`
pub fn pad_to_square<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [n, c, h, w] = x.dims();
    let side = h.max(w);
    if h == w {
        return x;
    }
    let device = x.device();

    let (top, left) = ((side - h) / 2, (side - w) / 2);
    let (bottom, right) = (side - h - top, side - w - left);

    let mut x = x;
    if left + right > 0 {
        let mut parts = Vec::with_capacity(3);
        if left > 0 {
            parts.push(Tensor::zeros([n, c, h, left], &device));
        }
        parts.push(x);
        if right > 0 {
            parts.push(Tensor::zeros([n, c, h, right], &device));
        }
        x = Tensor::cat(parts, 3);
    }
    if top + bottom > 0 {
        let mut parts = Vec::with_capacity(3);
        if top > 0 {
            parts.push(Tensor::zeros([n, c, top, side], &device));
        }
        parts.push(x);
        if bottom > 0 {
            parts.push(Tensor::zeros([n, c, bottom, side], &device));
        }
        x = Tensor::cat(parts, 2);
    }
    x
}

/// Side length of an inner crop for a uniform draw `u`
pub fn inner_crop_size(u: f64, power: f64, min_size: usize, max_size: usize) -> usize {
    let size = u.powf(power) * (max_size - min_size) as f64 + min_size as f64;
    (size as usize).clamp(min_size.max(1), max_size)
}

/// Samples crops of `input` (`[n, 3, h, w]`, values in `[0, 1]`)
///
/// Returns `[spec.count() * n, 3, cut_size, cut_size]`.
pub fn make_cutouts<B: Backend, R: Rng>(
    input: Tensor<B, 4>,
    spec: &CutoutSpec,
    augmentations: &AugmentConfig,
    rng: &mut R,
) -> Result<Tensor<B, 4>, CutoutError> {
    if spec.cut_size == 0 {
        return Err(CutoutError::ZeroCutSize);
    }
    if spec.count() == 0 {
        return Err(CutoutError::Empty);
    }

    let [n, c, side_y, side_x] = input.dims();
    let cut = spec.cut_size;
    let mut crops = Vec::with_capacity(spec.count());

    let variants = overview_variants(spec.overview);
    if !variants.is_empty() {
        let square = pad_to_square(input.clone());
        let plain = resize_area(square, cut, cut);
        for variant in variants {
            crops.push(match variant {
                OverviewVariant::Plain => plain.clone(),
                OverviewVariant::Gray => grayscale(plain.clone()),
                OverviewVariant::Flip => hflip(plain.clone()),
                OverviewVariant::FlipGray => grayscale(hflip(plain.clone())),
            });
        }
    }

    if spec.inner > 0 {
        let max_size = side_x.min(side_y);
        let min_size = side_x.min(side_y).min(cut);
        let gray_cutoff = (spec.inner_gray_fraction * spec.inner as f64) as usize;

        for i in 0..spec.inner {
            let size = inner_crop_size(rng.gen::<f64>(), spec.inner_size_power, min_size, max_size);
            let offset_x = rng.gen_range(0..=side_x - size);
            let offset_y = rng.gen_range(0..=side_y - size);

            let mut crop = input
                .clone()
                .slice([0..n, 0..c, offset_y..offset_y + size, offset_x..offset_x + size]);
            if i <= gray_cutoff {
                crop = grayscale(crop);
            }
            crops.push(resize_area(crop, cut, cut));
        }
    }

    let batch = Tensor::cat(crops, 0);
    Ok(if spec.skip_augs {
        batch
    } else {
        augment(batch, augmentations, rng)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::seeded_rng;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    fn spec(overview: usize, inner: usize) -> CutoutSpec {
        CutoutSpec {
            cut_size: 8,
            overview,
            inner,
            inner_size_power: 2.0,
            inner_gray_fraction: 0.2,
            skip_augs: false,
        }
    }

    #[test]
    fn test_variant_table() {
        assert!(overview_variants(0).is_empty());
        assert_eq!(overview_variants(2), vec![OverviewVariant::Plain, OverviewVariant::Gray]);
        assert_eq!(overview_variants(4).len(), 4);
        assert_eq!(overview_variants(4)[3], OverviewVariant::FlipGray);
        assert_eq!(overview_variants(7), vec![OverviewVariant::Plain; 7]);
    }

    #[test]
    fn test_output_count_and_size() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 4>::full([2, 3, 24, 16], 0.5, &device);

        for (overview, inner) in [(1, 0), (3, 2), (4, 5), (6, 1), (0, 3)] {
            let out = make_cutouts(input.clone(), &spec(overview, inner), &AugmentConfig::default(), &mut seeded_rng(1))
                .unwrap();
            let expected = overview + inner;
            assert_eq!(out.dims(), [expected * 2, 3, 8, 8], "overview {overview} inner {inner}");
        }
    }

    #[test]
    fn test_empty_is_error() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 4>::zeros([1, 3, 8, 8], &device);
        let err = make_cutouts(input, &spec(0, 0), &AugmentConfig::default(), &mut seeded_rng(1));
        assert_eq!(err.unwrap_err(), CutoutError::Empty);
    }

    #[test]
    fn test_pad_to_square_centers_content() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 4>::ones([1, 1, 2, 4], &device);
        let padded = pad_to_square(input);
        assert_eq!(padded.dims(), [1, 1, 4, 4]);

        let values: Vec<f32> = padded.into_data().to_vec().unwrap();
        let rows: Vec<f32> = values.chunks(4).map(|r| r.iter().sum()).collect();
        assert_eq!(rows, vec![0.0, 4.0, 4.0, 0.0]);
    }

    #[test]
    fn test_inner_crop_size_bounds() {
        assert_eq!(inner_crop_size(0.0, 2.0, 8, 64), 8);
        assert_eq!(inner_crop_size(1.0, 2.0, 8, 64), 64);
        let mid = inner_crop_size(0.5, 2.0, 8, 64);
        assert_eq!(mid, 22);
    }

    #[test]
    fn test_skip_augs_overview_is_exact_resize() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 4>::full([1, 3, 16, 16], 0.25, &device);
        let mut spec = spec(1, 0);
        spec.skip_augs = true;

        let out = make_cutouts(input, &spec, &AugmentConfig::default(), &mut seeded_rng(0)).unwrap();
        let values: Vec<f32> = out.into_data().to_vec().unwrap();
        assert!(values.iter().all(|v| (v - 0.25).abs() < 1e-5));
    }

    #[test]
    fn test_gradient_reaches_input() {
        let device = Default::default();
        let values: Vec<f32> = (0..3 * 16 * 16).map(|i| (i % 7) as f32 / 7.0).collect();
        let input = Tensor::<TestAutodiffBackend, 4>::from_data(TensorData::new(values, [1, 3, 16, 16]), &device)
            .require_grad();

        let out = make_cutouts(input.clone(), &spec(2, 2), &AugmentConfig::default(), &mut seeded_rng(3)).unwrap();
        let grads = out.powf_scalar(2.0).sum().backward();

        let grad: Vec<f32> = input.grad(&grads).unwrap().into_data().to_vec().unwrap();
        assert!(grad.iter().all(|g| g.is_finite()));
        assert!(grad.iter().any(|g| *g != 0.0));
    }
}
