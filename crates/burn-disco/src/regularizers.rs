//! Weighted pixel-space penalties

use burn::prelude::*;
use burn_disco_core::losses::{range_loss, saturation_loss, tv_loss};

/// Distance between images in `[-1, 1]`, per image
///
/// Stands in for a learned perceptual metric when pulling the result
/// toward an init image.
pub trait PerceptualDistance<B: Backend> {
    fn distance(&self, a: Tensor<B, 4>, b: Tensor<B, 4>) -> Tensor<B, 1>;
}

/// Mean squared pixel difference
#[derive(Debug, Clone, Copy, Default)]
pub struct SquaredError;

impl<B: Backend> PerceptualDistance<B> for SquaredError {
    fn distance(&self, a: Tensor<B, 4>, b: Tensor<B, 4>) -> Tensor<B, 1> {
        let [n, c, h, w] = a.dims();
        (a - b).powi_scalar(2).reshape([n, c * h * w]).mean_dim(1).reshape([n])
    }
}

/// Pull toward a fixed image
pub struct InitPenalty<'a, B: Backend> {
    pub reference: Tensor<B, 4>,
    pub scale: f64,
    pub distance: &'a dyn PerceptualDistance<B>,
}

/// Penalty weights of a run
pub struct Regularizers<'a, B: Backend> {
    pub tv_scale: f64,
    pub range_scale: f64,
    pub sat_scale: f64,
    pub init: Option<InitPenalty<'a, B>>,
}

impl<'a, B: Backend> Regularizers<'a, B> {
    pub fn new(tv_scale: f64, range_scale: f64, sat_scale: f64) -> Self {
        Self {
            tv_scale,
            range_scale,
            sat_scale,
            init: None,
        }
    }

    /// Adds the init-image term; a zero scale leaves it off
    pub fn with_init(mut self, reference: Tensor<B, 4>, scale: f64, distance: &'a dyn PerceptualDistance<B>) -> Self {
        if scale != 0.0 {
            self.init = Some(InitPenalty {
                reference,
                scale,
                distance,
            });
        }
        self
    }

    /// Smoothness, saturation and init terms on the blended image, shape `[1]`
    pub fn pixel_terms(&self, x_in: Tensor<B, 4>) -> Tensor<B, 1> {
        let mut loss = tv_loss(x_in.clone()).sum() * self.tv_scale + saturation_loss(x_in.clone()) * self.sat_scale;
        if let Some(init) = &self.init {
            loss = loss + init.distance.distance(x_in, init.reference.clone()).sum() * init.scale;
        }
        loss
    }

    /// Range term on the predicted clean image, shape `[1]`
    pub fn range_term(&self, pred: Tensor<B, 4>) -> Tensor<B, 1> {
        range_loss(pred).sum() * self.range_scale
    }

    pub fn has_range_term(&self) -> bool {
        self.range_scale != 0.0
    }

    pub fn has_pixel_terms(&self) -> bool {
        self.tv_scale != 0.0 || self.sat_scale != 0.0 || self.init.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_in_range_image_has_no_penalty() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::full([2, 3, 4, 4], 0.5, &device);
        let regs = Regularizers::new(1.0, 1.0, 1.0);

        let pixel: f32 = regs.pixel_terms(x.clone()).into_scalar();
        let range: f32 = regs.range_term(x).into_scalar();
        assert_eq!(pixel, 0.0);
        assert_eq!(range, 0.0);
    }

    #[test]
    fn test_terms_are_weighted() {
        let device = Default::default();
        // 0.5 above the range everywhere
        let x = Tensor::<TestBackend, 4>::full([1, 3, 4, 4], 1.5, &device);

        let sat: f32 = Regularizers::new(0.0, 0.0, 4.0).pixel_terms(x.clone()).into_scalar();
        assert!((sat - 2.0).abs() < 1e-6);

        let range: f32 = Regularizers::new(0.0, 8.0, 0.0).range_term(x).into_scalar();
        assert!((range - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_scales_disable_terms() {
        let off = Regularizers::<TestBackend>::new(0.0, 0.0, 0.0);
        assert!(!off.has_range_term());
        assert!(!off.has_pixel_terms());

        let range_only = Regularizers::<TestBackend>::new(0.0, 150.0, 0.0);
        assert!(range_only.has_range_term());
        assert!(!range_only.has_pixel_terms());
    }

    #[test]
    fn test_init_penalty() {
        let device = Default::default();
        let reference = Tensor::<TestBackend, 4>::zeros([1, 3, 4, 4], &device);
        let x = Tensor::<TestBackend, 4>::full([1, 3, 4, 4], 0.5, &device);

        let off = Regularizers::new(0.0, 0.0, 0.0).with_init(reference.clone(), 0.0, &SquaredError);
        assert!(!off.has_pixel_terms());

        let on = Regularizers::new(0.0, 0.0, 0.0).with_init(reference, 10.0, &SquaredError);
        assert!(on.has_pixel_terms());
        let value: f32 = on.pixel_terms(x).into_scalar();
        assert!((value - 2.5).abs() < 1e-6);
    }
}
