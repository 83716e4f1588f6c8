//! Randomized augmentations for crop batches
//!
//! All transforms take `[n, 3, h, w]` images in roughly `[0, 1]` and stay
//! differentiable with respect to the pixels. Random parameters are drawn
//! on the host, once per call, and shared by every crop in the batch.

use burn::prelude::*;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::random::randn;

/// ITU-R 601 luma weights
pub const LUMA: [f32; 3] = [0.2989, 0.587, 0.114];

/// Parameters of the augmentation chain applied after cropping
#[derive(Debug, Clone)]
pub struct AugmentConfig {
    pub flip_p: f64,
    pub noise_std: f32,
    pub max_degrees: f64,
    pub max_translate: f64,
    pub grayscale_p: f64,
    pub brightness: f64,
    pub contrast: f64,
    pub saturation: f64,
    pub hue: f64,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            flip_p: 0.5,
            noise_std: 0.01,
            max_degrees: 10.0,
            max_translate: 0.05,
            grayscale_p: 0.1,
            brightness: 0.1,
            contrast: 0.1,
            saturation: 0.1,
            hue: 0.1,
        }
    }
}

/// Applies the full chain: flip, noise, affine, noise, grayscale, noise, jitter
pub fn augment<B: Backend, R: Rng>(x: Tensor<B, 4>, config: &AugmentConfig, rng: &mut R) -> Tensor<B, 4> {
    let mut x = x;
    if rng.gen_bool(config.flip_p) {
        x = hflip(x);
    }
    x = add_noise(x, config.noise_std, rng);

    let [_, _, h, w] = x.dims();
    let degrees = rng.gen_range(-config.max_degrees..=config.max_degrees);
    let tx = (rng.gen_range(-config.max_translate..=config.max_translate) * w as f64).round();
    let ty = (rng.gen_range(-config.max_translate..=config.max_translate) * h as f64).round();
    x = affine(x, degrees, tx, ty);
    x = add_noise(x, config.noise_std, rng);

    if rng.gen_bool(config.grayscale_p) {
        x = grayscale(x);
    }
    x = add_noise(x, config.noise_std, rng);

    color_jitter(x, config, rng)
}

/// Mirrors the width axis
pub fn hflip<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    x.flip([3])
}

pub fn add_noise<B: Backend, R: Rng>(x: Tensor<B, 4>, std: f32, rng: &mut R) -> Tensor<B, 4> {
    let noise = randn::<B, 4, _>(rng, x.dims(), &x.device());
    x + noise * std
}

/// Mixes channels with a 3x3 matrix: `out[c] = sum_k m[c][k] * x[k]`
pub fn mix_channels<B: Backend>(x: Tensor<B, 4>, matrix: [[f32; 3]; 3]) -> Tensor<B, 4> {
    let [n, c, h, w] = x.dims();
    let device = x.device();
    let flat: Vec<f32> = (0..3).flat_map(|k| (0..3).map(move |c| matrix[c][k])).collect();
    let m = Tensor::<B, 2>::from_data(TensorData::new(flat, [3, 3]), &device);

    let pixels = x.swap_dims(1, 3).reshape([n * w * h, c]);
    pixels.matmul(m).reshape([n, w, h, c]).swap_dims(1, 3)
}

/// Luma replicated over three channels
pub fn grayscale<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    mix_channels(x, [LUMA; 3])
}

/// Rotates by `degrees` about the image center, then shifts by `(tx, ty)`
/// pixels. Bilinear sampling; pixels mapped from outside the image are zero.
pub fn affine<B: Backend>(x: Tensor<B, 4>, degrees: f64, tx: f64, ty: f64) -> Tensor<B, 4> {
    let [n, c, h, w] = x.dims();
    let device = x.device();

    let (sin, cos) = degrees.to_radians().sin_cos();
    let cx = (w as f64 - 1.0) / 2.0;
    let cy = (h as f64 - 1.0) / 2.0;

    let taps = h * w;
    let mut indices = vec![vec![0i64; taps]; 4];
    let mut weights = vec![vec![0f32; taps]; 4];

    for oy in 0..h {
        for ox in 0..w {
            // Inverse map from output pixel to source coordinate
            let dx = ox as f64 - cx - tx;
            let dy = oy as f64 - cy - ty;
            let sx = cos * dx + sin * dy + cx;
            let sy = -sin * dx + cos * dy + cy;

            let x0 = sx.floor();
            let y0 = sy.floor();
            let fx = sx - x0;
            let fy = sy - y0;
            let corners = [
                (x0, y0, (1.0 - fx) * (1.0 - fy)),
                (x0 + 1.0, y0, fx * (1.0 - fy)),
                (x0, y0 + 1.0, (1.0 - fx) * fy),
                (x0 + 1.0, y0 + 1.0, fx * fy),
            ];

            let out = oy * w + ox;
            for (k, (px, py, weight)) in corners.into_iter().enumerate() {
                if px >= 0.0 && py >= 0.0 && px < w as f64 && py < h as f64 {
                    indices[k][out] = py as i64 * w as i64 + px as i64;
                    weights[k][out] = weight as f32;
                }
            }
        }
    }

    let flat = x.reshape([n, c, taps]);
    let mut out = Tensor::<B, 3>::zeros([n, c, taps], &device);
    for (idx, wts) in indices.into_iter().zip(weights) {
        let idx = Tensor::<B, 1, Int>::from_data(TensorData::new(idx, [taps]), &device);
        let wts = Tensor::<B, 1>::from_data(TensorData::new(wts, [taps]), &device).reshape([1, 1, taps]);
        out = out + flat.clone().select(2, idx) * wts;
    }
    out.reshape([n, c, h, w])
}

fn blend<B: Backend>(x: Tensor<B, 4>, other: Tensor<B, 4>, factor: f64) -> Tensor<B, 4> {
    (x * factor + other * (1.0 - factor)).clamp(0.0, 1.0)
}

pub fn adjust_brightness<B: Backend>(x: Tensor<B, 4>, factor: f64) -> Tensor<B, 4> {
    (x * factor).clamp(0.0, 1.0)
}

pub fn adjust_contrast<B: Backend>(x: Tensor<B, 4>, factor: f64) -> Tensor<B, 4> {
    let [n, _, h, w] = x.dims();
    let mean = grayscale(x.clone())
        .slice([0..n, 0..1, 0..h, 0..w])
        .reshape([n, h * w])
        .mean_dim(1)
        .reshape([n, 1, 1, 1]);
    blend(x, mean, factor)
}

pub fn adjust_saturation<B: Backend>(x: Tensor<B, 4>, factor: f64) -> Tensor<B, 4> {
    let gray = grayscale(x.clone());
    blend(x, gray, factor)
}

/// Hue rotation by `shift` turns (in `[-0.5, 0.5]`), done in YIQ space
pub fn adjust_hue<B: Backend>(x: Tensor<B, 4>, shift: f64) -> Tensor<B, 4> {
    let to_yiq = [
        [0.299, 0.587, 0.114],
        [0.596, -0.274, -0.322],
        [0.211, -0.523, 0.312],
    ];
    let to_rgb = [
        [1.0, 0.956, 0.621],
        [1.0, -0.272, -0.647],
        [1.0, -1.106, 1.703],
    ];
    let (sin, cos) = (shift * std::f64::consts::TAU).sin_cos();
    let rotate = [[1.0, 0.0, 0.0], [0.0, cos, -sin], [0.0, sin, cos]];

    let m = matmul3(to_rgb, matmul3(rotate, to_yiq));
    let m = m.map(|row| row.map(|v| v as f32));
    mix_channels(x, m).clamp(0.0, 1.0)
}

fn matmul3(a: [[f64; 3]; 3], b: [[f64; 3]; 3]) -> [[f64; 3]; 3] {
    let mut out = [[0.0; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, v) in row.iter_mut().enumerate() {
            *v = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

#[derive(Debug, Clone, Copy)]
enum Jitter {
    Brightness,
    Contrast,
    Saturation,
    Hue,
}

/// Brightness, contrast, saturation and hue jitter in a random order
pub fn color_jitter<B: Backend, R: Rng>(x: Tensor<B, 4>, config: &AugmentConfig, rng: &mut R) -> Tensor<B, 4> {
    let mut order = [Jitter::Brightness, Jitter::Contrast, Jitter::Saturation, Jitter::Hue];
    order.shuffle(rng);

    order.into_iter().fold(x, |x, op| match op {
        Jitter::Brightness => {
            let f = rng.gen_range(1.0 - config.brightness..=1.0 + config.brightness);
            adjust_brightness(x, f)
        }
        Jitter::Contrast => {
            let f = rng.gen_range(1.0 - config.contrast..=1.0 + config.contrast);
            adjust_contrast(x, f)
        }
        Jitter::Saturation => {
            let f = rng.gen_range(1.0 - config.saturation..=1.0 + config.saturation);
            adjust_saturation(x, f)
        }
        Jitter::Hue => {
            let f = rng.gen_range(-config.hue..=config.hue);
            adjust_hue(x, f)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::seeded_rng;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn ramp(device: &<TestBackend as Backend>::Device) -> Tensor<TestBackend, 4> {
        let values: Vec<f32> = (0..3 * 4 * 4).map(|i| (i % 16) as f32 / 16.0).collect();
        Tensor::from_data(TensorData::new(values, [1, 3, 4, 4]), device)
    }

    fn values(x: Tensor<TestBackend, 4>) -> Vec<f32> {
        x.into_data().to_vec().unwrap()
    }

    #[test]
    fn test_identity_affine() {
        let device = Default::default();
        let x = ramp(&device);
        let y = affine(x.clone(), 0.0, 0.0, 0.0);

        for (a, b) in values(x).iter().zip(values(y)) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_affine_translation_shifts_pixels() {
        let device = Default::default();
        let x = ramp(&device);
        let y = values(affine(x.clone(), 0.0, 1.0, 0.0));
        let x = values(x);

        // Column 0 comes from outside, column 1 from column 0
        assert_eq!(y[0], 0.0);
        assert!((y[1] - x[0]).abs() < 1e-6);
    }

    #[test]
    fn test_grayscale_channels_equal() {
        let device = Default::default();
        let y = values(grayscale(ramp(&device)));
        let plane = 16;
        for i in 0..plane {
            assert!((y[i] - y[i + plane]).abs() < 1e-6);
            assert!((y[i] - y[i + 2 * plane]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_zero_hue_shift_is_identity() {
        let device = Default::default();
        let x = ramp(&device);
        let y = adjust_hue(x.clone(), 0.0);
        for (a, b) in values(x).iter().zip(values(y)) {
            assert!((a - b).abs() < 5e-3, "{a} vs {b}");
        }
    }

    #[test]
    fn test_augment_keeps_shape() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::ones([5, 3, 8, 8], &device) * 0.5;
        let y = augment(x, &AugmentConfig::default(), &mut seeded_rng(0));
        assert_eq!(y.dims(), [5, 3, 8, 8]);
        assert!(values(y).iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_augment_is_differentiable() {
        type AD = Autodiff<NdArray<f32>>;
        let device = Default::default();
        let x = Tensor::<AD, 4>::full([2, 3, 8, 8], 0.5, &device).require_grad();
        let y = augment(x.clone(), &AugmentConfig::default(), &mut seeded_rng(4));
        let grads = y.sum().backward();

        let grad: Vec<f32> = x.grad(&grads).unwrap().into_data().to_vec().unwrap();
        assert!(grad.iter().all(|g| g.is_finite()));
        assert!(grad.iter().any(|g| *g != 0.0));
    }
}
