//! Multi-octave perlin noise for structured initial images
//!
//! Each octave doubles the number of gradient cells and is sampled
//! directly at the output resolution. Channels are contrast-stretched the
//! same way an 8-bit autocontrast would.

use burn::prelude::*;
use image::RgbImage;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::image_io::rgb_to_tensor;

/// How channels of the two noise layers are generated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PerlinMode {
    /// Independent noise per channel in both layers
    Color,
    /// Shared noise across channels in both layers
    Gray,
    /// Color coarse layer, gray fine layer
    #[default]
    Mixed,
}

/// `3t^2 - 2t^3`
fn fade(t: f64) -> f64 {
    3.0 * t * t - 2.0 * t * t * t
}

/// One octave of gradient noise over a `cells_x` by `cells_y` lattice,
/// sampled at `width x height` pixels
fn gradient_noise<R: Rng>(cells_x: usize, cells_y: usize, width: usize, height: usize, rng: &mut R) -> Vec<f64> {
    let lattice = (cells_x + 1) * (cells_y + 1);
    let gx: Vec<f64> = (0..lattice).map(|_| rng.sample(StandardNormal)).collect();
    let gy: Vec<f64> = (0..lattice).map(|_| rng.sample(StandardNormal)).collect();
    let at = |i: usize, j: usize| j * (cells_x + 1) + i;

    let mut out = vec![0.0; width * height];
    for py in 0..height {
        let v = (py as f64 + 0.5) / height as f64 * cells_y as f64;
        let j = (v.floor() as usize).min(cells_y - 1);
        let ys = v - j as f64;
        let wy = 1.0 - fade(ys);

        for px in 0..width {
            let u = (px as f64 + 0.5) / width as f64 * cells_x as f64;
            let i = (u.floor() as usize).min(cells_x - 1);
            let xs = u - i as f64;
            let wx = 1.0 - fade(xs);

            let (c00, c10, c01, c11) = (at(i, j), at(i + 1, j), at(i, j + 1), at(i + 1, j + 1));
            let mut dot = wx * wy * (gx[c00] * xs + gy[c00] * ys);
            dot += (1.0 - wx) * wy * (-gx[c10] * (1.0 - xs) + gy[c10] * ys);
            dot += wx * (1.0 - wy) * (gx[c01] * xs - gy[c01] * (1.0 - ys));
            dot += (1.0 - wx) * (1.0 - wy) * (-gx[c11] * (1.0 - xs) - gy[c11] * (1.0 - ys));
            out[py * width + px] = dot;
        }
    }
    out
}

/// Sums octaves starting from a `base x base` lattice; octave `k` has
/// `base * 2^k` cells per side and amplitude `amplitudes[k]`
fn octave_sum<R: Rng>(amplitudes: &[f64], base: usize, width: usize, height: usize, rng: &mut R) -> Vec<f64> {
    let mut out = vec![0.5; width * height];
    let mut cells = base;
    for &amp in amplitudes {
        // Finer lattices than the pixel grid would only alias
        if cells > width.max(height) {
            break;
        }
        let layer = gradient_noise(cells, cells, width, height, rng);
        out.iter_mut().zip(layer).for_each(|(o, v)| *o += v * amp);
        cells *= 2;
    }
    out
}

/// Stretches a channel so its darkest value maps to 0 and brightest to 255
fn autocontrast(channel: &[f64]) -> Vec<u8> {
    let quantized: Vec<u8> = channel.iter().map(|v| (v.clamp(0.0, 1.0) * 255.0) as u8).collect();
    let lo = quantized.iter().copied().min().unwrap_or(0);
    let hi = quantized.iter().copied().max().unwrap_or(255);
    if hi <= lo {
        return quantized;
    }
    let scale = 255.0 / (hi - lo) as f64;
    quantized
        .into_iter()
        .map(|v| ((v - lo) as f64 * scale).round().min(255.0) as u8)
        .collect()
}

/// One noise layer as an RGB image
pub fn perlin_layer<R: Rng>(
    amplitudes: &[f64],
    base: usize,
    width: usize,
    height: usize,
    grayscale: bool,
    rng: &mut R,
) -> RgbImage {
    let channels: Vec<Vec<u8>> = if grayscale {
        let gray = autocontrast(&octave_sum(amplitudes, base, width, height, rng));
        vec![gray.clone(), gray.clone(), gray]
    } else {
        (0..3)
            .map(|_| autocontrast(&octave_sum(amplitudes, base, width, height, rng)))
            .collect()
    };

    let mut img = RgbImage::new(width as u32, height as u32);
    for (idx, pixel) in img.pixels_mut().enumerate() {
        pixel.0 = [channels[0][idx], channels[1][idx], channels[2][idx]];
    }
    img
}

/// Amplitudes `0.5 * 1.5^-k` for `k < count`
pub fn octave_amplitudes(count: usize) -> Vec<f64> {
    (0..count).map(|k| 0.5 * 1.5f64.powi(-(k as i32))).collect()
}

/// Structured noise init image in `[-1, 1]`, repeated over the batch
///
/// Averages a 12-octave layer on a 1x1 base lattice with an 8-octave layer
/// on a 4x4 base lattice.
pub fn perlin_init<B: Backend, R: Rng>(
    width: usize,
    height: usize,
    batch_size: usize,
    mode: PerlinMode,
    rng: &mut R,
    device: &B::Device,
) -> Tensor<B, 4> {
    let (coarse_gray, fine_gray) = match mode {
        PerlinMode::Color => (false, false),
        PerlinMode::Gray => (true, true),
        PerlinMode::Mixed => (false, true),
    };
    let coarse = perlin_layer(&octave_amplitudes(12), 1, width, height, coarse_gray, rng);
    let fine = perlin_layer(&octave_amplitudes(8), 4, width, height, fine_gray, rng);

    // Average in [0, 1], then map to [-1, 1]
    let coarse = rgb_to_tensor::<B>(&coarse, device).add_scalar(1.0);
    let fine = rgb_to_tensor::<B>(&fine, device).add_scalar(1.0);
    let init = (coarse + fine).div_scalar(2.0).sub_scalar(1.0);
    init.repeat_dim(0, batch_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::seeded_rng;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_amplitudes() {
        let amps = octave_amplitudes(3);
        assert_eq!(amps.len(), 3);
        assert!((amps[0] - 0.5).abs() < 1e-12);
        assert!((amps[2] - 0.5 / 2.25).abs() < 1e-12);
    }

    #[test]
    fn test_layer_is_full_range() {
        let img = perlin_layer(&octave_amplitudes(4), 1, 32, 24, false, &mut seeded_rng(9));
        assert_eq!(img.dimensions(), (32, 24));
        for ch in 0..3 {
            let values: Vec<u8> = img.pixels().map(|p| p.0[ch]).collect();
            assert_eq!(values.iter().copied().min(), Some(0));
            assert_eq!(values.iter().copied().max(), Some(255));
        }
    }

    #[test]
    fn test_gray_layer_channels_match() {
        let img = perlin_layer(&octave_amplitudes(3), 2, 16, 16, true, &mut seeded_rng(2));
        assert!(img.pixels().all(|p| p.0[0] == p.0[1] && p.0[1] == p.0[2]));
    }

    #[test]
    fn test_perlin_init_shape_and_range() {
        let device = Default::default();
        let init = perlin_init::<TestBackend, _>(16, 8, 2, PerlinMode::Mixed, &mut seeded_rng(5), &device);
        assert_eq!(init.dims(), [2, 3, 8, 16]);

        let values: Vec<f32> = init.into_data().to_vec().unwrap();
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_perlin_init_reproducible() {
        let device = Default::default();
        let a = perlin_init::<TestBackend, _>(8, 8, 1, PerlinMode::Color, &mut seeded_rng(5), &device);
        let b = perlin_init::<TestBackend, _>(8, 8, 1, PerlinMode::Color, &mut seeded_rng(5), &device);
        let a: Vec<f32> = a.into_data().to_vec().unwrap();
        let b: Vec<f32> = b.into_data().to_vec().unwrap();
        assert_eq!(a, b);
    }
}
