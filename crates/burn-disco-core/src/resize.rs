//! Differentiable image resizing
//!
//! Resampling is separable: each axis becomes a dense `[out, in]` weight
//! matrix and the image is multiplied by it. Matrix products backpropagate
//! on every backend, unlike interpolation kernels, so gradients always reach
//! the input pixels.
//!
//! Downscaling widens the filter support by the scale factor (antialiasing),
//! which keeps crops of large regions from aliasing when they are shrunk to
//! an embedding model's input size.

use burn::prelude::*;

/// Interpolation kernel used to build the resampling matrices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeFilter {
    /// Keys cubic kernel (a = -0.5)
    Cubic,
    /// Tent kernel; with `antialias = false` this is half-pixel bilinear
    Linear,
}

impl ResizeFilter {
    fn support(&self) -> f64 {
        match self {
            ResizeFilter::Cubic => 2.0,
            ResizeFilter::Linear => 1.0,
        }
    }

    fn weight(&self, x: f64) -> f64 {
        let x = x.abs();
        match self {
            ResizeFilter::Cubic => {
                if x <= 1.0 {
                    1.5 * x.powi(3) - 2.5 * x.powi(2) + 1.0
                } else if x < 2.0 {
                    -0.5 * x.powi(3) + 2.5 * x.powi(2) - 4.0 * x + 2.0
                } else {
                    0.0
                }
            }
            ResizeFilter::Linear => (1.0 - x).max(0.0),
        }
    }
}

/// Builds the `[out_len, in_len]` resampling matrix for one axis
///
/// Samples are pixel-center aligned. Taps that fall outside the input are
/// folded onto the nearest edge pixel, and each row is normalized to sum
/// to one.
pub fn resize_weights(in_len: usize, out_len: usize, filter: ResizeFilter, antialias: bool) -> Vec<f32> {
    let scale = out_len as f64 / in_len as f64;
    let stretch = if antialias && scale < 1.0 { scale } else { 1.0 };
    let support = filter.support() / stretch;

    let mut weights = vec![0.0f64; out_len * in_len];
    for i in 0..out_len {
        let center = (i as f64 + 0.5) / scale - 0.5;
        let first = (center - support).floor() as i64;
        let last = (center + support).ceil() as i64;
        let row = &mut weights[i * in_len..(i + 1) * in_len];

        for j in first..=last {
            let w = filter.weight((center - j as f64) * stretch);
            if w == 0.0 {
                continue;
            }
            let idx = j.clamp(0, in_len as i64 - 1) as usize;
            row[idx] += w;
        }

        let total: f64 = row.iter().sum();
        if total.abs() > f64::EPSILON {
            row.iter_mut().for_each(|w| *w /= total);
        }
    }

    weights.into_iter().map(|w| w as f32).collect()
}

/// Resizes `[n, c, h, w]` to `[n, c, out_h, out_w]`
pub fn resize<B: Backend>(
    x: Tensor<B, 4>,
    out_h: usize,
    out_w: usize,
    filter: ResizeFilter,
    antialias: bool,
) -> Tensor<B, 4> {
    let [n, c, h, w] = x.dims();
    if h == out_h && w == out_w {
        return x;
    }
    let device = x.device();

    let wx = Tensor::<B, 2>::from_data(
        TensorData::new(resize_weights(w, out_w, filter, antialias), [out_w, w]),
        &device,
    );
    let wy = Tensor::<B, 2>::from_data(
        TensorData::new(resize_weights(h, out_h, filter, antialias), [out_h, h]),
        &device,
    );

    // Width pass: rows of length w
    let x = x.reshape([n * c * h, w]).matmul(wx.transpose());
    let x = x.reshape([n, c, h, out_w]).swap_dims(2, 3);

    // Height pass on the transposed image
    let x = x.reshape([n * c * out_w, h]).matmul(wy.transpose());
    x.reshape([n, c, out_w, out_h]).swap_dims(2, 3)
}

/// Antialiased cubic resize, the quality path used for crops
pub fn resize_area<B: Backend>(x: Tensor<B, 4>, out_h: usize, out_w: usize) -> Tensor<B, 4> {
    resize(x, out_h, out_w, ResizeFilter::Cubic, true)
}

/// Bilinear upsampling by an integer factor (`align_corners = false`)
pub fn upsample_bilinear<B: Backend>(x: Tensor<B, 4>, factor: usize) -> Tensor<B, 4> {
    let [_, _, h, w] = x.dims();
    resize(x, h * factor, w * factor, ResizeFilter::Linear, false)
}
