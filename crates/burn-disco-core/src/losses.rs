//! Pixel- and embedding-space losses used by guidance
//!
//! All losses return per-sample (or per-pair) tensors so callers choose the
//! reduction. None of them hold state.

use burn::prelude::*;

/// Largest value of [`spherical_dist_loss`]: `2 * (pi / 2)^2`
pub const SPHERICAL_DIST_MAX: f64 = std::f64::consts::PI * std::f64::consts::PI / 2.0;

/// Scales rows to unit length (`x / max(|x|, 1e-12)`)
pub fn normalize_rows<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let norm = x.clone().powi_scalar(2).sum_dim(1).sqrt().clamp_min(1e-12);
    x / norm
}

/// Squared angular distance between every row of `x` and every row of `y`
///
/// Both sides are normalized, then `2 * asin(|x - y| / 2)^2`. Returns
/// `[x_rows, y_rows]`, bounded by [`SPHERICAL_DIST_MAX`].
pub fn spherical_dist_loss<B: Backend>(x: Tensor<B, 2>, y: Tensor<B, 2>) -> Tensor<B, 2> {
    let x = normalize_rows(x);
    let y = normalize_rows(y);
    let [n, d] = x.dims();
    let [t, _] = y.dims();

    let diff = x.reshape([n, 1, d]) - y.reshape([1, t, d]);
    let squared = diff.powi_scalar(2).sum_dim(2).reshape([n, t]);

    pointwise(squared, angular_from_squared)
}

/// `f(s) = 2 * asin(sqrt(s) / 2)^2` and `f'(s)`, with the removable
/// singularity at `s = 0` filled in (`f'(0) = 1/2`).
fn angular_from_squared(s: f64) -> (f64, f64) {
    if !s.is_finite() {
        return (f64::NAN, f64::NAN);
    }
    let u = (s.max(0.0).sqrt() / 2.0).min(1.0);
    let angle = u.asin();
    let value = 2.0 * angle * angle;

    let slope = if u < 1e-4 {
        0.5
    } else {
        let u = u.min(1.0 - 1e-7);
        angle / (2.0 * u * (1.0 - u * u).sqrt())
    };
    (value, slope)
}

/// Applies a scalar function on the host while keeping the graph intact
///
/// The result equals `f(x)` and its gradient is `f'(x) * upstream`, via
/// `f(x_detached) + (x - x_detached) * f'(x_detached)`. Used for functions
/// the tensor API lacks.
pub fn pointwise<B: Backend, const D: usize>(x: Tensor<B, D>, f: impl Fn(f64) -> (f64, f64)) -> Tensor<B, D> {
    let dims = x.dims();
    let device = x.device();

    let (values, slopes): (Vec<f32>, Vec<f32>) = x
        .clone()
        .into_data()
        .iter::<f32>()
        .map(|v| {
            let (value, slope) = f(v as f64);
            (value as f32, slope as f32)
        })
        .unzip();

    let value = Tensor::<B, D>::from_data(TensorData::new(values, dims), &device);
    let slope = Tensor::<B, D>::from_data(TensorData::new(slopes, dims), &device);
    let detached = x.clone().detach();
    value + (x - detached) * slope
}

fn mean_per_sample<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 1> {
    let [n, c, h, w] = x.dims();
    x.reshape([n, c * h * w]).mean_dim(1).reshape([n])
}

/// Total variation: squared first differences after replicating the last
/// row and column, averaged per sample
pub fn tv_loss<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 1> {
    let [n, c, h, w] = x.dims();
    let x = Tensor::cat(vec![x.clone(), x.slice([0..n, 0..c, 0..h, w - 1..w])], 3);
    let x = Tensor::cat(vec![x.clone(), x.slice([0..n, 0..c, h - 1..h, 0..w + 1])], 2);

    let dx = x.clone().slice([0..n, 0..c, 0..h, 1..w + 1]) - x.clone().slice([0..n, 0..c, 0..h, 0..w]);
    let dy = x.clone().slice([0..n, 0..c, 1..h + 1, 0..w]) - x.slice([0..n, 0..c, 0..h, 0..w]);
    mean_per_sample(dx.powi_scalar(2) + dy.powi_scalar(2))
}

/// Mean squared excursion outside `[-1, 1]`, per sample
pub fn range_loss<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 1> {
    let excess = x.clone() - x.clamp(-1.0, 1.0);
    mean_per_sample(excess.powi_scalar(2))
}

/// Mean absolute excursion outside `[-1, 1]` over the whole batch
pub fn saturation_loss<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 1> {
    let excess = x.clone() - x.clamp(-1.0, 1.0);
    excess.abs().mean()
}
