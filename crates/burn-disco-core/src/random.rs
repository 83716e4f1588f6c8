//! Host-side random tensors
//!
//! Every stochastic choice in a run draws from one seeded [`ChaCha8Rng`].
//! Values are generated on the host and uploaded so a seed reproduces the
//! same run on any backend.

use burn::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

/// The generator type threaded through a run
pub type RunRng = ChaCha8Rng;

/// Creates the run generator from a seed
pub fn seeded_rng(seed: u64) -> RunRng {
    ChaCha8Rng::seed_from_u64(seed)
}

/// An independent stream of the run generator
///
/// Components that draw in their own order (guidance crops, say) use a
/// separate stream so they do not shift the sampler's noise.
pub fn stream_rng(seed: u64, stream: u64) -> RunRng {
    let mut rng = seeded_rng(seed);
    rng.set_stream(stream);
    rng
}

/// Draws a fresh seed from the operating system
pub fn random_seed() -> u64 {
    rand::thread_rng().gen()
}

/// Standard normal samples with the given shape
pub fn randn<B: Backend, const D: usize, R: Rng + ?Sized>(
    rng: &mut R,
    shape: [usize; D],
    device: &B::Device,
) -> Tensor<B, D> {
    let len: usize = shape.iter().product();
    let values: Vec<f32> = (0..len).map(|_| rng.sample::<f32, _>(StandardNormal)).collect();
    Tensor::from_data(TensorData::new(values, shape), device)
}

/// Uniform samples in `[low, high)` with the given shape
pub fn uniform<B: Backend, const D: usize, R: Rng + ?Sized>(
    rng: &mut R,
    shape: [usize; D],
    low: f32,
    high: f32,
    device: &B::Device,
) -> Tensor<B, D> {
    let len: usize = shape.iter().product();
    let values: Vec<f32> = (0..len).map(|_| rng.gen_range(low..high)).collect();
    Tensor::from_data(TensorData::new(values, shape), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_same_seed_same_tensor() {
        let device = Default::default();
        let a: Tensor<TestBackend, 2> = randn(&mut seeded_rng(7), [3, 5], &device);
        let b: Tensor<TestBackend, 2> = randn(&mut seeded_rng(7), [3, 5], &device);

        let a: Vec<f32> = a.into_data().to_vec().unwrap();
        let b: Vec<f32> = b.into_data().to_vec().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_streams_differ() {
        let a: u64 = stream_rng(5, 0).gen();
        let b: u64 = stream_rng(5, 1).gen();
        assert_ne!(a, b);
        assert_eq!(a, seeded_rng(5).gen::<u64>());
    }

    #[test]
    fn test_randn_statistics() {
        let device = Default::default();
        let x: Tensor<TestBackend, 1> = randn(&mut seeded_rng(1), [10_000], &device);
        let values: Vec<f32> = x.into_data().to_vec().unwrap();

        let mean = values.iter().sum::<f32>() / values.len() as f32;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / values.len() as f32;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.1, "var {var}");
    }

    #[test]
    fn test_uniform_bounds() {
        let device = Default::default();
        let x: Tensor<TestBackend, 1> = uniform(&mut seeded_rng(3), [1000], -0.5, 0.5, &device);
        let values: Vec<f32> = x.into_data().to_vec().unwrap();
        assert!(values.iter().all(|v| (-0.5..0.5).contains(v)));
    }
}
