//! Layer normalization over the last dimension, as used by the CLIP towers.

use burn::prelude::*;

/// Layer normalization with a learned scale and shift
///
/// ```text
/// y = (x - mean(x)) / sqrt(var(x) + eps) * weight + bias
/// ```
///
/// The variance is the biased (population) estimate, matching the
/// reference CLIP checkpoints.
#[derive(Module, Debug)]
pub struct LayerNorm<B: Backend> {
    pub weight: Tensor<B, 1>,
    pub bias: Tensor<B, 1>,
    pub eps: f64,
}

impl<B: Backend> LayerNorm<B> {
    /// Identity-initialized norm of width `size`
    pub fn new(size: usize, device: &B::Device) -> Self {
        Self {
            weight: Tensor::ones([size], device),
            bias: Tensor::zeros([size], device),
            eps: 1e-5,
        }
    }

    /// Wraps checkpoint tensors
    pub fn from_weight_bias(weight: Tensor<B, 1>, bias: Tensor<B, 1>) -> Self {
        Self {
            weight,
            bias,
            eps: 1e-5,
        }
    }

    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let last_dim = D - 1;
        let mean = x.clone().mean_dim(last_dim);
        let var = x.clone().var_bias(last_dim);

        let x_norm = (x - mean) / (var + self.eps).sqrt();
        x_norm * self.weight.clone().unsqueeze() + self.bias.clone().unsqueeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_layernorm_zero_mean_unit_variance() {
        let device = Default::default();
        let norm = LayerNorm::<TestBackend>::new(4, &device);
        let x = Tensor::<TestBackend, 2>::from_floats([[1.0, 2.0, 3.0, 4.0]], &device);

        let values: Vec<f32> = norm.forward(x).into_data().to_vec().unwrap();
        let mean: f32 = values.iter().sum::<f32>() / 4.0;
        let var: f32 = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;

        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-3, "variance {var}");
    }

    #[test]
    fn test_layernorm_applies_affine() {
        let device = Default::default();
        let norm = LayerNorm::<TestBackend>::from_weight_bias(
            Tensor::from_floats([2.0, 2.0], &device),
            Tensor::from_floats([1.0, 1.0], &device),
        );
        let x = Tensor::<TestBackend, 2>::from_floats([[-1.0, 1.0]], &device);

        let values: Vec<f32> = norm.forward(x).into_data().to_vec().unwrap();
        assert!((values[0] - -1.0).abs() < 1e-3);
        assert!((values[1] - 3.0).abs() < 1e-3);
    }
}
