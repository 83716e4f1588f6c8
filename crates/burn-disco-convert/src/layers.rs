//! Helpers for loading common layer types from PyTorch-layout tensors

use burn::module::Param;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::*;

use burn_disco_core::layernorm::LayerNorm;

use crate::loader::{LoadError, SafeTensorFile};

/// Builds a Linear layer from a PyTorch `[out, in]` weight
pub fn linear_from_weight<B: Backend>(weight: Tensor<B, 2>, bias: Option<Tensor<B, 1>>, device: &B::Device) -> Linear<B> {
    let [out_features, in_features] = weight.dims();
    let mut linear = LinearConfig::new(in_features, out_features)
        .with_bias(bias.is_some())
        .init(device);

    // Burn stores Linear weights as [in, out]
    linear.weight = Param::from_tensor(weight.transpose());
    linear.bias = bias.map(Param::from_tensor);
    linear
}

/// Load a Linear layer, checking its shape
pub fn load_linear<B: Backend>(
    file: &SafeTensorFile,
    prefix: &str,
    in_features: usize,
    out_features: usize,
    device: &B::Device,
) -> Result<Linear<B>, LoadError> {
    let weight = file.load_f32_checked(&format!("{prefix}.weight"), [out_features, in_features], device)?;

    let bias_key = format!("{prefix}.bias");
    let bias = if file.contains(&bias_key) {
        Some(file.load_f32_checked(&bias_key, [out_features], device)?)
    } else {
        None
    };

    Ok(linear_from_weight(weight, bias, device))
}

/// Load a LayerNorm from `{prefix}.weight` and `{prefix}.bias`
pub fn load_layer_norm<B: Backend>(
    file: &SafeTensorFile,
    prefix: &str,
    size: usize,
    device: &B::Device,
) -> Result<LayerNorm<B>, LoadError> {
    let weight = file.load_f32_checked(&format!("{prefix}.weight"), [size], device)?;
    let bias = file.load_f32_checked(&format!("{prefix}.bias"), [size], device)?;
    Ok(LayerNorm::from_weight_bias(weight, bias))
}

/// Shape of a square convolution
#[derive(Debug, Clone, Copy)]
pub struct ConvShape {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
}

/// Load a Conv2d; the bias is optional in the file
pub fn load_conv2d<B: Backend>(
    file: &SafeTensorFile,
    prefix: &str,
    shape: ConvShape,
    device: &B::Device,
) -> Result<Conv2d<B>, LoadError> {
    let k = shape.kernel_size;
    let weight = file.load_f32_checked(
        &format!("{prefix}.weight"),
        [shape.out_channels, shape.in_channels, k, k],
        device,
    )?;

    let bias_key = format!("{prefix}.bias");
    let has_bias = file.contains(&bias_key);
    let mut conv = Conv2dConfig::new([shape.in_channels, shape.out_channels], [k, k])
        .with_stride([shape.stride, shape.stride])
        .with_padding(PaddingConfig2d::Explicit(shape.padding, shape.padding))
        .with_bias(has_bias)
        .init(device);

    conv.weight = Param::from_tensor(weight);
    if has_bias {
        conv.bias = Some(Param::from_tensor(file.load_f32_checked(&bias_key, [shape.out_channels], device)?));
    }

    Ok(conv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::tests::write_f32;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_linear_transposes_pytorch_layout() {
        let device = Default::default();
        // y = W x with W = [[1, 2], [3, 4], [5, 6]]
        let file = write_f32(&[
            ("fc.weight", vec![3, 2], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
            ("fc.bias", vec![3], vec![0.0, 0.0, 1.0]),
        ]);
        let st = SafeTensorFile::open(file.path()).unwrap();
        let linear = load_linear::<TestBackend>(&st, "fc", 2, 3, &device).unwrap();

        let x = Tensor::<TestBackend, 2>::from_floats([[1.0, 1.0]], &device);
        let y: Vec<f32> = linear.forward(x).into_data().to_vec().unwrap();
        assert_eq!(y, vec![3.0, 7.0, 12.0]);
    }

    #[test]
    fn test_linear_shape_checked() {
        let device = Default::default();
        let file = write_f32(&[("fc.weight", vec![3, 2], vec![0.0; 6])]);
        let st = SafeTensorFile::open(file.path()).unwrap();

        assert!(load_linear::<TestBackend>(&st, "fc", 3, 2, &device).is_err());
        let linear = load_linear::<TestBackend>(&st, "fc", 2, 3, &device).unwrap();
        assert!(linear.bias.is_none());
    }
}
