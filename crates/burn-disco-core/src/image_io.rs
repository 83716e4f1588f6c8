//! Conversions between `[n, 3, h, w]` tensors in `[-1, 1]` and RGB images

use burn::prelude::*;
use image::{imageops::FilterType, RgbImage};

/// Converts one image of the batch to an 8-bit RGB image
///
/// Values are mapped from `[-1, 1]` to `[0, 255]` and clamped.
pub fn tensor_to_rgb<B: Backend>(tensor: Tensor<B, 4>, index: usize) -> RgbImage {
    let [_, c, h, w] = tensor.dims();
    let tensor = tensor
        .slice([index..index + 1, 0..c, 0..h, 0..w])
        .add_scalar(1.0)
        .mul_scalar(127.5)
        .clamp(0.0, 255.0);

    let floats: Vec<f32> = tensor.into_data().iter::<f32>().collect();

    let mut rgb = Vec::with_capacity(h * w * 3);
    for y in 0..h {
        for x in 0..w {
            for ch in 0..3 {
                // Single-channel tensors are broadcast to gray
                let plane = if c == 1 { 0 } else { ch };
                rgb.push(floats[plane * h * w + y * w + x].round() as u8);
            }
        }
    }

    RgbImage::from_raw(w as u32, h as u32, rgb).unwrap_or_else(|| RgbImage::new(w as u32, h as u32))
}

/// Converts an RGB image to a `[1, 3, h, w]` tensor in `[-1, 1]`
pub fn rgb_to_tensor<B: Backend>(image: &RgbImage, device: &B::Device) -> Tensor<B, 4> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let mut planes = vec![0f32; 3 * h * w];
    for (x, y, pixel) in image.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for ch in 0..3 {
            planes[ch * h * w + y * w + x] = pixel.0[ch] as f32 / 127.5 - 1.0;
        }
    }
    Tensor::from_data(TensorData::new(planes, [1, 3, h, w]), device)
}

/// Resizes an image to `width x height` with a Lanczos filter
pub fn fit_image(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    if image.width() == width && image.height() == height {
        return image.clone();
    }
    image::imageops::resize(image, width, height, FilterType::Lanczos3)
}
