//! Attention helpers shared by the CLIP towers

use burn::prelude::*;

/// Additive causal mask: zero on and below the diagonal, `-inf` above
pub fn create_causal_mask<B: Backend>(seq_len: usize, device: &B::Device) -> Tensor<B, 2> {
    let mut mask = vec![0.0f32; seq_len * seq_len];
    for i in 0..seq_len {
        for j in (i + 1)..seq_len {
            mask[i * seq_len + j] = f32::NEG_INFINITY;
        }
    }
    Tensor::from_data(TensorData::new(mask, [seq_len, seq_len]), device)
}

/// Scaled dot-product attention over `[batch, heads, seq, head_dim]`
///
/// Softmax subtracts the row max first so half precision does not overflow.
pub fn scaled_dot_product_attention<B: Backend>(
    q: Tensor<B, 4>,
    k: Tensor<B, 4>,
    v: Tensor<B, 4>,
    mask: Option<Tensor<B, 2>>,
    head_dim: usize,
) -> Tensor<B, 4> {
    let scale = (head_dim as f64).powf(-0.5);
    let attn = q.matmul(k.transpose()) * scale;

    let attn = match mask {
        Some(m) => attn + m.unsqueeze::<4>(),
        None => attn,
    };

    let attn_max = attn.clone().max_dim(3).detach();
    let attn = (attn - attn_max).exp();
    let attn = attn.clone() / attn.sum_dim(3);

    attn.matmul(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_causal_mask_layout() {
        let device = Default::default();
        let mask: Vec<f32> = create_causal_mask::<TestBackend>(3, &device).into_data().to_vec().unwrap();
        assert_eq!(mask[0], 0.0);
        assert_eq!(mask[1], f32::NEG_INFINITY);
        assert_eq!(mask[3], 0.0);
        assert_eq!(mask[8], 0.0);
    }

    #[test]
    fn test_first_position_attends_only_to_itself() {
        let device = Default::default();
        let q = Tensor::<TestBackend, 4>::ones([1, 1, 3, 2], &device);
        let k = Tensor::<TestBackend, 4>::ones([1, 1, 3, 2], &device);
        let v = Tensor::<TestBackend, 4>::from_floats([[[[1.0, 0.0], [0.0, 1.0], [5.0, 5.0]]]], &device);

        let mask = create_causal_mask(3, &device);
        let out: Vec<f32> = scaled_dot_product_attention(q, k, v, Some(mask), 2)
            .into_data()
            .to_vec()
            .unwrap();

        assert!((out[0] - 1.0).abs() < 1e-6);
        assert!(out[1].abs() < 1e-6);
        // Second row averages the first two values
        assert!((out[2] - 0.5).abs() < 1e-6);
    }
}
