//! Image/text embedding capability used by guidance
//!
//! Guidance only needs three things from an embedding model: text
//! features, image features, and the resolution it expects. Concrete model
//! families are wrapped in adapters implementing [`ImageTextEmbedder`].

use burn::prelude::*;
use burn::tensor::Int;

use crate::clip::{ClipConfig, ClipModel};
use crate::tokenizer::{ClipTokenizer, END_OF_TEXT};

/// Input size assumed for models that do not report one
pub const DEFAULT_INPUT_RESOLUTION: usize = 224;

/// Per-channel input statistics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Normalization {
    /// Statistics of the OpenAI CLIP training set
    pub const CLIP: Self = Self {
        mean: [0.48145466, 0.4578275, 0.40821073],
        std: [0.26862954, 0.26130258, 0.27577711],
    };

    /// `(x - mean) / std` over channel dim 1 of `[n, 3, h, w]`
    pub fn apply<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let device = x.device();
        let mean = Tensor::<B, 1>::from_floats(self.mean, &device).reshape([1, 3, 1, 1]);
        let std = Tensor::<B, 1>::from_floats(self.std, &device).reshape([1, 3, 1, 1]);
        (x - mean) / std
    }
}

/// A joint text/image embedding model
pub trait ImageTextEmbedder<B: Backend> {
    /// Display name for logs
    fn name(&self) -> &str;

    /// Feature of one text, shape `[1, dim]`
    fn encode_text(&self, text: &str) -> Tensor<B, 2>;

    /// Features of normalized images `[n, 3, r, r]`, shape `[n, dim]`
    fn encode_image(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;

    /// Resolution the model was trained at, if it reports one
    fn native_resolution(&self) -> Option<usize> {
        None
    }

    /// Side length of crops fed to [`encode_image`](Self::encode_image)
    fn input_resolution(&self) -> usize {
        self.native_resolution().unwrap_or(DEFAULT_INPUT_RESOLUTION)
    }

    fn normalization(&self) -> Normalization {
        Normalization::CLIP
    }
}

/// Adapter for the OpenAI CLIP ViT family
pub struct ClipEmbedder<B: Backend> {
    model: ClipModel<B>,
    tokenizer: ClipTokenizer,
    name: String,
    context_length: usize,
    image_size: usize,
}

impl<B: Backend> ClipEmbedder<B> {
    /// Wraps a loaded model; weights are frozen
    pub fn new(model: ClipModel<B>, tokenizer: ClipTokenizer, config: &ClipConfig) -> Self {
        Self {
            model: model.no_grad(),
            tokenizer,
            name: config.name.clone(),
            context_length: config.context_length,
            image_size: config.vision.image_size,
        }
    }

    pub fn model(&self) -> &ClipModel<B> {
        &self.model
    }
}

impl<B: Backend> ImageTextEmbedder<B> for ClipEmbedder<B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn encode_text(&self, text: &str) -> Tensor<B, 2> {
        let tokens = self.tokenizer.encode_padded(text, self.context_length);
        let eot = tokens
            .iter()
            .position(|&t| t == END_OF_TEXT)
            .unwrap_or(self.context_length - 1);

        let device = self.model.text.position_embedding.val().device();
        let ids: Vec<i64> = tokens.into_iter().map(i64::from).collect();
        let ids = Tensor::<B, 2, Int>::from_data(TensorData::new(ids, [1, self.context_length]), &device);

        self.model.encode_text(ids, &[eot])
    }

    fn encode_image(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.model.encode_image(images)
    }

    fn native_resolution(&self) -> Option<usize> {
        Some(self.image_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::VisionConfig;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    /// A model family that does not report its input size
    struct Unsized;

    impl ImageTextEmbedder<TestBackend> for Unsized {
        fn name(&self) -> &str {
            "unsized"
        }

        fn encode_text(&self, _text: &str) -> Tensor<TestBackend, 2> {
            Tensor::zeros([1, 4], &Default::default())
        }

        fn encode_image(&self, images: Tensor<TestBackend, 4>) -> Tensor<TestBackend, 2> {
            let [n, _, _, _] = images.dims();
            Tensor::zeros([n, 4], &images.device())
        }
    }

    #[test]
    fn test_default_resolution_fallback() {
        assert_eq!(Unsized.native_resolution(), None);
        assert_eq!(Unsized.input_resolution(), DEFAULT_INPUT_RESOLUTION);
    }

    #[test]
    fn test_normalization_maps_mean_to_zero() {
        let device = Default::default();
        let norm = Normalization::CLIP;
        let x = Tensor::<TestBackend, 1>::from_floats(norm.mean, &device).reshape([1, 3, 1, 1]);
        let values: Vec<f32> = norm.apply(x).into_data().to_vec().unwrap();
        assert!(values.iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn test_clip_embedder_reports_native_size() {
        let device = Default::default();
        let config = ClipConfig {
            name: "tiny".into(),
            embed_dim: 4,
            vocab_size: 49408,
            context_length: 8,
            text_width: 8,
            text_heads: 2,
            text_layers: 1,
            vision: VisionConfig {
                image_size: 16,
                patch_size: 8,
                width: 8,
                layers: 1,
                heads: 2,
            },
        };
        let tokenizer = ClipTokenizer::from_vocab("#version: 0.2\nc a\n").unwrap();
        let embedder = ClipEmbedder::new(config.init::<TestBackend>(&device), tokenizer, &config);

        assert_eq!(embedder.input_resolution(), 16);
        assert_eq!(embedder.name(), "tiny");
        assert_eq!(embedder.encode_text("ca").dims(), [1, 4]);

        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 16, 16], &device);
        assert_eq!(embedder.encode_image(images).dims(), [2, 4]);
    }
}
