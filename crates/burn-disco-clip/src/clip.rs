//! CLIP text and vision towers (OpenAI ViT family)
//!
//! Both towers share the pre-norm transformer block. The text tower reads
//! its feature at the end-of-text token; the vision tower reads the class
//! token. Each projects into the joint embedding space.

use burn::module::Param;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Embedding, EmbeddingConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::sigmoid;
use burn::tensor::Int;

use crate::attention::{create_causal_mask, scaled_dot_product_attention};
use crate::tokenizer::CONTEXT_LENGTH;
use burn_disco_core::layernorm::LayerNorm;

/// Vision tower shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisionConfig {
    pub image_size: usize,
    pub patch_size: usize,
    pub width: usize,
    pub layers: usize,
    pub heads: usize,
}

impl VisionConfig {
    /// Patches along one side
    pub fn grid(&self) -> usize {
        self.image_size / self.patch_size
    }
}

/// Full CLIP model shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipConfig {
    pub name: String,
    pub embed_dim: usize,
    pub vocab_size: usize,
    pub context_length: usize,
    pub text_width: usize,
    pub text_heads: usize,
    pub text_layers: usize,
    pub vision: VisionConfig,
}

impl ClipConfig {
    pub fn vit_b_32() -> Self {
        Self {
            name: "ViT-B/32".into(),
            embed_dim: 512,
            vocab_size: 49408,
            context_length: CONTEXT_LENGTH,
            text_width: 512,
            text_heads: 8,
            text_layers: 12,
            vision: VisionConfig {
                image_size: 224,
                patch_size: 32,
                width: 768,
                layers: 12,
                heads: 12,
            },
        }
    }

    pub fn vit_b_16() -> Self {
        Self {
            name: "ViT-B/16".into(),
            vision: VisionConfig {
                patch_size: 16,
                ..Self::vit_b_32().vision
            },
            ..Self::vit_b_32()
        }
    }

    pub fn vit_l_14() -> Self {
        Self {
            name: "ViT-L/14".into(),
            embed_dim: 768,
            vocab_size: 49408,
            context_length: CONTEXT_LENGTH,
            text_width: 768,
            text_heads: 12,
            text_layers: 12,
            vision: VisionConfig {
                image_size: 224,
                patch_size: 14,
                width: 1024,
                layers: 24,
                heads: 16,
            },
        }
    }

    pub fn vit_l_14_336() -> Self {
        Self {
            name: "ViT-L/14@336px".into(),
            vision: VisionConfig {
                image_size: 336,
                ..Self::vit_l_14().vision
            },
            ..Self::vit_l_14()
        }
    }

    /// Looks up a configuration by its published name (`ViT-B/32`, ...)
    pub fn by_name(name: &str) -> Option<Self> {
        let normalized = name.to_ascii_lowercase().replace(['-', '/', '@'], "");
        match normalized.as_str() {
            "vitb32" => Some(Self::vit_b_32()),
            "vitb16" => Some(Self::vit_b_16()),
            "vitl14" => Some(Self::vit_l_14()),
            "vitl14336px" | "vitl14336" => Some(Self::vit_l_14_336()),
            _ => None,
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> ClipModel<B> {
        ClipModel {
            text: ClipTextTransformer::new(self, device),
            vision: ClipVisionTransformer::new(self, device),
        }
    }
}

/// Paired text and vision towers
#[derive(Module, Debug)]
pub struct ClipModel<B: Backend> {
    pub text: ClipTextTransformer<B>,
    pub vision: ClipVisionTransformer<B>,
}

impl<B: Backend> ClipModel<B> {
    /// `[batch, context]` token ids to `[batch, embed_dim]`
    pub fn encode_text(&self, token_ids: Tensor<B, 2, Int>, eot_positions: &[usize]) -> Tensor<B, 2> {
        self.text.forward_pooled(token_ids, eot_positions)
    }

    /// `[batch, 3, size, size]` normalized pixels to `[batch, embed_dim]`
    pub fn encode_image(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.vision.forward(images)
    }
}

/// CLIP text transformer
#[derive(Module, Debug)]
pub struct ClipTextTransformer<B: Backend> {
    pub token_embedding: Embedding<B>,
    pub position_embedding: Param<Tensor<B, 2>>,
    pub layers: Vec<TransformerBlock<B>>,
    pub final_layer_norm: LayerNorm<B>,
    /// `[width, embed_dim]`, applied as `x @ projection`
    pub text_projection: Param<Tensor<B, 2>>,
}

impl<B: Backend> ClipTextTransformer<B> {
    pub fn new(config: &ClipConfig, device: &B::Device) -> Self {
        Self {
            token_embedding: EmbeddingConfig::new(config.vocab_size, config.text_width).init(device),
            position_embedding: Param::from_tensor(Tensor::zeros(
                [config.context_length, config.text_width],
                device,
            )),
            layers: (0..config.text_layers)
                .map(|_| TransformerBlock::new(config.text_width, config.text_heads, device))
                .collect(),
            final_layer_norm: LayerNorm::new(config.text_width, device),
            text_projection: Param::from_tensor(Tensor::zeros([config.text_width, config.embed_dim], device)),
        }
    }

    /// Hidden states `[batch, seq_len, width]`
    pub fn forward(&self, token_ids: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let [_batch, seq_len] = token_ids.dims();

        let x = self.token_embedding.forward(token_ids);
        let pos_emb = self.position_embedding.val().slice([0..seq_len]).unsqueeze::<3>();
        let mut x = x + pos_emb;

        let mask = create_causal_mask(seq_len, &x.device());
        for layer in &self.layers {
            x = layer.forward(x, Some(mask.clone()));
        }

        self.final_layer_norm.forward(x)
    }

    /// Projected features read at each row's end-of-text position
    pub fn forward_pooled(&self, token_ids: Tensor<B, 2, Int>, eot_positions: &[usize]) -> Tensor<B, 2> {
        let hidden = self.forward(token_ids);
        let [_batch, _seq, width] = hidden.dims();

        let pooled: Vec<Tensor<B, 2>> = eot_positions
            .iter()
            .enumerate()
            .map(|(i, &pos)| hidden.clone().slice([i..i + 1, pos..pos + 1, 0..width]).reshape([1, width]))
            .collect();

        Tensor::cat(pooled, 0).matmul(self.text_projection.val())
    }
}

/// CLIP vision transformer
#[derive(Module, Debug)]
pub struct ClipVisionTransformer<B: Backend> {
    pub patch_embedding: Conv2d<B>,
    pub class_embedding: Param<Tensor<B, 1>>,
    pub position_embedding: Param<Tensor<B, 2>>,
    pub pre_layer_norm: LayerNorm<B>,
    pub layers: Vec<TransformerBlock<B>>,
    pub post_layer_norm: LayerNorm<B>,
    /// `[width, embed_dim]`
    pub projection: Param<Tensor<B, 2>>,
    pub image_size: usize,
}

impl<B: Backend> ClipVisionTransformer<B> {
    pub fn new(config: &ClipConfig, device: &B::Device) -> Self {
        let vision = &config.vision;
        let tokens = vision.grid() * vision.grid() + 1;

        Self {
            patch_embedding: Conv2dConfig::new([3, vision.width], [vision.patch_size, vision.patch_size])
                .with_stride([vision.patch_size, vision.patch_size])
                .with_bias(false)
                .init(device),
            class_embedding: Param::from_tensor(Tensor::zeros([vision.width], device)),
            position_embedding: Param::from_tensor(Tensor::zeros([tokens, vision.width], device)),
            pre_layer_norm: LayerNorm::new(vision.width, device),
            layers: (0..vision.layers)
                .map(|_| TransformerBlock::new(vision.width, vision.heads, device))
                .collect(),
            post_layer_norm: LayerNorm::new(vision.width, device),
            projection: Param::from_tensor(Tensor::zeros([vision.width, config.embed_dim], device)),
            image_size: vision.image_size,
        }
    }

    /// Image features `[batch, embed_dim]`
    ///
    /// Input must be `[batch, 3, image_size, image_size]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch, _, _, _] = images.dims();

        let x = self.patch_embedding.forward(images);
        let [_, width, gh, gw] = x.dims();
        let x = x.reshape([batch, width, gh * gw]).swap_dims(1, 2);

        let class = self.class_embedding.val().reshape([1, 1, width]).repeat_dim(0, batch);
        let x = Tensor::cat(vec![class, x], 1);
        let x = x + self.position_embedding.val().unsqueeze::<3>();

        let mut x = self.pre_layer_norm.forward(x);
        for layer in &self.layers {
            x = layer.forward(x, None);
        }

        let class_token = x.slice([0..batch, 0..1, 0..width]).reshape([batch, width]);
        self.post_layer_norm.forward(class_token).matmul(self.projection.val())
    }
}

/// Transformer block with pre-norm residual attention and MLP
#[derive(Module, Debug)]
pub struct TransformerBlock<B: Backend> {
    pub attn_norm: LayerNorm<B>,
    pub attn: MultiHeadSelfAttention<B>,
    pub ffn_norm: LayerNorm<B>,
    pub ffn: FeedForward<B>,
}

impl<B: Backend> TransformerBlock<B> {
    pub fn new(width: usize, heads: usize, device: &B::Device) -> Self {
        Self {
            attn_norm: LayerNorm::new(width, device),
            attn: MultiHeadSelfAttention::new(width, heads, device),
            ffn_norm: LayerNorm::new(width, device),
            ffn: FeedForward::new(width, width * 4, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>, mask: Option<Tensor<B, 2>>) -> Tensor<B, 3> {
        let residual = x.clone();
        let x = residual + self.attn.forward(self.attn_norm.forward(x), mask);

        let residual = x.clone();
        residual + self.ffn.forward(self.ffn_norm.forward(x))
    }
}

/// Multi-head self-attention
#[derive(Module, Debug)]
pub struct MultiHeadSelfAttention<B: Backend> {
    pub q_proj: Linear<B>,
    pub k_proj: Linear<B>,
    pub v_proj: Linear<B>,
    pub out_proj: Linear<B>,
    pub num_heads: usize,
    pub head_dim: usize,
}

impl<B: Backend> MultiHeadSelfAttention<B> {
    pub fn new(width: usize, num_heads: usize, device: &B::Device) -> Self {
        Self {
            q_proj: LinearConfig::new(width, width).init(device),
            k_proj: LinearConfig::new(width, width).init(device),
            v_proj: LinearConfig::new(width, width).init(device),
            out_proj: LinearConfig::new(width, width).init(device),
            num_heads,
            head_dim: width / num_heads,
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>, mask: Option<Tensor<B, 2>>) -> Tensor<B, 3> {
        let [batch, seq_len, _] = x.dims();
        let split = |t: Tensor<B, 3>| {
            t.reshape([batch, seq_len, self.num_heads, self.head_dim]).swap_dims(1, 2)
        };

        let q = split(self.q_proj.forward(x.clone()));
        let k = split(self.k_proj.forward(x.clone()));
        let v = split(self.v_proj.forward(x));

        let out = scaled_dot_product_attention(q, k, v, mask, self.head_dim);
        let out = out.swap_dims(1, 2).reshape([batch, seq_len, self.num_heads * self.head_dim]);

        self.out_proj.forward(out)
    }
}

/// MLP with QuickGELU
#[derive(Module, Debug)]
pub struct FeedForward<B: Backend> {
    pub fc1: Linear<B>,
    pub fc2: Linear<B>,
}

impl<B: Backend> FeedForward<B> {
    pub fn new(width: usize, hidden: usize, device: &B::Device) -> Self {
        Self {
            fc1: LinearConfig::new(width, hidden).init(device),
            fc2: LinearConfig::new(hidden, width).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.fc2.forward(quick_gelu(self.fc1.forward(x)))
    }
}

/// `x * sigmoid(1.702 * x)`
fn quick_gelu<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clone() * sigmoid(x * 1.702)
}
