//! CLIP embedding models for guidance
//!
//! # Models
//!
//! - [`ClipModel`] - OpenAI CLIP ViT-B/32, ViT-B/16 and ViT-L/14 text and
//!   vision towers
//!
//! # Capability
//!
//! Guidance talks to models through [`ImageTextEmbedder`], so other model
//! families can be added as adapters. [`ClipEmbedder`] is the adapter for
//! [`ClipModel`].
//!
//! ```ignore
//! use burn_disco_clip::{ClipConfig, ClipEmbedder, ClipTokenizer, ImageTextEmbedder};
//!
//! let config = ClipConfig::vit_b_32();
//! let tokenizer = ClipTokenizer::from_file("bpe_simple_vocab_16e6.txt")?;
//! let embedder = ClipEmbedder::new(config.init::<Backend>(&device), tokenizer, &config);
//!
//! let text = embedder.encode_text("a lighthouse at dusk");
//! ```

pub mod attention;
pub mod clip;
pub mod embedder;
pub mod tokenizer;

pub use attention::{create_causal_mask, scaled_dot_product_attention};
pub use clip::{
    ClipConfig, ClipModel, ClipTextTransformer, ClipVisionTransformer, FeedForward, MultiHeadSelfAttention,
    TransformerBlock, VisionConfig,
};
pub use embedder::{ClipEmbedder, ImageTextEmbedder, Normalization, DEFAULT_INPUT_RESOLUTION};
pub use tokenizer::{ClipTokenizer, TokenizerError, CONTEXT_LENGTH, END_OF_TEXT, START_OF_TEXT};
