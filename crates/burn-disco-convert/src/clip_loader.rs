//! CLIP weight loading
//!
//! Reads OpenAI CLIP checkpoints exported to safetensors with their
//! original key names (`visual.conv1.weight`, `transformer.resblocks.0...`).
//! Fused attention projections are split into separate Q/K/V layers.

use std::path::Path;

use burn::module::Param;
use burn::nn::EmbeddingConfig;
use burn::prelude::*;

use burn_disco_clip::{
    ClipConfig, ClipModel, ClipTextTransformer, ClipVisionTransformer, FeedForward, MultiHeadSelfAttention,
    TransformerBlock,
};

use crate::layers::{linear_from_weight, load_conv2d, load_layer_norm, load_linear, ConvShape};
use crate::loader::{LoadError, SafeTensorFile};

/// Opens `path` and loads both towers for `config`
pub fn load_clip<B: Backend, P: AsRef<Path>>(
    path: P,
    config: &ClipConfig,
    device: &B::Device,
) -> Result<ClipModel<B>, LoadError> {
    let file = SafeTensorFile::open(path)?;
    load_clip_from_file(&file, config, device)
}

pub fn load_clip_from_file<B: Backend>(
    file: &SafeTensorFile,
    config: &ClipConfig,
    device: &B::Device,
) -> Result<ClipModel<B>, LoadError> {
    Ok(ClipModel {
        text: load_text_tower(file, config, device)?,
        vision: load_vision_tower(file, config, device)?,
    })
}

fn load_text_tower<B: Backend>(
    file: &SafeTensorFile,
    config: &ClipConfig,
    device: &B::Device,
) -> Result<ClipTextTransformer<B>, LoadError> {
    let width = config.text_width;

    let mut token_embedding = EmbeddingConfig::new(config.vocab_size, width).init(device);
    token_embedding.weight =
        Param::from_tensor(file.load_f32_checked("token_embedding.weight", [config.vocab_size, width], device)?);

    let layers = (0..config.text_layers)
        .map(|i| load_block(file, &format!("transformer.resblocks.{i}"), width, config.text_heads, device))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ClipTextTransformer {
        token_embedding,
        position_embedding: Param::from_tensor(file.load_f32_checked(
            "positional_embedding",
            [config.context_length, width],
            device,
        )?),
        layers,
        final_layer_norm: load_layer_norm(file, "ln_final", width, device)?,
        text_projection: Param::from_tensor(file.load_f32_checked(
            "text_projection",
            [width, config.embed_dim],
            device,
        )?),
    })
}

fn load_vision_tower<B: Backend>(
    file: &SafeTensorFile,
    config: &ClipConfig,
    device: &B::Device,
) -> Result<ClipVisionTransformer<B>, LoadError> {
    let vision = &config.vision;
    let width = vision.width;
    let tokens = vision.grid() * vision.grid() + 1;

    let patch_embedding = load_conv2d(
        file,
        "visual.conv1",
        ConvShape {
            in_channels: 3,
            out_channels: width,
            kernel_size: vision.patch_size,
            stride: vision.patch_size,
            padding: 0,
        },
        device,
    )?;

    let layers = (0..vision.layers)
        .map(|i| {
            load_block(
                file,
                &format!("visual.transformer.resblocks.{i}"),
                width,
                vision.heads,
                device,
            )
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ClipVisionTransformer {
        patch_embedding,
        class_embedding: Param::from_tensor(file.load_f32_checked("visual.class_embedding", [width], device)?),
        position_embedding: Param::from_tensor(file.load_f32_checked(
            "visual.positional_embedding",
            [tokens, width],
            device,
        )?),
        pre_layer_norm: load_layer_norm(file, "visual.ln_pre", width, device)?,
        layers,
        post_layer_norm: load_layer_norm(file, "visual.ln_post", width, device)?,
        projection: Param::from_tensor(file.load_f32_checked("visual.proj", [width, config.embed_dim], device)?),
        image_size: vision.image_size,
    })
}

/// Load one residual attention block
fn load_block<B: Backend>(
    file: &SafeTensorFile,
    prefix: &str,
    width: usize,
    heads: usize,
    device: &B::Device,
) -> Result<TransformerBlock<B>, LoadError> {
    Ok(TransformerBlock {
        attn_norm: load_layer_norm(file, &format!("{prefix}.ln_1"), width, device)?,
        attn: load_attention(file, &format!("{prefix}.attn"), width, heads, device)?,
        ffn_norm: load_layer_norm(file, &format!("{prefix}.ln_2"), width, device)?,
        ffn: FeedForward {
            fc1: load_linear(file, &format!("{prefix}.mlp.c_fc"), width, width * 4, device)?,
            fc2: load_linear(file, &format!("{prefix}.mlp.c_proj"), width * 4, width, device)?,
        },
    })
}

/// Load attention with a fused `in_proj` of shape `[3 * width, width]`
fn load_attention<B: Backend>(
    file: &SafeTensorFile,
    prefix: &str,
    width: usize,
    heads: usize,
    device: &B::Device,
) -> Result<MultiHeadSelfAttention<B>, LoadError> {
    let in_proj_weight: Tensor<B, 2> =
        file.load_f32_checked(&format!("{prefix}.in_proj_weight"), [3 * width, width], device)?;
    let in_proj_bias: Tensor<B, 1> = file.load_f32_checked(&format!("{prefix}.in_proj_bias"), [3 * width], device)?;

    let part = |i: usize| {
        let rows = i * width..(i + 1) * width;
        linear_from_weight(
            in_proj_weight.clone().slice([rows.clone(), 0..width]),
            Some(in_proj_bias.clone().slice([rows])),
            device,
        )
    };

    Ok(MultiHeadSelfAttention {
        q_proj: part(0),
        k_proj: part(1),
        v_proj: part(2),
        out_proj: load_linear(file, &format!("{prefix}.out_proj"), width, width, device)?,
        num_heads: heads,
        head_dim: width / heads,
    })
}
