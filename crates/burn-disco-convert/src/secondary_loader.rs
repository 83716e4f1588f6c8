//! Secondary model weight loading
//!
//! Key names follow the nested `nn.Sequential` layout of the released
//! checkpoint: `net.{i}.0` for conv blocks and `net.2.main.{j}` for each
//! skip level, nesting one `main.3` deeper per resolution.

use std::path::Path;

use burn::module::Param;
use burn::prelude::*;

use burn_disco_secondary::{ConvBlock, SecondaryConfig, SecondaryDiffusion, SkipLevel};

use crate::layers::{load_conv2d, ConvShape};
use crate::loader::{LoadError, SafeTensorFile};

pub fn load_secondary<B: Backend, P: AsRef<Path>>(
    path: P,
    config: &SecondaryConfig,
    device: &B::Device,
) -> Result<SecondaryDiffusion<B>, LoadError> {
    let file = SafeTensorFile::open(path)?;
    load_secondary_from_file(&file, config, device)
}

pub fn load_secondary_from_file<B: Backend>(
    file: &SafeTensorFile,
    config: &SecondaryConfig,
    device: &B::Device,
) -> Result<SecondaryDiffusion<B>, LoadError> {
    let mut model = config.init::<B>(device);

    let features = config.time_features / 2;
    model.timestep_embed.weight = Param::from_tensor(file.load_f32_checked("timestep_embed.weight", [features, 1], device)?);

    for (i, block) in model.stem.iter_mut().enumerate() {
        load_block(file, &format!("net.{i}"), block, device)?;
    }

    let mut prefix = "net.2".to_string();
    let innermost = model.levels.len().saturating_sub(1);
    for (depth, level) in model.levels.iter_mut().enumerate() {
        load_level(file, &prefix, level, depth == innermost, device)?;
        prefix = format!("{prefix}.main.3");
    }

    load_block(file, "net.3", &mut model.head, device)?;

    let [out_channels, in_channels, _, _] = model.out.weight.dims();
    model.out = load_conv2d(
        file,
        "net.4",
        ConvShape {
            in_channels,
            out_channels,
            kernel_size: 3,
            stride: 1,
            padding: 1,
        },
        device,
    )?;

    Ok(model)
}

/// Main-path indices: pool at 0, down blocks at 1-2, the nested level at 3
/// and up blocks after it. The innermost level has no nested level.
fn load_level<B: Backend>(
    file: &SafeTensorFile,
    prefix: &str,
    level: &mut SkipLevel<B>,
    innermost: bool,
    device: &B::Device,
) -> Result<(), LoadError> {
    let down_len = level.down.len();
    for (j, block) in level.down.iter_mut().enumerate() {
        load_block(file, &format!("{prefix}.main.{}", j + 1), block, device)?;
    }

    let first_up = if innermost { down_len + 1 } else { down_len + 2 };
    for (j, block) in level.up.iter_mut().enumerate() {
        load_block(file, &format!("{prefix}.main.{}", first_up + j), block, device)?;
    }
    Ok(())
}

/// A conv block stores its convolution at `{prefix}.0`
fn load_block<B: Backend>(
    file: &SafeTensorFile,
    prefix: &str,
    block: &mut ConvBlock<B>,
    device: &B::Device,
) -> Result<(), LoadError> {
    let [out_channels, in_channels, _, _] = block.conv.weight.dims();
    block.conv = load_conv2d(
        file,
        &format!("{prefix}.0"),
        ConvShape {
            in_channels,
            out_channels,
            kernel_size: 3,
            stride: 1,
            padding: 1,
        },
        device,
    )?;
    Ok(())
}
