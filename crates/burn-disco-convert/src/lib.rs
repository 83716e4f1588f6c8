//! Weight Loading
//!
//! Loads pretrained weights from safetensors files into the CLIP towers and
//! the secondary model.
//!
//! ```ignore
//! use burn_disco_convert::{load_clip, load_secondary};
//!
//! let clip = load_clip::<Backend, _>("ViT-B-32.safetensors", &ClipConfig::vit_b_32(), &device)?;
//! let secondary = load_secondary::<Backend, _>("secondary.safetensors", &SecondaryConfig::imagenet2(), &device)?;
//! ```
//!
//! Tensors may be stored as f32, f16 or bf16; all are widened to f32.

pub mod clip_loader;
pub mod layers;
pub mod loader;
pub mod secondary_loader;

pub use clip_loader::{load_clip, load_clip_from_file};
pub use loader::{LoadError, SafeTensorFile};
pub use secondary_loader::{load_secondary, load_secondary_from_file};
