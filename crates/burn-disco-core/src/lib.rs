//! Building blocks for CLIP-guided diffusion
//!
//! Everything here operates on plain `burn` tensors and is differentiable
//! where it sits on the guidance path.
//!
//! # Modules
//!
//! ## Crops and augmentation
//!
//! - [`cutouts`] - Overview and inner crops of an image batch
//! - [`augment`] - Flip, affine, grayscale, noise and color jitter
//! - [`resize`] - Separable, matrix-based resampling
//!
//! ## Losses
//!
//! - [`losses`] - Spherical embedding distance, total variation, range and
//!   saturation penalties
//!
//! ## Layers
//!
//! - [`layernorm`] - Layer normalization
//!
//! ## Initialization and I/O
//!
//! - [`perlin`] - Multi-octave perlin noise init images
//! - [`image_io`] - Tensor and RGB image conversion
//! - [`random`] - Seeded host-side random tensors
//!
//! # Example
//!
//! ```ignore
//! use burn_disco_core::cutouts::{make_cutouts, CutoutSpec};
//! use burn_disco_core::augment::AugmentConfig;
//!
//! let spec = CutoutSpec { cut_size: 224, overview: 4, inner: 12, inner_size_power: 2.0,
//!                         inner_gray_fraction: 0.2, skip_augs: false };
//! let crops = make_cutouts(image01, &spec, &AugmentConfig::default(), &mut rng)?;
//! ```

pub mod augment;
pub mod cutouts;
pub mod image_io;
pub mod layernorm;
pub mod losses;
pub mod perlin;
pub mod random;
pub mod resize;
