//! Secondary diffusion model
//!
//! A small velocity-predicting U-Net used by guidance to estimate the clean
//! image cheaply at any noise level.
//!
//! # Example
//!
//! ```ignore
//! use burn_disco_secondary::SecondaryConfig;
//!
//! let model = SecondaryConfig::imagenet2().init::<Backend>(&device);
//! let out = model.forward(noisy, t);
//! let clean = out.pred;
//! ```

pub mod blocks;
pub mod model;

pub use blocks::{ConvBlock, FourierFeatures, SkipLevel};
pub use model::{t_to_alpha_sigma, SecondaryConfig, SecondaryDiffusion, SecondaryOutput};
