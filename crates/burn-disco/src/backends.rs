//! Backend selection
//!
//! Guidance needs gradients, so every backend here is wrapped in
//! [`Autodiff`]. Pick one with a feature flag:
//!
//! - `ndarray`: CPU (default, no GPU required)
//! - `wgpu`: WebGPU, cross-platform GPU
//! - `cuda`: native CUDA, NVIDIA only
//!
//! ```toml
//! [dependencies]
//! burn-disco = { version = "0.1", default-features = false, features = ["wgpu"] }
//! ```

#[allow(unused_imports)]
use burn::backend::Autodiff;

#[cfg(feature = "ndarray")]
pub use burn_ndarray::{NdArray, NdArrayDevice};

#[cfg(feature = "wgpu")]
pub use burn_wgpu::{Wgpu, WgpuDevice};

#[cfg(feature = "cuda")]
pub use burn_cuda::{Cuda, CudaDevice};

#[cfg(feature = "ndarray")]
pub type DefaultBackend = Autodiff<NdArray<f32>>;

#[cfg(all(feature = "wgpu", not(feature = "ndarray")))]
pub type DefaultBackend = Autodiff<Wgpu>;

#[cfg(all(feature = "cuda", not(any(feature = "ndarray", feature = "wgpu"))))]
pub type DefaultBackend = Autodiff<Cuda>;

#[cfg(feature = "ndarray")]
pub fn default_device() -> NdArrayDevice {
    NdArrayDevice::default()
}

#[cfg(all(feature = "wgpu", not(feature = "ndarray")))]
pub fn default_device() -> WgpuDevice {
    WgpuDevice::default()
}

#[cfg(all(feature = "cuda", not(any(feature = "ndarray", feature = "wgpu"))))]
pub fn default_device() -> CudaDevice {
    CudaDevice::default()
}

#[cfg(test)]
mod tests {
    #[test]
    #[cfg(any(feature = "ndarray", feature = "wgpu", feature = "cuda"))]
    fn test_default_backend_tracks_gradients() {
        use super::*;
        use burn::prelude::*;

        let device = default_device();
        let x = Tensor::<DefaultBackend, 1>::from_floats([1.0, 2.0], &device).require_grad();
        let grads = (x.clone() * x.clone()).sum().backward();
        assert!(x.grad(&grads).is_some());
    }
}
