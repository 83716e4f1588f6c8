//! Load tensors from .safetensors files

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use burn::prelude::*;
use half::{bf16, f16};
use memmap2::{Mmap, MmapOptions};
use safetensors::{Dtype, SafeTensors};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("Tensor not found: {0}")]
    TensorNotFound(String),

    #[error("Unsupported dtype for {name}: {dtype:?}")]
    UnsupportedDtype { name: String, dtype: Dtype },

    #[error("Shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

/// A memory-mapped safetensors file
pub struct SafeTensorFile {
    mmap: Mmap,
    tensors: HashMap<String, TensorInfo>,
}

struct TensorInfo {
    dtype: Dtype,
    shape: Vec<usize>,
    start: usize,
    end: usize,
}

impl SafeTensorFile {
    /// Open a safetensors file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let file = File::open(path)?;
        // Safety: the map is read-only and owned by the returned value
        let mmap = unsafe { MmapOptions::new().map(&file)? };

        let base = mmap.as_ptr() as usize;
        let st = SafeTensors::deserialize(&mmap)?;
        let tensors = st
            .tensors()
            .into_iter()
            .map(|(name, view)| {
                let start = view.data().as_ptr() as usize - base;
                let info = TensorInfo {
                    dtype: view.dtype(),
                    shape: view.shape().to_vec(),
                    start,
                    end: start + view.data().len(),
                };
                (name, info)
            })
            .collect();

        Ok(Self { mmap, tensors })
    }

    /// List all tensor names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(|s| s.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn shape(&self, name: &str) -> Option<&[usize]> {
        self.tensors.get(name).map(|t| t.shape.as_slice())
    }

    pub fn dtype(&self, name: &str) -> Option<Dtype> {
        self.tensors.get(name).map(|t| t.dtype)
    }

    /// Load a tensor as f32, converting from fp16/bf16 if needed
    pub fn load_f32<B: Backend, const D: usize>(&self, name: &str, device: &B::Device) -> Result<Tensor<B, D>, LoadError> {
        let info = self
            .tensors
            .get(name)
            .ok_or_else(|| LoadError::TensorNotFound(name.to_string()))?;

        let shape: [usize; D] = info.shape.clone().try_into().map_err(|actual| LoadError::ShapeMismatch {
            name: name.to_string(),
            expected: vec![0; D],
            actual,
        })?;

        let data = &self.mmap[info.start..info.end];

        // Byte-wise reads: tensor data in the map need not be aligned
        let floats: Vec<f32> = match info.dtype {
            Dtype::F32 => data
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect(),
            Dtype::F16 => data
                .chunks_exact(2)
                .map(|chunk| f16::from_bits(u16::from_le_bytes([chunk[0], chunk[1]])).to_f32())
                .collect(),
            Dtype::BF16 => data
                .chunks_exact(2)
                .map(|chunk| bf16::from_bits(u16::from_le_bytes([chunk[0], chunk[1]])).to_f32())
                .collect(),
            dtype => {
                return Err(LoadError::UnsupportedDtype {
                    name: name.to_string(),
                    dtype,
                })
            }
        };

        Ok(Tensor::from_data(TensorData::new(floats, shape), device))
    }

    /// Load a tensor with expected shape, converting to f32
    pub fn load_f32_checked<B: Backend, const D: usize>(
        &self,
        name: &str,
        expected_shape: [usize; D],
        device: &B::Device,
    ) -> Result<Tensor<B, D>, LoadError> {
        let actual = self
            .shape(name)
            .ok_or_else(|| LoadError::TensorNotFound(name.to_string()))?;

        if actual != expected_shape.as_slice() {
            return Err(LoadError::ShapeMismatch {
                name: name.to_string(),
                expected: expected_shape.to_vec(),
                actual: actual.to_vec(),
            });
        }

        self.load_f32::<B, D>(name, device)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use safetensors::tensor::TensorView;
    use std::io::Write;

    type TestBackend = NdArray<f32>;

    /// Writes f32 tensors to a temporary safetensors file
    pub(crate) fn write_f32(tensors: &[(&str, Vec<usize>, Vec<f32>)]) -> tempfile::NamedTempFile {
        let bytes: Vec<Vec<u8>> = tensors
            .iter()
            .map(|(_, _, values)| values.iter().flat_map(|v| v.to_le_bytes()).collect())
            .collect();
        let views: Vec<(&str, TensorView)> = tensors
            .iter()
            .zip(&bytes)
            .map(|((name, shape, _), data)| (*name, TensorView::new(Dtype::F32, shape.clone(), data).unwrap()))
            .collect();

        let serialized = safetensors::serialize(views, &None).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&serialized).unwrap();
        file
    }

    #[test]
    fn test_load_error_display() {
        let err = LoadError::TensorNotFound("missing".to_string());
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_load_f32_round_trip() {
        let file = write_f32(&[("w", vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])]);
        let st = SafeTensorFile::open(file.path()).unwrap();

        assert!(st.contains("w"));
        assert_eq!(st.shape("w"), Some(&[2usize, 3][..]));

        let device = Default::default();
        let t: Tensor<TestBackend, 2> = st.load_f32("w", &device).unwrap();
        let values: Vec<f32> = t.into_data().to_vec().unwrap();
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_rank_and_shape_checks() {
        let file = write_f32(&[("w", vec![2, 3], vec![0.0; 6])]);
        let st = SafeTensorFile::open(file.path()).unwrap();
        let device = Default::default();

        let wrong_rank = st.load_f32::<TestBackend, 1>("w", &device);
        assert!(matches!(wrong_rank, Err(LoadError::ShapeMismatch { .. })));

        let wrong_shape = st.load_f32_checked::<TestBackend, 2>("w", [3, 2], &device);
        assert!(matches!(wrong_shape, Err(LoadError::ShapeMismatch { .. })));

        let missing = st.load_f32::<TestBackend, 2>("nope", &device);
        assert!(matches!(missing, Err(LoadError::TensorNotFound(_))));
    }
}
