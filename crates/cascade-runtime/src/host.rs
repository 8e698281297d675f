//! Host-memory tensors
//!
//! The driver mints `input_ids` and `position_ids` in host memory between
//! decoding steps; the runtime transfers them to the device when the next
//! stage-0 binding runs. Host tensors are also the natural carrier for
//! caller-preallocated CPU output slots, so the contents sit behind a lock:
//! the runtime writes results into them during a run.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use half::f16;
use parking_lot::Mutex;

use cascade_types::{CascadeError, ElementType, Result};

use crate::tensor::{byte_size_of, TensorRef, TensorValue};

/// CPU tensor with owned contents.
pub struct HostTensor {
    dims: Vec<i64>,
    dtype: ElementType,
    data: Mutex<Vec<u8>>,
}

impl HostTensor {
    /// Create a host tensor from raw bytes. The byte length must match the
    /// shape and element type exactly.
    pub fn new(dims: Vec<i64>, dtype: ElementType, data: Vec<u8>) -> Result<Self> {
        let expected = byte_size_of(&dims, dtype)?;
        if data.len() != expected {
            return Err(CascadeError::request(format!(
                "host tensor of shape {dims:?} ({dtype}) needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            dims,
            dtype,
            data: Mutex::new(data),
        })
    }

    /// Zero-initialized host tensor.
    pub fn zeros(dims: Vec<i64>, dtype: ElementType) -> Result<Self> {
        let bytes = byte_size_of(&dims, dtype)?;
        Ok(Self {
            dims,
            dtype,
            data: Mutex::new(vec![0; bytes]),
        })
    }

    /// Int64 tensor from a slice of values.
    pub fn from_i64s(dims: Vec<i64>, values: &[i64]) -> Result<Self> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(dims, ElementType::INT64, data)
    }

    /// Half-precision tensor from a slice of values.
    pub fn from_f16s(dims: Vec<i64>, values: &[f16]) -> Result<Self> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(dims, ElementType::FP16, data)
    }

    /// Overwrite the tensor contents. Length must match.
    pub fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        let mut data = self.data.lock();
        if bytes.len() != data.len() {
            return Err(CascadeError::runtime(format!(
                "host tensor write of {} bytes into {}-byte tensor",
                bytes.len(),
                data.len()
            )));
        }
        data.copy_from_slice(bytes);
        Ok(())
    }

    /// Decode the contents as int64 values.
    pub fn i64_values(&self) -> Result<Vec<i64>> {
        if self.dtype != ElementType::INT64 {
            return Err(CascadeError::request(format!(
                "expected int64 tensor, got {}",
                self.dtype
            )));
        }
        let data = self.data.lock();
        Ok(data
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes(c.try_into().unwrap_or_default()))
            .collect())
    }

    pub fn into_ref(self) -> TensorRef {
        Arc::new(self)
    }
}

impl TensorValue for HostTensor {
    fn shape(&self) -> &[i64] {
        &self.dims
    }

    fn dtype(&self) -> ElementType {
        self.dtype
    }

    fn is_host_accessible(&self) -> bool {
        true
    }

    fn read_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.data.lock().clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for HostTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostTensor")
            .field("dims", &self.dims)
            .field("dtype", &self.dtype)
            .field("bytes", &self.data.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_i64s_round_trips() {
        let t = HostTensor::from_i64s(vec![2, 2], &[1, 2, 3, 4]).unwrap();
        assert_eq!(t.shape(), &[2, 2]);
        assert_eq!(t.dtype(), ElementType::INT64);
        assert!(t.is_host_accessible());
        assert_eq!(t.i64_values().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn length_mismatch_rejected() {
        assert!(HostTensor::from_i64s(vec![3], &[1, 2]).is_err());
        let t = HostTensor::zeros(vec![2], ElementType::FP16).unwrap();
        assert!(t.write_bytes(&[0; 3]).is_err());
        assert!(t.write_bytes(&[1, 2, 3, 4]).is_ok());
        assert_eq!(t.read_bytes().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn f16_contents() {
        let values = [f16::from_f32(1.5), f16::from_f32(-2.0)];
        let t = HostTensor::from_f16s(vec![2], &values).unwrap();
        let bytes = t.read_bytes().unwrap();
        let decoded = f16::from_le_bytes([bytes[0], bytes[1]]);
        assert_eq!(decoded, values[0]);
    }
}
