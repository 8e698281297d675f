//! Tensor handle abstraction
//!
//! A [`TensorValue`] is an opaque handle to a tensor owned by the backing
//! runtime: it knows its shape and element type, and host-accessible
//! tensors can surface their bytes for the scheduler (the driver reads
//! logits this way). Device-resident tensors stay opaque; the scheduler
//! only moves their handles around.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use cascade_types::{CascadeError, ElementType, Result};

/// Opaque, device-aware tensor handle.
pub trait TensorValue: Send + Sync + fmt::Debug {
    /// Concrete dimensions of this tensor
    fn shape(&self) -> &[i64];

    /// Element type
    fn dtype(&self) -> ElementType;

    /// Whether [`read_bytes`](Self::read_bytes) can succeed
    fn is_host_accessible(&self) -> bool;

    /// Copy out the tensor contents. Fails for device-resident tensors.
    fn read_bytes(&self) -> Result<Vec<u8>>;

    /// Downcast hook for runtime-specific access
    fn as_any(&self) -> &dyn Any;

    /// Total number of elements
    fn numel(&self) -> usize {
        self.shape().iter().map(|&d| d.max(0) as usize).product()
    }

    /// Total size in bytes
    fn size_bytes(&self) -> usize {
        self.numel() * self.dtype().size_bytes()
    }
}

/// Reference-counted tensor handle
pub type TensorRef = Arc<dyn TensorValue>;

/// Validate that `dims` are concrete (no dynamic/negative entries) and
/// return the byte size of a tensor of that shape, guarding the
/// multiplication against overflow.
pub fn byte_size_of(dims: &[i64], dtype: ElementType) -> Result<usize> {
    let mut total = dtype.size_bytes();
    for &d in dims {
        if d < 0 {
            return Err(CascadeError::config(format!(
                "cannot size a buffer over non-concrete dim {d} in shape {dims:?}"
            )));
        }
        total = total.checked_mul(d as usize).ok_or_else(|| {
            CascadeError::config(format!("buffer size overflows usize for shape {dims:?}"))
        })?;
    }
    Ok(total)
}
