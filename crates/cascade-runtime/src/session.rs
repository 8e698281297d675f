//! Compiled model sessions, IO bindings, and the runtime entry point

use std::any::Any;
use std::sync::Arc;

use cascade_types::{ElementType, Result};

use crate::memory::{DeviceAllocator, DeviceMemoryRef, MemoryDescriptor};
use crate::tensor::TensorRef;

/// Declared type and shape of one session input or output.
///
/// Dims use `-1` for dynamic dimensions, the runtime convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorTypeInfo {
    pub dims: Vec<i64>,
    pub dtype: ElementType,
}

impl TensorTypeInfo {
    pub fn new(dims: Vec<i64>, dtype: ElementType) -> Self {
        Self { dims, dtype }
    }
}

/// Names a session's inputs and outputs with concrete tensors before a run.
///
/// Outputs can be bound either to a caller-provided tensor view or "to
/// device": the runtime then allocates the output itself in the described
/// memory and surfaces it through [`output_values`](Self::output_values).
pub trait IoBinding: Send {
    fn bind_input(&mut self, name: &str, value: TensorRef) -> Result<()>;

    fn bind_output(&mut self, name: &str, value: TensorRef) -> Result<()>;

    fn bind_output_to_device(&mut self, name: &str, descriptor: &MemoryDescriptor) -> Result<()>;

    fn clear_bound_inputs(&mut self);

    fn clear_bound_outputs(&mut self);

    /// Output tensors after a run, in the order the outputs were bound.
    fn output_values(&self) -> Result<Vec<TensorRef>>;

    /// Downcast hook so a runtime can recover its concrete binding type
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// One compiled model pinned to a device.
///
/// Implementations must support concurrent [`run`](Self::run) calls with
/// distinct IO bindings; the scheduler relies on this when two requests
/// execute the same stage on different worker threads.
pub trait ModelSession: Send + Sync {
    /// Input names in declaration order
    fn input_names(&self) -> &[String];

    /// Output names in declaration order
    fn output_names(&self) -> &[String];

    fn input_type_info(&self, name: &str) -> Result<TensorTypeInfo>;

    fn output_type_info(&self, name: &str) -> Result<TensorTypeInfo>;

    /// Descriptor of this session's device memory
    fn memory_descriptor(&self) -> &MemoryDescriptor;

    /// Allocator for this session's device
    fn allocator(&self) -> Result<Arc<dyn DeviceAllocator>>;

    fn create_io_binding(&self) -> Result<Box<dyn IoBinding>>;

    /// Execute the model synchronously with the given binding.
    fn run(&self, binding: &mut dyn IoBinding) -> Result<()>;
}

/// Entry point to the backing inference runtime.
pub trait InferenceRuntime: Send + Sync {
    /// Open a compiled model with an execution provider on `device_id`.
    fn load_session(&self, model_file_path: &str, device_id: u32) -> Result<Arc<dyn ModelSession>>;

    /// Pin the calling thread to `device_id`. Workers call this before
    /// binding or running because threads drift across devices between
    /// invocations.
    fn set_current_device(&self, device_id: u32) -> Result<()>;

    /// Construct a tensor view over externally owned device memory.
    ///
    /// The view must fit inside the allocation; the tensor holds a clone of
    /// the allocation handle so the memory outlives the view.
    fn tensor_from_memory(
        &self,
        descriptor: &MemoryDescriptor,
        memory: DeviceMemoryRef,
        dims: &[i64],
        dtype: ElementType,
    ) -> Result<TensorRef>;
}
