//! Runtime contract for the Cascade pipeline
//!
//! The scheduler core never talks to a concrete inference runtime; it goes
//! through the object-safe traits defined here: compiled model sessions,
//! IO bindings, device allocators, device memory, and tensor handles. A
//! production deployment implements these over its runtime of choice; the
//! [`stub`] module ships a deterministic CPU implementation used by tests
//! and development.
//!
//! Handle semantics throughout: tensors and device memory are shared as
//! `Arc<dyn …>`, and a tensor view over device memory keeps its backing
//! allocation alive by holding a clone of the allocation handle.

pub mod host;
pub mod memory;
pub mod request;
pub mod session;
pub mod stub;
pub mod tensor;

pub use host::HostTensor;
pub use memory::{DeviceAllocator, DeviceMemory, DeviceMemoryRef, MemoryDescriptor};
pub use request::{PipelineRequest, PipelineResponse};
pub use session::{InferenceRuntime, IoBinding, ModelSession, TensorTypeInfo};
pub use tensor::{TensorRef, TensorValue};

// Re-export the shared leaf types alongside the contract.
pub use cascade_types::{CascadeError, Device, ElementType, Result};
