//! Device memory descriptors, allocations, and allocators

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use cascade_types::{Device, Result};

/// Describes where a piece of memory lives.
///
/// Mirrors the runtime's memory-info object: enough identity for the
/// runtime to bind an output "to device" and allocate there itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryDescriptor {
    pub device: Device,
}

impl MemoryDescriptor {
    pub fn cpu() -> Self {
        Self { device: Device::Cpu }
    }

    pub fn cuda(device_id: u32) -> Self {
        Self {
            device: Device::Cuda(device_id),
        }
    }

    pub fn is_host(&self) -> bool {
        self.device == Device::Cpu
    }
}

impl fmt::Display for MemoryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.device)
    }
}

/// One device allocation. Dropped when the last handle goes away.
pub trait DeviceMemory: Send + Sync + fmt::Debug {
    /// Allocation size in bytes
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Downcast hook for runtime-specific access
    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a device allocation
pub type DeviceMemoryRef = Arc<dyn DeviceMemory>;

/// Allocator scoped to one device.
pub trait DeviceAllocator: Send + Sync {
    /// Allocate `bytes` of device memory
    fn allocate(&self, bytes: usize) -> Result<DeviceMemoryRef>;

    /// Descriptor of the memory this allocator hands out
    fn descriptor(&self) -> &MemoryDescriptor;
}
