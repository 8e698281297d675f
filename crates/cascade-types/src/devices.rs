//! Device identity and tensor element types

use serde::{Deserialize, Serialize};

/// Device a tensor or session lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    /// Host (CPU) memory
    Cpu,
    /// CUDA device with device index
    Cuda(u32),
}

impl Device {
    pub fn is_gpu(&self) -> bool {
        matches!(self, Device::Cuda(_))
    }

    /// Device index for GPU devices
    pub fn index(&self) -> Option<u32> {
        match self {
            Device::Cuda(idx) => Some(*idx),
            Device::Cpu => None,
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(idx) => write!(f, "cuda:{}", idx),
        }
    }
}

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    /// 32-bit floating point
    FP32,
    /// 16-bit floating point (IEEE 754)
    FP16,
    /// 16-bit brain floating point
    BF16,
    /// 64-bit signed integer (token ids, positions)
    INT64,
    /// 32-bit signed integer
    INT32,
    /// 8-bit signed integer
    INT8,
    /// 8-bit unsigned integer
    UINT8,
    /// Boolean
    BOOL,
}

impl ElementType {
    /// Size in bytes of one element
    pub fn size_bytes(&self) -> usize {
        match self {
            ElementType::INT64 => 8,
            ElementType::FP32 | ElementType::INT32 => 4,
            ElementType::FP16 | ElementType::BF16 => 2,
            ElementType::INT8 | ElementType::UINT8 | ElementType::BOOL => 1,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(
            self,
            ElementType::FP32 | ElementType::FP16 | ElementType::BF16
        )
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ElementType::FP32 => "fp32",
            ElementType::FP16 => "fp16",
            ElementType::BF16 => "bf16",
            ElementType::INT64 => "int64",
            ElementType::INT32 => "int32",
            ElementType::INT8 => "int8",
            ElementType::UINT8 => "uint8",
            ElementType::BOOL => "bool",
        };
        write!(f, "{}", name)
    }
}
