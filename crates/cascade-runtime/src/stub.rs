//! Deterministic CPU stub of the runtime contract
//!
//! The stub simulates compiled sessions, device allocations, and IO
//! bindings entirely in host memory so the scheduler can be exercised
//! without GPUs or model files. "Models" are registered up front under
//! their file path; each carries declared input/output specs and a compute
//! closure that the stub invokes on [`ModelSession::run`].
//!
//! "Device" allocations are host-backed and inspectable, which lets tests
//! observe buffer identity and contents that a real runtime would keep
//! opaque.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use half::f16;
use parking_lot::Mutex;
use tracing::debug;

use cascade_types::{CascadeError, ElementType, Result};

use crate::host::HostTensor;
use crate::memory::{DeviceAllocator, DeviceMemory, DeviceMemoryRef, MemoryDescriptor};
use crate::session::{InferenceRuntime, IoBinding, ModelSession, TensorTypeInfo};
use crate::tensor::{byte_size_of, TensorRef, TensorValue};

// ── Model registration ───────────────────────────────────────────────────

/// Declared input or output of a stub model. Dims use `-1` for dynamic.
#[derive(Debug, Clone)]
pub struct StubIoSpec {
    pub name: String,
    pub dims: Vec<i64>,
    pub dtype: ElementType,
}

impl StubIoSpec {
    pub fn new(name: impl Into<String>, dims: Vec<i64>, dtype: ElementType) -> Self {
        Self {
            name: name.into(),
            dims,
            dtype,
        }
    }
}

/// Compute behavior invoked on every `run`.
pub type ComputeFn = Arc<dyn Fn(&mut StubComputeCtx<'_>) -> Result<()> + Send + Sync>;

/// A registered stub model: IO declarations plus compute behavior.
#[derive(Clone)]
pub struct StubModel {
    inputs: Vec<StubIoSpec>,
    outputs: Vec<StubIoSpec>,
    compute: ComputeFn,
}

impl StubModel {
    pub fn new(inputs: Vec<StubIoSpec>, outputs: Vec<StubIoSpec>, compute: ComputeFn) -> Self {
        Self {
            inputs,
            outputs,
            compute,
        }
    }
}

// ── Runtime ──────────────────────────────────────────────────────────────

/// Stub implementation of [`InferenceRuntime`].
pub struct StubRuntime {
    models: Mutex<HashMap<String, StubModel>>,
    run_log: Arc<Mutex<Vec<String>>>,
    device_log: Mutex<Vec<u32>>,
}

impl StubRuntime {
    pub fn new() -> Self {
        Self {
            models: Mutex::new(HashMap::new()),
            run_log: Arc::new(Mutex::new(Vec::new())),
            device_log: Mutex::new(Vec::new()),
        }
    }

    /// Register a model under the file path sessions will be loaded from.
    pub fn register_model(&self, path: impl Into<String>, model: StubModel) {
        self.models.lock().insert(path.into(), model);
    }

    /// Total number of `run` calls across all sessions.
    pub fn run_count(&self) -> usize {
        self.run_log.lock().len()
    }

    /// Model path per `run` call, in order.
    pub fn run_log(&self) -> Vec<String> {
        self.run_log.lock().clone()
    }

    /// Device id per `set_current_device` call, in order.
    pub fn device_log(&self) -> Vec<u32> {
        self.device_log.lock().clone()
    }
}

impl Default for StubRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceRuntime for StubRuntime {
    fn load_session(&self, model_file_path: &str, device_id: u32) -> Result<Arc<dyn ModelSession>> {
        let model = self
            .models
            .lock()
            .get(model_file_path)
            .cloned()
            .ok_or_else(|| {
                CascadeError::runtime(format!("no stub model registered at '{model_file_path}'"))
            })?;
        debug!(path = model_file_path, device_id, "loading stub session");
        Ok(Arc::new(StubSession::new(
            model_file_path.to_string(),
            device_id,
            model,
            Arc::clone(&self.run_log),
        )))
    }

    fn set_current_device(&self, device_id: u32) -> Result<()> {
        self.device_log.lock().push(device_id);
        Ok(())
    }

    fn tensor_from_memory(
        &self,
        descriptor: &MemoryDescriptor,
        memory: DeviceMemoryRef,
        dims: &[i64],
        dtype: ElementType,
    ) -> Result<TensorRef> {
        let needed = byte_size_of(dims, dtype)?;
        if needed > memory.len() {
            return Err(CascadeError::runtime(format!(
                "tensor view of {needed} bytes exceeds {}-byte allocation",
                memory.len()
            )));
        }
        Ok(Arc::new(StubDeviceTensor {
            memory,
            dims: dims.to_vec(),
            dtype,
            descriptor: descriptor.clone(),
        }))
    }
}

// ── Memory ───────────────────────────────────────────────────────────────

/// Host-backed "device" allocation.
#[derive(Debug)]
pub struct StubAllocation {
    data: Mutex<Vec<u8>>,
}

impl StubAllocation {
    fn new(bytes: usize) -> Self {
        Self {
            data: Mutex::new(vec![0; bytes]),
        }
    }

    fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }

    fn write_prefix(&self, bytes: &[u8]) -> Result<()> {
        let mut data = self.data.lock();
        if bytes.len() > data.len() {
            return Err(CascadeError::runtime(format!(
                "write of {} bytes exceeds {}-byte allocation",
                bytes.len(),
                data.len()
            )));
        }
        data[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn read_prefix(&self, len: usize) -> Result<Vec<u8>> {
        let data = self.data.lock();
        if len > data.len() {
            return Err(CascadeError::runtime(format!(
                "read of {len} bytes exceeds {}-byte allocation",
                data.len()
            )));
        }
        Ok(data[..len].to_vec())
    }
}

impl DeviceMemory for StubAllocation {
    fn len(&self) -> usize {
        self.data.lock().len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Allocator handing out [`StubAllocation`]s for one device.
pub struct StubAllocator {
    descriptor: MemoryDescriptor,
}

impl DeviceAllocator for StubAllocator {
    fn allocate(&self, bytes: usize) -> Result<DeviceMemoryRef> {
        Ok(Arc::new(StubAllocation::new(bytes)))
    }

    fn descriptor(&self) -> &MemoryDescriptor {
        &self.descriptor
    }
}

// ── Tensors ──────────────────────────────────────────────────────────────

/// Tensor view over a stub allocation.
#[derive(Debug, Clone)]
pub struct StubDeviceTensor {
    memory: DeviceMemoryRef,
    dims: Vec<i64>,
    dtype: ElementType,
    descriptor: MemoryDescriptor,
}

impl StubDeviceTensor {
    /// Backing allocation handle; tests use this for identity checks.
    pub fn memory(&self) -> &DeviceMemoryRef {
        &self.memory
    }

    pub fn descriptor(&self) -> &MemoryDescriptor {
        &self.descriptor
    }

    fn allocation(&self) -> Result<&StubAllocation> {
        self.memory
            .as_any()
            .downcast_ref::<StubAllocation>()
            .ok_or_else(|| CascadeError::runtime("stub tensor over foreign device memory"))
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        self.allocation()?.write_prefix(bytes)
    }
}

impl TensorValue for StubDeviceTensor {
    fn shape(&self) -> &[i64] {
        &self.dims
    }

    fn dtype(&self) -> ElementType {
        self.dtype
    }

    // Stub "device" memory is host-backed.
    fn is_host_accessible(&self) -> bool {
        true
    }

    fn read_bytes(&self) -> Result<Vec<u8>> {
        self.allocation()?.read_prefix(self.size_bytes())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ── Session and binding ──────────────────────────────────────────────────

enum OutputBinding {
    Value(TensorRef),
    Device(MemoryDescriptor),
}

/// IO binding for stub sessions.
#[derive(Default)]
pub struct StubIoBinding {
    inputs: Vec<(String, TensorRef)>,
    outputs: Vec<(String, OutputBinding)>,
    produced: HashMap<String, TensorRef>,
}

impl StubIoBinding {
    fn upsert_output(&mut self, name: &str, binding: OutputBinding) {
        if let Some(entry) = self.outputs.iter_mut().find(|(n, _)| n == name) {
            entry.1 = binding;
        } else {
            self.outputs.push((name.to_string(), binding));
        }
    }
}

impl IoBinding for StubIoBinding {
    fn bind_input(&mut self, name: &str, value: TensorRef) -> Result<()> {
        if let Some(entry) = self.inputs.iter_mut().find(|(n, _)| n == name) {
            entry.1 = value;
        } else {
            self.inputs.push((name.to_string(), value));
        }
        Ok(())
    }

    fn bind_output(&mut self, name: &str, value: TensorRef) -> Result<()> {
        self.upsert_output(name, OutputBinding::Value(value));
        Ok(())
    }

    fn bind_output_to_device(&mut self, name: &str, descriptor: &MemoryDescriptor) -> Result<()> {
        self.upsert_output(name, OutputBinding::Device(descriptor.clone()));
        Ok(())
    }

    fn clear_bound_inputs(&mut self) {
        self.inputs.clear();
    }

    fn clear_bound_outputs(&mut self) {
        self.outputs.clear();
        self.produced.clear();
    }

    fn output_values(&self) -> Result<Vec<TensorRef>> {
        self.outputs
            .iter()
            .map(|(name, binding)| match binding {
                OutputBinding::Value(t) => Ok(Arc::clone(t)),
                OutputBinding::Device(_) => {
                    self.produced.get(name).cloned().ok_or_else(|| {
                        CascadeError::runtime(format!("output '{name}' was not produced"))
                    })
                }
            })
            .collect()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// One loaded stub model pinned to a (simulated) device.
pub struct StubSession {
    path: String,
    model: StubModel,
    input_names: Vec<String>,
    output_names: Vec<String>,
    descriptor: MemoryDescriptor,
    allocator: Arc<StubAllocator>,
    run_log: Arc<Mutex<Vec<String>>>,
}

impl StubSession {
    fn new(
        path: String,
        device_id: u32,
        model: StubModel,
        run_log: Arc<Mutex<Vec<String>>>,
    ) -> Self {
        let descriptor = MemoryDescriptor::cuda(device_id);
        Self {
            input_names: model.inputs.iter().map(|s| s.name.clone()).collect(),
            output_names: model.outputs.iter().map(|s| s.name.clone()).collect(),
            allocator: Arc::new(StubAllocator {
                descriptor: descriptor.clone(),
            }),
            descriptor,
            path,
            model,
            run_log,
        }
    }

    fn find_spec(specs: &[StubIoSpec], kind: &str, name: &str, path: &str) -> Result<TensorTypeInfo> {
        specs
            .iter()
            .find(|s| s.name == name)
            .map(|s| TensorTypeInfo::new(s.dims.clone(), s.dtype))
            .ok_or_else(|| {
                CascadeError::runtime(format!("session '{path}' has no {kind} named '{name}'"))
            })
    }
}

impl ModelSession for StubSession {
    fn input_names(&self) -> &[String] {
        &self.input_names
    }

    fn output_names(&self) -> &[String] {
        &self.output_names
    }

    fn input_type_info(&self, name: &str) -> Result<TensorTypeInfo> {
        Self::find_spec(&self.model.inputs, "input", name, &self.path)
    }

    fn output_type_info(&self, name: &str) -> Result<TensorTypeInfo> {
        Self::find_spec(&self.model.outputs, "output", name, &self.path)
    }

    fn memory_descriptor(&self) -> &MemoryDescriptor {
        &self.descriptor
    }

    fn allocator(&self) -> Result<Arc<dyn DeviceAllocator>> {
        Ok(Arc::clone(&self.allocator) as Arc<dyn DeviceAllocator>)
    }

    fn create_io_binding(&self) -> Result<Box<dyn IoBinding>> {
        Ok(Box::<StubIoBinding>::default())
    }

    fn run(&self, binding: &mut dyn IoBinding) -> Result<()> {
        let binding = binding
            .as_any_mut()
            .downcast_mut::<StubIoBinding>()
            .ok_or_else(|| CascadeError::runtime("stub session given a foreign IO binding"))?;
        self.run_log.lock().push(self.path.clone());

        let mut ctx = StubComputeCtx {
            inputs: &binding.inputs,
            outputs: &binding.outputs,
            produced: &mut binding.produced,
            specs: &self.model.outputs,
            descriptor: &self.descriptor,
        };
        (self.model.compute)(&mut ctx)
    }
}

// ── Compute context ──────────────────────────────────────────────────────

/// View of one `run` handed to a model's compute closure.
pub struct StubComputeCtx<'a> {
    inputs: &'a [(String, TensorRef)],
    outputs: &'a [(String, OutputBinding)],
    produced: &'a mut HashMap<String, TensorRef>,
    specs: &'a [StubIoSpec],
    descriptor: &'a MemoryDescriptor,
}

impl StubComputeCtx<'_> {
    pub fn input(&self, name: &str) -> Result<&TensorRef> {
        self.inputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t)
            .ok_or_else(|| CascadeError::runtime(format!("input '{name}' is not bound")))
    }

    pub fn input_i64s(&self, name: &str) -> Result<Vec<i64>> {
        let bytes = self.input(name)?.read_bytes()?;
        Ok(bytes
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes(c.try_into().unwrap_or_default()))
            .collect())
    }

    pub fn input_f16s(&self, name: &str) -> Result<Vec<f16>> {
        let bytes = self.input(name)?.read_bytes()?;
        Ok(bytes
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]))
            .collect())
    }

    /// Shape the scheduler bound for a value-bound output, if any.
    pub fn bound_output_shape(&self, name: &str) -> Option<Vec<i64>> {
        self.outputs.iter().find(|(n, _)| n == name).and_then(|(_, b)| match b {
            OutputBinding::Value(t) => Some(t.shape().to_vec()),
            OutputBinding::Device(_) => None,
        })
    }

    /// Materialize an output: write through a value-bound view, or allocate
    /// the tensor for a device-bound output.
    pub fn produce(&mut self, name: &str, dims: &[i64], bytes: Vec<u8>) -> Result<()> {
        let spec = self
            .specs
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| CascadeError::runtime(format!("no declared output '{name}'")))?;
        let expected = byte_size_of(dims, spec.dtype)?;
        if bytes.len() != expected {
            return Err(CascadeError::runtime(format!(
                "output '{name}' of shape {dims:?} needs {expected} bytes, got {}",
                bytes.len()
            )));
        }

        let binding = self
            .outputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, b)| b)
            .ok_or_else(|| CascadeError::runtime(format!("output '{name}' is not bound")))?;

        match binding {
            OutputBinding::Value(t) => {
                if t.shape() != dims {
                    return Err(CascadeError::runtime(format!(
                        "output '{name}' bound with shape {:?} but produced as {dims:?}",
                        t.shape()
                    )));
                }
                if let Some(dev) = t.as_any().downcast_ref::<StubDeviceTensor>() {
                    dev.write(&bytes)
                } else if let Some(host) = t.as_any().downcast_ref::<HostTensor>() {
                    host.write_bytes(&bytes)
                } else {
                    Err(CascadeError::runtime(format!(
                        "cannot write output '{name}' into a foreign tensor"
                    )))
                }
            }
            OutputBinding::Device(descriptor) => {
                let tensor: TensorRef = if descriptor.is_host() {
                    Arc::new(HostTensor::new(dims.to_vec(), spec.dtype, bytes)?)
                } else {
                    Arc::new(StubDeviceTensor {
                        memory: Arc::new(StubAllocation::from_vec(bytes)),
                        dims: dims.to_vec(),
                        dtype: spec.dtype,
                        descriptor: self.descriptor.clone(),
                    })
                };
                self.produced.insert(name.to_string(), tensor);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_runtime() -> StubRuntime {
        let runtime = StubRuntime::new();
        let compute: ComputeFn = Arc::new(|ctx| {
            let x = ctx.input("x")?;
            let shape = x.shape().to_vec();
            let bytes = x.read_bytes()?;
            ctx.produce("y", &shape, bytes)
        });
        runtime.register_model(
            "echo.onnx",
            StubModel::new(
                vec![StubIoSpec::new("x", vec![-1], ElementType::INT64)],
                vec![StubIoSpec::new("y", vec![-1], ElementType::INT64)],
                compute,
            ),
        );
        runtime
    }

    #[test]
    fn unknown_model_path_fails() {
        let runtime = StubRuntime::new();
        assert!(runtime.load_session("missing.onnx", 0).is_err());
    }

    #[test]
    fn device_bound_output_round_trips() {
        let runtime = echo_runtime();
        let session = runtime.load_session("echo.onnx", 0).unwrap();
        assert_eq!(session.input_names(), ["x".to_string()]);

        let mut binding = session.create_io_binding().unwrap();
        let input = HostTensor::from_i64s(vec![3], &[7, 8, 9]).unwrap().into_ref();
        binding.bind_input("x", input).unwrap();
        binding
            .bind_output_to_device("y", &MemoryDescriptor::cpu())
            .unwrap();

        session.run(binding.as_mut()).unwrap();
        let outputs = binding.output_values().unwrap();
        assert_eq!(outputs.len(), 1);
        let host = outputs[0].as_any().downcast_ref::<HostTensor>().unwrap();
        assert_eq!(host.i64_values().unwrap(), vec![7, 8, 9]);
        assert_eq!(runtime.run_count(), 1);
        assert_eq!(runtime.run_log(), vec!["echo.onnx".to_string()]);
    }

    #[test]
    fn value_bound_output_writes_through_allocation() {
        let runtime = echo_runtime();
        let session = runtime.load_session("echo.onnx", 1).unwrap();
        let allocator = session.allocator().unwrap();
        let memory = allocator.allocate(2 * 8).unwrap();
        let view = runtime
            .tensor_from_memory(
                session.memory_descriptor(),
                Arc::clone(&memory),
                &[2],
                ElementType::INT64,
            )
            .unwrap();

        let mut binding = session.create_io_binding().unwrap();
        let input = HostTensor::from_i64s(vec![2], &[5, 6]).unwrap().into_ref();
        binding.bind_input("x", input).unwrap();
        binding.bind_output("y", Arc::clone(&view)).unwrap();

        session.run(binding.as_mut()).unwrap();
        let outputs = binding.output_values().unwrap();
        // The produced tensor is the bound view over the caller's allocation.
        let dev = outputs[0].as_any().downcast_ref::<StubDeviceTensor>().unwrap();
        assert!(Arc::ptr_eq(dev.memory(), &memory));
        let bytes = outputs[0].read_bytes().unwrap();
        assert_eq!(i64::from_le_bytes(bytes[0..8].try_into().unwrap()), 5);
    }

    #[test]
    fn view_exceeding_allocation_fails() {
        let runtime = StubRuntime::new();
        let alloc: DeviceMemoryRef = Arc::new(StubAllocation::new(4));
        let err = runtime
            .tensor_from_memory(&MemoryDescriptor::cuda(0), alloc, &[4], ElementType::INT64)
            .unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn set_current_device_is_logged() {
        let runtime = StubRuntime::new();
        runtime.set_current_device(1).unwrap();
        runtime.set_current_device(0).unwrap();
        assert_eq!(runtime.device_log(), vec![1, 0]);
    }
}
