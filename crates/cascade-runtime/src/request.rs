//! Caller-facing request and response value types

use cascade_types::{CascadeError, Result};

use crate::memory::MemoryDescriptor;
use crate::tensor::TensorRef;

/// One inference request: parallel names and values for the stage-0 inputs.
/// The values are moved into the pipeline at admission.
#[derive(Debug)]
pub struct PipelineRequest {
    pub input_names: Vec<String>,
    pub input_values: Vec<TensorRef>,
}

impl PipelineRequest {
    pub fn new(input_names: Vec<String>, input_values: Vec<TensorRef>) -> Self {
        Self {
            input_names,
            input_values,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_names.len() != self.input_values.len() {
            return Err(CascadeError::request(format!(
                "request has {} input names but {} input values",
                self.input_names.len(),
                self.input_values.len()
            )));
        }
        Ok(())
    }
}

/// Response slots for one request.
///
/// Each requested output name is paired with an optional preallocated
/// tensor and an optional memory descriptor. When the descriptor is set
/// the runtime allocates the output there itself; otherwise the
/// preallocated tensor receives the result.
#[derive(Debug)]
pub struct PipelineResponse {
    pub output_names: Vec<String>,
    pub output_values: Vec<Option<TensorRef>>,
    pub output_descriptors: Vec<Option<MemoryDescriptor>>,
}

impl PipelineResponse {
    /// Response with empty slots for the given output names.
    pub fn new(output_names: Vec<String>) -> Self {
        let n = output_names.len();
        Self {
            output_names,
            output_values: vec![None; n],
            output_descriptors: vec![None; n],
        }
    }

    /// Ask the runtime to allocate the named output in the given memory.
    pub fn with_output_descriptor(mut self, name: &str, descriptor: MemoryDescriptor) -> Self {
        if let Some(idx) = self.output_names.iter().position(|n| n == name) {
            self.output_descriptors[idx] = Some(descriptor);
        }
        self
    }

    /// Supply a preallocated tensor for the named output.
    pub fn with_output_value(mut self, name: &str, value: TensorRef) -> Self {
        if let Some(idx) = self.output_names.iter().position(|n| n == name) {
            self.output_values[idx] = Some(value);
        }
        self
    }

    /// The filled slot for `name`, if the pipeline produced it.
    pub fn output(&self, name: &str) -> Option<&TensorRef> {
        self.output_names
            .iter()
            .position(|n| n == name)
            .and_then(|idx| self.output_values[idx].as_ref())
    }

    pub fn validate(&self) -> Result<()> {
        if self.output_values.len() != self.output_names.len()
            || self.output_descriptors.len() != self.output_names.len()
        {
            return Err(CascadeError::request(
                "response output names, values, and descriptors must be parallel",
            ));
        }
        Ok(())
    }
}
