//! Inter-stage message carrier
//!
//! A token threads one `(request, step)` through the stages: it names the
//! tensors the next stage should bind and carries their handles without
//! copies. Exactly one owner at a time: the worker running a stage, or the
//! driver once the token lands on the completion queue.

use cascade_runtime::TensorRef;
use cascade_types::ReqId;

/// Mutable carrier of `(req_id, step_id, named tensor handles, error)`.
#[derive(Debug, Default)]
pub struct Token {
    pub req_id: ReqId,
    pub step_id: usize,
    /// Parallel with `values`
    pub value_names: Vec<String>,
    pub values: Vec<TensorRef>,
    /// Set by the worker wrapper when stage execution failed
    pub error_msg: Option<String>,
}

impl Token {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset all four fields at once.
    pub fn init(
        &mut self,
        req_id: ReqId,
        step_id: usize,
        value_names: Vec<String>,
        values: Vec<TensorRef>,
    ) {
        self.req_id = req_id;
        self.step_id = step_id;
        self.value_names = value_names;
        self.values = values;
        self.error_msg = None;
    }

    /// Drop the carried names, values, and error.
    pub fn clear(&mut self) {
        self.value_names.clear();
        self.values.clear();
        self.error_msg = None;
    }

    /// Index of `name` among the carried values.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.value_names.iter().position(|n| n == name)
    }

    /// The carried value under `name`, if present.
    pub fn value(&self, name: &str) -> Option<&TensorRef> {
        self.position(name).map(|idx| &self.values[idx])
    }
}
