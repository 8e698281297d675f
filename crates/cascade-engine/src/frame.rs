//! Per-request execution frame
//!
//! A frame lives from admission to final response emission and owns every
//! per-request resource: one `RunState` per stage with the IO binding, the
//! device allocator, and the preallocated buffers.
//!
//! Each KV state gets two rotating device buffers sized for
//! `(batch_size, max_seq_len, …)`. On a given step the state input is read
//! from buffer 1 if the step is odd and buffer 2 if it is even, and the
//! state output is written to the other. This rules out read/write
//! aliasing within a step and makes the past→present hand-off free: the
//! produced view simply becomes next step's input.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use cascade_runtime::tensor::byte_size_of;
use cascade_runtime::{
    DeviceAllocator, DeviceMemoryRef, InferenceRuntime, IoBinding, MemoryDescriptor,
    ModelSession, PipelineResponse, TensorRef,
};
use cascade_types::{CascadeError, PipelineConfig, ReqId, Result, StageConfig};

use crate::session::StageSession;
use crate::token::Token;

/// Per-stage, per-request execution state.
pub struct RunState {
    pub(crate) io_binding: Box<dyn IoBinding>,
    #[allow(dead_code)] // holds the device allocator for the frame's lifetime
    pub(crate) allocator: Arc<dyn DeviceAllocator>,
    /// Rotating state buffers, one pair per past/present state
    pub(crate) state_buffers_1: Vec<DeviceMemoryRef>,
    pub(crate) state_buffers_2: Vec<DeviceMemoryRef>,
    /// Preallocated buffers for forward activations (absent on the last stage)
    pub(crate) inter_stage_buffers: HashMap<String, DeviceMemoryRef>,
    /// Current contents of each present output; the seq-len dim starts at 0
    /// and grows as steps complete
    pub(crate) state_values: HashMap<String, TensorRef>,
}

impl std::fmt::Debug for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunState").finish_non_exhaustive()
    }
}

/// Frame-owned copy of one caller response slot.
#[derive(Debug, Clone)]
pub(crate) struct ResponseSlot {
    pub(crate) name: String,
    pub(crate) descriptor: Option<MemoryDescriptor>,
    pub(crate) value: Option<TensorRef>,
}

/// Scheduling and preallocation context for one in-flight request.
#[derive(Debug)]
pub struct RequestExecutionFrame {
    pub(crate) req_index: usize,
    pub(crate) req_id: ReqId,
    pub(crate) batch_size: i64,
    pub(crate) orig_input_seq_len: i64,
    /// Stage the request is currently in; advanced by the driver
    pub(crate) stage_id: usize,
    pub(crate) response_slots: Vec<ResponseSlot>,
    /// Resident token, reused to report worker failures
    pub(crate) token: Token,
    pub(crate) run_states: Vec<RunState>,
}

impl RequestExecutionFrame {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: &PipelineConfig,
        stages: &[Arc<StageSession>],
        runtime: &dyn InferenceRuntime,
        req_index: usize,
        req_id: ReqId,
        batch_size: i64,
        orig_input_seq_len: i64,
        response: &PipelineResponse,
    ) -> Result<Self> {
        debug!(%req_id, req_index, batch_size, orig_input_seq_len, "constructing execution frame");

        let mut run_states = Vec::with_capacity(config.num_stages());
        for (idx, mcfg) in config.stages.iter().enumerate() {
            let is_last = idx + 1 == config.num_stages();
            run_states.push(build_run_state(
                config, mcfg, &stages[idx], runtime, batch_size, is_last,
            )?);
        }

        let response_slots = response
            .output_names
            .iter()
            .enumerate()
            .map(|(i, name)| ResponseSlot {
                name: name.clone(),
                descriptor: response.output_descriptors[i].clone(),
                value: response.output_values[i].clone(),
            })
            .collect();

        Ok(Self {
            req_index,
            req_id,
            batch_size,
            orig_input_seq_len,
            stage_id: 0,
            response_slots,
            token: Token::new(),
            run_states,
        })
    }
}

fn build_run_state(
    config: &PipelineConfig,
    mcfg: &StageConfig,
    stage: &StageSession,
    runtime: &dyn InferenceRuntime,
    batch_size: i64,
    is_last: bool,
) -> Result<RunState> {
    let allocator = stage.session.allocator()?;

    // All states of one stage share shape layout and element type, so the
    // first declared past input sizes every pair. The element type comes
    // from the session's declared state type, not from an assumption.
    let first_past = mcfg.past_input_names.first().ok_or_else(|| {
        CascadeError::config(format!(
            "stage {}: no past/present state pairs declared",
            mcfg.model_name
        ))
    })?;
    let state_info = stage.session.input_type_info(first_past)?;
    let state_dtype = state_info.dtype;
    let mut state_shape = state_info.dims;
    override_dim(
        &mut state_shape,
        mcfg.batch_dim_index_in_state,
        batch_size,
        "state batch",
        &mcfg.model_name,
    )?;
    override_dim(
        &mut state_shape,
        mcfg.seq_len_dim_index_in_state,
        config.max_seq_len as i64,
        "state seq-len",
        &mcfg.model_name,
    )?;
    let state_bytes = byte_size_of(&state_shape, state_dtype)?;

    let mut state_buffers_1 = Vec::with_capacity(mcfg.past_input_names.len());
    let mut state_buffers_2 = Vec::with_capacity(mcfg.past_input_names.len());
    for _ in &mcfg.past_input_names {
        state_buffers_1.push(allocator.allocate(state_bytes)?);
        state_buffers_2.push(allocator.allocate(state_bytes)?);
    }

    // Initial state views carry seq-len 0: the first run has no past to
    // feed. They deliberately sit over buffer 1 so that step 0 (even)
    // reads buffer 1 and writes buffer 2.
    let mut init_shape = state_shape.clone();
    init_shape[mcfg.seq_len_dim_index_in_state] = 0;
    let mut state_values = HashMap::new();
    for (j, oname) in mcfg.present_output_names.iter().enumerate() {
        let view = runtime.tensor_from_memory(
            &stage.memory,
            Arc::clone(&state_buffers_1[j]),
            &init_shape,
            state_dtype,
        )?;
        state_values.insert(oname.clone(), view);
    }

    // Allocating inter-stage activations on every step would be wasteful;
    // give each forwarded output one buffer sized for max_seq_len. The
    // last stage forwards nothing.
    let mut inter_stage_buffers = HashMap::new();
    if !is_last {
        for oname in mcfg.inter_stage_output_input_map.keys() {
            let out_info = stage.session.output_type_info(oname)?;
            let mut shape = out_info.dims;
            override_dim(
                &mut shape,
                mcfg.batch_dim_in_inter_stage_output,
                batch_size,
                "inter-stage batch",
                &mcfg.model_name,
            )?;
            override_dim(
                &mut shape,
                mcfg.seq_len_dim_in_inter_stage_output,
                config.max_seq_len as i64,
                "inter-stage seq-len",
                &mcfg.model_name,
            )?;
            let bytes = byte_size_of(&shape, state_dtype)?;
            inter_stage_buffers.insert(oname.clone(), allocator.allocate(bytes)?);
        }
    }

    let io_binding = stage.session.create_io_binding()?;

    Ok(RunState {
        io_binding,
        allocator,
        state_buffers_1,
        state_buffers_2,
        inter_stage_buffers,
        state_values,
    })
}

fn override_dim(
    dims: &mut [i64],
    idx: usize,
    value: i64,
    what: &str,
    stage: &str,
) -> Result<()> {
    match dims.get_mut(idx) {
        Some(d) => {
            *d = value;
            Ok(())
        }
        None => Err(CascadeError::config(format!(
            "stage {stage}: {what} dim index {idx} out of range for rank-{} shape",
            dims.len()
        ))),
    }
}
