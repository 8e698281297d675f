//! Stage worker
//!
//! One invocation processes one `(request, step, stage)`: it rebinds the
//! stage's IO, runs the session synchronously on its device, folds the
//! produced states back into the frame, and returns the outgoing token
//! carrying the renamed forward activations.
//!
//! Input resolution: a stage input either arrives in the incoming token or
//! loops back from the state saved under the parallel present output name.
//! A stage must not declare required inputs outside these two sources.

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use cascade_runtime::{InferenceRuntime, IoBinding, ModelSession, TensorValue};
use cascade_types::{CascadeError, Result, StageConfig};

use crate::frame::RequestExecutionFrame;
use crate::session::StageSession;
use crate::token::Token;

pub(crate) fn process_request(
    token: Token,
    mcfg: &StageConfig,
    stage: &StageSession,
    frame: &mut RequestExecutionFrame,
    runtime: &dyn InferenceRuntime,
) -> Result<Token> {
    let started = Instant::now();
    let stage_id = frame.stage_id;
    let batch_size = frame.batch_size;
    debug!(req_id = %token.req_id, step = token.step_id, stage = stage_id, "executing stage");

    // Worker threads drift across devices between invocations.
    runtime.set_current_device(mcfg.device_id)?;

    let Token {
        req_id,
        step_id,
        value_names: in_names,
        values: in_values,
        ..
    } = token;

    let run_state = frame
        .run_states
        .get_mut(stage_id)
        .ok_or_else(|| CascadeError::execution(format!("no run state for stage {stage_id}")))?;

    run_state.io_binding.clear_bound_inputs();
    run_state.io_binding.clear_bound_outputs();

    // Bind inputs: token values win, then looped-back state.
    for iname in &mcfg.input_names {
        if let Some(pos) = in_names.iter().position(|n| n == iname) {
            run_state
                .io_binding
                .bind_input(iname, Arc::clone(&in_values[pos]))?;
            continue;
        }
        if let Some(k) = mcfg.past_index(iname) {
            let mapped = &mcfg.present_output_names[k];
            let value = run_state.state_values.get(mapped).ok_or_else(|| {
                CascadeError::execution(format!("no saved state under '{mapped}' for input '{iname}'"))
            })?;
            run_state.io_binding.bind_input(iname, Arc::clone(value))?;
        }
    }

    // The state outputs' seq-len is the incoming seq-len plus the past
    // seq-len accumulated so far (zero on the first run).
    let seq_input_pos = in_names
        .iter()
        .position(|n| n == &mcfg.input_to_use_for_seq_len)
        .ok_or_else(|| {
            CascadeError::request(format!(
                "input '{}' required to derive the sequence length is missing",
                mcfg.input_to_use_for_seq_len
            ))
        })?;
    let input_seq_len = dim_at(
        in_values[seq_input_pos].shape(),
        mcfg.seq_len_dim_index_in_input,
        &mcfg.input_to_use_for_seq_len,
    )?;

    let first_present = &mcfg.present_output_names[0];
    let past_seq_len = {
        let state = run_state.state_values.get(first_present).ok_or_else(|| {
            CascadeError::execution(format!("no saved state under '{first_present}'"))
        })?;
        dim_at(state.shape(), mcfg.seq_len_dim_index_in_state, first_present)?
    };
    let new_seq_len = input_seq_len + past_seq_len;

    // All state outputs share one declared shape and element type.
    let state_info = stage.session.output_type_info(first_present)?;
    let state_dtype = state_info.dtype;
    let mut state_shape = state_info.dims;
    set_dim(&mut state_shape, mcfg.batch_dim_index_in_state, batch_size, first_present)?;
    set_dim(&mut state_shape, mcfg.seq_len_dim_index_in_state, new_seq_len, first_present)?;

    // Bind outputs.
    for oname in &mcfg.output_names {
        if let Some(k) = mcfg.present_index(oname) {
            // Rotate: read and write buffers must never alias within a step.
            let buffer = if step_id % 2 == 0 {
                &run_state.state_buffers_2[k]
            } else {
                &run_state.state_buffers_1[k]
            };
            let value = runtime.tensor_from_memory(
                &stage.memory,
                Arc::clone(buffer),
                &state_shape,
                state_dtype,
            )?;
            run_state.io_binding.bind_output(oname, value)?;
        } else if let Some(slot) = frame.response_slots.iter().find(|s| &s.name == oname) {
            // Caller-requested final output: the caller tells us where it
            // should land.
            if let Some(descriptor) = &slot.descriptor {
                run_state.io_binding.bind_output_to_device(oname, descriptor)?;
            } else {
                let value = slot.value.as_ref().ok_or_else(|| {
                    CascadeError::request(format!(
                        "requested output '{oname}' has neither a preallocated \
                         value nor a memory descriptor"
                    ))
                })?;
                run_state.io_binding.bind_output(oname, Arc::clone(value))?;
            }
        } else {
            // Forward activation for the next stage.
            let out_info = stage.session.output_type_info(oname)?;
            let mut shape = out_info.dims;
            set_dim(&mut shape, mcfg.batch_dim_in_inter_stage_output, batch_size, oname)?;
            set_dim(&mut shape, mcfg.seq_len_dim_in_inter_stage_output, input_seq_len, oname)?;
            let buffer = run_state.inter_stage_buffers.get(oname).ok_or_else(|| {
                CascadeError::execution(format!(
                    "no preallocated buffer for inter-stage output '{oname}'"
                ))
            })?;
            let value = runtime.tensor_from_memory(
                &stage.memory,
                Arc::clone(buffer),
                &shape,
                state_dtype,
            )?;
            run_state.io_binding.bind_output(oname, value)?;
        }
    }

    stage.session.run(run_state.io_binding.as_mut())?;

    // Fold results back: states replace the saved views (advancing the
    // past seq-len for the next step), forward activations move into the
    // outgoing token under the next stage's input name, and caller-bound
    // outputs are already in the caller's memory.
    let outputs = run_state.io_binding.output_values()?;
    if outputs.len() != mcfg.output_names.len() {
        return Err(CascadeError::execution(format!(
            "stage {} produced {} outputs for {} bound names",
            mcfg.model_name,
            outputs.len(),
            mcfg.output_names.len()
        )));
    }

    let mut out = Token::new();
    out.req_id = req_id;
    out.step_id = step_id;
    for (oname, value) in mcfg.output_names.iter().zip(outputs) {
        let is_state = mcfg.present_index(oname).is_some();
        debug_assert!(
            !(is_state && mcfg.inter_stage_output_input_map.contains_key(oname)),
            "output '{oname}' is both state and inter-stage"
        );
        if is_state {
            run_state.state_values.insert(oname.clone(), value);
        } else if let Some(next_name) = mcfg.inter_stage_output_input_map.get(oname) {
            out.value_names.push(next_name.clone());
            out.values.push(value);
        }
    }

    debug!(
        req_id = %req_id,
        step = step_id,
        stage = stage_id,
        new_seq_len,
        elapsed_us = started.elapsed().as_micros() as u64,
        "stage complete"
    );
    Ok(out)
}

fn dim_at(shape: &[i64], idx: usize, name: &str) -> Result<i64> {
    shape.get(idx).copied().ok_or_else(|| {
        CascadeError::execution(format!(
            "dim index {idx} out of range for '{name}' with rank-{} shape",
            shape.len()
        ))
    })
}

fn set_dim(shape: &mut [i64], idx: usize, value: i64, name: &str) -> Result<()> {
    match shape.get_mut(idx) {
        Some(d) => {
            *d = value;
            Ok(())
        }
        None => Err(CascadeError::execution(format!(
            "dim index {idx} out of range for '{name}' with rank-{} shape",
            shape.len()
        ))),
    }
}
