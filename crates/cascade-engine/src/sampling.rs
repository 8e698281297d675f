//! Greedy next-token selection
//!
//! Between steps the driver turns the final stage's half-precision logits
//! into the next step's stage-0 inputs: per batch row, the argmax over the
//! vocab dimension at the last sequence position. The last position is the
//! one that matters because the logits carry the full prompt on step 0 but
//! shrink to a single position from step 1 onward.

use half::f16;

use cascade_runtime::{HostTensor, TensorRef, TensorValue};
use cascade_types::{CascadeError, ElementType, Result};

/// Per-row argmax of `logits` shaped `(batch, seq_len, vocab)`.
///
/// Comparison uses IEEE-754 half ordering; ties resolve to the smallest
/// index.
pub fn select_next_tokens(logits: &TensorRef) -> Result<Vec<i64>> {
    let shape = logits.shape();
    if shape.len() != 3 {
        return Err(CascadeError::execution(format!(
            "logits must be (batch, seq_len, vocab), got shape {shape:?}"
        )));
    }
    if logits.dtype() != ElementType::FP16 {
        return Err(CascadeError::execution(format!(
            "logits must be fp16, got {}",
            logits.dtype()
        )));
    }
    let (batch, seq_len, vocab) = (shape[0], shape[1], shape[2]);
    if batch <= 0 || seq_len <= 0 || vocab <= 0 {
        return Err(CascadeError::execution(format!(
            "logits shape {shape:?} has an empty dim"
        )));
    }

    let bytes = logits.read_bytes().map_err(|e| {
        CascadeError::execution(format!("logits are not host-accessible: {e}"))
    })?;
    let (batch, seq_len, vocab) = (batch as usize, seq_len as usize, vocab as usize);
    if bytes.len() != batch * seq_len * vocab * 2 {
        return Err(CascadeError::execution(format!(
            "logits carry {} bytes for shape {shape:?}",
            bytes.len()
        )));
    }

    let mut next_ids = Vec::with_capacity(batch);
    for row in 0..batch {
        // Only the last sequence position feeds the next step.
        let base = (row * seq_len + (seq_len - 1)) * vocab * 2;
        let mut best_idx = 0usize;
        let mut best = f16::from_le_bytes([bytes[base], bytes[base + 1]]);
        for v in 1..vocab {
            let off = base + v * 2;
            let elem = f16::from_le_bytes([bytes[off], bytes[off + 1]]);
            if elem > best {
                best = elem;
                best_idx = v;
            }
        }
        next_ids.push(best_idx as i64);
    }
    Ok(next_ids)
}

/// Build the host tensors for the next step's stage-0 inputs: `input_ids`
/// of shape `(batch, 1)` and `position_ids` of the same shape with every
/// element at `position`.
pub fn next_step_inputs(next_ids: &[i64], position: i64) -> Result<(TensorRef, TensorRef)> {
    let batch = next_ids.len() as i64;
    let dims = vec![batch, 1];
    let input_ids = HostTensor::from_i64s(dims.clone(), next_ids)?.into_ref();
    let positions = vec![position; next_ids.len()];
    let position_ids = HostTensor::from_i64s(dims, &positions)?.into_ref();
    Ok((input_ids, position_ids))
}
