//! Test support
//!
//! Deterministic stub pipelines for exercising the scheduler without GPUs
//! or model files. The two-stage decoder embeds token ids into a hidden
//! tensor on stage 0 and turns hiddens into one-hot logits pointing at
//! `(id + 1) % vocab` on stage 1, so greedy decoding yields the successor
//! of each input id and tests can predict every generated token.
//!
//! Builders in this module panic on malformed arguments; they exist for
//! tests and examples, not for production call sites.

use std::sync::Arc;
use std::sync::Once;

use half::f16;

use cascade_runtime::stub::{ComputeFn, StubIoSpec, StubModel, StubRuntime};
use cascade_runtime::{
    HostTensor, MemoryDescriptor, PipelineRequest, PipelineResponse, TensorValue,
};
use cascade_types::{CascadeError, ElementType, PipelineConfig, StageConfig};

pub const STAGE0_PATH: &str = "decoder_part_0.onnx";
pub const STAGE1_PATH: &str = "decoder_part_1.onnx";
pub const SOLO_PATH: &str = "decoder_solo.onnx";

static TEST_INIT: Once = Once::new();

/// Initialize test logging once for the whole process.
pub fn init_test_logging() {
    TEST_INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// A stub runtime with registered models plus the matching configuration.
pub struct StubPipeline {
    pub runtime: Arc<StubRuntime>,
    pub config: PipelineConfig,
}

/// Two-stage decoder: embedding shard on device 0, head shard on device 1.
pub fn two_stage_pipeline(vocab: usize, hidden: usize, max_seq_len: usize) -> StubPipeline {
    let runtime = Arc::new(StubRuntime::new());
    runtime.register_model(STAGE0_PATH, embed_stage(hidden));
    runtime.register_model(STAGE1_PATH, head_stage(vocab, hidden));

    let config = PipelineConfig {
        input_ids_name: "input_ids".into(),
        position_ids_name: "position_ids".into(),
        logits_name: "logits".into(),
        max_seq_len,
        stages: vec![
            stage_config(
                "decoder_part_0",
                STAGE0_PATH,
                0,
                "input_ids",
                &[("hidden_states", "input_hidden_states")],
                "past_0",
                "present_0",
            ),
            stage_config(
                "decoder_part_1",
                STAGE1_PATH,
                1,
                "input_hidden_states",
                &[("logits", "logits")],
                "past_1",
                "present_1",
            ),
        ],
    };
    StubPipeline { runtime, config }
}

/// Single-stage decoder: the whole model on device 0.
pub fn single_stage_pipeline(vocab: usize, max_seq_len: usize) -> StubPipeline {
    let runtime = Arc::new(StubRuntime::new());
    runtime.register_model(SOLO_PATH, solo_stage(vocab));

    let config = PipelineConfig {
        input_ids_name: "input_ids".into(),
        position_ids_name: "position_ids".into(),
        logits_name: "logits".into(),
        max_seq_len,
        stages: vec![stage_config(
            "decoder_solo",
            SOLO_PATH,
            0,
            "input_ids",
            &[("logits", "logits")],
            "past_0",
            "present_0",
        )],
    };
    StubPipeline { runtime, config }
}

/// Head-stage replacement whose compute always fails.
pub fn failing_head_stage(vocab: usize, hidden: usize) -> StubModel {
    let (v, h) = (vocab as i64, hidden as i64);
    let compute: ComputeFn = Arc::new(|_ctx| Err(CascadeError::runtime("induced stage failure")));
    StubModel::new(
        vec![
            StubIoSpec::new("input_hidden_states", vec![-1, -1, h], ElementType::FP16),
            StubIoSpec::new("past_1", vec![-1, -1, h], ElementType::FP16),
        ],
        vec![
            StubIoSpec::new("present_1", vec![-1, -1, h], ElementType::FP16),
            StubIoSpec::new("logits", vec![-1, -1, v], ElementType::FP16),
        ],
        compute,
    )
}

/// Request with a `(batch, seq)` prompt; every row must have equal length.
pub fn prompt_request(prompts: &[&[i64]]) -> PipelineRequest {
    let batch = prompts.len() as i64;
    let seq = prompts[0].len() as i64;
    assert!(prompts.iter().all(|p| p.len() as i64 == seq), "ragged prompt rows");

    let ids: Vec<i64> = prompts.iter().flat_map(|p| p.iter().copied()).collect();
    let positions: Vec<i64> = prompts.iter().flat_map(|p| 0..p.len() as i64).collect();
    PipelineRequest::new(
        vec!["input_ids".into(), "position_ids".into()],
        vec![
            HostTensor::from_i64s(vec![batch, seq], &ids).unwrap().into_ref(),
            HostTensor::from_i64s(vec![batch, seq], &positions).unwrap().into_ref(),
        ],
    )
}

/// Response asking for host-allocated logits.
pub fn logits_response() -> PipelineResponse {
    PipelineResponse::new(vec!["logits".into()])
        .with_output_descriptor("logits", MemoryDescriptor::cpu())
}

#[allow(clippy::too_many_arguments)]
fn stage_config(
    model_name: &str,
    path: &str,
    device_id: u32,
    seq_len_input: &str,
    inter_stage: &[(&str, &str)],
    past: &str,
    present: &str,
) -> StageConfig {
    StageConfig {
        model_name: model_name.into(),
        model_file_path: path.into(),
        device_id,
        input_to_use_for_seq_len: seq_len_input.into(),
        seq_len_dim_index_in_input: 1,
        batch_dim_index_in_input: 0,
        batch_dim_index_in_state: 0,
        seq_len_dim_index_in_state: 1,
        seq_len_dim_in_inter_stage_output: 1,
        batch_dim_in_inter_stage_output: 0,
        past_input_names: vec![past.into()],
        present_output_names: vec![present.into()],
        inter_stage_output_input_map: inter_stage
            .iter()
            .map(|(o, i)| (o.to_string(), i.to_string()))
            .collect(),
        input_names: Vec::new(),
        output_names: Vec::new(),
    }
}

fn embed_stage(hidden: usize) -> StubModel {
    let h = hidden as i64;
    let compute: ComputeFn = Arc::new(move |ctx| {
        let dims = ctx.input("input_ids")?.shape().to_vec();
        let ids = ctx.input_i64s("input_ids")?;

        // hidden[b, s, :] = id as f16, so stage 1 can recover the token.
        let mut hidden_bytes = Vec::with_capacity(ids.len() * hidden * 2);
        for &id in &ids {
            let val = f16::from_f32(id as f32);
            for _ in 0..hidden {
                hidden_bytes.extend_from_slice(&val.to_le_bytes());
            }
        }
        ctx.produce("hidden_states", &[dims[0], dims[1], h], hidden_bytes)?;
        fill_state(ctx, "present_0")
    });

    StubModel::new(
        vec![
            StubIoSpec::new("input_ids", vec![-1, -1], ElementType::INT64),
            StubIoSpec::new("position_ids", vec![-1, -1], ElementType::INT64),
            StubIoSpec::new("past_0", vec![-1, -1, h], ElementType::FP16),
        ],
        vec![
            StubIoSpec::new("present_0", vec![-1, -1, h], ElementType::FP16),
            StubIoSpec::new("hidden_states", vec![-1, -1, h], ElementType::FP16),
        ],
        compute,
    )
}

fn head_stage(vocab: usize, hidden: usize) -> StubModel {
    let (v, h) = (vocab as i64, hidden as i64);
    let compute: ComputeFn = Arc::new(move |ctx| {
        let dims = ctx.input("input_hidden_states")?.shape().to_vec();
        let values = ctx.input_f16s("input_hidden_states")?;
        let rows = (dims[0] * dims[1]) as usize;

        let mut logits = Vec::with_capacity(rows * vocab * 2);
        for row in 0..rows {
            let id = values[row * hidden].to_f32().round() as i64;
            one_hot_row(&mut logits, vocab, (id + 1).rem_euclid(v) as usize);
        }
        ctx.produce("logits", &[dims[0], dims[1], v], logits)?;
        fill_state(ctx, "present_1")
    });

    StubModel::new(
        vec![
            StubIoSpec::new("input_hidden_states", vec![-1, -1, h], ElementType::FP16),
            StubIoSpec::new("past_1", vec![-1, -1, h], ElementType::FP16),
        ],
        vec![
            StubIoSpec::new("present_1", vec![-1, -1, h], ElementType::FP16),
            StubIoSpec::new("logits", vec![-1, -1, v], ElementType::FP16),
        ],
        compute,
    )
}

fn solo_stage(vocab: usize) -> StubModel {
    let v = vocab as i64;
    let compute: ComputeFn = Arc::new(move |ctx| {
        let dims = ctx.input("input_ids")?.shape().to_vec();
        let ids = ctx.input_i64s("input_ids")?;

        let mut logits = Vec::with_capacity(ids.len() * vocab * 2);
        for &id in &ids {
            one_hot_row(&mut logits, vocab, (id + 1).rem_euclid(v) as usize);
        }
        ctx.produce("logits", &[dims[0], dims[1], v], logits)?;
        fill_state(ctx, "present_0")
    });

    StubModel::new(
        vec![
            StubIoSpec::new("input_ids", vec![-1, -1], ElementType::INT64),
            StubIoSpec::new("position_ids", vec![-1, -1], ElementType::INT64),
            StubIoSpec::new("past_0", vec![-1, -1, 2], ElementType::FP16),
        ],
        vec![
            StubIoSpec::new("present_0", vec![-1, -1, 2], ElementType::FP16),
            StubIoSpec::new("logits", vec![-1, -1, v], ElementType::FP16),
        ],
        compute,
    )
}

fn one_hot_row(out: &mut Vec<u8>, vocab: usize, hot: usize) {
    for t in 0..vocab {
        let val = if t == hot { f16::ONE } else { f16::ZERO };
        out.extend_from_slice(&val.to_le_bytes());
    }
}

fn fill_state(ctx: &mut cascade_runtime::stub::StubComputeCtx<'_>, name: &str) -> cascade_types::Result<()> {
    if let Some(shape) = ctx.bound_output_shape(name) {
        let bytes = shape.iter().product::<i64>() as usize * 2;
        ctx.produce(name, &shape, vec![0; bytes])?;
    }
    Ok(())
}
