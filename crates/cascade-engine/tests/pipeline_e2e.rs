//! End-to-end pipeline tests against the stub runtime.
//!
//! The stub decoder generates the successor of each token id, so every
//! assertion about generated tokens is exact.

use std::sync::Arc;

use cascade_engine::testing::{
    self, failing_head_stage, logits_response, prompt_request, single_stage_pipeline,
    two_stage_pipeline, STAGE0_PATH, STAGE1_PATH,
};
use cascade_engine::{
    sampling, CascadeError, HostTensor, MemoryDescriptor, PipelineRequest, PipelineResponse,
    PipelineSession, TensorValue,
};

fn session_from(fixture: testing::StubPipeline, workers: usize) -> (PipelineSession, Arc<cascade_runtime::stub::StubRuntime>) {
    testing::init_test_logging();
    let runtime = Arc::clone(&fixture.runtime);
    let session = PipelineSession::new(fixture.config, workers, runtime.clone()).unwrap();
    (session, runtime)
}

#[test]
fn single_step_populates_logits() {
    let (session, runtime) = session_from(two_stage_pipeline(16, 4, 8), 4);

    let mut responses = vec![logits_response()];
    session
        .run(vec![prompt_request(&[&[1]])], &mut responses, 1)
        .unwrap();

    let logits = responses[0].output("logits").expect("logits slot filled");
    assert_eq!(logits.shape(), &[1, 1, 16]);
    // One step, two stages, one request.
    assert_eq!(runtime.run_count(), 2);
}

#[test]
fn greedy_decoding_generates_successor_tokens() {
    let (session, runtime) = session_from(two_stage_pipeline(16, 4, 8), 4);

    let mut responses = vec![logits_response()];
    session
        .run(vec![prompt_request(&[&[5]])], &mut responses, 3)
        .unwrap();

    // Step 0 consumes 5, step 1 consumes 6, step 2 consumes 7; the final
    // logits therefore point at 8.
    let logits = responses[0].output("logits").unwrap();
    assert_eq!(sampling::select_next_tokens(logits).unwrap(), vec![8]);
    assert_eq!(runtime.run_count(), 6);
}

#[test]
fn per_request_stage_order_is_strict() {
    let (session, runtime) = session_from(two_stage_pipeline(16, 4, 8), 4);

    let mut responses = vec![logits_response()];
    session
        .run(vec![prompt_request(&[&[2]])], &mut responses, 3)
        .unwrap();

    // A single request observes exactly (0,0), (1,0), (0,1), (1,1), …
    let expected: Vec<String> = (0..3)
        .flat_map(|_| [STAGE0_PATH.to_string(), STAGE1_PATH.to_string()])
        .collect();
    assert_eq!(runtime.run_log(), expected);
    // Workers re-pin the stage device on every invocation.
    assert_eq!(runtime.device_log(), vec![0, 1, 0, 1, 0, 1]);
}

#[test]
fn prompt_argmax_uses_last_position() {
    let (session, _) = session_from(two_stage_pipeline(16, 4, 8), 2);

    let mut responses = vec![logits_response()];
    session
        .run(vec![prompt_request(&[&[1, 2, 3]])], &mut responses, 2)
        .unwrap();

    // Step 0 selects from the last prompt position (3 → 4); step 1
    // consumes 4, so the final logits point at 5.
    let logits = responses[0].output("logits").unwrap();
    assert_eq!(sampling::select_next_tokens(logits).unwrap(), vec![5]);
}

#[test]
fn two_requests_batch_two_schedule_all_stage_invocations() {
    let (session, runtime) = session_from(two_stage_pipeline(32, 4, 8), 4);

    let requests = vec![
        prompt_request(&[&[3], &[9]]),
        prompt_request(&[&[10], &[20]]),
    ];
    let mut responses = vec![logits_response(), logits_response()];
    session.run(requests, &mut responses, 3).unwrap();

    // 3 steps × 2 stages × 2 requests.
    assert_eq!(runtime.run_count(), 12);

    let first = responses[0].output("logits").unwrap();
    assert_eq!(first.shape(), &[2, 1, 32]);
    assert_eq!(sampling::select_next_tokens(first).unwrap(), vec![6, 12]);
    let second = responses[1].output("logits").unwrap();
    assert_eq!(sampling::select_next_tokens(second).unwrap(), vec![13, 23]);
}

#[test]
fn zero_steps_returns_success_without_work() {
    let (session, runtime) = session_from(two_stage_pipeline(16, 4, 8), 2);

    let mut responses = vec![logits_response()];
    session
        .run(vec![prompt_request(&[&[1]])], &mut responses, 0)
        .unwrap();

    assert!(responses[0].output("logits").is_none());
    assert_eq!(runtime.run_count(), 0);
}

#[test]
fn single_stage_pipeline_wraps_every_completion() {
    let (session, runtime) = session_from(single_stage_pipeline(8, 8), 2);

    let mut responses = vec![logits_response()];
    session
        .run(vec![prompt_request(&[&[2]])], &mut responses, 2)
        .unwrap();

    let logits = responses[0].output("logits").unwrap();
    assert_eq!(sampling::select_next_tokens(logits).unwrap(), vec![4]);
    assert_eq!(runtime.run_count(), 2);
}

#[test]
fn caller_preallocated_output_receives_the_result() {
    let (session, _) = session_from(two_stage_pipeline(16, 4, 8), 2);

    let slot = HostTensor::zeros(vec![1, 1, 16], cascade_types::ElementType::FP16)
        .unwrap()
        .into_ref();
    let response = PipelineResponse::new(vec!["logits".into()])
        .with_output_value("logits", Arc::clone(&slot));

    let mut responses = vec![response];
    session
        .run(vec![prompt_request(&[&[7]])], &mut responses, 1)
        .unwrap();

    // The runtime wrote through the caller's tensor.
    let returned = responses[0].output("logits").unwrap();
    assert!(Arc::ptr_eq(returned, &slot));
    assert_eq!(sampling::select_next_tokens(&slot).unwrap(), vec![8]);
}

#[test]
fn reruns_are_deterministic() {
    let (session, _) = session_from(two_stage_pipeline(16, 4, 8), 4);

    let mut first = vec![logits_response()];
    session
        .run(vec![prompt_request(&[&[4, 9]])], &mut first, 3)
        .unwrap();
    let mut second = vec![logits_response()];
    session
        .run(vec![prompt_request(&[&[4, 9]])], &mut second, 3)
        .unwrap();

    let a = first[0].output("logits").unwrap().read_bytes().unwrap();
    let b = second[0].output("logits").unwrap().read_bytes().unwrap();
    assert_eq!(a, b);
}

#[test]
fn max_seq_len_bound_is_enforced_at_admission() {
    // Prompt of 2 plus 2 steps fits exactly in max_seq_len 4.
    let (session, _) = session_from(two_stage_pipeline(16, 4, 4), 2);
    let mut responses = vec![logits_response()];
    session
        .run(vec![prompt_request(&[&[1, 2]])], &mut responses, 2)
        .unwrap();

    // One more step would overrun the preallocated state buffers.
    let (session, runtime) = session_from(two_stage_pipeline(16, 4, 4), 2);
    let mut responses = vec![logits_response()];
    let err = session
        .run(vec![prompt_request(&[&[1, 2]])], &mut responses, 3)
        .unwrap_err();
    assert!(err.is_admission_error());
    assert!(err.to_string().contains("max_seq_len"));
    assert_eq!(runtime.run_count(), 0);
}

#[test]
fn missing_seq_len_input_fails_admission() {
    let (session, runtime) = session_from(two_stage_pipeline(16, 4, 8), 2);

    let request = PipelineRequest::new(
        vec!["position_ids".into()],
        vec![HostTensor::from_i64s(vec![1, 1], &[0]).unwrap().into_ref()],
    );
    let mut responses = vec![logits_response()];
    let err = session.run(vec![request], &mut responses, 1).unwrap_err();
    assert!(err.is_admission_error());
    assert!(err.to_string().contains("input_ids"));
    assert_eq!(runtime.run_count(), 0);
}

#[test]
fn state_inter_stage_name_collision_fails_construction() {
    let fixture = two_stage_pipeline(16, 4, 8);
    let mut config = fixture.config;
    config.stages[1]
        .inter_stage_output_input_map
        .insert("present_1".into(), "anything".into());

    let err = PipelineSession::new(config, 2, fixture.runtime).unwrap_err();
    assert!(matches!(err, CascadeError::Config { .. }));
    assert!(err.to_string().contains("present_1"));
}

#[test]
fn stage_failure_aborts_the_batch() {
    let fixture = two_stage_pipeline(16, 4, 8);
    // Replace the head shard with one that always fails.
    fixture.runtime.register_model(STAGE1_PATH, failing_head_stage(16, 4));
    let (session, _) = session_from(fixture, 2);

    let mut responses = vec![logits_response()];
    let err = session
        .run(vec![prompt_request(&[&[1]])], &mut responses, 2)
        .unwrap_err();

    let message = err.to_string();
    assert!(
        message.starts_with("Error in processing request id: "),
        "unexpected message: {message}"
    );
    assert!(message.contains("induced stage failure"));
    // Failed requests leave their response slots untouched.
    assert!(responses[0].output("logits").is_none());
}

#[test]
fn unknown_requested_output_fails_after_final_step() {
    let (session, _) = session_from(two_stage_pipeline(16, 4, 8), 2);

    let response = PipelineResponse::new(vec!["logits".into(), "attention_weights".into()])
        .with_output_descriptor("logits", MemoryDescriptor::cpu())
        .with_output_descriptor("attention_weights", MemoryDescriptor::cpu());
    let mut responses = vec![response];
    let err = session
        .run(vec![prompt_request(&[&[1]])], &mut responses, 1)
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Output attention_weights is not produced by the final stage"
    );
}

#[test]
fn mismatched_request_response_lists_are_rejected() {
    let (session, _) = session_from(two_stage_pipeline(16, 4, 8), 2);
    let mut responses: Vec<PipelineResponse> = Vec::new();
    let err = session
        .run(vec![prompt_request(&[&[1]])], &mut responses, 1)
        .unwrap_err();
    assert!(err.is_admission_error());
}

#[test]
fn descriptor_session_construction_from_file() {
    use std::io::Write;

    let fixture = two_stage_pipeline(16, 4, 8);
    let text = serde_json::to_string(&fixture.config).unwrap();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();

    let session =
        PipelineSession::from_descriptor_file(file.path(), 2, fixture.runtime).unwrap();
    let mut responses = vec![logits_response()];
    session
        .run(vec![prompt_request(&[&[3]])], &mut responses, 2)
        .unwrap();
    let logits = responses[0].output("logits").unwrap();
    assert_eq!(sampling::select_next_tokens(logits).unwrap(), vec![5]);
}
