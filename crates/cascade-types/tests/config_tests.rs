use std::io::Write;

use cascade_types::{CascadeError, PipelineConfig};

fn two_stage_descriptor() -> String {
    r#"{
        "input_ids_name": "input_ids",
        "position_ids_name": "position_ids",
        "logits_name": "logits",
        "max_seq_len": 128,
        "ensemble": [
            {
                "model_name": "turing_part_0",
                "model_file_path": "/models/part0.onnx",
                "device_id": 0,
                "input_to_use_for_seq_len": "input_ids",
                "seq_len_dim_index_in_input": 1,
                "batch_dim_index_in_input": 0,
                "batch_dim_index_in_state": 0,
                "seq_len_dim_index_in_state": 1,
                "seq_len_dim_in_inter_stage_output": 1,
                "batch_dim_in_inter_stage_output": 0,
                "past_input_names": ["past_0", "past_1"],
                "present_output_names": ["present_0", "present_1"],
                "inter_stage_output_input_map": [["hidden_states", "input_hidden_states"]]
            },
            {
                "model_name": "turing_part_1",
                "model_file_path": "/models/part1.onnx",
                "device_id": 1,
                "input_to_use_for_seq_len": "input_hidden_states",
                "seq_len_dim_index_in_input": 1,
                "batch_dim_index_in_input": 0,
                "batch_dim_index_in_state": 0,
                "seq_len_dim_index_in_state": 1,
                "seq_len_dim_in_inter_stage_output": 1,
                "batch_dim_in_inter_stage_output": 0,
                "past_input_names": ["past_2"],
                "present_output_names": ["present_2"],
                "inter_stage_output_input_map": [["logits", "logits"]]
            }
        ]
    }"#
    .to_string()
}

#[test]
fn parses_two_stage_descriptor() {
    let config = PipelineConfig::from_json_str(&two_stage_descriptor()).unwrap();
    assert_eq!(config.num_stages(), 2);
    assert_eq!(config.input_ids_name, "input_ids");
    assert_eq!(config.max_seq_len, 128);

    let stage0 = &config.stages[0];
    assert_eq!(stage0.model_name, "turing_part_0");
    assert_eq!(stage0.device_id, 0);
    assert_eq!(stage0.past_input_names, vec!["past_0", "past_1"]);
    assert_eq!(
        stage0.inter_stage_output_input_map.get("hidden_states").map(String::as_str),
        Some("input_hidden_states")
    );
    // Session-populated fields start empty.
    assert!(stage0.input_names.is_empty());
    assert!(stage0.output_names.is_empty());
}

#[test]
fn loads_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(two_stage_descriptor().as_bytes()).unwrap();

    let config = PipelineConfig::from_json_file(file.path()).unwrap();
    assert_eq!(config.num_stages(), 2);
}

#[test]
fn missing_file_is_io_error() {
    let err = PipelineConfig::from_json_file("/nonexistent/ensemble.json").unwrap_err();
    assert!(matches!(err, CascadeError::Io { .. }));
}

#[test]
fn missing_required_key_fails() {
    let text = r#"{"input_ids_name": "input_ids", "ensemble": []}"#;
    let err = PipelineConfig::from_json_str(text).unwrap_err();
    assert!(matches!(err, CascadeError::Serialization { .. }));
}

#[test]
fn empty_ensemble_fails_validation() {
    let mut config = PipelineConfig::from_json_str(&two_stage_descriptor()).unwrap();
    config.stages.clear();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("at least one stage"));
}

#[test]
fn mismatched_state_vectors_fail_validation() {
    let mut config = PipelineConfig::from_json_str(&two_stage_descriptor()).unwrap();
    config.stages[0].past_input_names.pop();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("must be parallel"));
}

#[test]
fn state_and_inter_stage_collision_fails_validation() {
    let mut config = PipelineConfig::from_json_str(&two_stage_descriptor()).unwrap();
    config.stages[1]
        .inter_stage_output_input_map
        .insert("present_2".into(), "anything".into());
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("present_2"));
    assert!(err.is_admission_error());
}

#[test]
fn zero_max_seq_len_fails_validation() {
    let mut config = PipelineConfig::from_json_str(&two_stage_descriptor()).unwrap();
    config.max_seq_len = 0;
    assert!(config.validate().is_err());
}

#[test]
fn descriptor_round_trips_through_json() {
    let config = PipelineConfig::from_json_str(&two_stage_descriptor()).unwrap();
    let text = serde_json::to_string(&config).unwrap();
    let reparsed = PipelineConfig::from_json_str(&text).unwrap();
    assert_eq!(reparsed.num_stages(), config.num_stages());
    assert_eq!(
        reparsed.stages[0].inter_stage_output_input_map,
        config.stages[0].inter_stage_output_input_map
    );
}
