//! Pipeline configuration model and JSON descriptor loader
//!
//! A pipeline is described by an external JSON "ensemble" descriptor: a few
//! well-known tensor names, the maximum sequence length the preallocated
//! state buffers must accommodate, and one stage descriptor per model shard
//! in execution order. The configuration is immutable once the pipeline
//! session has loaded the stage sessions and recorded their IO names.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::CascadeError;
use crate::Result;

/// Immutable description of the whole pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Name of the token-id input of stage 0
    pub input_ids_name: String,
    /// Name of the position-id input of stage 0
    pub position_ids_name: String,
    /// Name of the final-stage logits output
    pub logits_name: String,
    /// Upper bound on sequence length; sizes all preallocated buffers
    pub max_seq_len: usize,
    /// Stage descriptors in execution order
    #[serde(rename = "ensemble")]
    pub stages: Vec<StageConfig>,
}

/// Description of one pipeline stage (one model shard on one device).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub model_name: String,
    pub model_file_path: String,
    pub device_id: u32,

    /// Input whose shape carries the current sequence length
    pub input_to_use_for_seq_len: String,
    pub seq_len_dim_index_in_input: usize,
    pub batch_dim_index_in_input: usize,
    pub batch_dim_index_in_state: usize,
    pub seq_len_dim_index_in_state: usize,
    pub seq_len_dim_in_inter_stage_output: usize,
    pub batch_dim_in_inter_stage_output: usize,

    /// KV-cache inputs; `past_input_names[k]` is fed, on step > 0, from the
    /// value produced under `present_output_names[k]` on the previous step
    #[serde(default)]
    pub past_input_names: Vec<String>,
    #[serde(default)]
    pub present_output_names: Vec<String>,

    /// Forward activations: this stage's output name mapped to the next
    /// stage's input name. Encoded in the descriptor as a list of
    /// `[output, next_input]` pairs.
    #[serde(default, with = "name_pairs")]
    pub inter_stage_output_input_map: HashMap<String, String>,

    /// Populated from the loaded session, not from the descriptor
    #[serde(skip)]
    pub input_names: Vec<String>,
    #[serde(skip)]
    pub output_names: Vec<String>,
}

impl PipelineConfig {
    /// Load and validate a descriptor from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            CascadeError::io(format!("error reading descriptor {}: {e}", path.display()))
        })?;
        Self::from_json_str(&text)
    }

    /// Parse and validate a descriptor from a JSON string.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    /// Structural validation that does not require loaded sessions.
    ///
    /// Rules that depend on the sessions' enumerated IO names (inter-stage
    /// names resolving against real inputs/outputs) are checked by the
    /// pipeline session after load.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(CascadeError::config("ensemble must declare at least one stage"));
        }
        if self.max_seq_len == 0 {
            return Err(CascadeError::config("max_seq_len must be positive"));
        }
        for stage in &self.stages {
            stage.validate()?;
        }
        Ok(())
    }
}

impl StageConfig {
    fn validate(&self) -> Result<()> {
        if self.past_input_names.len() != self.present_output_names.len() {
            return Err(CascadeError::config(format!(
                "stage {}: past_input_names ({}) and present_output_names ({}) must be parallel",
                self.model_name,
                self.past_input_names.len(),
                self.present_output_names.len()
            )));
        }
        if self.present_output_names.is_empty() {
            return Err(CascadeError::config(format!(
                "stage {}: at least one past/present state pair is required",
                self.model_name
            )));
        }
        if self.input_to_use_for_seq_len.is_empty() {
            return Err(CascadeError::config(format!(
                "stage {}: input_to_use_for_seq_len must be set",
                self.model_name
            )));
        }
        // A name cannot both loop back as state and feed the next stage.
        for name in &self.present_output_names {
            if self.inter_stage_output_input_map.contains_key(name) {
                return Err(CascadeError::config(format!(
                    "stage {}: output '{name}' appears in both present_output_names \
                     and inter_stage_output_input_map",
                    self.model_name
                )));
            }
        }
        Ok(())
    }

    /// Position of `name` in `past_input_names`, if it is a state input.
    pub fn past_index(&self, name: &str) -> Option<usize> {
        self.past_input_names.iter().position(|n| n == name)
    }

    /// Position of `name` in `present_output_names`, if it is a state output.
    pub fn present_index(&self, name: &str) -> Option<usize> {
        self.present_output_names.iter().position(|n| n == name)
    }
}

/// Serde adapter for the `[[output, next_input], …]` pair-list encoding.
mod name_pairs {
    use std::collections::HashMap;

    use serde::de::Deserializer;
    use serde::ser::Serializer;
    use serde::{Deserialize, Serialize};

    pub fn serialize<S: Serializer>(
        map: &HashMap<String, String>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut pairs: Vec<(&String, &String)> = map.iter().collect();
        pairs.sort();
        pairs.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<HashMap<String, String>, D::Error> {
        let pairs: Vec<(String, String)> = Vec::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}
