//! Pipeline session and driver
//!
//! The session owns one compiled stage session per model shard and a
//! fixed worker pool. `run` admits a batch of requests, seeds every
//! request's stage-0 task, then drains the completion queue: each token
//! advances its request to the next stage, and a wrap-around to stage 0
//! completes a step, triggering greedy token selection and the next step's
//! stage-0 task. The driver thread is the sole consumer of the queue and
//! the sole submitter after admission, so per-request stages and steps
//! execute in strict program order while different requests pipeline
//! freely across workers.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info};

use cascade_runtime::{
    InferenceRuntime, MemoryDescriptor, ModelSession, PipelineRequest, PipelineResponse,
    TensorValue,
};
use cascade_types::{CascadeError, PipelineConfig, ReqId, ReqIdGenerator, Result};

use crate::frame::RequestExecutionFrame;
use crate::pool::TaskPool;
use crate::queue::ResponseQueue;
use crate::sampling;
use crate::token::Token;
use crate::worker;

/// One stage's compiled session and its device-memory descriptor.
pub struct StageSession {
    pub session: Arc<dyn ModelSession>,
    pub memory: MemoryDescriptor,
}

/// Load every stage session and record its IO names into the config.
pub(crate) fn init_stages(
    config: &mut PipelineConfig,
    runtime: &dyn InferenceRuntime,
) -> Result<Vec<Arc<StageSession>>> {
    let mut stages = Vec::with_capacity(config.num_stages());
    for mcfg in &mut config.stages {
        let started = Instant::now();
        let session = runtime.load_session(&mcfg.model_file_path, mcfg.device_id)?;
        mcfg.input_names = session.input_names().to_vec();
        mcfg.output_names = session.output_names().to_vec();
        let memory = session.memory_descriptor().clone();
        info!(
            model = %mcfg.model_name,
            device = mcfg.device_id,
            elapsed_us = started.elapsed().as_micros() as u64,
            "stage session created"
        );
        stages.push(Arc::new(StageSession { session, memory }));
    }
    Ok(stages)
}

/// Multi-stage pipelined inference session.
pub struct PipelineSession {
    config: Arc<PipelineConfig>,
    stages: Vec<Arc<StageSession>>,
    runtime: Arc<dyn InferenceRuntime>,
    pool: TaskPool,
    req_ids: ReqIdGenerator,
}

impl std::fmt::Debug for PipelineSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineSession").finish_non_exhaustive()
    }
}

impl PipelineSession {
    /// Load every stage of `config` through `runtime` and spin up the
    /// worker pool. The config is validated and then frozen.
    pub fn new(
        mut config: PipelineConfig,
        thread_pool_size: usize,
        runtime: Arc<dyn InferenceRuntime>,
    ) -> Result<Self> {
        config.validate()?;
        let stages = init_stages(&mut config, runtime.as_ref())?;
        validate_resolved(&config)?;
        let pool = TaskPool::new(thread_pool_size)?;
        info!(
            stages = config.num_stages(),
            workers = pool.size(),
            "pipeline session ready"
        );
        Ok(Self {
            config: Arc::new(config),
            stages,
            runtime,
            pool,
            req_ids: ReqIdGenerator::new(),
        })
    }

    /// Convenience constructor from a JSON ensemble descriptor file.
    pub fn from_descriptor_file(
        path: impl AsRef<std::path::Path>,
        thread_pool_size: usize,
        runtime: Arc<dyn InferenceRuntime>,
    ) -> Result<Self> {
        let config = PipelineConfig::from_json_file(path)?;
        Self::new(config, thread_pool_size, runtime)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Drive `num_steps` decoding iterations for a batch of requests.
    ///
    /// Any failure aborts the whole batch and returns the first observed
    /// message; partially completed requests leave their response slots
    /// untouched. `num_steps == 0` succeeds without admitting work.
    pub fn run(
        &self,
        req_list: Vec<PipelineRequest>,
        resp_list: &mut [PipelineResponse],
        num_steps: usize,
    ) -> Result<()> {
        if req_list.len() != resp_list.len() {
            return Err(CascadeError::request(format!(
                "{} requests but {} response slots",
                req_list.len(),
                resp_list.len()
            )));
        }
        if num_steps == 0 || req_list.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let num_reqs = req_list.len();
        let num_stages = self.config.num_stages();
        let queue = Arc::new(ResponseQueue::new());
        let mut frames: HashMap<ReqId, Arc<Mutex<RequestExecutionFrame>>> =
            HashMap::with_capacity(num_reqs);

        // Admission: one frame per request, stage-0 task seeded immediately.
        let stage0 = &self.config.stages[0];
        for (req_index, req) in req_list.into_iter().enumerate() {
            req.validate()?;
            let resp = &resp_list[req_index];
            resp.validate()?;

            let pos = req
                .input_names
                .iter()
                .position(|n| n == &stage0.input_to_use_for_seq_len)
                .ok_or_else(|| {
                    CascadeError::request(format!(
                        "request {req_index}: stage-0 inputs do not include '{}'",
                        stage0.input_to_use_for_seq_len
                    ))
                })?;
            let shape = req.input_values[pos].shape().to_vec();
            let batch_size = admission_dim(&shape, stage0.batch_dim_index_in_input, req_index)?;
            let orig_seq_len = admission_dim(&shape, stage0.seq_len_dim_index_in_input, req_index)?;
            if batch_size <= 0 || orig_seq_len <= 0 {
                return Err(CascadeError::request(format!(
                    "request {req_index}: non-positive batch ({batch_size}) \
                     or sequence length ({orig_seq_len})"
                )));
            }
            // The preallocated state buffers must hold the prompt plus one
            // position per decoded step.
            if orig_seq_len as usize + num_steps > self.config.max_seq_len {
                return Err(CascadeError::request(format!(
                    "request {req_index}: sequence length {orig_seq_len} plus {num_steps} \
                     steps exceeds max_seq_len {}",
                    self.config.max_seq_len
                )));
            }

            let req_id = self.req_ids.next();
            debug!(%req_id, req_index, batch_size, orig_seq_len, "admitted request");
            let frame = RequestExecutionFrame::new(
                &self.config,
                &self.stages,
                self.runtime.as_ref(),
                req_index,
                req_id,
                batch_size,
                orig_seq_len,
                resp,
            )?;
            let frame = Arc::new(Mutex::new(frame));
            frames.insert(req_id, Arc::clone(&frame));

            let mut token = Token::new();
            token.init(req_id, 0, req.input_names, req.input_values);
            self.submit_stage_task(0, token, frame, Arc::clone(&queue));
        }

        // Drain completions, advancing (stage, step) per request.
        let mut completed = 0usize;
        while completed < num_reqs {
            let mut token = queue.get();
            // One failed request fails the whole batch.
            if let Some(message) = token.error_msg.take() {
                return Err(CascadeError::execution(message));
            }
            let req_id = token.req_id;
            let step_id = token.step_id;
            let frame = frames.get(&req_id).cloned().ok_or_else(|| {
                CascadeError::execution(format!("completion for unknown request id {req_id}"))
            })?;

            let next_stage = {
                let mut f = frame.lock();
                f.stage_id = (f.stage_id + 1) % num_stages;
                f.stage_id
            };

            if next_stage != 0 {
                // The token already carries the renamed activations the
                // next stage needs.
                self.submit_stage_task(next_stage, token, frame, Arc::clone(&queue));
                continue;
            }

            // Wrapped around: this request finished a full step.
            let next_step = step_id + 1;
            if next_step == num_steps {
                let req_index = frame.lock().req_index;
                let resp = &mut resp_list[req_index];
                for i in 0..resp.output_names.len() {
                    let oname = resp.output_names[i].clone();
                    match token.position(&oname) {
                        Some(p) => resp.output_values[i] = Some(Arc::clone(&token.values[p])),
                        None => {
                            return Err(CascadeError::execution(format!(
                                "Output {oname} is not produced by the final stage"
                            )))
                        }
                    }
                }
                frames.remove(&req_id);
                completed += 1;
                debug!(%req_id, steps = num_steps, "request complete");
                continue;
            }

            // Greedy selection feeds the next step.
            let logits_pos = token.position(&self.config.logits_name).ok_or_else(|| {
                CascadeError::execution(format!(
                    "did not get '{}' in the final stage output",
                    self.config.logits_name
                ))
            })?;
            let next_ids = sampling::select_next_tokens(&token.values[logits_pos])?;
            let (batch_size, orig_seq_len) = {
                let f = frame.lock();
                (f.batch_size, f.orig_input_seq_len)
            };
            if next_ids.len() != batch_size as usize {
                return Err(CascadeError::execution(format!(
                    "selected {} tokens for a batch of {batch_size}",
                    next_ids.len()
                )));
            }
            let position = orig_seq_len + next_step as i64 - 1;
            let (input_ids, position_ids) = sampling::next_step_inputs(&next_ids, position)?;

            token.clear();
            token.req_id = req_id;
            token.step_id = next_step;
            token.value_names = vec![
                self.config.input_ids_name.clone(),
                self.config.position_ids_name.clone(),
            ];
            token.values = vec![input_ids, position_ids];
            self.submit_stage_task(0, token, frame, Arc::clone(&queue));
        }

        info!(
            requests = num_reqs,
            num_steps,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pipeline run complete"
        );
        Ok(())
    }

    fn submit_stage_task(
        &self,
        stage_id: usize,
        token: Token,
        frame: Arc<Mutex<RequestExecutionFrame>>,
        queue: Arc<ResponseQueue<Token>>,
    ) {
        let config = Arc::clone(&self.config);
        let stage = Arc::clone(&self.stages[stage_id]);
        let runtime = Arc::clone(&self.runtime);
        self.pool.run_task(move || {
            let req_id = token.req_id;
            let step_id = token.step_id;
            let mcfg = &config.stages[stage_id];
            let mut guard = frame.lock();
            let frame_ref = &mut *guard;
            let result = catch_unwind(AssertUnwindSafe(|| {
                worker::process_request(token, mcfg, stage.as_ref(), &mut *frame_ref, runtime.as_ref())
            }));
            let out = match result {
                Ok(Ok(out)) => out,
                Ok(Err(e)) => error_token(
                    frame_ref,
                    req_id,
                    step_id,
                    format!("Error in processing request id: {req_id} with exception: {e}"),
                ),
                Err(_) => error_token(
                    frame_ref,
                    req_id,
                    step_id,
                    format!("Error in processing request id: {req_id} with unknown exception"),
                ),
            };
            drop(guard);
            queue.put(out);
        });
    }
}

/// Build an error token out of the frame's resident token. The incoming
/// token may have been consumed mid-flight, so it cannot carry the report.
fn error_token(
    frame: &mut RequestExecutionFrame,
    req_id: ReqId,
    step_id: usize,
    message: String,
) -> Token {
    let mut token = std::mem::take(&mut frame.token);
    token.clear();
    token.req_id = req_id;
    token.step_id = step_id;
    token.error_msg = Some(message);
    token
}

/// Name-resolution rules that need the sessions' enumerated IO names.
fn validate_resolved(config: &PipelineConfig) -> Result<()> {
    for (idx, mcfg) in config.stages.iter().enumerate() {
        for name in &mcfg.past_input_names {
            if !mcfg.input_names.contains(name) {
                return Err(CascadeError::config(format!(
                    "stage {}: past input '{name}' is not an input of the session",
                    mcfg.model_name
                )));
            }
        }
        for name in &mcfg.present_output_names {
            if !mcfg.output_names.contains(name) {
                return Err(CascadeError::config(format!(
                    "stage {}: present output '{name}' is not an output of the session",
                    mcfg.model_name
                )));
            }
        }
        for (oname, target) in &mcfg.inter_stage_output_input_map {
            if !mcfg.output_names.contains(oname) {
                return Err(CascadeError::config(format!(
                    "stage {}: inter-stage output '{oname}' is not an output of the session",
                    mcfg.model_name
                )));
            }
            if idx + 1 < config.num_stages()
                && !config.stages[idx + 1].input_names.contains(target)
            {
                return Err(CascadeError::config(format!(
                    "stage {}: inter-stage target '{target}' is not an input of the next stage",
                    mcfg.model_name
                )));
            }
        }
    }
    Ok(())
}

fn admission_dim(shape: &[i64], idx: usize, req_index: usize) -> Result<i64> {
    shape.get(idx).copied().ok_or_else(|| {
        CascadeError::request(format!(
            "request {req_index}: dim index {idx} out of range for input shape {shape:?}"
        ))
    })
}

#[cfg(test)]
mod tests {
    use crate::testing;

    use super::*;

    #[test]
    fn unresolvable_inter_stage_target_is_rejected() {
        let fixture = testing::two_stage_pipeline(8, 4, 16);
        let mut config = fixture.config;
        config.stages[0]
            .inter_stage_output_input_map
            .insert("hidden_states".into(), "no_such_input".into());

        let err = PipelineSession::new(config, 2, fixture.runtime).unwrap_err();
        assert!(err.to_string().contains("no_such_input"));
    }

    #[test]
    fn unknown_past_input_is_rejected() {
        let fixture = testing::two_stage_pipeline(8, 4, 16);
        let mut config = fixture.config;
        config.stages[0].past_input_names[0] = "past_missing".into();
        config.stages[0].present_output_names[0] = "present_0".into();

        let err = PipelineSession::new(config, 2, fixture.runtime).unwrap_err();
        assert!(err.to_string().contains("past_missing"));
    }

    #[test]
    fn unknown_model_path_fails_construction() {
        let fixture = testing::two_stage_pipeline(8, 4, 16);
        let mut config = fixture.config;
        config.stages[1].model_file_path = "missing.onnx".into();

        let err = PipelineSession::new(config, 2, fixture.runtime).unwrap_err();
        assert!(matches!(err, CascadeError::Runtime { .. }));
    }
}
