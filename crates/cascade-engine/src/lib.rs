//! # Cascade Engine
//!
//! Pipelined inference scheduler for autoregressive decoding across
//! sequential GPU-resident model shards.
//!
//! A full transformer is split into N *stages*, each a compiled session
//! pinned to one device. [`PipelineSession::run`] drives `num_steps`
//! decoding iterations for a batch of requests: every iteration threads
//! each request through stages 0…N−1, forward activations flow between
//! stages as renamed tensor handles, and per-stage KV state loops back
//! into the same stage on the next step through rotating preallocated
//! buffers. Between steps the driver greedily selects the next token from
//! the final stage's logits and re-feeds it as stage-0 input.
//!
//! Scheduling is message passing over threads: a fixed worker pool runs
//! one `(request, step, stage)` per task, and a single-consumer completion
//! queue feeds the driver. Per-request order is strict because the driver
//! only submits a request's next task after receiving the previous one;
//! different requests pipeline freely, even through the same stage.

pub mod frame;
pub mod pool;
pub mod queue;
pub mod sampling;
pub mod session;
pub mod testing;
pub mod token;
mod worker;

pub use pool::TaskPool;
pub use queue::ResponseQueue;
pub use session::{PipelineSession, StageSession};
pub use token::Token;

// Re-export the contract and shared types the public API is written in.
pub use cascade_runtime::{
    HostTensor, InferenceRuntime, MemoryDescriptor, PipelineRequest, PipelineResponse, TensorRef,
    TensorValue,
};
pub use cascade_types::{CascadeError, PipelineConfig, ReqId, Result, StageConfig};
