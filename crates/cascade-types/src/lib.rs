//! Core type definitions for the Cascade pipelined inference scheduler
//!
//! This crate contains the fundamental types shared across the Cascade
//! workspace: the error enum, request identifiers, tensor element types,
//! device identity, and the pipeline configuration model with its JSON
//! descriptor loader. It is deliberately lightweight so that every other
//! crate can depend on it without cycles.

pub mod config;
pub mod devices;
pub mod errors;
pub mod ids;

pub use config::{PipelineConfig, StageConfig};
pub use devices::{Device, ElementType};
pub use errors::CascadeError;
pub use ids::{ReqId, ReqIdGenerator};

/// Result type used throughout Cascade
pub type Result<T> = std::result::Result<T, CascadeError>;
