//! Error types for the Cascade pipeline

use thiserror::Error;

/// Main error type for Cascade operations
#[derive(Debug, Error, Clone)]
pub enum CascadeError {
    /// Configuration errors: missing keys, mismatched parallel vectors,
    /// name collisions across state and inter-stage sets
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Request validation errors detected at admission
    #[error("Invalid request: {message}")]
    Request { message: String },

    /// Errors reported by the backing inference runtime
    #[error("Runtime error: {message}")]
    Runtime { message: String },

    /// Stage execution and driver errors. The message already carries the
    /// request/step context, so it is surfaced verbatim.
    #[error("{message}")]
    Execution { message: String },

    /// I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

impl CascadeError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a request validation error
    pub fn request(message: impl Into<String>) -> Self {
        Self::Request {
            message: message.into(),
        }
    }

    /// Create a runtime error
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    /// Create an execution error
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Check if this error was detected before any stage ran
    pub fn is_admission_error(&self) -> bool {
        matches!(self, Self::Config { .. } | Self::Request { .. })
    }
}

impl From<std::io::Error> for CascadeError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<serde_json::Error> for CascadeError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
