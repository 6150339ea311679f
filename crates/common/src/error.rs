//! Common error types for InferLoop
//!
//! This module defines all error types used across the InferLoop system.
//! Errors raised inside a task are recorded as failure text on the task,
//! everything else is returned to the immediate caller.

use thiserror::Error;

/// Main error type for InferLoop
#[derive(Error, Debug)]
pub enum InferLoopError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested model is absent from the model catalog
    #[error("Model not configured: {0}")]
    ModelNotConfigured(String),

    /// Model could not be loaded (missing weights, engine failure, ...)
    #[error("Model load failed for {key}: {reason}")]
    ModelLoadFailed { key: String, reason: String },

    /// Named lock could not be acquired (or its lease ran out)
    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    /// Engine returned no usable output
    #[error("Inference failed: {0}")]
    InferenceFailed(String),

    /// Unknown task identifier
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Long-poll used up its whole retry budget
    #[error("Polling exhausted for task {task_id} after {attempts} attempts")]
    PollExhausted { task_id: String, attempts: u32 },

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Queue full (backpressure)
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Shared store errors
    #[error("Store error: {0}")]
    Store(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl InferLoopError {
    /// Whether the same request may succeed if issued again later.
    ///
    /// Caller errors (unknown model, unknown task, invalid input) and
    /// inference failures are final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InferLoopError::ModelLoadFailed { .. }
                | InferLoopError::LockTimeout(_)
                | InferLoopError::Timeout(_)
                | InferLoopError::QueueFull(_)
                | InferLoopError::PollExhausted { .. }
                | InferLoopError::Store(_)
        )
    }

    /// Short machine-readable kind, used for metrics labels and logs
    pub fn kind(&self) -> &'static str {
        match self {
            InferLoopError::Config(_) => "config",
            InferLoopError::ModelNotConfigured(_) => "model_not_configured",
            InferLoopError::ModelLoadFailed { .. } => "model_load_failed",
            InferLoopError::LockTimeout(_) => "lock_timeout",
            InferLoopError::InferenceFailed(_) => "inference_failed",
            InferLoopError::TaskNotFound(_) => "task_not_found",
            InferLoopError::PollExhausted { .. } => "poll_exhausted",
            InferLoopError::Timeout(_) => "timeout",
            InferLoopError::QueueFull(_) => "queue_full",
            InferLoopError::InvalidInput(_) => "invalid_input",
            InferLoopError::Store(_) => "store",
            InferLoopError::Serialization(_) => "serialization",
            InferLoopError::Io(_) => "io",
            InferLoopError::Internal(_) => "internal",
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        InferLoopError::Config(msg.into())
    }

    /// Create a model-not-configured error
    pub fn model_not_configured(name: impl Into<String>) -> Self {
        InferLoopError::ModelNotConfigured(name.into())
    }

    /// Create a model load error
    pub fn model_load_failed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        InferLoopError::ModelLoadFailed {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a lock timeout error
    pub fn lock_timeout(msg: impl Into<String>) -> Self {
        InferLoopError::LockTimeout(msg.into())
    }

    /// Create an inference error
    pub fn inference_failed(msg: impl Into<String>) -> Self {
        InferLoopError::InferenceFailed(msg.into())
    }

    /// Create a task-not-found error
    pub fn task_not_found(task_id: impl Into<String>) -> Self {
        InferLoopError::TaskNotFound(task_id.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        InferLoopError::InvalidInput(msg.into())
    }

    /// Create a queue full error
    pub fn queue_full(msg: impl Into<String>) -> Self {
        InferLoopError::QueueFull(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        InferLoopError::Timeout(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        InferLoopError::Store(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        InferLoopError::Internal(msg.into())
    }
}

/// Result type alias for InferLoop operations
pub type Result<T> = std::result::Result<T, InferLoopError>;
