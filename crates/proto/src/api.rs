//! Request and response objects exchanged with the transport layer

use crate::task::{TaskArgs, TaskId, TaskState, TaskStatus};
use serde::{Deserialize, Serialize};

/// Inference submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub text: String,
    pub model_name: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default)]
    pub speculative: bool,
}

fn default_batch_size() -> u32 {
    1
}

impl SubmitRequest {
    pub fn new(text: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model_name: model_name.into(),
            batch_size: default_batch_size(),
            speculative: false,
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_speculative(mut self, speculative: bool) -> Self {
        self.speculative = speculative;
        self
    }
}

impl From<SubmitRequest> for TaskArgs {
    fn from(req: SubmitRequest) -> Self {
        TaskArgs {
            text: req.text,
            model_name: req.model_name,
            batch_size: req.batch_size,
            speculative: req.speculative,
        }
    }
}

/// Acknowledgement of an accepted submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub task_id: TaskId,
}

/// Caller-facing status label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLabel {
    /// Pending or running
    Processing,
    Finished,
    Failed,
    /// Long-poll gave up; poll again or resubmit
    Exhausted,
    NotFound,
}

impl From<TaskState> for StatusLabel {
    fn from(state: TaskState) -> Self {
        match state {
            TaskState::Pending | TaskState::Running => StatusLabel::Processing,
            TaskState::Success => StatusLabel::Finished,
            TaskState::Failure => StatusLabel::Failed,
        }
    }
}

/// Status object returned for every status query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub task_id: TaskId,
    pub status: StatusLabel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl StatusResponse {
    pub fn exhausted(task_id: TaskId, attempts: u32) -> Self {
        Self {
            task_id,
            status: StatusLabel::Exhausted,
            result: None,
            detail: Some(format!("no terminal state after {} polling windows", attempts)),
        }
    }

    pub fn not_found(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: StatusLabel::NotFound,
            result: None,
            detail: None,
        }
    }

    pub fn failed(task_id: TaskId, detail: impl Into<String>) -> Self {
        Self {
            task_id,
            status: StatusLabel::Failed,
            result: None,
            detail: Some(detail.into()),
        }
    }
}

impl From<TaskStatus> for StatusResponse {
    fn from(status: TaskStatus) -> Self {
        Self {
            status: status.state.into(),
            task_id: status.task_id,
            result: status.result,
            detail: status.error,
        }
    }
}

/// All known task identifiers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskListResponse {
    pub tasks: Vec<TaskId>,
}

/// Result of a synchronous submit-and-await
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub task_id: TaskId,
    pub status: StatusLabel,
    pub result: String,
}

/// Health check outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub message: String,
}
