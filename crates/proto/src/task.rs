//! Task records and their state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque task identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        TaskId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        TaskId(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        TaskId(s.to_string())
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Created, waiting for a worker
    Pending,

    /// Picked up by a worker
    Running,

    /// Finished with a result
    Success,

    /// Finished with an error
    Failure,
}

impl TaskState {
    /// Terminal states never change again
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failure)
    }

    /// Transitions allowed by the lifecycle `Pending -> Running -> {Success, Failure}`
    pub fn can_transition_to(self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Pending, TaskState::Running)
                | (TaskState::Running, TaskState::Success)
                | (TaskState::Running, TaskState::Failure)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Pending => "PENDING",
            TaskState::Running => "RUNNING",
            TaskState::Success => "SUCCESS",
            TaskState::Failure => "FAILURE",
        };
        f.write_str(name)
    }
}

/// Immutable snapshot of the submitted request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskArgs {
    pub text: String,
    pub model_name: String,
    pub batch_size: u32,
    pub speculative: bool,
}

/// Rejected state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid task transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: TaskState,
    pub to: TaskState,
}

/// Persisted task record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub args: TaskArgs,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Create a pending record with a fresh identifier
    pub fn new(args: TaskArgs) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::generate(),
            state: TaskState::Pending,
            result: None,
            error: None,
            args,
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(&mut self, next: TaskState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Mark the task as picked up by a worker
    pub fn start(&mut self) -> Result<(), InvalidTransition> {
        self.transition(TaskState::Running)
    }

    /// Record a successful result
    pub fn succeed(&mut self, result: String) -> Result<(), InvalidTransition> {
        self.transition(TaskState::Success)?;
        self.result = Some(result);
        Ok(())
    }

    /// Record a failure reason
    pub fn fail(&mut self, reason: String) -> Result<(), InvalidTransition> {
        self.transition(TaskState::Failure)?;
        self.error = Some(reason);
        Ok(())
    }

    /// Read-only view for observers
    pub fn status(&self) -> TaskStatus {
        TaskStatus {
            task_id: self.id.clone(),
            state: self.state,
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }
}

/// Point-in-time view of a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
