//! InferLoop data types
//!
//! Task records persisted in the shared store, and the request/response
//! objects the transport layer exchanges with the task service.

pub mod api;
pub mod task;

pub use api::{
    GenerateResponse, HealthResponse, StatusLabel, StatusResponse, SubmitRequest, SubmitResponse,
    TaskListResponse,
};
pub use task::{InvalidTransition, TaskArgs, TaskId, TaskRecord, TaskState, TaskStatus};
