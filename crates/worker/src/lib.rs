//! InferLoop Worker
//!
//! Asynchronous inference task layer: tasks are submitted and tracked through
//! a shared store, executed by a worker pool, and run against cached model
//! variants, optionally batched with other prompts for the same model.

pub mod batching;
pub mod dispatcher;
pub mod engine;
pub mod registry;
pub mod service;
pub mod store;
pub mod tracker;

pub use batching::{BatchAccumulator, BatchMode, BatchOutcome, PARKED_MESSAGE};
pub use dispatcher::{TaskDispatcher, TaskExecutor, WorkQueue};
pub use engine::{Decoding, GenerationParams, InferenceEngine, MockEngine, MockModel};
pub use registry::{ModelHandle, ModelKey, ModelRegistry};
pub use service::InferenceService;
pub use store::{MemoryStore, ScopedLock, SharedStore};
pub use tracker::StatusTracker;
