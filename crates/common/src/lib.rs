//! InferLoop common library
//!
//! This crate contains configuration, error and metrics code shared across InferLoop components.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::{BatchDelivery, InferLoopConfig, ModelSpec};
pub use error::{InferLoopError, Result};
pub use metrics::{LatencyTimer, MetricsRegistry, METRICS};
