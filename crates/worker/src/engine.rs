//! Inference engine boundary
//!
//! Token generation is supplied by an external backend. The task layer only
//! needs to load a model variant and turn prompts into text; both calls are
//! blocking and are run off the async executor by their callers.

use inferloop_common::config::{GenerationConfig, ModelSpec};
use inferloop_common::error::{InferLoopError, Result};
use std::time::Duration;

/// Decoding strategy a model variant is loaded with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decoding {
    /// Plain autoregressive decoding
    Standard,

    /// Speculative decoding with a prompt-lookup draft
    PromptLookup { num_pred_tokens: usize },
}

impl Decoding {
    /// Pick the strategy for a request's speculative flag
    pub fn select(speculative: bool, num_pred_tokens: usize) -> Self {
        if speculative {
            Decoding::PromptLookup { num_pred_tokens }
        } else {
            Decoding::Standard
        }
    }
}

/// Per-call generation parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationParams {
    /// Maximum generated tokens
    pub max_tokens: u32,

    /// Generation stops at any of these
    pub stop: Vec<String>,

    /// Prepend the prompt to the generated text
    pub echo: bool,
}

impl GenerationParams {
    /// Parameters for a single, unbatched prompt
    pub fn direct(config: &GenerationConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            stop: config.stop.clone(),
            echo: false,
        }
    }

    /// Parameters for prompts flushed together as a batch
    pub fn batched(config: &GenerationConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            stop: config.batch_stop.clone(),
            echo: true,
        }
    }
}

/// Backend that loads models and generates text
pub trait InferenceEngine: Send + Sync + 'static {
    /// Loaded model instance
    type Model: Send + Sync + 'static;

    /// Load a model variant
    fn load(&self, name: &str, spec: &ModelSpec, decoding: Decoding) -> Result<Self::Model>;

    /// Generate text for one prompt
    fn generate(&self, model: &Self::Model, prompt: &str, params: &GenerationParams) -> Result<String>;

    /// Generate text for several prompts, one result per prompt in order
    fn generate_batch(
        &self,
        model: &Self::Model,
        prompts: &[String],
        params: &GenerationParams,
    ) -> Vec<Result<String>> {
        prompts
            .iter()
            .map(|prompt| self.generate(model, prompt, params))
            .collect()
    }
}

/// Model handle produced by [`MockEngine`]
#[derive(Debug, Clone)]
pub struct MockModel {
    pub name: String,
    pub decoding: Decoding,
}

/// Engine returning canned text, for running the service without a backend
#[derive(Debug, Clone, Default)]
pub struct MockEngine {
    latency: Duration,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate generation latency
    pub fn with_latency(latency: Duration) -> Self {
        Self { latency }
    }
}

impl InferenceEngine for MockEngine {
    type Model = MockModel;

    fn load(&self, name: &str, _spec: &ModelSpec, decoding: Decoding) -> Result<MockModel> {
        Ok(MockModel {
            name: name.to_string(),
            decoding,
        })
    }

    fn generate(&self, model: &MockModel, prompt: &str, _params: &GenerationParams) -> Result<String> {
        if prompt.is_empty() {
            return Err(InferLoopError::inference_failed("empty prompt"));
        }
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        Ok(format!("Mock inference result for: {}", model.name))
    }
}
