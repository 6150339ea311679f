//! Configuration structures for InferLoop
//!
//! This module defines all configuration types used by the task service and its workers.
//! Configurations are loaded from YAML files and can be overridden by environment variables.
//! Every field has a default, so an empty file is a valid configuration.

use crate::error::{InferLoopError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for InferLoop
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InferLoopConfig {
    /// Worker pool configuration
    pub worker: WorkerConfig,

    /// Model catalog
    pub models: ModelsConfig,

    /// Model registry locking
    pub registry: RegistryConfig,

    /// Dynamic batching
    pub batching: BatchingConfig,

    /// Generation parameters handed to the engine
    pub generation: GenerationConfig,

    /// Status polling defaults
    pub polling: PollingConfig,

    /// Engine selection
    pub engine: EngineConfig,

    /// Observability configuration
    pub observability: ObservabilityConfig,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent task workers (0 = CPU count)
    pub pool_size: usize,

    /// Maximum number of tasks waiting for a worker
    pub max_queue_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            max_queue_size: default_max_queue_size(),
        }
    }
}

/// A single entry of the model catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Path to the model weights
    pub path: PathBuf,

    /// Threads the engine may use for this model
    #[serde(default = "default_model_threads")]
    pub n_threads: usize,

    /// Chat template name understood by the engine
    #[serde(default = "default_chat_format")]
    pub chat_format: String,
}

impl ModelSpec {
    /// Create a spec with default engine settings
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            n_threads: default_model_threads(),
            chat_format: default_chat_format(),
        }
    }
}

/// Model catalog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Known models by name
    pub catalog: BTreeMap<String, ModelSpec>,

    /// Optional JSON catalog file merged over `catalog` at load time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog_path: Option<PathBuf>,

    /// Model used for health checks
    pub default_model: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            catalog: BTreeMap::new(),
            catalog_path: None,
            default_model: default_model_name(),
        }
    }
}

impl ModelsConfig {
    /// Merge a JSON catalog file of the form `{"name": {"path": "..."}}`
    pub fn merge_catalog_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            InferLoopError::Config(format!("Failed to read model catalog {}: {}", path.display(), e))
        })?;

        let entries: BTreeMap<String, ModelSpec> = serde_json::from_str(&content).map_err(|e| {
            InferLoopError::Config(format!("Failed to parse model catalog {}: {}", path.display(), e))
        })?;

        self.catalog.extend(entries);
        Ok(())
    }
}

/// Model registry locking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Lease of the model load lock; a load must finish within it
    pub lock_ttl_secs: u64,

    /// How long a resolver waits to acquire the load lock
    pub lock_wait_secs: u64,

    /// Delay between lock acquisition attempts
    pub lock_retry_ms: u64,

    /// Draft tokens predicted per step in speculative mode
    pub speculative_pred_tokens: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: default_lock_secs(),
            lock_wait_secs: default_lock_secs(),
            lock_retry_ms: default_lock_retry_ms(),
            speculative_pred_tokens: default_pred_tokens(),
        }
    }
}

/// How results of a flushed batch reach the prompts that were queued
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchDelivery {
    /// Parked prompts get the "awaiting peers" sentinel, the flushing
    /// request gets the first generated text of the batch
    #[default]
    TriggerOnly,

    /// Every queued prompt waits for and receives its own text
    PerRequest,
}

/// Dynamic batching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// Result delivery policy
    pub delivery: BatchDelivery,

    /// How long a parked prompt waits before forcing a partial flush
    /// (per-request delivery only)
    pub max_wait_ms: u64,

    /// Prefix of batch queue keys in the shared store
    pub queue_prefix: String,

    /// Prefix of per-prompt result keys written by a flush
    /// (per-request delivery only)
    pub result_prefix: String,

    /// How often a parked prompt checks the store for its result
    pub result_poll_ms: u64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            delivery: BatchDelivery::default(),
            max_wait_ms: default_batch_wait_ms(),
            queue_prefix: default_queue_prefix(),
            result_prefix: default_result_prefix(),
            result_poll_ms: default_result_poll_ms(),
        }
    }
}

/// Generation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Maximum generated tokens per prompt
    pub max_tokens: u32,

    /// Stop sequences for single-prompt generation
    pub stop: Vec<String>,

    /// Stop sequences for batched generation
    pub batch_stop: Vec<String>,

    /// Prompt template, `{text}` is replaced by the trimmed request text
    pub prompt_template: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            stop: vec!["Q:".to_string(), "\n".to_string(), "A:".to_string()],
            batch_stop: vec!["Q:".to_string(), "\n".to_string()],
            prompt_template: default_prompt_template(),
        }
    }
}

impl GenerationConfig {
    /// Render the prompt for a request text
    pub fn render_prompt(&self, text: &str) -> String {
        self.prompt_template.replace("{text}", text.trim())
    }
}

/// Status polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Interval between status re-checks
    pub interval_ms: u64,

    /// Default long-poll window
    pub timeout_secs: u64,

    /// Default number of long-poll windows
    pub retry_limit: u32,

    /// Default bound for synchronous submit-and-await
    pub await_timeout_secs: u64,

    /// Bound for the health check
    pub health_timeout_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            timeout_secs: default_poll_timeout(),
            retry_limit: default_retry_limit(),
            await_timeout_secs: default_await_timeout(),
            health_timeout_secs: default_health_timeout(),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Replace real inference with canned responses
    pub mock: bool,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Enable Prometheus metrics
    pub enable_metrics: bool,

    /// Emit log lines as JSON instead of compact text
    pub structured_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: true,
            structured_logging: true,
        }
    }
}

/// Default value functions
fn default_pool_size() -> usize {
    0 // Means use CPU count
}

fn default_max_queue_size() -> usize {
    1024
}

fn default_model_threads() -> usize {
    8
}

fn default_chat_format() -> String {
    "llama-2".to_string()
}

fn default_model_name() -> String {
    "default".to_string()
}

fn default_lock_secs() -> u64 {
    30
}

fn default_lock_retry_ms() -> u64 {
    50
}

fn default_pred_tokens() -> usize {
    10
}

fn default_batch_wait_ms() -> u64 {
    5000
}

fn default_queue_prefix() -> String {
    "batch_queue".to_string()
}

fn default_result_prefix() -> String {
    "batch_result".to_string()
}

fn default_result_poll_ms() -> u64 {
    50
}

fn default_max_tokens() -> u32 {
    32
}

fn default_prompt_template() -> String {
    "Q: {text} Please respond in English. A: ".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_poll_timeout() -> u64 {
    30
}

fn default_retry_limit() -> u32 {
    3
}

fn default_await_timeout() -> u64 {
    10
}

fn default_health_timeout() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Parse the truthy spellings accepted by `MOCK_INFERENCE`
fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "1" | "yes")
}

impl InferLoopConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| InferLoopError::Config(format!("Failed to read config file {}: {}", path.display(), e)))?;

        let mut config: InferLoopConfig = serde_yaml::from_str(&content)
            .map_err(|e| InferLoopError::Config(format!("Failed to parse config file {}: {}", path.display(), e)))?;

        // Relative catalog paths are relative to the config file
        if let Some(catalog_path) = config.models.catalog_path.clone() {
            let catalog_path = match path.parent() {
                Some(dir) if catalog_path.is_relative() => dir.join(catalog_path),
                _ => catalog_path,
            };
            config.models.merge_catalog_file(catalog_path)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file if it exists, then apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::from_file(path)?
        } else {
            InferLoopConfig::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup
    ///
    /// Recognised variables: `MODEL_CONFIG_PATH`, `MOCK_INFERENCE`,
    /// `INFERLOOP_POOL_SIZE`, `INFERLOOP_BATCH_DELIVERY`, `INFERLOOP_LOG_LEVEL`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("MODEL_CONFIG_PATH") {
            let path = PathBuf::from(path);
            self.models.merge_catalog_file(&path)?;
            self.models.catalog_path = Some(path);
        }

        if let Some(mock) = lookup("MOCK_INFERENCE") {
            self.engine.mock = parse_flag(&mock);
        }

        if let Some(pool_size) = lookup("INFERLOOP_POOL_SIZE") {
            self.worker.pool_size = pool_size
                .parse()
                .map_err(|_| InferLoopError::config(format!("Invalid pool size: {}", pool_size)))?;
        }

        if let Some(delivery) = lookup("INFERLOOP_BATCH_DELIVERY") {
            self.batching.delivery = match delivery.as_str() {
                "trigger_only" => BatchDelivery::TriggerOnly,
                "per_request" => BatchDelivery::PerRequest,
                other => {
                    return Err(InferLoopError::config(format!("Invalid batch delivery: {}", other)));
                }
            };
        }

        if let Some(level) = lookup("INFERLOOP_LOG_LEVEL") {
            self.observability.log_level = level;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.worker.max_queue_size == 0 {
            return Err(InferLoopError::config("worker.max_queue_size must be greater than 0"));
        }

        if self.polling.interval_ms == 0 {
            return Err(InferLoopError::config("polling.interval_ms must be greater than 0"));
        }

        if self.polling.retry_limit == 0 {
            return Err(InferLoopError::config("polling.retry_limit must be greater than 0"));
        }

        if self.registry.lock_ttl_secs == 0 || self.registry.lock_retry_ms == 0 {
            return Err(InferLoopError::config("registry lock settings must be greater than 0"));
        }

        if self.batching.result_poll_ms == 0 {
            return Err(InferLoopError::config("batching.result_poll_ms must be greater than 0"));
        }

        if !self.models.catalog.is_empty() && !self.models.catalog.contains_key(&self.models.default_model) {
            return Err(InferLoopError::config(format!(
                "Default model '{}' not found in catalog",
                self.models.default_model
            )));
        }

        Ok(())
    }

    /// Effective number of pool workers
    pub fn pool_size(&self) -> usize {
        match self.worker.pool_size {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            n => n,
        }
    }

    /// Get the load lock lease as Duration
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.registry.lock_ttl_secs)
    }

    /// Get the load lock wait bound as Duration
    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.registry.lock_wait_secs)
    }

    /// Get the polling interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.polling.interval_ms)
    }

    /// Get the submit-and-await bound as Duration
    pub fn await_timeout(&self) -> Duration {
        Duration::from_secs(self.polling.await_timeout_secs)
    }

    /// Get the batch wait bound as Duration
    pub fn batch_max_wait(&self) -> Duration {
        Duration::from_millis(self.batching.max_wait_ms)
    }

    /// Get the batch result check interval as Duration
    pub fn batch_result_poll(&self) -> Duration {
        Duration::from_millis(self.batching.result_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = InferLoopConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.registry.lock_ttl_secs, 30);
        assert_eq!(config.polling.interval_ms, 1000);
        assert_eq!(config.generation.max_tokens, 32);
        assert_eq!(config.batching.delivery, BatchDelivery::TriggerOnly);
        assert!(config.pool_size() >= 1);
    }

    #[test]
    fn test_config_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
worker:
  pool_size: 4
models:
  default_model: modelA
  catalog:
    modelA:
      path: /models/a.gguf
batching:
  delivery: per_request
  max_wait_ms: 250
"#
        )
        .unwrap();

        let config = InferLoopConfig::from_file(file.path()).unwrap();
        assert_eq!(config.worker.pool_size, 4);
        assert_eq!(config.batching.delivery, BatchDelivery::PerRequest);
        assert_eq!(config.batch_max_wait(), Duration::from_millis(250));

        let spec = &config.models.catalog["modelA"];
        assert_eq!(spec.path, PathBuf::from("/models/a.gguf"));
        assert_eq!(spec.n_threads, 8);
        assert_eq!(spec.chat_format, "llama-2");
        // Untouched sections keep their defaults
        assert_eq!(config.polling.retry_limit, 3);
    }

    #[test]
    fn test_relative_catalog_path_resolves_next_to_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("models.json"),
            r#"{"modelA": {"path": "/models/a.gguf"}}"#,
        )
        .unwrap();
        let config_path = dir.path().join("worker-config.yaml");
        std::fs::write(
            &config_path,
            "models:\n  catalog_path: models.json\n  default_model: modelA\n",
        )
        .unwrap();

        let config = InferLoopConfig::from_file(&config_path).unwrap();
        assert_eq!(
            config.models.catalog["modelA"].path,
            PathBuf::from("/models/a.gguf")
        );
    }

    #[test]
    fn test_config_validation_unknown_default_model() {
        let mut config = InferLoopConfig::default();
        config
            .models
            .catalog
            .insert("modelA".to_string(), ModelSpec::new("/models/a.gguf"));
        config.models.default_model = "modelB".to_string();

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_zero_retry_limit() {
        let mut config = InferLoopConfig::default();
        config.polling.retry_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides_from_lookup() {
        let mut catalog = tempfile::NamedTempFile::new().unwrap();
        write!(catalog, r#"{{"modelA": {{"path": "/models/a.gguf"}}}}"#).unwrap();

        let vars: HashMap<&str, String> = HashMap::from([
            ("MODEL_CONFIG_PATH", catalog.path().display().to_string()),
            ("MOCK_INFERENCE", "Yes".to_string()),
            ("INFERLOOP_POOL_SIZE", "2".to_string()),
            ("INFERLOOP_BATCH_DELIVERY", "per_request".to_string()),
        ]);

        let mut config = InferLoopConfig::default();
        config.apply_overrides(|key| vars.get(key).cloned()).unwrap();

        assert!(config.engine.mock);
        assert_eq!(config.worker.pool_size, 2);
        assert_eq!(config.batching.delivery, BatchDelivery::PerRequest);
        assert!(config.models.catalog.contains_key("modelA"));
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let mut config = InferLoopConfig::default();
        let result = config.apply_overrides(|key| {
            (key == "INFERLOOP_POOL_SIZE").then(|| "many".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_render_prompt() {
        let generation = GenerationConfig::default();
        assert_eq!(
            generation.render_prompt("  hello "),
            "Q: hello Please respond in English. A: "
        );
    }
}
