//! Model registry
//!
//! Lazily loads model variants and caches them for the lifetime of the
//! process. A variant is identified by its model name and decoding strategy.
//! First loads are serialized across workers by a named lock in the shared
//! store, and the cache is re-checked once the lock is held.

use crate::engine::{Decoding, InferenceEngine};
use crate::store::{ScopedLock, SharedStore};
use inferloop_common::config::{InferLoopConfig, ModelSpec};
use inferloop_common::error::{InferLoopError, Result};
use inferloop_common::{LatencyTimer, METRICS};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Cache key of a model variant: `<model_name>|<speculative>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelKey(String);

impl ModelKey {
    pub fn new(model_name: &str, speculative: bool) -> Self {
        ModelKey(format!("{}|{}", model_name, speculative))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the lock guarding the first load of this variant
    pub fn lock_name(&self) -> String {
        format!("model_lock:{}", self.0)
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shared reference to a loaded model variant
pub struct ModelHandle<M> {
    key: ModelKey,
    decoding: Decoding,
    instance: Arc<M>,
}

impl<M> Clone for ModelHandle<M> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            decoding: self.decoding,
            instance: Arc::clone(&self.instance),
        }
    }
}

impl<M> ModelHandle<M> {
    pub fn key(&self) -> &ModelKey {
        &self.key
    }

    pub fn decoding(&self) -> Decoding {
        self.decoding
    }

    pub fn instance(&self) -> &Arc<M> {
        &self.instance
    }

    /// Whether two handles point at the same loaded instance
    pub fn same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.instance, &other.instance)
    }
}

impl<M> fmt::Debug for ModelHandle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("key", &self.key)
            .field("decoding", &self.decoding)
            .finish()
    }
}

/// Load lock settings
#[derive(Debug, Clone, Copy)]
struct LockSettings {
    ttl: Duration,
    wait: Duration,
    retry: Duration,
}

/// Registry of loaded model variants
pub struct ModelRegistry<E: InferenceEngine> {
    /// Static model catalog
    catalog: BTreeMap<String, ModelSpec>,

    /// Backend used for loading
    engine: Arc<E>,

    /// Store providing the cross-worker load lock
    store: Arc<dyn SharedStore>,

    /// Loaded variants
    cache: RwLock<HashMap<ModelKey, ModelHandle<E::Model>>>,

    lock: LockSettings,

    /// Draft tokens for speculative variants
    speculative_pred_tokens: usize,
}

impl<E: InferenceEngine> ModelRegistry<E> {
    /// Create a registry from the configured catalog
    pub fn new(config: &InferLoopConfig, engine: Arc<E>, store: Arc<dyn SharedStore>) -> Self {
        Self {
            catalog: config.models.catalog.clone(),
            engine,
            store,
            cache: RwLock::new(HashMap::new()),
            lock: LockSettings {
                ttl: config.lock_ttl(),
                wait: config.lock_wait(),
                retry: Duration::from_millis(config.registry.lock_retry_ms),
            },
            speculative_pred_tokens: config.registry.speculative_pred_tokens,
        }
    }

    /// Whether `model_name` is in the catalog
    pub fn is_configured(&self, model_name: &str) -> bool {
        self.catalog.contains_key(model_name)
    }

    /// Keys of the variants loaded in this process
    pub fn loaded_keys(&self) -> Vec<ModelKey> {
        let mut keys: Vec<ModelKey> = self.cache.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Get a handle for a model variant, loading it on first use
    pub async fn resolve(&self, model_name: &str, speculative: bool) -> Result<ModelHandle<E::Model>> {
        let spec = self
            .catalog
            .get(model_name)
            .ok_or_else(|| InferLoopError::model_not_configured(model_name))?;

        let key = ModelKey::new(model_name, speculative);
        if let Some(handle) = self.cached(&key) {
            return Ok(handle);
        }

        let wait_start = Instant::now();
        let lock = ScopedLock::acquire(
            Arc::clone(&self.store),
            &key.lock_name(),
            self.lock.ttl,
            self.lock.wait,
            self.lock.retry,
        )
        .await?;
        METRICS.models.lock_wait.observe(wait_start.elapsed().as_secs_f64());

        let outcome = match self.cached(&key) {
            Some(handle) => {
                debug!("Model {} loaded by another worker while waiting", key);
                Ok(handle)
            }
            None => {
                let decoding = Decoding::select(speculative, self.speculative_pred_tokens);
                self.load(model_name, spec, key, decoding, lock.lease_remaining())
                    .await
            }
        };

        if let Err(e) = lock.release().await {
            warn!("Failed to release model lock: {}", e);
        }

        outcome
    }

    fn cached(&self, key: &ModelKey) -> Option<ModelHandle<E::Model>> {
        self.cache.read().get(key).cloned()
    }

    /// Load a variant while holding its lock; must finish within `lease`
    async fn load(
        &self,
        model_name: &str,
        spec: &ModelSpec,
        key: ModelKey,
        decoding: Decoding,
        lease: Duration,
    ) -> Result<ModelHandle<E::Model>> {
        info!(
            "Loading model {} from {} ({:?})",
            key,
            spec.path.display(),
            decoding
        );

        let engine = Arc::clone(&self.engine);
        let name = model_name.to_string();
        let spec = spec.clone();
        let load = tokio::task::spawn_blocking(move || {
            METRICS
                .models
                .load_duration
                .time(|| engine.load(&name, &spec, decoding))
        });

        let loaded = match tokio::time::timeout(lease, load).await {
            Err(_) => Err(InferLoopError::lock_timeout(format!(
                "loading {} exceeded the {:?} lock lease",
                key, lease
            ))),
            Ok(Err(join_err)) => Err(InferLoopError::model_load_failed(
                key.as_str(),
                format!("loader aborted: {}", join_err),
            )),
            Ok(Ok(Err(e @ InferLoopError::ModelLoadFailed { .. }))) => Err(e),
            Ok(Ok(Err(e))) => Err(InferLoopError::model_load_failed(key.as_str(), e.to_string())),
            Ok(Ok(Ok(instance))) => Ok(instance),
        };

        let instance = match loaded {
            Ok(instance) => instance,
            Err(e) => {
                METRICS.models.load_failures_total.inc();
                warn!("Model {} failed to load: {}", key, e);
                return Err(e);
            }
        };

        let handle = ModelHandle {
            key: key.clone(),
            decoding,
            instance: Arc::new(instance),
        };

        let cached = {
            let mut cache = self.cache.write();
            cache.insert(key.clone(), handle.clone());
            cache.len()
        };
        METRICS.models.loads_total.inc();
        METRICS.models.cached.set(cached as i64);

        info!("Model {} loaded", key);
        Ok(handle)
    }
}
