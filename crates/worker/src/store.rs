//! Shared key-value store
//!
//! Task records, batch queues and model load locks live in a store shared by
//! every worker. The store is a capability trait so a networked backend can be
//! plugged in; [`MemoryStore`] serves tests and single-process deployments.

use async_trait::async_trait;
use inferloop_common::error::{InferLoopError, Result};
use inferloop_proto::{TaskId, TaskRecord};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Key prefix of persisted task records
pub const TASK_KEY_PREFIX: &str = "task:";

/// Atomic operations the task layer needs from the shared store
///
/// Every method is atomic with respect to concurrent callers on the same key.
#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one
    async fn set(&self, key: &str, value: String) -> Result<()>;

    /// Read and delete a value
    async fn take(&self, key: &str) -> Result<Option<String>>;

    /// List keys starting with `prefix`
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Append to the tail of a list, returning the resulting length
    async fn push(&self, list: &str, value: String) -> Result<usize>;

    /// Pop up to `max` items from the head of a list, in order
    async fn drain(&self, list: &str, max: usize) -> Result<Vec<String>>;

    /// Current length of a list
    async fn len(&self, list: &str) -> Result<usize>;

    /// Take the named lock for `token` if it is free or its lease expired
    async fn try_lock(&self, name: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Release the named lock if `token` still holds it
    async fn unlock(&self, name: &str, token: &str) -> Result<bool>;

    /// Connectivity check
    async fn ping(&self) -> Result<()>;
}

#[derive(Debug)]
struct LockEntry {
    token: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct MemoryInner {
    values: HashMap<String, String>,
    lists: HashMap<String, VecDeque<String>>,
    locks: HashMap<String, LockEntry>,
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.lists.contains_key(key) {
            return Err(wrong_type(key, "list"));
        }
        inner.values.insert(key.to_string(), value);
        Ok(())
    }

    async fn take(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().values.remove(key))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        let mut keys: Vec<String> = inner
            .values
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn push(&self, list: &str, value: String) -> Result<usize> {
        let mut inner = self.inner.lock();
        if inner.values.contains_key(list) {
            return Err(wrong_type(list, "value"));
        }
        let queue = inner.lists.entry(list.to_string()).or_default();
        queue.push_back(value);
        Ok(queue.len())
    }

    async fn drain(&self, list: &str, max: usize) -> Result<Vec<String>> {
        let mut inner = self.inner.lock();
        let Some(queue) = inner.lists.get_mut(list) else {
            return Ok(Vec::new());
        };
        let count = max.min(queue.len());
        Ok(queue.drain(..count).collect())
    }

    async fn len(&self, list: &str) -> Result<usize> {
        Ok(self.inner.lock().lists.get(list).map_or(0, VecDeque::len))
    }

    async fn try_lock(&self, name: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if let Some(entry) = inner.locks.get(name) {
            if entry.expires_at > now && entry.token != token {
                return Ok(false);
            }
        }
        inner.locks.insert(
            name.to_string(),
            LockEntry {
                token: token.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn unlock(&self, name: &str, token: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.locks.get(name) {
            Some(entry) if entry.token == token => {
                inner.locks.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

fn wrong_type(key: &str, held: &str) -> InferLoopError {
    InferLoopError::store(format!("key {} already holds a {}", key, held))
}

/// Lease-bounded named lock, released on drop if not released explicitly
pub struct ScopedLock {
    store: Arc<dyn SharedStore>,
    name: String,
    token: String,
    acquired_at: Instant,
    ttl: Duration,
    released: bool,
}

impl ScopedLock {
    /// Acquire `name`, retrying every `retry` until `wait` has elapsed
    pub async fn acquire(
        store: Arc<dyn SharedStore>,
        name: &str,
        ttl: Duration,
        wait: Duration,
        retry: Duration,
    ) -> Result<Self> {
        let token = uuid::Uuid::new_v4().to_string();
        let deadline = Instant::now() + wait;

        loop {
            if store.try_lock(name, &token, ttl).await? {
                trace!("Acquired lock {}", name);
                return Ok(Self {
                    store,
                    name: name.to_string(),
                    token,
                    acquired_at: Instant::now(),
                    ttl,
                    released: false,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(InferLoopError::lock_timeout(format!(
                    "could not acquire {} within {:?}",
                    name, wait
                )));
            }
            tokio::time::sleep(retry.min(deadline - now)).await;
        }
    }

    /// Time left before the lease expires
    pub fn lease_remaining(&self) -> Duration {
        self.ttl.saturating_sub(self.acquired_at.elapsed())
    }

    /// Release the lock; `false` if the lease had already passed to someone else
    pub async fn release(mut self) -> Result<bool> {
        self.released = true;
        let held = self.store.unlock(&self.name, &self.token).await?;
        if !held {
            warn!("Lock {} was no longer held at release", self.name);
        }
        Ok(held)
    }
}

impl Drop for ScopedLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let store = Arc::clone(&self.store);
        let name = std::mem::take(&mut self.name);
        let token = std::mem::take(&mut self.token);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.unlock(&name, &token).await {
                        warn!("Failed to release lock {} on drop: {}", name, e);
                    } else {
                        debug!("Released lock {} on drop", name);
                    }
                });
            }
            Err(_) => warn!("Lock {} dropped outside a runtime, left to expire", name),
        }
    }
}

/// Store key of a task record
pub fn task_key(id: &TaskId) -> String {
    format!("{}{}", TASK_KEY_PREFIX, id)
}

/// Load a task record
pub async fn load_task(store: &dyn SharedStore, id: &TaskId) -> Result<Option<TaskRecord>> {
    match store.get(&task_key(id)).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Persist a task record
pub async fn save_task(store: &dyn SharedStore, record: &TaskRecord) -> Result<()> {
    let raw = serde_json::to_string(record)?;
    store.set(&task_key(&record.id), raw).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_push_and_drain_fifo() {
        let store = MemoryStore::new();
        assert_eq!(store.push("q", "a".to_string()).await.unwrap(), 1);
        assert_eq!(store.push("q", "b".to_string()).await.unwrap(), 2);
        assert_eq!(store.push("q", "c".to_string()).await.unwrap(), 3);

        assert_eq!(store.drain("q", 2).await.unwrap(), vec!["a", "b"]);
        assert_eq!(store.len("q").await.unwrap(), 1);
        assert_eq!(store.drain("q", usize::MAX).await.unwrap(), vec!["c"]);
        assert!(store.drain("missing", 4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keys_by_prefix() {
        let store = MemoryStore::new();
        store.set("task:b", "1".to_string()).await.unwrap();
        store.set("task:a", "2".to_string()).await.unwrap();
        store.set("other", "3".to_string()).await.unwrap();

        assert_eq!(store.keys("task:").await.unwrap(), vec!["task:a", "task:b"]);
    }

    #[tokio::test]
    async fn test_take_removes_value() {
        let store = MemoryStore::new();
        store.set("k", "v".to_string()).await.unwrap();

        assert_eq!(store.take("k").await.unwrap().as_deref(), Some("v"));
        assert!(store.take("k").await.unwrap().is_none());
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_values_and_lists_do_not_share_keys() {
        let store = MemoryStore::new();
        store.set("plain", "v".to_string()).await.unwrap();
        store.push("queue", "a".to_string()).await.unwrap();

        let err = store.push("plain", "a".to_string()).await.unwrap_err();
        assert!(matches!(err, InferLoopError::Store(_)));
        assert!(err.is_retryable());
        assert!(store.set("queue", "v".to_string()).await.is_err());
        assert_eq!(store.len("queue").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_lock_exclusion_and_release() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(30);

        assert!(store.try_lock("l", "one", ttl).await.unwrap());
        assert!(!store.try_lock("l", "two", ttl).await.unwrap());
        assert!(!store.unlock("l", "two").await.unwrap());
        assert!(store.unlock("l", "one").await.unwrap());
        assert!(store.try_lock("l", "two", ttl).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_lease_expires() {
        let store = MemoryStore::new();
        assert!(store.try_lock("l", "one", Duration::from_secs(1)).await.unwrap());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(store.try_lock("l", "two", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scoped_lock_times_out() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let held = ScopedLock::acquire(
            Arc::clone(&store),
            "model_lock:m|false",
            Duration::from_secs(30),
            Duration::from_secs(1),
            Duration::from_millis(50),
        )
        .await
        .unwrap();

        let err = ScopedLock::acquire(
            Arc::clone(&store),
            "model_lock:m|false",
            Duration::from_secs(30),
            Duration::from_secs(1),
            Duration::from_millis(50),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, InferLoopError::LockTimeout(_)));

        assert!(held.release().await.unwrap());
    }

    #[tokio::test]
    async fn test_scoped_lock_released_on_drop() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let ttl = Duration::from_secs(30);
        {
            let _lock = ScopedLock::acquire(
                Arc::clone(&store),
                "l",
                ttl,
                Duration::from_secs(1),
                Duration::from_millis(10),
            )
            .await
            .unwrap();
        }

        // The drop hands the release to the runtime; the next acquire waits for it
        let lock = ScopedLock::acquire(
            Arc::clone(&store),
            "l",
            ttl,
            Duration::from_secs(1),
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        assert!(lock.release().await.unwrap());
    }
}
