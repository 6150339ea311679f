//! Dynamic request batching
//!
//! Prompts submitted with a batch size above one are parked in a queue in the
//! shared store, keyed by model variant and batch size. The submission that
//! brings a queue to its batch size drains it and runs a single batched
//! inference call over every drained prompt, in enqueue order.
//!
//! What parked submissions receive depends on [`BatchDelivery`]:
//! with `TriggerOnly` they return a sentinel immediately and only the flushing
//! submission gets text back (the first of the batch); with `PerRequest`
//! every prompt waits for its own text. A flush may run in a different
//! process than the one that parked a prompt, so results for prompts without
//! a local waiter are written to the store under a per-prompt key.

use crate::engine::{GenerationParams, InferenceEngine};
use crate::registry::ModelHandle;
use crate::store::SharedStore;
use inferloop_common::config::{BatchDelivery, InferLoopConfig};
use inferloop_common::error::{InferLoopError, Result};
use inferloop_common::{LatencyTimer, METRICS};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Text returned to parked submissions under `TriggerOnly` delivery
pub const PARKED_MESSAGE: &str = "Request added to batch, waiting for more requests.";

/// Batching strategy selected by a request's batch size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// Run the prompt on its own
    Direct,

    /// Collect this many prompts per inference call
    Pooled(usize),
}

impl BatchMode {
    pub fn from_batch_size(batch_size: u32) -> Result<Self> {
        match batch_size {
            0 => Err(InferLoopError::invalid_input("batch size must be at least 1")),
            1 => Ok(BatchMode::Direct),
            n => Ok(BatchMode::Pooled(n as usize)),
        }
    }
}

/// What a submission gets back from the accumulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Generated text
    Generated(String),

    /// Parked until enough peers arrive; no text for this submission
    Parked,
}

impl BatchOutcome {
    /// Text recorded as the task result
    pub fn into_text(self) -> String {
        match self {
            BatchOutcome::Generated(text) => text,
            BatchOutcome::Parked => PARKED_MESSAGE.to_string(),
        }
    }
}

/// Queue entry as stored in the shared store
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueuedPrompt {
    id: Uuid,
    prompt: String,
}

/// Result of one batched prompt, as handed to a waiter in another process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum DeliveredResult {
    Text(String),
    Error(String),
}

impl From<Result<String>> for DeliveredResult {
    fn from(result: Result<String>) -> Self {
        match result {
            Ok(text) => DeliveredResult::Text(text),
            Err(InferLoopError::InferenceFailed(msg)) => DeliveredResult::Error(msg),
            Err(e) => DeliveredResult::Error(e.to_string()),
        }
    }
}

impl DeliveredResult {
    fn into_result(self) -> Result<String> {
        match self {
            DeliveredResult::Text(text) => Ok(text),
            DeliveredResult::Error(msg) => Err(InferLoopError::InferenceFailed(msg)),
        }
    }
}

type Waiter = oneshot::Sender<Result<String>>;

/// Batch accumulator for all model variants of a process
pub struct BatchAccumulator<E: InferenceEngine> {
    store: Arc<dyn SharedStore>,
    engine: Arc<E>,
    delivery: BatchDelivery,

    /// Bound on waiting for peers before forcing a partial flush
    max_wait: Duration,

    queue_prefix: String,
    result_prefix: String,

    /// Store check interval while waiting for a result
    result_poll: Duration,

    direct_params: GenerationParams,
    batch_params: GenerationParams,

    /// Result channels of prompts parked by this process (`PerRequest`
    /// delivery); results for prompts parked elsewhere go through the store
    waiters: Mutex<HashMap<Uuid, Waiter>>,
}

impl<E: InferenceEngine> BatchAccumulator<E> {
    /// Create a new accumulator
    pub fn new(config: &InferLoopConfig, engine: Arc<E>, store: Arc<dyn SharedStore>) -> Self {
        Self {
            store,
            engine,
            delivery: config.batching.delivery,
            max_wait: config.batch_max_wait(),
            queue_prefix: config.batching.queue_prefix.clone(),
            result_prefix: config.batching.result_prefix.clone(),
            result_poll: config.batch_result_poll(),
            direct_params: GenerationParams::direct(&config.generation),
            batch_params: GenerationParams::batched(&config.generation),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Store key of the queue for a model variant and batch size
    pub fn queue_key(&self, handle: &ModelHandle<E::Model>, batch_size: usize) -> String {
        format!("{}:{}:{}", self.queue_prefix, handle.key(), batch_size)
    }

    fn result_key(&self, id: Uuid) -> String {
        format!("{}:{}", self.result_prefix, id)
    }

    /// Prompts currently parked for a model variant and batch size
    pub async fn pending(&self, handle: &ModelHandle<E::Model>, batch_size: usize) -> Result<usize> {
        self.store.len(&self.queue_key(handle, batch_size)).await
    }

    /// Run a prompt, batching it with peers when `batch_size > 1`
    pub async fn submit(
        &self,
        handle: &ModelHandle<E::Model>,
        prompt: String,
        batch_size: u32,
    ) -> Result<BatchOutcome> {
        match BatchMode::from_batch_size(batch_size)? {
            BatchMode::Direct => {
                METRICS.batching.direct_total.inc();
                self.infer_direct(handle, prompt).await.map(BatchOutcome::Generated)
            }
            BatchMode::Pooled(size) => self.enqueue(handle, prompt, size).await,
        }
    }

    async fn infer_direct(&self, handle: &ModelHandle<E::Model>, prompt: String) -> Result<String> {
        let engine = Arc::clone(&self.engine);
        let model = Arc::clone(handle.instance());
        let params = self.direct_params.clone();

        let text = tokio::task::spawn_blocking(move || engine.generate(&model, &prompt, &params))
            .await
            .map_err(|e| InferLoopError::inference_failed(format!("generation aborted: {}", e)))??;

        usable_text(text.trim().to_string())
    }

    async fn enqueue(
        &self,
        handle: &ModelHandle<E::Model>,
        prompt: String,
        batch_size: usize,
    ) -> Result<BatchOutcome> {
        let key = self.queue_key(handle, batch_size);
        let entry = QueuedPrompt {
            id: Uuid::new_v4(),
            prompt,
        };
        let payload = serde_json::to_string(&entry)?;

        // Registered before the push so a concurrent flush in this process can deliver
        let receiver = match self.delivery {
            BatchDelivery::PerRequest => Some(self.register_waiter(entry.id)),
            BatchDelivery::TriggerOnly => None,
        };

        let queued = match self.store.push(&key, payload).await {
            Ok(len) => len,
            Err(e) => {
                self.waiters.lock().remove(&entry.id);
                return Err(e);
            }
        };

        if queued < batch_size {
            METRICS.batching.parked_total.inc();
            trace!("Parked prompt {} on {} ({}/{})", entry.id, key, queued, batch_size);
            return match receiver {
                None => Ok(BatchOutcome::Parked),
                Some(receiver) => self
                    .await_delivery(handle, &key, entry.id, receiver)
                    .await
                    .map(BatchOutcome::Generated),
            };
        }

        let results = match self.flush(handle, &key).await {
            Ok(results) => results,
            Err(e) => {
                self.waiters.lock().remove(&entry.id);
                return Err(e);
            }
        };
        match receiver {
            None => match results.into_iter().next() {
                Some((_, first)) => first.map(BatchOutcome::Generated),
                // A concurrent flush took every entry, including ours
                None => Ok(BatchOutcome::Parked),
            },
            Some(receiver) => {
                self.deliver(results).await;
                self.await_delivery(handle, &key, entry.id, receiver)
                    .await
                    .map(BatchOutcome::Generated)
            }
        }
    }

    fn register_waiter(&self, id: Uuid) -> oneshot::Receiver<Result<String>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(id, tx);
        rx
    }

    /// Wait for this prompt's result, forcing a partial flush if peers never come
    async fn await_delivery(
        &self,
        handle: &ModelHandle<E::Model>,
        key: &str,
        id: Uuid,
        mut receiver: oneshot::Receiver<Result<String>>,
    ) -> Result<String> {
        let result = self.collect(handle, key, id, &mut receiver).await;
        self.waiters.lock().remove(&id);
        result
    }

    async fn collect(
        &self,
        handle: &ModelHandle<E::Model>,
        key: &str,
        id: Uuid,
        receiver: &mut oneshot::Receiver<Result<String>>,
    ) -> Result<String> {
        if let Some(result) = self.wait_for_result(id, receiver).await {
            return result;
        }

        debug!("No full batch on {} within {:?}, flushing what is queued", key, self.max_wait);
        let results = self.flush(handle, key).await?;
        self.deliver(results).await;

        if let Some(result) = self.wait_for_result(id, receiver).await {
            return result;
        }
        Err(InferLoopError::inference_failed(format!(
            "batch result not delivered within {:?}",
            self.max_wait * 2
        )))
    }

    /// Wait up to `max_wait` for a result from a local flush or from the store
    async fn wait_for_result(
        &self,
        id: Uuid,
        receiver: &mut oneshot::Receiver<Result<String>>,
    ) -> Option<Result<String>> {
        let key = self.result_key(id);
        let deadline = Instant::now() + self.max_wait;

        loop {
            match self.store.take(&key).await {
                Ok(Some(raw)) => {
                    return Some(
                        serde_json::from_str::<DeliveredResult>(&raw)
                            .map_err(InferLoopError::from)
                            .and_then(DeliveredResult::into_result),
                    )
                }
                Ok(None) => {}
                Err(e) => return Some(Err(e)),
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            tokio::select! {
                delivered = &mut *receiver => {
                    return Some(delivered.unwrap_or_else(|_| Err(closed_channel())));
                }
                _ = tokio::time::sleep_until((now + self.result_poll).min(deadline)) => {}
            }
        }
    }

    /// Hand each drained prompt's result to its waiter
    ///
    /// Waiters parked by this process get it over their channel; the rest
    /// find it in the store under their result key.
    async fn deliver(&self, results: Vec<(Uuid, Result<String>)>) {
        let mut remote = Vec::new();
        {
            let mut waiters = self.waiters.lock();
            for (id, result) in results {
                match waiters.remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => remote.push((id, result)),
                }
            }
        }

        for (id, result) in remote {
            let payload = match serde_json::to_string(&DeliveredResult::from(result)) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Failed to encode result of batched prompt {}: {}", id, e);
                    continue;
                }
            };
            match self.store.set(&self.result_key(id), payload).await {
                Ok(()) => trace!("Stored result of batched prompt {}", id),
                Err(e) => warn!("Failed to store result of batched prompt {}: {}", id, e),
            }
        }
    }

    /// Drain the queue and run one batched inference over every entry
    ///
    /// Returns one result per drained entry in enqueue order; empty when a
    /// concurrent flush already emptied the queue.
    async fn flush(
        &self,
        handle: &ModelHandle<E::Model>,
        key: &str,
    ) -> Result<Vec<(Uuid, Result<String>)>> {
        let drained = self.store.drain(key, usize::MAX).await?;
        if drained.is_empty() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::with_capacity(drained.len());
        let mut prompts = Vec::with_capacity(drained.len());
        for raw in drained {
            match serde_json::from_str::<QueuedPrompt>(&raw) {
                Ok(entry) => {
                    ids.push(entry.id);
                    prompts.push(entry.prompt);
                }
                Err(e) => warn!("Skipping malformed batch entry on {}: {}", key, e),
            }
        }

        let size = prompts.len();
        METRICS.batching.flushes_total.inc();
        METRICS.batching.batch_size.observe(size as f64);
        debug!("Flushing batch of {} prompts from {}", size, key);

        let engine = Arc::clone(&self.engine);
        let model = Arc::clone(handle.instance());
        let params = self.batch_params.clone();
        let outputs = tokio::task::spawn_blocking(move || {
            METRICS
                .batching
                .inference_duration
                .time(|| engine.generate_batch(&model, &prompts, &params))
        })
        .await;

        let mut outputs = match outputs {
            Ok(outputs) => outputs,
            Err(e) => {
                warn!("Batched generation on {} aborted: {}", key, e);
                return Ok(ids
                    .into_iter()
                    .map(|id| (id, Err(InferLoopError::inference_failed("batched generation aborted"))))
                    .collect());
            }
        };

        if outputs.len() != size {
            warn!("Engine returned {} outputs for a batch of {}", outputs.len(), size);
        }
        outputs.resize_with(size, || {
            Err(InferLoopError::inference_failed("no output for batched prompt"))
        });

        Ok(ids
            .into_iter()
            .zip(outputs)
            .map(|(id, output)| (id, output.and_then(usable_text)))
            .collect())
    }
}

fn usable_text(text: String) -> Result<String> {
    if text.trim().is_empty() {
        return Err(InferLoopError::inference_failed("no valid response"));
    }
    Ok(text)
}

fn closed_channel() -> InferLoopError {
    InferLoopError::inference_failed("batch result channel closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Decoding;
    use crate::registry::ModelRegistry;
    use crate::store::MemoryStore;
    use inferloop_common::config::ModelSpec;

    /// Engine recording every batch it is asked to generate
    #[derive(Default)]
    struct RecordingEngine {
        batches: Mutex<Vec<Vec<String>>>,
    }

    impl InferenceEngine for RecordingEngine {
        type Model = ();

        fn load(&self, _name: &str, _spec: &ModelSpec, _decoding: Decoding) -> Result<()> {
            Ok(())
        }

        fn generate(&self, _model: &(), prompt: &str, _params: &GenerationParams) -> Result<String> {
            Ok(format!("  out:{}  ", prompt))
        }

        fn generate_batch(
            &self,
            _model: &(),
            prompts: &[String],
            _params: &GenerationParams,
        ) -> Vec<Result<String>> {
            self.batches.lock().push(prompts.to_vec());
            prompts.iter().map(|p| Ok(format!("out:{}", p))).collect()
        }
    }

    /// Store that refuses to drain lists
    struct UndrainableStore(MemoryStore);

    #[async_trait::async_trait]
    impl SharedStore for UndrainableStore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.0.get(key).await
        }

        async fn set(&self, key: &str, value: String) -> Result<()> {
            self.0.set(key, value).await
        }

        async fn take(&self, key: &str) -> Result<Option<String>> {
            self.0.take(key).await
        }

        async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
            self.0.keys(prefix).await
        }

        async fn push(&self, list: &str, value: String) -> Result<usize> {
            self.0.push(list, value).await
        }

        async fn drain(&self, _list: &str, _max: usize) -> Result<Vec<String>> {
            Err(InferLoopError::store("drain refused"))
        }

        async fn len(&self, list: &str) -> Result<usize> {
            self.0.len(list).await
        }

        async fn try_lock(&self, name: &str, token: &str, ttl: Duration) -> Result<bool> {
            self.0.try_lock(name, token, ttl).await
        }

        async fn unlock(&self, name: &str, token: &str) -> Result<bool> {
            self.0.unlock(name, token).await
        }

        async fn ping(&self) -> Result<()> {
            self.0.ping().await
        }
    }

    struct Fixture {
        config: InferLoopConfig,
        engine: Arc<RecordingEngine>,
        store: Arc<dyn SharedStore>,
        accumulator: Arc<BatchAccumulator<RecordingEngine>>,
        handle: ModelHandle<()>,
    }

    impl Fixture {
        /// Another accumulator on the same store, as in a second worker process
        fn peer(&self) -> Arc<BatchAccumulator<RecordingEngine>> {
            Arc::new(BatchAccumulator::new(
                &self.config,
                Arc::clone(&self.engine),
                Arc::clone(&self.store),
            ))
        }
    }

    async fn fixture(delivery: BatchDelivery, max_wait_ms: u64) -> Fixture {
        fixture_on(delivery, max_wait_ms, Arc::new(MemoryStore::new())).await
    }

    async fn fixture_on(
        delivery: BatchDelivery,
        max_wait_ms: u64,
        store: Arc<dyn SharedStore>,
    ) -> Fixture {
        let mut config = InferLoopConfig::default();
        config
            .models
            .catalog
            .insert("modelA".to_string(), ModelSpec::new("/models/a.gguf"));
        config.batching.delivery = delivery;
        config.batching.max_wait_ms = max_wait_ms;

        let engine = Arc::new(RecordingEngine::default());
        let registry = ModelRegistry::new(&config, Arc::clone(&engine), Arc::clone(&store));
        let handle = registry.resolve("modelA", false).await.unwrap();
        let accumulator = Arc::new(BatchAccumulator::new(
            &config,
            Arc::clone(&engine),
            Arc::clone(&store),
        ));

        Fixture {
            config,
            engine,
            store,
            accumulator,
            handle,
        }
    }

    #[test]
    fn test_batch_mode_selection() {
        assert!(BatchMode::from_batch_size(0).is_err());
        assert_eq!(BatchMode::from_batch_size(1).unwrap(), BatchMode::Direct);
        assert_eq!(BatchMode::from_batch_size(4).unwrap(), BatchMode::Pooled(4));
    }

    #[tokio::test]
    async fn test_direct_bypasses_queue() {
        let f = fixture(BatchDelivery::TriggerOnly, 1000).await;

        let outcome = f
            .accumulator
            .submit(&f.handle, "hello".to_string(), 1)
            .await
            .unwrap();

        assert_eq!(outcome, BatchOutcome::Generated("out:hello".to_string()));
        assert!(f.engine.batches.lock().is_empty());
    }

    #[tokio::test]
    async fn test_underfilled_batch_parks_every_caller() {
        let f = fixture(BatchDelivery::TriggerOnly, 1000).await;

        for prompt in ["a", "b"] {
            let outcome = f
                .accumulator
                .submit(&f.handle, prompt.to_string(), 3)
                .await
                .unwrap();
            assert_eq!(outcome, BatchOutcome::Parked);
            assert_eq!(outcome.into_text(), PARKED_MESSAGE);
        }

        assert_eq!(f.accumulator.pending(&f.handle, 3).await.unwrap(), 2);
        assert!(f.engine.batches.lock().is_empty());
    }

    #[tokio::test]
    async fn test_full_batch_flushes_once_in_fifo_order() {
        let f = fixture(BatchDelivery::TriggerOnly, 1000).await;

        let mut outcomes = Vec::new();
        for prompt in ["a", "b", "c"] {
            outcomes.push(
                f.accumulator
                    .submit(&f.handle, prompt.to_string(), 3)
                    .await
                    .unwrap(),
            );
        }

        assert_eq!(outcomes[0], BatchOutcome::Parked);
        assert_eq!(outcomes[1], BatchOutcome::Parked);
        // The flushing request receives the first text of the batch
        assert_eq!(outcomes[2], BatchOutcome::Generated("out:a".to_string()));

        let batches = f.engine.batches.lock().clone();
        assert_eq!(batches, vec![vec!["a".to_string(), "b".to_string(), "c".to_string()]]);
        assert_eq!(f.accumulator.pending(&f.handle, 3).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submissions_trigger_one_flush() {
        let f = fixture(BatchDelivery::TriggerOnly, 1000).await;

        let mut tasks = Vec::new();
        for i in 0..4 {
            let accumulator = Arc::clone(&f.accumulator);
            let handle = f.handle.clone();
            tasks.push(tokio::spawn(async move {
                accumulator.submit(&handle, format!("p{}", i), 4).await
            }));
        }

        let mut generated = 0;
        for task in tasks {
            if let BatchOutcome::Generated(_) = task.await.unwrap().unwrap() {
                generated += 1;
            }
        }

        assert_eq!(generated, 1);
        let batches = f.engine.batches.lock().clone();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_per_request_delivery_returns_own_text() {
        let f = fixture(BatchDelivery::PerRequest, 5000).await;

        let mut tasks = Vec::new();
        for i in 0..3 {
            let accumulator = Arc::clone(&f.accumulator);
            let handle = f.handle.clone();
            tasks.push(tokio::spawn(async move {
                accumulator.submit(&handle, format!("p{}", i), 3).await
            }));
        }

        for (i, task) in tasks.into_iter().enumerate() {
            let outcome = task.await.unwrap().unwrap();
            assert_eq!(outcome, BatchOutcome::Generated(format!("out:p{}", i)));
        }
        assert_eq!(f.engine.batches.lock().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_per_request_delivery_across_processes() {
        let f = fixture(BatchDelivery::PerRequest, 5000).await;
        let peer = f.peer();

        let accumulator = Arc::clone(&f.accumulator);
        let handle = f.handle.clone();
        let parked = tokio::spawn(async move {
            accumulator.submit(&handle, "a".to_string(), 2).await
        });
        while f.accumulator.pending(&f.handle, 2).await.unwrap() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // The peer fills the batch and flushes the prompt parked by the first accumulator
        let flushed = peer.submit(&f.handle, "b".to_string(), 2).await.unwrap();
        assert_eq!(flushed, BatchOutcome::Generated("out:b".to_string()));

        let delivered = parked.await.unwrap().unwrap();
        assert_eq!(delivered, BatchOutcome::Generated("out:a".to_string()));
        assert_eq!(f.engine.batches.lock().len(), 1);
        assert!(f.store.keys("batch_result").await.unwrap().is_empty());
    }

    #[test]
    fn test_delivered_result_encoding() {
        let ok: Result<String> = Ok("hi".to_string());
        let text = DeliveredResult::from(ok);
        let raw = serde_json::to_string(&text).unwrap();
        assert_eq!(raw, r#"{"text":"hi"}"#);

        let failed = DeliveredResult::from(Err(InferLoopError::inference_failed("no valid response")));
        let err = failed.into_result().unwrap_err();
        assert_eq!(err.to_string(), "Inference failed: no valid response");
    }

    #[tokio::test]
    async fn test_per_request_failed_flush_releases_waiter() {
        let store: Arc<dyn SharedStore> = Arc::new(UndrainableStore(MemoryStore::new()));
        let f = fixture_on(BatchDelivery::PerRequest, 1000, store).await;

        f.store
            .push(&f.accumulator.queue_key(&f.handle, 2), "queued".to_string())
            .await
            .unwrap();
        let err = f
            .accumulator
            .submit(&f.handle, "b".to_string(), 2)
            .await
            .unwrap_err();

        assert!(matches!(err, InferLoopError::Store(_)));
        assert!(f.accumulator.waiters.lock().is_empty());
    }

    #[tokio::test]
    async fn test_per_request_partial_flush_after_max_wait() {
        let f = fixture(BatchDelivery::PerRequest, 50).await;

        let outcome = f
            .accumulator
            .submit(&f.handle, "lonely".to_string(), 4)
            .await
            .unwrap();

        assert_eq!(outcome, BatchOutcome::Generated("out:lonely".to_string()));
        assert_eq!(f.engine.batches.lock().clone(), vec![vec!["lonely".to_string()]]);
        assert_eq!(f.accumulator.pending(&f.handle, 4).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_queues_are_separate_per_batch_size() {
        let f = fixture(BatchDelivery::TriggerOnly, 1000).await;

        f.accumulator.submit(&f.handle, "a".to_string(), 2).await.unwrap();
        f.accumulator.submit(&f.handle, "b".to_string(), 3).await.unwrap();

        assert_eq!(f.accumulator.pending(&f.handle, 2).await.unwrap(), 1);
        assert_eq!(f.accumulator.pending(&f.handle, 3).await.unwrap(), 1);
        assert_eq!(
            f.accumulator.queue_key(&f.handle, 2),
            "batch_queue:modelA|false:2"
        );
    }
}
