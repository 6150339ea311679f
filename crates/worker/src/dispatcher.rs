//! Task dispatch and the worker pool
//!
//! Submissions write a `Pending` record and push the task id onto a lock-free
//! work queue. A fixed pool of workers pulls ids, runs the task and records
//! the terminal state. Execution runs in its own tokio task so a panic fails
//! only that task and never takes the worker down.

use crate::batching::{BatchAccumulator, BatchMode};
use crate::engine::InferenceEngine;
use crate::registry::ModelRegistry;
use crate::store::{load_task, save_task, SharedStore};
use crossbeam::queue::SegQueue;
use inferloop_common::config::{GenerationConfig, InferLoopConfig};
use inferloop_common::error::{InferLoopError, Result};
use inferloop_common::METRICS;
use inferloop_proto::{TaskArgs, TaskId, TaskRecord, TaskStatus};
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Pause before the single retry of a failed task record write
const SAVE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Bounded multi-consumer queue of task ids
pub struct WorkQueue {
    queue: SegQueue<TaskId>,

    /// Reserved plus queued entries
    depth: AtomicUsize,

    capacity: usize,
    shutdown: AtomicBool,
    notify: Notify,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: SegQueue::new(),
            depth: AtomicUsize::new(0),
            capacity,
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Claim a slot ahead of [`WorkQueue::push_reserved`]
    pub fn reserve(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(InferLoopError::internal("work queue is shut down"));
        }
        self.depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |depth| {
                (depth < self.capacity).then_some(depth + 1)
            })
            .map(|_| ())
            .map_err(|depth| {
                InferLoopError::queue_full(format!("{} tasks queued (max {})", depth, self.capacity))
            })
    }

    /// Return a slot claimed by [`WorkQueue::reserve`] without pushing
    pub fn cancel_reservation(&self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }

    /// Push into a previously reserved slot
    pub fn push_reserved(&self, id: TaskId) {
        self.queue.push(id);
        self.notify.notify_one();
    }

    /// Reserve and push in one step
    pub fn push(&self, id: TaskId) -> Result<()> {
        self.reserve()?;
        self.push_reserved(id);
        Ok(())
    }

    /// Wait for the next id; `None` once the queue is shut down
    pub async fn next(&self) -> Option<TaskId> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_shut_down() {
                return None;
            }
            if let Some(id) = self.queue.pop() {
                self.depth.fetch_sub(1, Ordering::SeqCst);
                return Some(id);
            }

            notified.await;
        }
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Stop handing out work; idle consumers wake and return `None`
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// Runs a single task: resolve the model, render the prompt, accumulate
pub struct TaskExecutor<E: InferenceEngine> {
    registry: Arc<ModelRegistry<E>>,
    accumulator: Arc<BatchAccumulator<E>>,
    generation: GenerationConfig,
}

impl<E: InferenceEngine> TaskExecutor<E> {
    pub fn new(
        registry: Arc<ModelRegistry<E>>,
        accumulator: Arc<BatchAccumulator<E>>,
        generation: GenerationConfig,
    ) -> Self {
        Self {
            registry,
            accumulator,
            generation,
        }
    }

    pub async fn execute(&self, args: &TaskArgs) -> Result<String> {
        let handle = self
            .registry
            .resolve(&args.model_name, args.speculative)
            .await?;
        let prompt = self.generation.render_prompt(&args.text);
        let outcome = self
            .accumulator
            .submit(&handle, prompt, args.batch_size)
            .await?;
        Ok(outcome.into_text())
    }
}

/// Task front door and worker pool
pub struct TaskDispatcher<E: InferenceEngine> {
    store: Arc<dyn SharedStore>,
    executor: Arc<TaskExecutor<E>>,
    queue: WorkQueue,

    /// Signalled whenever a task reaches a terminal state
    completed: Notify,

    pool_size: usize,

    /// Store re-check interval while awaiting, for completions elsewhere
    poll_interval: Duration,
}

impl<E: InferenceEngine> TaskDispatcher<E> {
    pub fn new(
        config: &InferLoopConfig,
        executor: Arc<TaskExecutor<E>>,
        store: Arc<dyn SharedStore>,
    ) -> Self {
        Self {
            store,
            executor,
            queue: WorkQueue::new(config.worker.max_queue_size),
            completed: Notify::new(),
            pool_size: config.pool_size(),
            poll_interval: config.poll_interval(),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    /// Register a task and queue it for a worker
    pub async fn submit(&self, args: TaskArgs) -> Result<TaskId> {
        BatchMode::from_batch_size(args.batch_size)?;

        if let Err(e) = self.queue.reserve() {
            METRICS.tasks.rejected_total.inc();
            warn!("Rejected submission: {}", e);
            return Err(e);
        }

        let record = TaskRecord::new(args);
        if let Err(e) = save_task(self.store.as_ref(), &record).await {
            self.queue.cancel_reservation();
            return Err(e);
        }

        let id = record.id;
        self.queue.push_reserved(id.clone());
        METRICS.tasks.submitted_total.inc();
        METRICS.tasks.queue_depth.set(self.queue.depth() as i64);
        debug!("Queued task {} for {}", id, record.args.model_name);
        Ok(id)
    }

    /// Spawn the worker pool
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        info!("Starting {} workers", self.pool_size);
        (0..self.pool_size)
            .map(|worker| tokio::spawn(Arc::clone(self).worker_loop(worker)))
            .collect()
    }

    /// Stop the pool once running tasks finish; queued tasks stay `Pending`
    pub fn shutdown(&self) {
        info!("Shutting down workers ({} tasks queued)", self.queue.depth());
        self.queue.shutdown();
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        debug!("Worker {} started", worker);
        while let Some(id) = self.queue.next().await {
            METRICS.tasks.queue_depth.set(self.queue.depth() as i64);
            self.run_task(&id).await;
        }
        debug!("Worker {} stopped", worker);
    }

    async fn run_task(&self, id: &TaskId) {
        let mut record = match load_task(self.store.as_ref(), id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!("Task {} vanished before it could run", id);
                return;
            }
            Err(e) => {
                error!("Failed to load task {}: {}", id, e);
                return;
            }
        };

        if let Err(e) = record.start() {
            warn!("Skipping task {}: {}", id, e);
            return;
        }
        if let Err(e) = self.persist(&record).await {
            error!("Failed to mark task {} running, left pending: {}", id, e);
            return;
        }

        METRICS.tasks.active.inc();
        let started = std::time::Instant::now();

        let executor = Arc::clone(&self.executor);
        let args = record.args.clone();
        let outcome = tokio::spawn(async move { executor.execute(&args).await }).await;

        let transition = match outcome {
            Ok(Ok(text)) => {
                METRICS.tasks.succeeded_total.inc();
                record.succeed(text)
            }
            Ok(Err(e)) => {
                METRICS.tasks.failed_total.with_label_values(&[e.kind()]).inc();
                warn!("Task {} failed: {}", id, e);
                record.fail(e.to_string())
            }
            Err(e) => {
                METRICS.tasks.failed_total.with_label_values(&["aborted"]).inc();
                let reason = join_failure(e);
                error!("Task {} aborted: {}", id, reason);
                record.fail(reason)
            }
        };

        METRICS.tasks.active.dec();
        METRICS.tasks.duration.observe(started.elapsed().as_secs_f64());

        if let Err(e) = transition {
            error!("Task {} left in {:?}: {}", id, record.state, e);
        } else if let Err(e) = self.persist(&record).await {
            error!("Failed to record outcome of task {}, left running: {}", id, e);
        } else {
            debug!("Task {} finished as {:?}", id, record.state);
        }
        self.completed.notify_waiters();
    }

    /// Save a task record, retrying once
    async fn persist(&self, record: &TaskRecord) -> Result<()> {
        if let Err(e) = save_task(self.store.as_ref(), record).await {
            warn!("Saving task {} failed, retrying: {}", record.id, e);
            tokio::time::sleep(SAVE_RETRY_DELAY).await;
            return save_task(self.store.as_ref(), record).await;
        }
        Ok(())
    }

    /// Wait for a task to reach a terminal state
    pub async fn await_task(&self, id: &TaskId, timeout: Duration) -> Result<TaskStatus> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.completed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match load_task(self.store.as_ref(), id).await? {
                Some(record) if record.state.is_terminal() => return Ok(record.status()),
                Some(_) => {}
                None => return Err(InferLoopError::task_not_found(id.as_str())),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(InferLoopError::timeout(format!(
                    "task {} not finished within {:?}",
                    id, timeout
                )));
            }

            let wake = (now + self.poll_interval).min(deadline);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }
}

fn join_failure(error: JoinError) -> String {
    if !error.is_panic() {
        return format!("execution cancelled: {}", error);
    }
    format!("execution panicked: {}", panic_message(error.into_panic()))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
