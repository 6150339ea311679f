//! Service facade
//!
//! Wires the registry, batch accumulator, dispatcher and status tracker
//! together and exposes the operations a transport layer calls. The
//! `*_response` methods never fail: every outcome, including unknown tasks
//! and exhausted polls, is folded into a [`StatusResponse`].

use crate::batching::BatchAccumulator;
use crate::dispatcher::{TaskDispatcher, TaskExecutor};
use crate::engine::InferenceEngine;
use crate::registry::ModelRegistry;
use crate::store::SharedStore;
use crate::tracker::StatusTracker;
use inferloop_common::config::InferLoopConfig;
use inferloop_common::error::{InferLoopError, Result};
use inferloop_proto::{
    GenerateResponse, HealthResponse, StatusLabel, StatusResponse, SubmitRequest, SubmitResponse,
    TaskId, TaskListResponse, TaskState, TaskStatus,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub struct InferenceService<E: InferenceEngine> {
    config: InferLoopConfig,
    store: Arc<dyn SharedStore>,
    registry: Arc<ModelRegistry<E>>,
    dispatcher: Arc<TaskDispatcher<E>>,
    tracker: StatusTracker,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<E: InferenceEngine> InferenceService<E> {
    pub fn new(config: InferLoopConfig, engine: Arc<E>, store: Arc<dyn SharedStore>) -> Self {
        let registry = Arc::new(ModelRegistry::new(
            &config,
            Arc::clone(&engine),
            Arc::clone(&store),
        ));
        let accumulator = Arc::new(BatchAccumulator::new(&config, engine, Arc::clone(&store)));
        let executor = Arc::new(TaskExecutor::new(
            Arc::clone(&registry),
            accumulator,
            config.generation.clone(),
        ));
        let dispatcher = Arc::new(TaskDispatcher::new(&config, executor, Arc::clone(&store)));
        let tracker = StatusTracker::new(Arc::clone(&store), config.poll_interval());

        Self {
            config,
            store,
            registry,
            dispatcher,
            tracker,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &InferLoopConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ModelRegistry<E>> {
        &self.registry
    }

    /// Start the worker pool
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            warn!("Worker pool already running");
            return;
        }
        workers.extend(self.dispatcher.start());
    }

    /// Stop the worker pool and wait for running tasks to finish
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                error!("Worker exited abnormally: {}", e);
            }
        }
        info!("Worker pool stopped");
    }

    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse> {
        let task_id = self.dispatcher.submit(request.into()).await?;
        Ok(SubmitResponse { task_id })
    }

    pub async fn get_status(&self, id: &TaskId) -> Result<TaskStatus> {
        self.tracker.get_status(id).await
    }

    /// Long-poll for success, with configured defaults for unset bounds
    pub async fn poll_status(
        &self,
        id: &TaskId,
        timeout: Option<Duration>,
        retry_limit: Option<u32>,
    ) -> Result<TaskStatus> {
        let timeout = timeout.unwrap_or(Duration::from_secs(self.config.polling.timeout_secs));
        let retry_limit = retry_limit.unwrap_or(self.config.polling.retry_limit);
        self.tracker
            .poll_status(id, TaskState::Success, timeout, retry_limit)
            .await
    }

    pub async fn status_response(&self, id: &TaskId) -> StatusResponse {
        respond(id, self.get_status(id).await)
    }

    pub async fn poll_response(
        &self,
        id: &TaskId,
        timeout: Option<Duration>,
        retry_limit: Option<u32>,
    ) -> StatusResponse {
        respond(id, self.poll_status(id, timeout, retry_limit).await)
    }

    pub async fn list_tasks(&self) -> Result<TaskListResponse> {
        Ok(TaskListResponse {
            tasks: self.tracker.list_tasks().await?,
        })
    }

    /// Submit and wait for the generated text
    ///
    /// A failed task becomes `InferenceFailed`; running out of time is
    /// `Timeout`.
    pub async fn submit_and_await(
        &self,
        request: SubmitRequest,
        timeout: Option<Duration>,
    ) -> Result<GenerateResponse> {
        let timeout = timeout.unwrap_or_else(|| self.config.await_timeout());
        let SubmitResponse { task_id } = self.submit(request).await?;
        let status = self.dispatcher.await_task(&task_id, timeout).await?;

        match status.state {
            TaskState::Success => Ok(GenerateResponse {
                task_id,
                status: StatusLabel::Finished,
                result: status.result.unwrap_or_default(),
            }),
            _ => Err(InferLoopError::inference_failed(
                status
                    .error
                    .unwrap_or_else(|| format!("task {} failed", task_id)),
            )),
        }
    }

    /// Run a short prompt through the default model
    pub async fn health_check(&self) -> HealthResponse {
        let model = &self.config.models.default_model;
        let outcome = if self.registry.is_configured(model) {
            let request = SubmitRequest::new("hello", model.clone());
            let timeout = Duration::from_secs(self.config.polling.health_timeout_secs);
            self.submit_and_await(request, Some(timeout)).await.map(|_| ())
        } else {
            Err(InferLoopError::model_not_configured(model.as_str()))
        };

        match outcome {
            Ok(_) => HealthResponse {
                healthy: true,
                message: "Model healthy".to_string(),
            },
            Err(e) => {
                warn!("Health check failed: {}", e);
                HealthResponse {
                    healthy: false,
                    message: format!("Model not responding: {}", e),
                }
            }
        }
    }

    /// Store connectivity check
    pub async fn store_health(&self) -> HealthResponse {
        match self.store.ping().await {
            Ok(()) => HealthResponse {
                healthy: true,
                message: "Store reachable".to_string(),
            },
            Err(e) => HealthResponse {
                healthy: false,
                message: format!("Store unreachable: {}", e),
            },
        }
    }
}

fn respond(id: &TaskId, outcome: Result<TaskStatus>) -> StatusResponse {
    match outcome {
        Ok(status) => status.into(),
        Err(InferLoopError::TaskNotFound(_)) => StatusResponse::not_found(id.clone()),
        Err(InferLoopError::PollExhausted { attempts, .. }) => {
            StatusResponse::exhausted(id.clone(), attempts)
        }
        Err(e) => StatusResponse::failed(id.clone(), e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockEngine;
    use crate::store::MemoryStore;
    use inferloop_common::config::ModelSpec;

    fn service(default_model: &str) -> InferenceService<MockEngine> {
        let mut config = InferLoopConfig::default();
        config
            .models
            .catalog
            .insert("modelA".to_string(), ModelSpec::new("/models/a.gguf"));
        config.models.default_model = default_model.to_string();
        config.worker.pool_size = 2;
        config.polling.interval_ms = 20;

        InferenceService::new(
            config,
            Arc::new(MockEngine::new()),
            Arc::new(MemoryStore::new()),
        )
    }

    #[tokio::test]
    async fn test_submit_and_await() {
        let service = service("modelA");
        service.start();

        let response = service
            .submit_and_await(SubmitRequest::new("hello", "modelA"), None)
            .await
            .unwrap();
        assert_eq!(response.status, StatusLabel::Finished);
        assert_eq!(response.result, "Mock inference result for: modelA");

        let err = service
            .submit_and_await(SubmitRequest::new("hello", "nope"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, InferLoopError::InferenceFailed(_)));

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_and_await_times_out_without_workers() {
        let service = service("modelA");

        let err = service
            .submit_and_await(
                SubmitRequest::new("hello", "modelA"),
                Some(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, InferLoopError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_status_responses() {
        let service = service("modelA");

        let missing = service.status_response(&TaskId::from("nope")).await;
        assert_eq!(missing.status, StatusLabel::NotFound);

        let SubmitResponse { task_id } = service
            .submit(SubmitRequest::new("hello", "modelA"))
            .await
            .unwrap();
        let pending = service.status_response(&task_id).await;
        assert_eq!(pending.status, StatusLabel::Processing);

        let exhausted = service
            .poll_response(&task_id, Some(Duration::from_millis(50)), Some(1))
            .await;
        assert_eq!(exhausted.status, StatusLabel::Exhausted);

        service.start();
        let finished = service
            .poll_response(&task_id, Some(Duration::from_secs(5)), Some(1))
            .await;
        assert_eq!(finished.status, StatusLabel::Finished);
        assert!(finished.result.is_some());

        assert_eq!(service.list_tasks().await.unwrap().tasks, vec![task_id]);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_checks() {
        let healthy = service("modelA");
        healthy.start();
        assert!(healthy.health_check().await.healthy);
        assert!(healthy.store_health().await.healthy);
        healthy.shutdown().await;

        let unhealthy = service("unlisted");
        unhealthy.start();
        let response = unhealthy.health_check().await;
        assert!(!response.healthy);
        assert!(response.message.starts_with("Model not responding"));
        assert!(response.message.contains("unlisted"));
        // An unknown default model is reported without queueing a task
        assert!(unhealthy.list_tasks().await.unwrap().tasks.is_empty());
        unhealthy.shutdown().await;
    }
}
