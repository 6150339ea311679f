//! Read-only task status lookups and bounded long-polling

use crate::store::{load_task, SharedStore, TASK_KEY_PREFIX};
use inferloop_common::error::{InferLoopError, Result};
use inferloop_proto::{TaskId, TaskState, TaskStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

pub struct StatusTracker {
    store: Arc<dyn SharedStore>,

    /// Re-check interval inside a poll window
    interval: Duration,
}

impl StatusTracker {
    pub fn new(store: Arc<dyn SharedStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Current status of a task
    pub async fn get_status(&self, id: &TaskId) -> Result<TaskStatus> {
        load_task(self.store.as_ref(), id)
            .await?
            .map(|record| record.status())
            .ok_or_else(|| InferLoopError::task_not_found(id.as_str()))
    }

    /// Wait until the task reaches `target` or a terminal state
    ///
    /// Each window of `timeout` without a match costs one attempt; after
    /// `retry_limit` attempts (at least one) the poll gives up with
    /// `PollExhausted`.
    pub async fn poll_status(
        &self,
        id: &TaskId,
        target: TaskState,
        timeout: Duration,
        retry_limit: u32,
    ) -> Result<TaskStatus> {
        let attempts = retry_limit.max(1);

        for attempt in 1..=attempts {
            let window_end = Instant::now() + timeout;
            loop {
                let status = self.get_status(id).await?;
                if status.state == target || status.is_terminal() {
                    return Ok(status);
                }

                let now = Instant::now();
                if now >= window_end {
                    break;
                }
                trace!("Task {} still {:?}", id, status.state);
                tokio::time::sleep(self.interval.min(window_end - now)).await;
            }
            debug!("Poll window {}/{} for task {} expired", attempt, attempts, id);
        }

        Err(InferLoopError::PollExhausted {
            task_id: id.to_string(),
            attempts,
        })
    }

    /// Every task id in the store
    pub async fn list_tasks(&self) -> Result<Vec<TaskId>> {
        Ok(self
            .store
            .keys(TASK_KEY_PREFIX)
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(TASK_KEY_PREFIX).map(TaskId::from))
            .collect())
    }
}
