//! Hand-off seam between the dispatcher and the task system.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::error::EnqueueFailure;

/// Receipt for an enqueued execution. Not a completion signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub id: String,
}

/// What a worker receives for one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub task_id: String,
    pub execution_id: i64,
    pub target_ids: Vec<i64>,
}

/// The task system, as seen by the dispatcher.
///
/// Implementations must return quickly: enqueue is fire-and-forget and the
/// dispatcher bounds it with a timeout anyway.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(
        &self,
        execution_id: i64,
        target_ids: &[i64],
    ) -> Result<TaskHandle, EnqueueFailure>;
}

/// In-process queue backed by a bounded tokio mpsc channel.
///
/// Uses `try_send`, so a full or closed channel fails the enqueue instead of
/// stalling the poller.
pub struct ChannelTaskQueue {
    tx: mpsc::Sender<QueuedTask>,
}

impl ChannelTaskQueue {
    pub fn new(tx: mpsc::Sender<QueuedTask>) -> Self {
        Self { tx }
    }

    /// Convenience constructor returning the queue and its consumer end.
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<QueuedTask>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl TaskQueue for ChannelTaskQueue {
    async fn enqueue(
        &self,
        execution_id: i64,
        target_ids: &[i64],
    ) -> Result<TaskHandle, EnqueueFailure> {
        let task_id = Uuid::new_v4().to_string();
        let task = QueuedTask {
            task_id: task_id.clone(),
            execution_id,
            target_ids: target_ids.to_vec(),
        };
        self.tx.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                EnqueueFailure::Unavailable("task queue is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                EnqueueFailure::Unavailable("task queue is closed".to_string())
            }
        })?;
        debug!(execution_id, %task_id, "task enqueued");
        Ok(TaskHandle { id: task_id })
    }
}
