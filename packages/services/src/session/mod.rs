//! Session queue: batches of graph executions.

mod engine;
mod executor;
mod graph;

use std::sync::Arc;
use std::time::Duration;

use actors::{EventBus, JobQueue, QueueError};
use conductor_core::{
    Batch, BatchId, BatchStatus, EnqueueBatchResult, JobFilter, JobId, NewJob, QueueConfig,
    QueueInfo, SessionId, SessionPayload, SessionQueueItem, SessionQueueStatus,
};
use db::repositories::JobRepository;
use thiserror::Error;

pub use engine::{GraphEngine, InvocationContext, InvocationError};
pub use executor::SessionExecutor;
pub use graph::{
    GraphError, MAX_RUNS, collect_inputs, execution_order, validate, validate_batch,
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid batch: {0}")]
    InvalidBatch(#[from] GraphError),

    #[error("Queue item not found: {0}")]
    NotFound(JobId),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone)]
pub struct SessionQueueConfig {
    pub workers: usize,
    pub persist: bool,
    pub max_queue_size: Option<usize>,
}

impl Default for SessionQueueConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            persist: false,
            max_queue_size: None,
        }
    }
}

impl SessionQueueConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    pub fn with_max_queue_size(mut self, max: Option<usize>) -> Self {
        self.max_queue_size = max;
        self
    }
}

/// Queue of session items. Items from every `queue_id` share one worker pool.
#[derive(Clone)]
pub struct SessionQueue {
    queue: JobQueue<SessionExecutor>,
    engine: Arc<dyn GraphEngine>,
    max_queue_size: Option<usize>,
}

impl SessionQueue {
    pub const QUEUE_NAME: &'static str = "sessions";

    pub async fn start(
        config: SessionQueueConfig,
        engine: Arc<dyn GraphEngine>,
        bus: EventBus,
        journal: Option<JobRepository>,
    ) -> Result<Self, SessionError> {
        let queue_config = QueueConfig::new(Self::QUEUE_NAME)
            .with_concurrency(config.workers)
            .with_persist(config.persist)
            .with_max_queue_size(config.max_queue_size);
        let executor = SessionExecutor::new(engine.clone());
        let queue = JobQueue::start(executor, queue_config, bus, journal).await?;

        tracing::info!("Session queue started with {} workers", config.workers);
        Ok(Self {
            queue,
            engine,
            max_queue_size: config.max_queue_size,
        })
    }

    /// Validate a batch and queue one item per run. With a queue size limit,
    /// the runs are truncated to the remaining capacity; a full queue is an
    /// error.
    pub async fn enqueue_batch(
        &self,
        queue_id: &str,
        batch: Batch,
        prepend: bool,
    ) -> Result<EnqueueBatchResult, SessionError> {
        validate_batch(&batch, self.engine.as_ref())?;

        let requested = batch.runs as usize;
        let capacity = match self.max_queue_size {
            Some(max) => {
                let waiting = self.queue.counts(JobFilter::all()).await?.waiting;
                let remaining = max.saturating_sub(waiting);
                if remaining == 0 {
                    return Err(QueueError::QueueFull(max).into());
                }
                remaining
            }
            None => requested,
        };

        let batch_id = BatchId::new();
        let requests = (0..requested.min(capacity))
            .map(|_| {
                NewJob::new(SessionPayload {
                    session_id: SessionId::new(),
                    origin: batch.origin.clone(),
                    destination: batch.destination.clone(),
                    graph: batch.graph.clone(),
                })
                .in_queue(queue_id)
                .in_batch(batch_id)
            })
            .collect();

        let items = self.queue.enqueue_many(requests, prepend).await?;
        tracing::info!(
            "Queued batch {} with {} of {} items on {}",
            batch_id,
            items.len(),
            requested,
            queue_id
        );

        Ok(EnqueueBatchResult {
            queue_id: queue_id.to_string(),
            batch_id,
            requested,
            enqueued: items.len(),
            item_ids: items.into_iter().map(|item| item.id).collect(),
            prepend,
        })
    }

    pub async fn get_queue_item(
        &self,
        item_id: JobId,
    ) -> Result<Option<SessionQueueItem>, SessionError> {
        Ok(self.queue.get_job(item_id).await?.map(SessionQueueItem::from))
    }

    pub async fn get_batch_status(
        &self,
        queue_id: &str,
        batch_id: BatchId,
    ) -> Result<BatchStatus, SessionError> {
        let counts = self
            .queue
            .counts(JobFilter::queue(queue_id).with_batches(vec![batch_id]))
            .await?;
        Ok(BatchStatus::from_counts(queue_id, batch_id, counts))
    }

    pub async fn get_queue_status(
        &self,
        queue_id: &str,
    ) -> Result<SessionQueueStatus, SessionError> {
        let counts = self.queue.counts(JobFilter::queue(queue_id)).await?;
        Ok(SessionQueueStatus::from_counts(queue_id, counts))
    }

    /// List items in creation order. The filter's queue, batch, state and
    /// limit all apply.
    pub async fn list_queue_items(
        &self,
        filter: JobFilter,
    ) -> Result<Vec<SessionQueueItem>, SessionError> {
        let items = self.queue.list_jobs(filter).await?;
        Ok(items.into_iter().map(SessionQueueItem::from).collect())
    }

    /// Cancel one item and return its state after the request.
    pub async fn cancel_queue_item(
        &self,
        item_id: JobId,
    ) -> Result<SessionQueueItem, SessionError> {
        self.queue.cancel(item_id).await?;
        self.get_queue_item(item_id)
            .await?
            .ok_or(SessionError::NotFound(item_id))
    }

    /// Cancel every unfinished item of the given batches. Returns how many
    /// items were cancelled or signalled.
    pub async fn cancel_by_batch_ids(
        &self,
        queue_id: &str,
        batch_ids: Vec<BatchId>,
    ) -> Result<usize, SessionError> {
        let cancelled = self
            .queue
            .cancel_where(JobFilter::queue(queue_id).with_batches(batch_ids))
            .await?;
        Ok(cancelled.len())
    }

    /// Forget finished items of a queue.
    pub async fn prune(&self, queue_id: &str) -> Result<usize, SessionError> {
        Ok(self.queue.prune(JobFilter::queue(queue_id)).await?)
    }

    pub async fn wait_for_queue_item(
        &self,
        item_id: JobId,
        timeout: Option<Duration>,
    ) -> Result<SessionQueueItem, SessionError> {
        match self.queue.wait_for_job(item_id, timeout).await {
            Ok(item) => Ok(item.into()),
            Err(QueueError::NotFound(id)) => Err(SessionError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn pause(&self) -> Result<(), SessionError> {
        Ok(self.queue.pause()?)
    }

    pub fn resume(&self) -> Result<(), SessionError> {
        Ok(self.queue.resume()?)
    }

    pub async fn info(&self) -> Result<QueueInfo, SessionError> {
        Ok(self.queue.info().await?)
    }

    pub async fn stop(&self) -> Result<(), SessionError> {
        self.queue.stop().await?;
        Ok(())
    }
}
