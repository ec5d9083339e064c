//! Client handle for a running job queue.

use std::sync::Arc;
use std::time::Duration;

use conductor_core::{Job, JobCounts, JobFilter, JobId, NewJob, QueueConfig, QueueInfo};
use db::repositories::JobRepository;
use ractor::rpc::CallResult;
use ractor::{Actor, ActorRef, RpcReplyPort};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::bus::EventBus;
use crate::handler::JobExecutor;
use crate::messages::{QueueError, QueueMessage};
use crate::persistence::JobJournal;
use crate::queue_actor::{JobOf, QueueActor, QueueArgs, QueueMsgOf};

/// Generic job queue parametrized by its executor.
///
/// The handle is cheap to clone; all clones talk to the same queue actor.
pub struct JobQueue<E: JobExecutor> {
    actor: ActorRef<QueueMsgOf<E>>,
    config: Arc<QueueConfig>,
    kind: Arc<str>,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<E: JobExecutor> Clone for JobQueue<E> {
    fn clone(&self) -> Self {
        Self {
            actor: self.actor.clone(),
            config: self.config.clone(),
            kind: self.kind.clone(),
            handle: self.handle.clone(),
        }
    }
}

impl<E: JobExecutor> JobQueue<E> {
    /// Spawn the queue actor and its workers.
    ///
    /// Queues configured with `persist` need a job repository; their
    /// journaled jobs are recovered before the first dispatch.
    pub async fn start(
        executor: E,
        config: QueueConfig,
        bus: EventBus,
        journal: Option<JobRepository>,
    ) -> Result<Self, QueueError> {
        let journal = match (config.persist, journal) {
            (true, Some(repo)) => Some(JobJournal::new(repo, config.name.clone())),
            (true, None) => {
                return Err(QueueError::Config(format!(
                    "queue {} is persistent but has no job repository",
                    config.name
                )));
            }
            (false, _) => None,
        };

        let kind: Arc<str> = Arc::from(executor.kind());
        let args = QueueArgs {
            executor: Arc::new(executor),
            config: config.clone(),
            bus,
            journal,
        };

        let (actor, handle) = Actor::spawn(None, QueueActor::<E>::new(), args)
            .await
            .map_err(|e| QueueError::Actor(format!("Failed to spawn queue {}: {e}", config.name)))?;

        Ok(Self {
            actor,
            config: Arc::new(config),
            kind,
            handle: Arc::new(Mutex::new(Some(handle))),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Enqueue one job. Returns the waiting job immediately.
    pub async fn enqueue(&self, payload: E::Payload) -> Result<JobOf<E>, QueueError> {
        let mut jobs = self.enqueue_many(vec![NewJob::new(payload)], false).await?;
        jobs.pop()
            .ok_or_else(|| QueueError::Actor("enqueue returned no job".to_string()))
    }

    /// Enqueue a group of jobs atomically. With `prepend` the whole group
    /// goes ahead of the waiting jobs, keeping its own order.
    pub async fn enqueue_many(
        &self,
        requests: Vec<NewJob<E::Payload>>,
        prepend: bool,
    ) -> Result<Vec<JobOf<E>>, QueueError> {
        let jobs: Vec<JobOf<E>> = requests
            .into_iter()
            .map(|request| {
                let queue_id = request
                    .queue_id
                    .unwrap_or_else(|| self.config.name.clone());
                Job::new(queue_id, request.payload).with_batch(request.batch_id)
            })
            .collect();

        self.call(|reply| QueueMessage::Enqueue {
            jobs,
            prepend,
            reply,
        })
        .await?
    }

    /// Cancel a job. Waiting jobs are cancelled at once; running jobs are
    /// signalled and end cancelled when their worker returns. Returns
    /// false for terminal or unknown jobs.
    pub async fn cancel(&self, job_id: JobId) -> Result<bool, QueueError> {
        self.call(|reply| QueueMessage::CancelJob { job_id, reply })
            .await
    }

    /// Cancel every non-terminal job matching `filter`.
    pub async fn cancel_where(&self, filter: JobFilter) -> Result<Vec<JobId>, QueueError> {
        self.call(|reply| QueueMessage::CancelWhere { filter, reply })
            .await
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<JobOf<E>>, QueueError> {
        self.call(|reply| QueueMessage::GetJob { job_id, reply })
            .await
    }

    /// List jobs matching `filter` in creation order.
    pub async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<JobOf<E>>, QueueError> {
        self.call(|reply| QueueMessage::ListJobs { filter, reply })
            .await
    }

    pub async fn counts(&self, filter: JobFilter) -> Result<JobCounts, QueueError> {
        self.call(|reply| QueueMessage::Counts { filter, reply })
            .await
    }

    /// Block until the job is terminal. On timeout the current snapshot is
    /// returned instead of an error.
    pub async fn wait_for_job(
        &self,
        job_id: JobId,
        timeout: Option<Duration>,
    ) -> Result<JobOf<E>, QueueError> {
        let result = ractor::rpc::call(
            &self.actor,
            |reply| QueueMessage::WaitForJob { job_id, reply },
            timeout,
        )
        .await;

        match result {
            Ok(CallResult::Success(Some(job))) => Ok(job),
            Ok(CallResult::Success(None)) => Err(QueueError::NotFound(job_id)),
            Ok(CallResult::Timeout) => self
                .get_job(job_id)
                .await?
                .ok_or(QueueError::NotFound(job_id)),
            Ok(CallResult::SenderError) => Err(QueueError::ShuttingDown),
            Err(_) => Err(QueueError::ShuttingDown),
        }
    }

    /// Forget terminal jobs matching `filter`. Returns how many were removed.
    pub async fn prune(&self, filter: JobFilter) -> Result<usize, QueueError> {
        self.call(|reply| QueueMessage::Prune { filter, reply })
            .await
    }

    pub fn pause(&self) -> Result<(), QueueError> {
        self.actor
            .send_message(QueueMessage::Pause)
            .map_err(|_| QueueError::ShuttingDown)
    }

    pub fn resume(&self) -> Result<(), QueueError> {
        self.actor
            .send_message(QueueMessage::Resume)
            .map_err(|_| QueueError::ShuttingDown)
    }

    pub async fn info(&self) -> Result<QueueInfo, QueueError> {
        self.call(|reply| QueueMessage::GetInfo { reply }).await
    }

    /// Drain and stop the queue: waiting jobs are cancelled, running jobs
    /// are signalled, and the call returns once every worker is gone.
    /// Stopping an already stopped queue is a no-op.
    pub async fn stop(&self) -> Result<(), QueueError> {
        match self.call(|reply| QueueMessage::Shutdown { reply }).await {
            Ok(()) | Err(QueueError::ShuttingDown) => {}
            Err(e) => return Err(e),
        }

        if let Some(handle) = self.handle.lock().await.take()
            && let Err(e) = handle.await
        {
            return Err(QueueError::Actor(format!("queue task failed: {e}")));
        }

        tracing::info!("Stopped queue: {}", self.config.name);
        Ok(())
    }

    async fn call<T, F>(&self, build: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(RpcReplyPort<T>) -> QueueMsgOf<E>,
    {
        match ractor::rpc::call(&self.actor, build, None).await {
            Ok(CallResult::Success(value)) => Ok(value),
            Ok(CallResult::Timeout) => Err(QueueError::Timeout),
            Ok(CallResult::SenderError) => Err(QueueError::ShuttingDown),
            Err(_) => Err(QueueError::ShuttingDown),
        }
    }
}
