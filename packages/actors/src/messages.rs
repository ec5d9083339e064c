//! Message types for actor communication.

use conductor_core::{Job, JobCounts, JobError, JobFilter, JobId, JobProgress, QueueInfo};
use ractor::RpcReplyPort;

use crate::handler::JobContext;
use crate::persistence::PersistenceError;

/// Messages for the QueueActor.
#[derive(Debug)]
pub enum QueueMessage<P, R> {
    /// Admit a group of jobs atomically, optionally ahead of waiting jobs.
    Enqueue {
        jobs: Vec<Job<P, R>>,
        prepend: bool,
        reply: RpcReplyPort<Result<Vec<Job<P, R>>, QueueError>>,
    },

    /// A worker finished running a job.
    JobFinished {
        job_id: JobId,
        worker_id: usize,
        outcome: Result<R, JobError>,
    },

    /// Progress reported by a running job.
    Progress {
        job_id: JobId,
        progress: JobProgress,
    },

    /// Cancel a job. Replies whether the job was waiting or running.
    CancelJob {
        job_id: JobId,
        reply: RpcReplyPort<bool>,
    },

    /// Cancel every non-terminal job matching the filter.
    CancelWhere {
        filter: JobFilter,
        reply: RpcReplyPort<Vec<JobId>>,
    },

    /// Get a job by ID.
    GetJob {
        job_id: JobId,
        reply: RpcReplyPort<Option<Job<P, R>>>,
    },

    /// List jobs in creation order.
    ListJobs {
        filter: JobFilter,
        reply: RpcReplyPort<Vec<Job<P, R>>>,
    },

    /// Count jobs per state.
    Counts {
        filter: JobFilter,
        reply: RpcReplyPort<JobCounts>,
    },

    /// Reply once the job is terminal (immediately if it already is).
    WaitForJob {
        job_id: JobId,
        reply: RpcReplyPort<Option<Job<P, R>>>,
    },

    /// Forget terminal jobs matching the filter.
    Prune {
        filter: JobFilter,
        reply: RpcReplyPort<usize>,
    },

    /// Stop dispatching waiting jobs.
    Pause,

    /// Resume dispatching.
    Resume,

    /// Get queue info.
    GetInfo { reply: RpcReplyPort<QueueInfo> },

    /// Cancel everything, wait for workers to go idle, then stop.
    Shutdown { reply: RpcReplyPort<()> },
}

/// Messages for the WorkerActor.
#[derive(Debug)]
pub enum WorkerMessage<P, R> {
    /// Run a job that the queue has already marked running.
    ProcessJob { job: Box<Job<P, R>>, ctx: JobContext },
}

/// Error type for queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is shutting down")]
    ShuttingDown,

    #[error("Queue is full (limit {0} waiting jobs)")]
    QueueFull(usize),

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Actor error: {0}")]
    Actor(String),

    #[error("Timeout")]
    Timeout,

    #[error("Invalid queue configuration: {0}")]
    Config(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}
