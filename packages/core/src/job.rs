//! Job domain types: identifiers, the lifecycle state machine and the generic
//! job record shared by every queue.

use std::sync::{LazyLock, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::{Generator, Ulid};

use crate::error::{ErrorKind, JobError};

static GENERATOR: LazyLock<Mutex<Generator>> = LazyLock::new(|| Mutex::new(Generator::new()));

/// Next ULID, strictly increasing within the process even inside one
/// millisecond.
fn next_ulid() -> Ulid {
    let mut generator = match GENERATOR.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    generator.generate().unwrap_or_else(|_| Ulid::new())
}

/// Unique identifier for a job, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID.
    pub fn new() -> Self {
        Self(next_ulid())
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Grouping key shared by all jobs expanded from one batch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub Ulid);

impl BatchId {
    pub fn new() -> Self {
        Self(next_ulid())
    }

    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Flat view of a job's lifecycle position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Running,
    Completed,
    Errored,
    Cancelled,
}

impl JobState {
    /// Check if the state is terminal. No transition leaves a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Errored | JobState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Errored => "errored",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current status of a job in its lifecycle.
///
/// Each variant owns exactly the data that is valid in that state, so a
/// result can only exist on a completed job and error details only on an
/// errored one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus<R> {
    /// Job is waiting to be dispatched to a worker.
    Waiting,
    /// Job is currently being executed by a worker.
    Running { started_at: DateTime<Utc> },
    /// Job completed successfully.
    Completed {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        result: R,
    },
    /// Job failed with an error.
    Errored {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        error_type: ErrorKind,
        error: String,
        error_traceback: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_origin: Option<String>,
    },
    /// Job was cancelled, either before dispatch or while running.
    Cancelled {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        started_at: Option<DateTime<Utc>>,
        finished_at: DateTime<Utc>,
    },
}

impl<R> JobStatus<R> {
    pub fn state(&self) -> JobState {
        match self {
            JobStatus::Waiting => JobState::Waiting,
            JobStatus::Running { .. } => JobState::Running,
            JobStatus::Completed { .. } => JobState::Completed,
            JobStatus::Errored { .. } => JobState::Errored,
            JobStatus::Cancelled { .. } => JobState::Cancelled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        self.state().as_str()
    }
}

/// Byte-level progress reported by long transfers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
}

/// Rejected state-machine transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid job transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
}

/// Request to create a job. The queue fills in ids and timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob<P> {
    pub payload: P,
    /// Logical queue name; the owning queue's name when unset.
    pub queue_id: Option<String>,
    pub batch_id: Option<BatchId>,
}

impl<P> NewJob<P> {
    pub fn new(payload: P) -> Self {
        Self {
            payload,
            queue_id: None,
            batch_id: None,
        }
    }

    pub fn in_queue(mut self, queue_id: impl Into<String>) -> Self {
        self.queue_id = Some(queue_id.into());
        self
    }

    pub fn in_batch(mut self, batch_id: BatchId) -> Self {
        self.batch_id = Some(batch_id);
        self
    }
}

/// A job represents a unit of asynchronous work tracked by a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job<P, R> {
    /// Unique identifier for this job.
    pub id: JobId,
    /// Logical queue the job belongs to.
    pub queue_id: String,
    /// Grouping key for jobs expanded from one batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,
    /// Type-specific work descriptor.
    pub payload: P,
    /// Current status.
    #[serde(flatten)]
    pub status: JobStatus<R>,
    /// Last reported transfer progress, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<JobProgress>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job was last updated.
    pub updated_at: DateTime<Utc>,
}

impl<P, R> Job<P, R> {
    /// Create a new waiting job.
    pub fn new(queue_id: impl Into<String>, payload: P) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            queue_id: queue_id.into(),
            batch_id: None,
            payload,
            status: JobStatus::Waiting,
            progress: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach the job to a batch.
    pub fn with_batch(mut self, batch_id: Option<BatchId>) -> Self {
        self.batch_id = batch_id;
        self
    }

    pub fn state(&self) -> JobState {
        self.status.state()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn result(&self) -> Option<&R> {
        match &self.status {
            JobStatus::Completed { result, .. } => Some(result),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.status {
            JobStatus::Errored { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn error_type(&self) -> Option<ErrorKind> {
        match &self.status {
            JobStatus::Errored { error_type, .. } => Some(*error_type),
            _ => None,
        }
    }

    pub fn error_traceback(&self) -> Option<&str> {
        match &self.status {
            JobStatus::Errored {
                error_traceback, ..
            } => Some(error_traceback),
            _ => None,
        }
    }

    pub fn error_origin(&self) -> Option<&str> {
        match &self.status {
            JobStatus::Errored { error_origin, .. } => error_origin.as_deref(),
            _ => None,
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        match &self.status {
            JobStatus::Waiting => None,
            JobStatus::Running { started_at }
            | JobStatus::Completed { started_at, .. }
            | JobStatus::Errored { started_at, .. } => Some(*started_at),
            JobStatus::Cancelled { started_at, .. } => *started_at,
        }
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        match &self.status {
            JobStatus::Completed { finished_at, .. }
            | JobStatus::Errored { finished_at, .. }
            | JobStatus::Cancelled { finished_at, .. } => Some(*finished_at),
            _ => None,
        }
    }

    /// `waiting -> running`
    pub fn start(&mut self) -> Result<(), InvalidTransition> {
        match self.status {
            JobStatus::Waiting => {
                let now = Utc::now();
                self.status = JobStatus::Running { started_at: now };
                self.updated_at = now;
                Ok(())
            }
            _ => Err(self.invalid(JobState::Running)),
        }
    }

    /// `running -> completed`
    pub fn complete(&mut self, result: R) -> Result<(), InvalidTransition> {
        match self.status {
            JobStatus::Running { started_at } => {
                let now = Utc::now();
                self.status = JobStatus::Completed {
                    started_at,
                    finished_at: now,
                    result,
                };
                self.updated_at = now;
                Ok(())
            }
            _ => Err(self.invalid(JobState::Completed)),
        }
    }

    /// `running -> errored`
    ///
    /// A [`JobError::Cancelled`] is routed to [`Job::cancel`] so cancellation
    /// never shows up as a failure.
    pub fn fail(&mut self, error: JobError) -> Result<(), InvalidTransition> {
        let started_at = match self.status {
            JobStatus::Running { started_at } => started_at,
            _ => return Err(self.invalid(JobState::Errored)),
        };
        match error {
            JobError::Cancelled => self.cancel(),
            JobError::Failed {
                kind,
                message,
                traceback,
                origin,
            } => {
                let now = Utc::now();
                self.status = JobStatus::Errored {
                    started_at,
                    finished_at: now,
                    error_type: kind,
                    error: message,
                    error_traceback: traceback,
                    error_origin: origin,
                };
                self.updated_at = now;
                Ok(())
            }
        }
    }

    /// `waiting | running -> cancelled`
    pub fn cancel(&mut self) -> Result<(), InvalidTransition> {
        let started_at = match self.status {
            JobStatus::Waiting => None,
            JobStatus::Running { started_at } => Some(started_at),
            _ => return Err(self.invalid(JobState::Cancelled)),
        };
        let now = Utc::now();
        self.status = JobStatus::Cancelled {
            started_at,
            finished_at: now,
        };
        self.updated_at = now;
        Ok(())
    }

    /// Mark a job that was running when its process died.
    ///
    /// Re-entering `running` would make the machine cyclic, so the job is
    /// closed out as errored and a retry has to be a new job.
    pub fn interrupt(&mut self) -> Result<(), InvalidTransition> {
        self.fail(JobError::new(
            ErrorKind::Interrupted,
            "job was running when the service stopped unexpectedly",
        ))
    }

    fn invalid(&self, to: JobState) -> InvalidTransition {
        InvalidTransition {
            from: self.state(),
            to,
        }
    }
}
