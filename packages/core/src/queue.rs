//! Queue configuration, state and query types.

use serde::{Deserialize, Serialize};

use crate::{BatchId, Job, JobState};

/// Current operational state of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    /// Queue is active and dispatching jobs.
    #[default]
    Running,
    /// Queue is paused, waiting jobs stay waiting.
    Paused,
    /// Queue is draining before shutdown and no longer accepts jobs.
    Draining,
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueState::Running => write!(f, "running"),
            QueueState::Paused => write!(f, "paused"),
            QueueState::Draining => write!(f, "draining"),
        }
    }
}

/// Configuration for a job queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Logical queue name, stored on every job as `queue_id`.
    pub name: String,
    /// Number of workers, each running one job at a time.
    pub concurrency: usize,
    /// Journal job snapshots to the database and recover them on start.
    pub persist: bool,
    /// Maximum number of waiting jobs (None = unlimited).
    pub max_queue_size: Option<usize>,
    /// Minimum interval between progress events per job.
    pub progress_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            concurrency: 1,
            persist: false,
            max_queue_size: None,
            progress_interval_ms: 500,
        }
    }
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
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

    pub fn with_progress_interval_ms(mut self, ms: u64) -> Self {
        self.progress_interval_ms = ms;
        self
    }
}

/// Per-state job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub running: usize,
    pub completed: usize,
    pub errored: usize,
    pub cancelled: usize,
}

impl JobCounts {
    pub fn total(&self) -> usize {
        self.waiting + self.running + self.completed + self.errored + self.cancelled
    }

    pub fn record(&mut self, state: JobState) {
        match state {
            JobState::Waiting => self.waiting += 1,
            JobState::Running => self.running += 1,
            JobState::Completed => self.completed += 1,
            JobState::Errored => self.errored += 1,
            JobState::Cancelled => self.cancelled += 1,
        }
    }
}

/// Snapshot returned by a queue's `info` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub name: String,
    pub state: QueueState,
    pub concurrency: usize,
    pub counts: JobCounts,
}

/// Selects jobs for listing, counting, cancelling and pruning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_ids: Option<Vec<BatchId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<JobState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn queue(queue_id: impl Into<String>) -> Self {
        Self {
            queue_id: Some(queue_id.into()),
            ..Default::default()
        }
    }

    pub fn batch(batch_id: BatchId) -> Self {
        Self {
            batch_ids: Some(vec![batch_id]),
            ..Default::default()
        }
    }

    pub fn with_queue(mut self, queue_id: impl Into<String>) -> Self {
        self.queue_id = Some(queue_id.into());
        self
    }

    pub fn with_batches(mut self, batch_ids: Vec<BatchId>) -> Self {
        self.batch_ids = Some(batch_ids);
        self
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check the job against every set criterion. `limit` is applied by the
    /// caller over the ordered result.
    pub fn matches<P, R>(&self, job: &Job<P, R>) -> bool {
        if let Some(queue_id) = &self.queue_id
            && job.queue_id != *queue_id
        {
            return false;
        }
        if let Some(batch_ids) = &self.batch_ids {
            match job.batch_id {
                Some(batch_id) if batch_ids.contains(&batch_id) => {}
                _ => return false,
            }
        }
        if let Some(state) = self.state
            && job.state() != state
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_matches_queue_batch_and_state() {
        let batch = BatchId::new();
        let job: Job<(), ()> = Job::new("q1", ()).with_batch(Some(batch));

        assert!(JobFilter::all().matches(&job));
        assert!(JobFilter::queue("q1").matches(&job));
        assert!(!JobFilter::queue("q2").matches(&job));
        assert!(JobFilter::batch(batch).matches(&job));
        assert!(!JobFilter::batch(BatchId::new()).matches(&job));
        assert!(JobFilter::all().with_state(JobState::Waiting).matches(&job));
        assert!(!JobFilter::all().with_state(JobState::Running).matches(&job));

        let loose: Job<(), ()> = Job::new("q1", ());
        assert!(!JobFilter::batch(batch).matches(&loose));
    }

    #[test]
    fn counts_total_every_bucket() {
        let mut counts = JobCounts::default();
        for state in [
            JobState::Waiting,
            JobState::Running,
            JobState::Completed,
            JobState::Errored,
            JobState::Cancelled,
            JobState::Completed,
        ] {
            counts.record(state);
        }
        assert_eq!(counts.completed, 2);
        assert_eq!(counts.total(), 6);
    }

    #[test]
    fn concurrency_is_at_least_one() {
        assert_eq!(QueueConfig::new("q").with_concurrency(0).concurrency, 1);
    }
}
