//! Database-backed job journal for persistent queues.

use conductor_core::{Job, JobId};
use db::DbError;
use db::repositories::{JobRepository, JobSnapshot};
use serde::{Serialize, de::DeserializeOwned};

/// Journals job snapshots of one queue so they survive a restart.
#[derive(Clone)]
pub struct JobJournal {
    repo: JobRepository,
    queue: String,
}

impl JobJournal {
    pub fn new(repo: JobRepository, queue: impl Into<String>) -> Self {
        Self {
            repo,
            queue: queue.into(),
        }
    }

    /// Save the current snapshot of a job.
    pub async fn save<P, R>(&self, job: &Job<P, R>) -> Result<(), PersistenceError>
    where
        P: Serialize,
        R: Serialize,
    {
        let snapshot = JobSnapshot {
            job_id: job.id.to_string(),
            queue: self.queue.clone(),
            status: job.state().as_str().to_string(),
            data: serde_json::to_string(job)?,
            updated_at: job.updated_at.to_rfc3339(),
        };
        self.repo.save(&snapshot).await?;
        tracing::debug!("Journaled job {} as {}", job.id, snapshot.status);
        Ok(())
    }

    /// Load every journaled job of this queue in creation order.
    ///
    /// Snapshots that no longer deserialize are skipped with a warning.
    pub async fn load<P, R>(&self) -> Result<Vec<Job<P, R>>, PersistenceError>
    where
        P: DeserializeOwned,
        R: DeserializeOwned,
    {
        let snapshots = self.repo.list_for_queue(&self.queue).await?;
        let mut jobs = Vec::with_capacity(snapshots.len());

        for snapshot in snapshots {
            match serde_json::from_str(&snapshot.data) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    tracing::warn!("Skipping unreadable journal entry {}: {}", snapshot.job_id, e);
                }
            }
        }

        Ok(jobs)
    }

    /// Remove a job from the journal.
    pub async fn delete(&self, job_id: JobId) -> Result<(), PersistenceError> {
        self.repo.delete(&job_id.to_string()).await?;
        Ok(())
    }
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
