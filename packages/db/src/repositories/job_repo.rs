//! Job journal: serialized snapshots of jobs owned by persistent queues.

use serde::{Deserialize, Serialize};

use crate::{Database, DbError};

/// One journaled job. `data` is the job serialized to JSON, so the
/// journal stays agnostic of payload and result types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub queue: String,
    pub status: String,
    pub data: String,
    pub updated_at: String,
}

/// Repository for job journal operations.
#[derive(Clone)]
pub struct JobRepository {
    db: Database,
}

impl JobRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or replace a snapshot.
    pub async fn save(&self, snapshot: &JobSnapshot) -> Result<(), DbError> {
        self.db
            .query("UPSERT type::thing('job', $id) CONTENT $data")
            .bind(("id", snapshot.job_id.clone()))
            .bind(("data", snapshot.clone()))
            .await?
            .check()?;

        Ok(())
    }

    /// Get a snapshot by job id.
    pub async fn get(&self, job_id: &str) -> Result<JobSnapshot, DbError> {
        let record: Option<JobSnapshot> = self.db.select(("job", job_id)).await?;
        record.ok_or_else(|| DbError::NotFound(format!("Job not found: {job_id}")))
    }

    /// All snapshots of a queue in job id (creation) order.
    pub async fn list_for_queue(&self, queue: &str) -> Result<Vec<JobSnapshot>, DbError> {
        let mut result = self
            .db
            .query("SELECT * FROM job WHERE queue = $queue ORDER BY job_id ASC")
            .bind(("queue", queue.to_string()))
            .await?;

        let records: Vec<JobSnapshot> = result.take(0)?;

        Ok(records)
    }

    /// Delete a snapshot. Missing snapshots are not an error.
    pub async fn delete(&self, job_id: &str) -> Result<(), DbError> {
        let _: Option<JobSnapshot> = self.db.delete(("job", job_id)).await?;
        Ok(())
    }
}
