//! Repository implementations for database operations.

mod job_repo;
mod model_repo;

pub use job_repo::{JobRepository, JobSnapshot};
pub use model_repo::ModelRecordRepository;
