//! Core domain types for the conductor job system.
//!
//! This crate contains shared types used across all packages:
//! - Job, JobStatus and the failure taxonomy for work items
//! - Queue configuration, filters and counts
//! - Events published on the bus
//! - Model records and session graphs

mod error;
mod events;
mod job;
mod model;
mod queue;
mod session;

pub use error::{ErrorKind, JobError};
pub use events::{Event, TopicFilter};
pub use job::{BatchId, InvalidTransition, Job, JobId, JobProgress, JobState, JobStatus, NewJob};
pub use model::{
    BaseModelType, ModelConfig, ModelFormat, ModelRecordChanges, ModelRecordFilter,
    ModelSourceType, ModelType,
};
pub use queue::{JobCounts, JobFilter, QueueConfig, QueueInfo, QueueState};
pub use session::{
    Batch, BatchStatus, Edge, EdgeConnection, EnqueueBatchResult, Graph, ImageField,
    InvocationOutput, Node, Session, SessionId, SessionPayload, SessionQueueItem,
    SessionQueueStatus, SessionResults,
};
