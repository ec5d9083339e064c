//! Actor-based job engine for conductor.
//!
//! This crate provides the Ractor-based queue engine shared by every
//! workload, plus the in-process event bus.
//!
//! # Architecture
//!
//! - `JobQueue` - Cloneable client handle for one queue
//! - `QueueActor` - Owns a queue's jobs, dispatches to workers, journals
//! - `WorkerActor` - Runs one job at a time through the queue's executor
//! - `EventBus` - Broadcast channel for lifecycle events
//!
//! # Usage
//!
//! ```ignore
//! use actors::{EventBus, JobQueue};
//! use conductor_core::QueueConfig;
//!
//! let bus = EventBus::default();
//! let queue = JobQueue::start(executor, QueueConfig::new("downloads"), bus, None).await?;
//! let job = queue.enqueue(payload).await?;
//! let done = queue.wait_for_job(job.id, None).await?;
//! ```

mod bus;
mod handler;
mod messages;
mod persistence;
mod queue;
mod queue_actor;
mod worker_actor;

pub use bus::{DEFAULT_CAPACITY, EventBus, EventSubscription};
pub use handler::{ExecFuture, FnExecutor, JobContext, JobData, JobExecutor};
pub use messages::{QueueError, QueueMessage, WorkerMessage};
pub use persistence::{JobJournal, PersistenceError};
pub use queue::JobQueue;
pub use queue_actor::{JobOf, QueueActor, QueueArgs};
pub use worker_actor::{WorkerActor, WorkerArgs};
