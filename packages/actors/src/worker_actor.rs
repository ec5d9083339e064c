//! Worker actor for executing jobs.

use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use conductor_core::{Job, JobError};
use futures_util::FutureExt;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tracing::Instrument;

use crate::handler::{JobContext, JobExecutor};
use crate::messages::{QueueMessage, WorkerMessage};
use crate::queue_actor::{QueueMsgOf, WorkerMsgOf};

/// State for the worker actor.
pub struct WorkerActorState<E: JobExecutor> {
    /// Worker index within its queue.
    pub worker_id: usize,
    /// Queue actor reference.
    pub queue: ActorRef<QueueMsgOf<E>>,
    /// Executor shared by all workers of the queue.
    pub executor: Arc<E>,
}

/// Worker actor arguments.
pub struct WorkerArgs<E: JobExecutor> {
    pub worker_id: usize,
    pub queue: ActorRef<QueueMsgOf<E>>,
    pub executor: Arc<E>,
}

/// Worker actor that runs one job at a time.
pub struct WorkerActor<E>(PhantomData<fn() -> E>);

impl<E> WorkerActor<E> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<E> Default for WorkerActor<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: JobExecutor> Actor for WorkerActor<E> {
    type Msg = WorkerMsgOf<E>;
    type State = WorkerActorState<E>;
    type Arguments = WorkerArgs<E>;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::debug!("Starting worker {} for {}", args.worker_id, args.executor.kind());
        Ok(WorkerActorState {
            worker_id: args.worker_id,
            queue: args.queue,
            executor: args.executor,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::ProcessJob { job, ctx } => {
                let job_id = job.id;
                let span = tracing::info_span!(
                    "job",
                    kind = %ctx.kind(),
                    job_id = %job_id,
                    worker = state.worker_id
                );

                let outcome = run_guarded(state.executor.as_ref(), *job, ctx)
                    .instrument(span)
                    .await;

                if let Err(error) = &outcome {
                    tracing::debug!("Job {} did not complete: {}", job_id, error);
                }

                state.queue.send_message(QueueMessage::JobFinished {
                    job_id,
                    worker_id: state.worker_id,
                    outcome,
                })?;
            }
        }

        Ok(())
    }
}

/// Run the executor, turning panics (while building or polling the
/// future) into internal job errors.
async fn run_guarded<E: JobExecutor>(
    executor: &E,
    job: Job<E::Payload, E::Output>,
    ctx: JobContext,
) -> Result<E::Output, JobError> {
    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| executor.execute(job, ctx))) {
        Ok(future) => future,
        Err(panic) => return Err(JobError::from_panic(panic)),
    };

    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => Err(JobError::from_panic(panic)),
    }
}
