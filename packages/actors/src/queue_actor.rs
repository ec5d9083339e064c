//! Queue actor: the single owner of a queue's job table.
//!
//! Every state change of every job happens inside this actor's message
//! handler, so counts, listings and transitions never race. Workers are
//! linked children that receive jobs pushed to them when idle.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use conductor_core::{
    ErrorKind, Event, Job, JobCounts, JobError, JobFilter, JobId, JobProgress, JobState,
    QueueConfig, QueueInfo, QueueState,
};
use ractor::{Actor, ActorId, ActorProcessingErr, ActorRef, RpcReplyPort, SupervisionEvent};
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::handler::{JobContext, JobExecutor};
use crate::messages::{QueueError, QueueMessage, WorkerMessage};
use crate::persistence::JobJournal;
use crate::worker_actor::{WorkerActor, WorkerArgs};

/// Job type handled by executor `E`.
pub type JobOf<E> = Job<<E as JobExecutor>::Payload, <E as JobExecutor>::Output>;
pub type QueueMsgOf<E> =
    QueueMessage<<E as JobExecutor>::Payload, <E as JobExecutor>::Output>;
pub type WorkerMsgOf<E> =
    WorkerMessage<<E as JobExecutor>::Payload, <E as JobExecutor>::Output>;

/// Bookkeeping for a job handed to a worker.
struct RunningJob {
    worker_id: usize,
    token: CancellationToken,
    cancel_requested: bool,
}

/// Queue actor arguments.
pub struct QueueArgs<E: JobExecutor> {
    pub executor: Arc<E>,
    pub config: QueueConfig,
    pub bus: EventBus,
    pub journal: Option<JobJournal>,
}

/// State for the queue actor.
pub struct QueueActorState<E: JobExecutor> {
    config: QueueConfig,
    kind: Arc<str>,
    executor: Arc<E>,
    bus: EventBus,
    journal: Option<JobJournal>,
    state: QueueState,
    /// All known jobs, in creation order.
    jobs: BTreeMap<JobId, JobOf<E>>,
    /// Waiting jobs in dispatch order.
    pending: VecDeque<JobId>,
    running: HashMap<JobId, RunningJob>,
    workers: BTreeMap<usize, ActorRef<WorkerMsgOf<E>>>,
    idle: VecDeque<usize>,
    next_worker_id: usize,
    waiters: HashMap<JobId, Vec<RpcReplyPort<Option<JobOf<E>>>>>,
    shutdown: Vec<RpcReplyPort<()>>,
}

impl<E: JobExecutor> QueueActorState<E> {
    fn new(args: QueueArgs<E>) -> Self {
        let kind: Arc<str> = Arc::from(args.executor.kind());
        Self {
            config: args.config,
            kind,
            executor: args.executor,
            bus: args.bus,
            journal: args.journal,
            state: QueueState::Running,
            jobs: BTreeMap::new(),
            pending: VecDeque::new(),
            running: HashMap::new(),
            workers: BTreeMap::new(),
            idle: VecDeque::new(),
            next_worker_id: 0,
            waiters: HashMap::new(),
            shutdown: Vec::new(),
        }
    }

    /// Reload journaled jobs. Waiting jobs are requeued in creation order;
    /// jobs that were running when the process died are closed out as
    /// interrupted.
    async fn recover(&mut self) -> Result<(), ActorProcessingErr> {
        let Some(journal) = self.journal.clone() else {
            return Ok(());
        };

        let jobs: Vec<JobOf<E>> = journal.load().await?;
        let total = jobs.len();
        let mut interrupted = Vec::new();

        for mut job in jobs {
            match job.state() {
                JobState::Waiting => self.pending.push_back(job.id),
                JobState::Running => {
                    if job.interrupt().is_ok() {
                        interrupted.push(job.id);
                    }
                }
                _ => {}
            }
            self.jobs.insert(job.id, job);
        }

        for job_id in &interrupted {
            self.commit(*job_id).await;
        }

        tracing::info!(
            queue = %self.config.name,
            total,
            requeued = self.pending.len(),
            interrupted = interrupted.len(),
            "Recovered journaled jobs"
        );

        Ok(())
    }

    /// Persist, publish and, for terminal states, release waiters.
    async fn commit(&mut self, job_id: JobId) {
        let Some(job) = self.jobs.get(&job_id).cloned() else {
            return;
        };

        if let Some(journal) = &self.journal
            && let Err(e) = journal.save(&job).await
        {
            tracing::warn!("Failed to journal job {}: {}", job_id, e);
        }

        tracing::debug!(
            kind = %self.kind,
            job_id = %job_id,
            state = %job.state(),
            "job transition"
        );

        let payload = serde_json::to_value(&job).unwrap_or_default();
        self.bus
            .publish(Event::job_state(&self.kind, job_id, job.state()).with_payload(payload));

        if job.is_terminal()
            && let Some(waiters) = self.waiters.remove(&job_id)
        {
            for waiter in waiters {
                let _ = waiter.send(Some(job.clone()));
            }
        }
    }

    fn publish_queue_event(&self, event: &str) {
        self.bus
            .publish(Event::new(format!("{}.{}", self.kind, event)).with_payload(
                serde_json::json!({ "queue": self.config.name, "state": self.state }),
            ));
    }

    fn context(
        &self,
        job_id: JobId,
        token: CancellationToken,
        myself: &ActorRef<QueueMsgOf<E>>,
    ) -> JobContext {
        let queue = myself.clone();
        JobContext::new(
            job_id,
            self.kind.clone(),
            token,
            self.bus.clone(),
            Duration::from_millis(self.config.progress_interval_ms),
            Arc::new(move |progress| {
                let _ = queue.send_message(QueueMessage::Progress { job_id, progress });
            }),
        )
    }

    async fn spawn_worker(
        &mut self,
        myself: &ActorRef<QueueMsgOf<E>>,
    ) -> Result<(), ActorProcessingErr> {
        let worker_id = self.next_worker_id;
        self.next_worker_id += 1;

        let args = WorkerArgs {
            worker_id,
            queue: myself.clone(),
            executor: self.executor.clone(),
        };

        let (worker, _handle) =
            Actor::spawn_linked(None, WorkerActor::<E>::new(), args, myself.get_cell())
                .await
                .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn worker: {e}")))?;

        self.workers.insert(worker_id, worker);
        self.idle.push_back(worker_id);
        Ok(())
    }

    /// Hand waiting jobs to idle workers, FIFO.
    async fn dispatch(&mut self, myself: &ActorRef<QueueMsgOf<E>>) {
        while self.state == QueueState::Running && !self.pending.is_empty() {
            let Some(worker_id) = self.idle.pop_front() else {
                break;
            };
            let Some(job_id) = self.pending.pop_front() else {
                self.idle.push_front(worker_id);
                break;
            };
            let Some(job) = self.jobs.get_mut(&job_id) else {
                self.idle.push_front(worker_id);
                continue;
            };
            if job.start().is_err() {
                self.idle.push_front(worker_id);
                continue;
            }
            let snapshot = job.clone();

            let token = CancellationToken::new();
            let ctx = self.context(job_id, token.clone(), myself);
            self.running.insert(
                job_id,
                RunningJob {
                    worker_id,
                    token,
                    cancel_requested: false,
                },
            );
            self.commit(job_id).await;

            let sent = self.workers.get(&worker_id).map(|worker| {
                worker.send_message(WorkerMessage::ProcessJob {
                    job: Box::new(snapshot),
                    ctx,
                })
            });
            if !matches!(sent, Some(Ok(()))) {
                tracing::warn!("Worker {} unavailable for job {}", worker_id, job_id);
                self.workers.remove(&worker_id);
                self.finish(
                    job_id,
                    worker_id,
                    Err(JobError::new(ErrorKind::Internal, "worker unavailable")),
                )
                .await;
            }
        }
    }

    /// Apply a worker's outcome. A job whose cancellation was requested
    /// ends cancelled whatever the outcome.
    async fn finish(
        &mut self,
        job_id: JobId,
        worker_id: usize,
        outcome: Result<E::Output, JobError>,
    ) {
        let running = self.running.remove(&job_id);
        let cancel_requested = running.is_some_and(|r| r.cancel_requested);

        if cancel_requested
            && let Ok(output) = outcome.as_ref()
            && let Some(undo) = self.executor.rollback(job_id, output.clone())
            && let Err(e) = undo.await
        {
            tracing::warn!("Rollback of cancelled job {} failed: {}", job_id, e);
        }

        if let Some(job) = self.jobs.get_mut(&job_id) {
            let result = if cancel_requested {
                job.cancel()
            } else {
                match outcome {
                    Ok(output) => job.complete(output),
                    Err(error) => job.fail(error),
                }
            };
            match result {
                Ok(()) => self.commit(job_id).await,
                Err(e) => tracing::warn!("Ignoring outcome for job {}: {}", job_id, e),
            }
        }

        if self.workers.contains_key(&worker_id) && !self.idle.contains(&worker_id) {
            self.idle.push_back(worker_id);
        }
    }

    async fn cancel(&mut self, job_id: JobId) -> bool {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return false;
        };

        match job.state() {
            JobState::Waiting => {
                if job.cancel().is_err() {
                    return false;
                }
                self.pending.retain(|id| *id != job_id);
                self.commit(job_id).await;
                true
            }
            JobState::Running => {
                if let Some(running) = self.running.get_mut(&job_id) {
                    running.cancel_requested = true;
                    running.token.cancel();
                }
                tracing::debug!("Cancellation requested for running job {}", job_id);
                true
            }
            _ => false,
        }
    }

    async fn enqueue(
        &mut self,
        jobs: Vec<JobOf<E>>,
        prepend: bool,
    ) -> Result<Vec<JobOf<E>>, QueueError> {
        if self.state == QueueState::Draining {
            return Err(QueueError::ShuttingDown);
        }
        if let Some(max) = self.config.max_queue_size
            && self.pending.len() + jobs.len() > max
        {
            return Err(QueueError::QueueFull(max));
        }

        for job in &jobs {
            self.jobs.insert(job.id, job.clone());
        }
        if prepend {
            for job in jobs.iter().rev() {
                self.pending.push_front(job.id);
            }
        } else {
            self.pending.extend(jobs.iter().map(|job| job.id));
        }
        for job in &jobs {
            self.commit(job.id).await;
        }

        Ok(jobs)
    }

    fn counts(&self, filter: &JobFilter) -> JobCounts {
        let mut counts = JobCounts::default();
        for job in self.jobs.values().filter(|job| filter.matches(job)) {
            counts.record(job.state());
        }
        counts
    }

    async fn prune(&mut self, filter: &JobFilter) -> usize {
        let doomed: Vec<JobId> = self
            .jobs
            .values()
            .filter(|job| job.is_terminal() && filter.matches(job))
            .map(|job| job.id)
            .collect();

        for job_id in &doomed {
            self.jobs.remove(job_id);
            if let Some(journal) = &self.journal
                && let Err(e) = journal.delete(*job_id).await
            {
                tracing::warn!("Failed to remove job {} from journal: {}", job_id, e);
            }
        }

        doomed.len()
    }

    async fn begin_drain(&mut self) {
        if self.state == QueueState::Draining {
            return;
        }
        tracing::info!("Draining queue: {}", self.config.name);
        self.state = QueueState::Draining;

        let waiting: Vec<JobId> = self.pending.drain(..).collect();
        for job_id in waiting {
            if let Some(job) = self.jobs.get_mut(&job_id)
                && job.cancel().is_ok()
            {
                self.commit(job_id).await;
            }
        }
        for running in self.running.values_mut() {
            running.cancel_requested = true;
            running.token.cancel();
        }
    }

    /// Stop once draining and every worker is idle.
    fn maybe_stop(&mut self, myself: &ActorRef<QueueMsgOf<E>>) {
        if self.state != QueueState::Draining || !self.running.is_empty() {
            return;
        }
        for reply in self.shutdown.drain(..) {
            let _ = reply.send(());
        }
        myself.stop(None);
    }

    async fn worker_lost(
        &mut self,
        myself: &ActorRef<QueueMsgOf<E>>,
        actor_id: ActorId,
        reason: String,
    ) -> Result<(), ActorProcessingErr> {
        let Some(worker_id) = self
            .workers
            .iter()
            .find(|(_, worker)| worker.get_id() == actor_id)
            .map(|(id, _)| *id)
        else {
            return Ok(());
        };

        tracing::warn!("Worker {} of queue {} lost: {}", worker_id, self.config.name, reason);
        self.workers.remove(&worker_id);
        self.idle.retain(|id| *id != worker_id);

        let orphaned: Vec<JobId> = self
            .running
            .iter()
            .filter(|(_, running)| running.worker_id == worker_id)
            .map(|(job_id, _)| *job_id)
            .collect();
        for job_id in orphaned {
            let error = JobError::new(ErrorKind::Internal, format!("worker lost: {reason}"));
            self.finish(job_id, worker_id, Err(error)).await;
        }

        if self.state == QueueState::Draining {
            self.maybe_stop(myself);
        } else {
            self.spawn_worker(myself).await?;
            self.dispatch(myself).await;
        }
        Ok(())
    }
}

/// Queue actor that owns one queue's jobs and workers.
pub struct QueueActor<E>(PhantomData<fn() -> E>);

impl<E> QueueActor<E> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<E> Default for QueueActor<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: JobExecutor> Actor for QueueActor<E> {
    type Msg = QueueMsgOf<E>;
    type State = QueueActorState<E>;
    type Arguments = QueueArgs<E>;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            "Starting queue actor: {} ({}, {} workers)",
            args.config.name,
            args.executor.kind(),
            args.config.concurrency
        );
        let mut state = QueueActorState::new(args);
        state.recover().await?;
        Ok(state)
    }

    async fn post_start(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        for _ in 0..state.config.concurrency.max(1) {
            state.spawn_worker(&myself).await?;
        }
        state.dispatch(&myself).await;
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            QueueMessage::Enqueue {
                jobs,
                prepend,
                reply,
            } => {
                let result = state.enqueue(jobs, prepend).await;
                let _ = reply.send(result);
                state.dispatch(&myself).await;
            }

            QueueMessage::JobFinished {
                job_id,
                worker_id,
                outcome,
            } => {
                state.finish(job_id, worker_id, outcome).await;
                state.maybe_stop(&myself);
                state.dispatch(&myself).await;
            }

            QueueMessage::Progress { job_id, progress } => {
                let JobProgress { bytes, total_bytes } = progress;
                if let Some(job) = state.jobs.get_mut(&job_id)
                    && job.state() == JobState::Running
                {
                    job.progress = Some(progress);
                    job.updated_at = chrono::Utc::now();
                    state.bus.publish(
                        Event::new(format!("{}.progress", state.kind))
                            .with_job(job_id)
                            .with_status(JobState::Running)
                            .with_payload(serde_json::json!({
                                "bytes": bytes,
                                "total_bytes": total_bytes,
                            })),
                    );
                }
            }

            QueueMessage::CancelJob { job_id, reply } => {
                let cancelled = state.cancel(job_id).await;
                let _ = reply.send(cancelled);
            }

            QueueMessage::CancelWhere { filter, reply } => {
                let targets: Vec<JobId> = state
                    .jobs
                    .values()
                    .filter(|job| !job.is_terminal() && filter.matches(job))
                    .map(|job| job.id)
                    .collect();
                let mut cancelled = Vec::with_capacity(targets.len());
                for job_id in targets {
                    if state.cancel(job_id).await {
                        cancelled.push(job_id);
                    }
                }
                let _ = reply.send(cancelled);
            }

            QueueMessage::GetJob { job_id, reply } => {
                let _ = reply.send(state.jobs.get(&job_id).cloned());
            }

            QueueMessage::ListJobs { filter, reply } => {
                let jobs = state
                    .jobs
                    .values()
                    .filter(|job| filter.matches(job))
                    .take(filter.limit.unwrap_or(usize::MAX))
                    .cloned()
                    .collect();
                let _ = reply.send(jobs);
            }

            QueueMessage::Counts { filter, reply } => {
                let _ = reply.send(state.counts(&filter));
            }

            QueueMessage::WaitForJob { job_id, reply } => match state.jobs.get(&job_id) {
                None => {
                    let _ = reply.send(None);
                }
                Some(job) if job.is_terminal() => {
                    let _ = reply.send(Some(job.clone()));
                }
                Some(_) => {
                    state.waiters.entry(job_id).or_default().push(reply);
                }
            },

            QueueMessage::Prune { filter, reply } => {
                let pruned = state.prune(&filter).await;
                let _ = reply.send(pruned);
            }

            QueueMessage::Pause => {
                if state.state == QueueState::Running {
                    state.state = QueueState::Paused;
                    tracing::info!("Paused queue: {}", state.config.name);
                    state.publish_queue_event("queue_paused");
                }
            }

            QueueMessage::Resume => {
                if state.state == QueueState::Paused {
                    state.state = QueueState::Running;
                    tracing::info!("Resumed queue: {}", state.config.name);
                    state.publish_queue_event("queue_resumed");
                    state.dispatch(&myself).await;
                }
            }

            QueueMessage::GetInfo { reply } => {
                let _ = reply.send(QueueInfo {
                    name: state.config.name.clone(),
                    state: state.state,
                    concurrency: state.config.concurrency,
                    counts: state.counts(&JobFilter::all()),
                });
            }

            QueueMessage::Shutdown { reply } => {
                state.shutdown.push(reply);
                state.begin_drain().await;
                state.maybe_stop(&myself);
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisionEvent::ActorFailed(cell, err) => {
                state
                    .worker_lost(&myself, cell.get_id(), err.to_string())
                    .await?;
            }
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                let reason = reason.unwrap_or_else(|| "terminated".to_string());
                state.worker_lost(&myself, cell.get_id(), reason).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::info!("Queue actor stopped: {}", state.config.name);
        Ok(())
    }
}
