#![allow(clippy::disallowed_methods)]

use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use actors::{
    EventBus, ExecFuture, FnExecutor, JobContext, JobExecutor, JobJournal, JobQueue, QueueError,
};
use conductor_core::{
    ErrorKind, Job, JobError, JobFilter, JobId, JobState, NewJob, QueueConfig, QueueState,
};
use db::DbConfig;
use db::repositories::JobRepository;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Task {
    Echo(u32),
    Fail(String),
    Panic,
    Sleep(u64),
    UntilCancelled,
    Record(String),
}

type TestJob = Job<Task, u32>;

#[derive(Clone, Default)]
struct Probe {
    executed: Arc<AtomicUsize>,
    order: Arc<Mutex<Vec<String>>>,
}

fn executor(probe: Probe) -> impl JobExecutor<Payload = Task, Output = u32> {
    FnExecutor::new("test", move |job: TestJob, ctx: JobContext| -> ExecFuture<u32> {
        let probe = probe.clone();
        Box::pin(async move {
            probe.executed.fetch_add(1, Ordering::SeqCst);
            match job.payload {
                Task::Echo(n) => Ok(n),
                Task::Fail(message) => Err(JobError::new(ErrorKind::Execution, message)),
                Task::Panic => panic!("executor exploded"),
                Task::Sleep(ms) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(ms as u32)
                }
                Task::UntilCancelled => {
                    ctx.cancelled().await;
                    Ok(0)
                }
                Task::Record(name) => {
                    probe.order.lock().unwrap().push(name);
                    Ok(0)
                }
            }
        })
    })
}

async fn start(
    config: QueueConfig,
) -> Result<(JobQueue<impl JobExecutor<Payload = Task, Output = u32>>, EventBus, Probe), QueueError>
{
    let bus = EventBus::default();
    let probe = Probe::default();
    let queue = JobQueue::start(executor(probe.clone()), config, bus.clone(), None).await?;
    Ok((queue, bus, probe))
}

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

#[tokio::test]
async fn completed_job_carries_result_and_publishes_transitions() -> Result<(), Box<dyn Error>> {
    let (queue, bus, _) = start(QueueConfig::new("happy").with_concurrency(2)).await?;
    let mut events = bus.subscribe("test.*");

    let job = queue.enqueue(Task::Echo(7)).await?;
    assert_eq!(job.state(), JobState::Waiting);
    assert_eq!(job.queue_id, "happy");

    let done = queue.wait_for_job(job.id, WAIT).await?;
    assert_eq!(done.state(), JobState::Completed);
    assert_eq!(done.result(), Some(&7));
    assert!(done.error().is_none());
    assert!(done.started_at().is_some() && done.finished_at().is_some());

    let mut topics = Vec::new();
    while topics.len() < 3 {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await?
            .ok_or("bus closed")?;
        assert_eq!(event.job_id, Some(job.id));
        topics.push(event.topic);
    }
    assert_eq!(topics, vec!["test.waiting", "test.running", "test.completed"]);

    queue.stop().await?;
    Ok(())
}

#[tokio::test]
async fn errors_and_panics_become_errored_jobs() -> Result<(), Box<dyn Error>> {
    let (queue, _, _) = start(QueueConfig::new("failing")).await?;

    let failed = queue.enqueue(Task::Fail("bad input".into())).await?;
    let panicked = queue.enqueue(Task::Panic).await?;
    let after = queue.enqueue(Task::Echo(1)).await?;

    let failed = queue.wait_for_job(failed.id, WAIT).await?;
    assert_eq!(failed.state(), JobState::Errored);
    assert_eq!(failed.error(), Some("bad input"));
    assert_eq!(failed.error_type(), Some(ErrorKind::Execution));
    assert!(failed.result().is_none());

    let panicked = queue.wait_for_job(panicked.id, WAIT).await?;
    assert_eq!(panicked.error_type(), Some(ErrorKind::Internal));
    assert!(panicked.error().unwrap().contains("executor exploded"));
    assert!(panicked.error_traceback().unwrap().contains("panic"));

    // The worker survives a panicking job.
    let after = queue.wait_for_job(after.id, WAIT).await?;
    assert_eq!(after.result(), Some(&1));

    queue.stop().await?;
    Ok(())
}

#[tokio::test]
async fn cancelled_waiting_job_never_runs() -> Result<(), Box<dyn Error>> {
    let (queue, bus, probe) = start(QueueConfig::new("cancel-waiting")).await?;
    let mut running = bus.subscribe("test.running");

    queue.pause()?;
    let job = queue.enqueue(Task::Echo(1)).await?;
    assert!(queue.cancel(job.id).await?);
    queue.resume()?;

    let done = queue.wait_for_job(job.id, WAIT).await?;
    assert_eq!(done.state(), JobState::Cancelled);
    assert!(done.started_at().is_none());

    // Cancelling again, or cancelling an unknown job, reports false.
    assert!(!queue.cancel(job.id).await?);
    assert!(!queue.cancel(JobId::new()).await?);

    let probe_job = queue.enqueue(Task::Echo(2)).await?;
    queue.wait_for_job(probe_job.id, WAIT).await?;
    let first_running = running.recv().await.ok_or("bus closed")?;
    assert_eq!(first_running.job_id, Some(probe_job.id));
    assert_eq!(probe.executed.load(Ordering::SeqCst), 1);

    queue.stop().await?;
    Ok(())
}

#[tokio::test]
async fn cancelled_running_job_ends_cancelled() -> Result<(), Box<dyn Error>> {
    let (queue, bus, _) = start(QueueConfig::new("cancel-running")).await?;
    let mut running = bus.subscribe("test.running");

    let job = queue.enqueue(Task::UntilCancelled).await?;
    running.recv().await.ok_or("bus closed")?;

    assert!(queue.cancel(job.id).await?);
    let done = queue.wait_for_job(job.id, WAIT).await?;

    // The executor returned Ok, but cancellation wins.
    assert_eq!(done.state(), JobState::Cancelled);
    assert!(done.result().is_none());
    assert!(done.started_at().is_some());

    queue.stop().await?;
    Ok(())
}

#[tokio::test]
async fn concurrent_waiters_see_the_same_terminal_job() -> Result<(), Box<dyn Error>> {
    let (queue, _, _) = start(QueueConfig::new("waiters")).await?;
    let job = queue.enqueue(Task::Sleep(100)).await?;

    let mut handles = Vec::new();
    for _ in 0..5 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            queue.wait_for_job(job.id, None).await
        }));
    }

    let mut finished = Vec::new();
    for handle in handles {
        finished.push(handle.await??);
    }

    assert!(finished.iter().all(|j| j.state() == JobState::Completed));
    assert!(finished.iter().all(|j| *j == finished[0]));

    queue.stop().await?;
    Ok(())
}

#[tokio::test]
async fn wait_timeout_returns_current_snapshot() -> Result<(), Box<dyn Error>> {
    let (queue, _, _) = start(QueueConfig::new("timeout")).await?;
    let job = queue.enqueue(Task::UntilCancelled).await?;

    let snapshot = queue
        .wait_for_job(job.id, Some(Duration::from_millis(50)))
        .await?;
    assert!(!snapshot.is_terminal());

    let missing = queue
        .wait_for_job(JobId::new(), Some(Duration::from_millis(50)))
        .await;
    assert!(matches!(missing, Err(QueueError::NotFound(_))));

    queue.stop().await?;
    Ok(())
}

#[tokio::test]
async fn enqueue_does_not_wait_for_execution() -> Result<(), Box<dyn Error>> {
    let (queue, _, _) = start(QueueConfig::new("fast-enqueue")).await?;
    queue.enqueue(Task::Sleep(1_000)).await?;

    let started = Instant::now();
    for _ in 0..20 {
        queue.enqueue(Task::Echo(0)).await?;
    }
    assert!(started.elapsed() < Duration::from_millis(500));

    queue.stop().await?;
    Ok(())
}

#[tokio::test]
async fn dispatch_is_fifo_and_prepend_jumps_ahead() -> Result<(), Box<dyn Error>> {
    let (queue, _, probe) = start(QueueConfig::new("fifo")).await?;

    queue.pause()?;
    queue.enqueue(Task::Record("a".into())).await?;
    queue.enqueue(Task::Record("b".into())).await?;
    let front = queue
        .enqueue_many(
            vec![
                NewJob::new(Task::Record("c".into())),
                NewJob::new(Task::Record("d".into())),
            ],
            true,
        )
        .await?;
    assert_eq!(queue.info().await?.state, QueueState::Paused);
    queue.resume()?;

    let last = queue.enqueue(Task::Echo(0)).await?;
    queue.wait_for_job(last.id, WAIT).await?;
    assert!(front.iter().all(|j| j.queue_id == "fifo"));

    let order = probe.order.lock().unwrap().clone();
    assert_eq!(order, vec!["c", "d", "a", "b"]);

    queue.stop().await?;
    Ok(())
}

#[tokio::test]
async fn admission_limit_rejects_whole_group() -> Result<(), Box<dyn Error>> {
    let config = QueueConfig::new("bounded").with_max_queue_size(Some(2));
    let (queue, _, _) = start(config).await?;

    queue.pause()?;
    queue.enqueue(Task::Echo(1)).await?;

    let rejected = queue
        .enqueue_many(
            vec![NewJob::new(Task::Echo(2)), NewJob::new(Task::Echo(3))],
            false,
        )
        .await;
    assert!(matches!(rejected, Err(QueueError::QueueFull(2))));
    assert_eq!(queue.counts(JobFilter::all()).await?.total(), 1);

    queue.stop().await?;
    Ok(())
}

#[tokio::test]
async fn listing_counting_cancelling_and_pruning() -> Result<(), Box<dyn Error>> {
    let (queue, _, _) = start(QueueConfig::new("bookkeeping")).await?;

    let batch = conductor_core::BatchId::new();
    let done = queue.enqueue(Task::Echo(1)).await?;
    queue.wait_for_job(done.id, WAIT).await?;

    queue.pause()?;
    let grouped = queue
        .enqueue_many(
            vec![
                NewJob::new(Task::Echo(2)).in_batch(batch),
                NewJob::new(Task::Echo(3)).in_batch(batch).in_queue("other"),
            ],
            false,
        )
        .await?;

    let counts = queue.counts(JobFilter::all()).await?;
    assert_eq!((counts.completed, counts.waiting, counts.total()), (1, 2, 3));

    let other = queue.list_jobs(JobFilter::queue("other")).await?;
    assert_eq!(other.len(), 1);
    assert_eq!(other[0].id, grouped[1].id);

    let listed = queue.list_jobs(JobFilter::all().with_limit(2)).await?;
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, done.id);

    let cancelled = queue.cancel_where(JobFilter::batch(batch)).await?;
    assert_eq!(cancelled.len(), 2);
    let counts = queue.counts(JobFilter::batch(batch)).await?;
    assert_eq!(counts.cancelled, 2);

    let pruned = queue
        .prune(JobFilter::all().with_state(JobState::Cancelled))
        .await?;
    assert_eq!(pruned, 2);
    assert!(queue.get_job(grouped[0].id).await?.is_none());
    assert!(queue.get_job(done.id).await?.is_some());

    let info = queue.info().await?;
    assert_eq!(info.name, "bookkeeping");
    assert_eq!(info.concurrency, 1);
    assert_eq!(info.counts.total(), 1);

    queue.stop().await?;
    Ok(())
}

#[tokio::test]
async fn stop_drains_and_rejects_new_work() -> Result<(), Box<dyn Error>> {
    let (queue, bus, _) = start(QueueConfig::new("drain")).await?;
    let mut running = bus.subscribe("test.running");

    let busy = queue.enqueue(Task::UntilCancelled).await?;
    let queued = queue.enqueue(Task::Echo(1)).await?;
    running.recv().await.ok_or("bus closed")?;

    let observer = queue.clone();
    queue.stop().await?;

    let again = observer.enqueue(Task::Echo(2)).await;
    assert!(matches!(again, Err(QueueError::ShuttingDown)));
    // Stopping twice is fine.
    observer.stop().await?;

    // Both jobs were cancelled before the actor went away.
    let _ = (busy, queued);
    Ok(())
}

#[tokio::test]
async fn persistent_queue_recovers_journaled_jobs() -> Result<(), Box<dyn Error>> {
    let db = db::init(&DbConfig::memory()).await?;
    let repo = JobRepository::new(db);
    let journal = JobJournal::new(repo.clone(), "durable");

    let waiting: TestJob = Job::new("durable", Task::Echo(5));
    let mut running: TestJob = Job::new("durable", Task::Sleep(10));
    running.start()?;
    let mut finished: TestJob = Job::new("durable", Task::Echo(9));
    finished.start()?;
    finished.complete(9)?;

    for job in [&waiting, &running, &finished] {
        journal.save(job).await?;
    }

    let config = QueueConfig::new("durable").with_persist(true);
    let queue = JobQueue::start(
        executor(Probe::default()),
        config,
        EventBus::default(),
        Some(repo.clone()),
    )
    .await?;

    let requeued = queue.wait_for_job(waiting.id, WAIT).await?;
    assert_eq!(requeued.result(), Some(&5));

    let interrupted = queue.get_job(running.id).await?.ok_or("missing job")?;
    assert_eq!(interrupted.state(), JobState::Errored);
    assert_eq!(interrupted.error_type(), Some(ErrorKind::Interrupted));

    let kept = queue.get_job(finished.id).await?.ok_or("missing job")?;
    assert_eq!(kept.result(), Some(&9));

    // New work is journaled too.
    let fresh = queue.enqueue(Task::Echo(3)).await?;
    queue.wait_for_job(fresh.id, WAIT).await?;
    queue.stop().await?;

    let snapshot = repo.get(&fresh.id.to_string()).await?;
    assert_eq!(snapshot.status, "completed");
    assert_eq!(snapshot.queue, "durable");

    Ok(())
}

#[tokio::test]
async fn persistent_queue_requires_repository() {
    let config = QueueConfig::new("nowhere").with_persist(true);
    let result =
        JobQueue::start(executor(Probe::default()), config, EventBus::default(), None).await;
    assert!(matches!(result, Err(QueueError::Config(_))));
}

/// Finishes successfully even when cancelled and counts rollbacks.
struct Stubborn {
    rolled_back: Arc<AtomicUsize>,
}

impl JobExecutor for Stubborn {
    type Payload = Task;
    type Output = u32;

    fn kind(&self) -> &str {
        "stubborn"
    }

    fn execute(&self, _job: TestJob, ctx: JobContext) -> ExecFuture<u32> {
        Box::pin(async move {
            ctx.cancelled().await;
            Ok(42)
        })
    }

    fn rollback(&self, _job_id: JobId, output: u32) -> Option<ExecFuture<()>> {
        assert_eq!(output, 42);
        let rolled_back = self.rolled_back.clone();
        Some(Box::pin(async move {
            rolled_back.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
    }
}

#[tokio::test]
async fn late_success_of_cancelled_job_is_rolled_back() -> Result<(), Box<dyn Error>> {
    let bus = EventBus::default();
    let rolled_back = Arc::new(AtomicUsize::new(0));
    let executor = Stubborn {
        rolled_back: rolled_back.clone(),
    };
    let queue =
        JobQueue::start(executor, QueueConfig::new("stubborn"), bus.clone(), None).await?;
    let mut running = bus.subscribe("stubborn.running");

    let job = queue.enqueue(Task::UntilCancelled).await?;
    running.recv().await.ok_or("bus closed")?;
    assert!(queue.cancel(job.id).await?);

    let done = queue.wait_for_job(job.id, WAIT).await?;
    assert_eq!(done.state(), JobState::Cancelled);
    assert_eq!(rolled_back.load(Ordering::SeqCst), 1);

    queue.stop().await?;
    Ok(())
}
