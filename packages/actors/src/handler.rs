//! Job executor trait and the per-job execution context.

use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use conductor_core::{Event, Job, JobError, JobId, JobProgress};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;

/// Future returned by an executor.
pub type ExecFuture<T> = Pin<Box<dyn Future<Output = Result<T, JobError>> + Send>>;

/// Bounds shared by job payloads and results.
pub trait JobData: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> JobData for T where
    T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

/// Executes jobs of one kind.
///
/// A queue is parametrized by exactly one executor, which fixes the payload
/// and result types of its jobs.
pub trait JobExecutor: Send + Sync + 'static {
    type Payload: JobData;
    type Output: JobData;

    /// Queue kind, used as the event topic prefix.
    fn kind(&self) -> &str;

    /// Run a job. Returning [`JobError::Cancelled`] or observing
    /// `ctx.cancelled()` ends the job as cancelled.
    fn execute(
        &self,
        job: Job<Self::Payload, Self::Output>,
        ctx: JobContext,
    ) -> ExecFuture<Self::Output>;

    /// Undo the side effects of a run that succeeded after its
    /// cancellation was requested. The job still ends cancelled.
    fn rollback(&self, _job_id: JobId, _output: Self::Output) -> Option<ExecFuture<()>> {
        None
    }
}

impl<E: JobExecutor> JobExecutor for Arc<E> {
    type Payload = E::Payload;
    type Output = E::Output;

    fn kind(&self) -> &str {
        (**self).kind()
    }

    fn execute(
        &self,
        job: Job<Self::Payload, Self::Output>,
        ctx: JobContext,
    ) -> ExecFuture<Self::Output> {
        (**self).execute(job, ctx)
    }

    fn rollback(&self, job_id: JobId, output: Self::Output) -> Option<ExecFuture<()>> {
        (**self).rollback(job_id, output)
    }
}

/// A simple function-based executor.
pub struct FnExecutor<P, R, F> {
    kind: String,
    handler: F,
    _types: PhantomData<fn() -> (P, R)>,
}

impl<P, R, F> FnExecutor<P, R, F>
where
    F: Fn(Job<P, R>, JobContext) -> ExecFuture<R> + Send + Sync + 'static,
{
    pub fn new(kind: impl Into<String>, handler: F) -> Self {
        Self {
            kind: kind.into(),
            handler,
            _types: PhantomData,
        }
    }
}

impl<P, R, F> JobExecutor for FnExecutor<P, R, F>
where
    P: JobData,
    R: JobData,
    F: Fn(Job<P, R>, JobContext) -> ExecFuture<R> + Send + Sync + 'static,
{
    type Payload = P;
    type Output = R;

    fn kind(&self) -> &str {
        &self.kind
    }

    fn execute(&self, job: Job<P, R>, ctx: JobContext) -> ExecFuture<R> {
        (self.handler)(job, ctx)
    }
}

type ProgressSink = Arc<dyn Fn(JobProgress) + Send + Sync>;

/// Handle given to an executor for one job run.
#[derive(Clone)]
pub struct JobContext {
    job_id: JobId,
    kind: Arc<str>,
    token: CancellationToken,
    bus: EventBus,
    progress: ProgressSink,
    interval: Duration,
    last_progress: Arc<Mutex<Option<Instant>>>,
}

impl JobContext {
    pub(crate) fn new(
        job_id: JobId,
        kind: Arc<str>,
        token: CancellationToken,
        bus: EventBus,
        interval: Duration,
        progress: ProgressSink,
    ) -> Self {
        Self {
            job_id,
            kind,
            token,
            bus,
            progress,
            interval,
            last_progress: Arc::new(Mutex::new(None)),
        }
    }

    /// Context for running an executor outside a queue. Progress reports
    /// are dropped.
    pub fn standalone(job_id: JobId, kind: &str, token: CancellationToken, bus: EventBus) -> Self {
        Self::new(job_id, Arc::from(kind), token, bus, Duration::ZERO, Arc::new(|_| {}))
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Cancellation checkpoint.
    pub fn check_cancelled(&self) -> Result<(), JobError> {
        if self.token.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Report transfer progress.
    ///
    /// Reports are dropped if one was sent less than the queue's progress
    /// interval ago, except the final one (`bytes == total_bytes`). Returns
    /// whether the report was forwarded.
    pub fn report_progress(&self, bytes: u64, total_bytes: Option<u64>) -> bool {
        let is_final = total_bytes == Some(bytes);
        let now = Instant::now();
        {
            let mut last = match self.last_progress.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !is_final
                && let Some(previous) = *last
                && now.duration_since(previous) < self.interval
            {
                return false;
            }
            *last = Some(now);
        }
        (self.progress)(JobProgress { bytes, total_bytes });
        true
    }

    /// Publish an event under this job's id on the shared bus.
    pub fn publish(&self, event: Event) {
        self.bus.publish(event.with_job(self.job_id));
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("kind", &self.kind)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) fn context(interval: Duration) -> (JobContext, Arc<AtomicUsize>) {
        let forwarded = Arc::new(AtomicUsize::new(0));
        let counter = forwarded.clone();
        let ctx = JobContext::new(
            JobId::new(),
            Arc::from("test"),
            CancellationToken::new(),
            EventBus::default(),
            interval,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (ctx, forwarded)
    }

    #[test]
    fn progress_is_rate_limited_except_final() {
        let (ctx, forwarded) = context(Duration::from_secs(60));

        assert!(ctx.report_progress(10, Some(100)));
        assert!(!ctx.report_progress(20, Some(100)));
        assert!(!ctx.report_progress(30, Some(100)));
        assert!(ctx.report_progress(100, Some(100)));
        assert_eq!(forwarded.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn zero_interval_forwards_everything() {
        let (ctx, forwarded) = context(Duration::ZERO);
        for i in 0..5 {
            ctx.report_progress(i, None);
        }
        assert_eq!(forwarded.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn checkpoint_reports_cancellation() {
        let (ctx, _) = context(Duration::ZERO);
        assert!(ctx.check_cancelled().is_ok());
        ctx.token.cancel();
        assert_eq!(ctx.check_cancelled(), Err(JobError::Cancelled));
        assert!(ctx.is_cancelled());
    }
}
