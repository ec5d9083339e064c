//! Download queue: fetches remote files into a destination directory.

mod executor;
mod transport;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use actors::{EventBus, JobQueue, QueueError};
use conductor_core::{Job, JobFilter, JobId, QueueConfig};
use serde::{Deserialize, Serialize};
use url::Url;

pub use executor::DownloadExecutor;
pub use transport::{ByteStream, FetchResponse, HttpTransport, TransferError, Transport};

pub type DownloadJob = Job<DownloadRequest, DownloadResult>;

/// One file to fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSource {
    pub url: Url,
    /// File name relative to the destination. Defaults to the last URL
    /// path segment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Expected SHA-256 of the complete file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl RemoteSource {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            path: None,
            sha256: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.sha256 = Some(sha256.into());
        self
    }

    fn file_name(&self) -> Result<PathBuf, TransferError> {
        let name = match &self.path {
            Some(path) => path.clone(),
            None => self
                .url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .ok_or_else(|| {
                    let reason = format!("cannot derive a file name from {}", self.url);
                    TransferError::InvalidRequest(reason)
                })?,
        };

        let relative = PathBuf::from(&name);
        let plain = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if !plain || relative.as_os_str().is_empty() {
            return Err(TransferError::InvalidRequest(format!(
                "file name {name:?} must be a relative path inside the destination"
            )));
        }
        Ok(relative)
    }
}

/// Download job payload.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub sources: Vec<RemoteSource>,
    pub destination: PathBuf,
    /// Bearer token sent with every request. Never serialized, so it stays
    /// out of events and journals.
    #[serde(default, skip_serializing)]
    pub auth: Option<String>,
}

impl DownloadRequest {
    pub fn new(sources: Vec<RemoteSource>, destination: impl Into<PathBuf>) -> Self {
        Self {
            sources,
            destination: destination.into(),
            auth: None,
        }
    }

    pub fn with_auth(mut self, token: impl Into<String>) -> Self {
        self.auth = Some(token.into());
        self
    }

    /// Resolve every source to its final path under the destination.
    pub fn targets(&self) -> Result<Vec<(&RemoteSource, PathBuf)>, TransferError> {
        if self.sources.is_empty() {
            return Err(TransferError::InvalidRequest("no sources given".to_string()));
        }
        self.sources
            .iter()
            .map(|source| Ok((source, self.destination.join(source.file_name()?))))
            .collect()
    }
}

impl std::fmt::Debug for DownloadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadRequest")
            .field("sources", &self.sources)
            .field("destination", &self.destination)
            .field("auth", &self.auth.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A file written by a download job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadedFile {
    pub path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
}

/// Download job result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadResult {
    pub files: Vec<DownloadedFile>,
    pub total_bytes: u64,
}

/// Path of the partial file for `target`.
pub fn part_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Download queue configuration.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub workers: usize,
    pub progress_interval: Duration,
    pub max_queue_size: Option<usize>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            progress_interval: Duration::from_millis(500),
            max_queue_size: None,
        }
    }
}

impl DownloadConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }
}

/// Queue of download jobs with its own worker pool.
#[derive(Clone)]
pub struct DownloadQueueService {
    queue: JobQueue<DownloadExecutor>,
}

impl DownloadQueueService {
    pub const QUEUE_NAME: &'static str = "downloads";

    pub async fn start(
        config: DownloadConfig,
        transport: Arc<dyn Transport>,
        bus: EventBus,
    ) -> Result<Self, QueueError> {
        let queue_config = QueueConfig::new(Self::QUEUE_NAME)
            .with_concurrency(config.workers)
            .with_max_queue_size(config.max_queue_size)
            .with_progress_interval_ms(config.progress_interval.as_millis() as u64);

        let executor = DownloadExecutor::new(transport);
        let queue = JobQueue::start(executor, queue_config, bus, None).await?;
        tracing::info!("Download queue started with {} workers", config.workers);
        Ok(Self { queue })
    }

    /// Enqueue a download. Returns the waiting job.
    pub async fn download(&self, request: DownloadRequest) -> Result<DownloadJob, QueueError> {
        let job = self.queue.enqueue(request).await?;
        tracing::debug!("Queued download {}", job.id);
        Ok(job)
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<DownloadJob>, QueueError> {
        self.queue.get_job(job_id).await
    }

    pub async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<DownloadJob>, QueueError> {
        self.queue.list_jobs(filter).await
    }

    pub async fn cancel(&self, job_id: JobId) -> Result<bool, QueueError> {
        self.queue.cancel(job_id).await
    }

    pub async fn wait_for_job(
        &self,
        job_id: JobId,
        timeout: Option<Duration>,
    ) -> Result<DownloadJob, QueueError> {
        self.queue.wait_for_job(job_id, timeout).await
    }

    pub async fn prune(&self) -> Result<usize, QueueError> {
        self.queue.prune(JobFilter::all()).await
    }

    pub fn queue(&self) -> &JobQueue<DownloadExecutor> {
        &self.queue
    }

    pub async fn stop(&self) -> Result<(), QueueError> {
        self.queue.stop().await
    }
}
