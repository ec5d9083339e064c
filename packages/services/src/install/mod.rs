//! Model installation: source resolution, download, probing and registration.

mod executor;
mod probe;
mod source;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use actors::{EventBus, JobQueue, QueueError};
use conductor_core::{
    Job, JobFilter, JobId, ModelConfig, ModelRecordChanges, ModelRecordFilter, ModelSourceType,
    NewJob, QueueConfig,
};
use db::DbError;
use db::repositories::{JobRepository, ModelRecordRepository};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::download::DownloadQueueService;

pub use executor::{InstallExecutor, TMP_INSTALL_PREFIX};
pub use probe::{ProbeError, ProbedModel, probe_api, probe_path};
pub use source::{API_MODELS, ApiModel, ResolvedSource, api_model, resolve};

pub type InstallJob = Job<InstallRequest, InstallResult>;

/// Install job payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallRequest {
    pub source: String,
    #[serde(default)]
    pub overrides: ModelRecordChanges,
}

/// Install job result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallResult {
    pub config_out: ModelConfig,
    pub source_type: ModelSourceType,
    /// Download sub-job, for URL sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_job: Option<JobId>,
    pub already_installed: bool,
}

impl InstallResult {
    fn existing(config_out: ModelConfig, source_type: ModelSourceType) -> Self {
        Self {
            config_out,
            source_type,
            download_job: None,
            already_installed: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstallConfig {
    pub models_dir: PathBuf,
    pub workers: usize,
    /// Journal install jobs so they survive a restart.
    pub persist: bool,
}

impl InstallConfig {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            workers: 2,
            persist: false,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }
}

/// Outcome of the startup scan of the models directory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanReport {
    /// Leftover scratch directories that were removed.
    pub removed: Vec<PathBuf>,
    /// Keys of records whose files are gone.
    pub missing: Vec<String>,
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("Cannot resolve model source {input:?}: {reason}")]
    Resolution { input: String, reason: String },

    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Installs models from API identifiers, local paths and URLs.
#[derive(Clone)]
pub struct ModelInstallService {
    queue: JobQueue<InstallExecutor>,
    records: ModelRecordRepository,
    models_dir: PathBuf,
    scan: Arc<ScanReport>,
}

impl ModelInstallService {
    pub const QUEUE_NAME: &'static str = "installs";

    /// Scan the models directory and start the install queue.
    pub async fn start(
        config: InstallConfig,
        records: ModelRecordRepository,
        downloads: DownloadQueueService,
        bus: EventBus,
        journal: Option<JobRepository>,
    ) -> Result<Self, InstallError> {
        tokio::fs::create_dir_all(&config.models_dir).await?;
        let models_dir = tokio::fs::canonicalize(&config.models_dir).await?;
        let scan = scan(&models_dir, &records).await?;

        let installer = Arc::new(executor::Installer::new(
            records.clone(),
            downloads,
            models_dir.clone(),
        ));
        let queue_config = QueueConfig::new(Self::QUEUE_NAME)
            .with_concurrency(config.workers)
            .with_persist(config.persist);
        let executor = InstallExecutor::new(installer);
        let queue = JobQueue::start(executor, queue_config, bus, journal).await?;

        tracing::info!("Install service started in {}", models_dir.display());
        Ok(Self {
            queue,
            records,
            models_dir,
            scan: Arc::new(scan),
        })
    }

    /// Queue an install of `source`. Resolution happens on the worker, so
    /// a bad source surfaces as an errored job.
    pub async fn heuristic_import(
        &self,
        source: &str,
        overrides: Option<ModelRecordChanges>,
    ) -> Result<InstallJob, InstallError> {
        let request = InstallRequest {
            source: source.to_string(),
            overrides: overrides.unwrap_or_default(),
        };
        let mut jobs = self.queue.enqueue_many(vec![NewJob::new(request)], false).await?;
        let job = jobs
            .pop()
            .ok_or_else(|| QueueError::Actor("enqueue returned no job".to_string()))?;
        tracing::debug!("Queued install {} for {}", job.id, source);
        Ok(job)
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<InstallJob>, InstallError> {
        Ok(self.queue.get_job(job_id).await?)
    }

    pub async fn list_jobs(&self) -> Result<Vec<InstallJob>, InstallError> {
        Ok(self.queue.list_jobs(JobFilter::all()).await?)
    }

    pub async fn cancel_job(&self, job_id: JobId) -> Result<bool, InstallError> {
        Ok(self.queue.cancel(job_id).await?)
    }

    /// Forget finished install jobs.
    pub async fn prune_jobs(&self) -> Result<usize, InstallError> {
        Ok(self.queue.prune(JobFilter::all()).await?)
    }

    pub async fn wait_for_job(
        &self,
        job_id: JobId,
        timeout: Option<Duration>,
    ) -> Result<InstallJob, InstallError> {
        Ok(self.queue.wait_for_job(job_id, timeout).await?)
    }

    /// Wait until no install is waiting or running, or the timeout passes.
    /// Returns every known install job.
    pub async fn wait_for_installs(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Vec<InstallJob>, InstallError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        for job in self.queue.list_jobs(JobFilter::all()).await? {
            if job.is_terminal() {
                continue;
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        break;
                    }
                    Some(left)
                }
                None => None,
            };
            self.queue.wait_for_job(job.id, remaining).await?;
        }
        self.list_jobs().await
    }

    /// Delete a record and any files the service placed for it.
    pub async fn uninstall(&self, key: &str) -> Result<ModelConfig, InstallError> {
        let removed = self.records.delete(key).await?;
        let placed = self.models_dir.join(key);
        if tokio::fs::try_exists(&placed).await? {
            executor::remove_dir(&placed).await;
        }
        tracing::info!("Uninstalled {} ({})", removed.name, key);
        Ok(removed)
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn records(&self) -> &ModelRecordRepository {
        &self.records
    }

    /// Result of the startup scan.
    pub fn scan_report(&self) -> &ScanReport {
        &self.scan
    }

    pub async fn stop(&self) -> Result<(), InstallError> {
        self.queue.stop().await?;
        Ok(())
    }
}

/// Remove leftover scratch directories and report records whose files vanished.
async fn scan(
    models_dir: &Path,
    records: &ModelRecordRepository,
) -> Result<ScanReport, InstallError> {
    let mut report = ScanReport::default();

    let mut entries = tokio::fs::read_dir(models_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let scratch = name.to_string_lossy().starts_with(TMP_INSTALL_PREFIX);
        if scratch && entry.file_type().await?.is_dir() {
            executor::remove_dir(&entry.path()).await;
            report.removed.push(entry.path());
        }
    }

    for record in records.list(&ModelRecordFilter::default()).await? {
        if let Some(path) = &record.path
            && !tokio::fs::try_exists(path).await.unwrap_or(false)
        {
            tracing::warn!("Model {} ({}) is missing from {}", record.name, record.key, path);
            report.missing.push(record.key);
        }
    }

    if !report.removed.is_empty() || !report.missing.is_empty() {
        tracing::info!(
            "Model scan: removed {} scratch directories, {} records missing files",
            report.removed.len(),
            report.missing.len()
        );
    }
    Ok(report)
}
