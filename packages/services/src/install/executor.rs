use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use actors::{ExecFuture, JobContext, JobExecutor};
use chrono::Utc;
use conductor_core::{
    BaseModelType, ErrorKind, Event, Job, JobError, JobId, JobState, ModelConfig, ModelFormat,
    ModelSourceType, ModelType,
};
use db::DbError;
use db::repositories::ModelRecordRepository;
use url::Url;

use super::probe::{ProbedModel, probe_path};
use super::source::{ResolvedSource, api_model, resolve};
use super::{InstallRequest, InstallResult};
use crate::download::{DownloadQueueService, DownloadRequest, RemoteSource};

/// Prefix of the scratch directories URL installs download into.
pub const TMP_INSTALL_PREFIX: &str = "tmpinstall_";

/// State shared by the install workers.
pub(super) struct Installer {
    pub records: ModelRecordRepository,
    pub downloads: DownloadQueueService,
    pub models_dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// The install job that last reported each key as installed.
    owners: Mutex<HashMap<String, JobId>>,
}

fn guarded<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Installer {
    pub fn new(
        records: ModelRecordRepository,
        downloads: DownloadQueueService,
        models_dir: PathBuf,
    ) -> Self {
        Self {
            records,
            downloads,
            models_dir,
            locks: Mutex::new(HashMap::new()),
            owners: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        guarded(&self.locks).entry(key.to_string()).or_default().clone()
    }

    /// Only called with the key's install lock held.
    fn claim(&self, key: &str, job_id: JobId) {
        guarded(&self.owners).insert(key.to_string(), job_id);
    }

    /// Undo a cancelled install that registered `key`, unless a later
    /// install has reported the record since.
    async fn rollback(&self, job_id: JobId, key: &str, placed: bool) -> Result<(), JobError> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        let owner = guarded(&self.owners).get(key).copied();
        if owner != Some(job_id) {
            tracing::info!("Keeping {}: install {:?} reported it after {}", key, owner, job_id);
            return Ok(());
        }

        self.unregister(key, placed).await?;
        guarded(&self.owners).remove(key);
        tracing::info!("Rolled back cancelled install of {}", key);
        Ok(())
    }

    async fn unregister(&self, key: &str, placed: bool) -> Result<(), JobError> {
        match self.records.delete(key).await {
            Ok(_) | Err(DbError::NotFound(_)) => {}
            Err(e) => return Err(registration(e)),
        }
        if placed {
            remove_dir(&self.models_dir.join(key)).await;
        }
        Ok(())
    }

    async fn install(
        &self,
        job_id: JobId,
        request: InstallRequest,
        ctx: &JobContext,
    ) -> Result<InstallResult, JobError> {
        let resolved = resolve(&request.source)
            .await
            .map_err(|e| JobError::from_error(ErrorKind::Resolution, &e))?;
        let key = resolved.key();
        let source_type = resolved.source_type();

        let lock = self.lock_for(&key);
        let _guard = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(JobError::Cancelled),
            guard = lock.lock() => guard,
        };

        if let Some(existing) = self.records.find(&key).await.map_err(registration)? {
            tracing::info!("{} is already installed as {}", request.source, key);
            self.claim(&key, job_id);
            return Ok(InstallResult::existing(existing, source_type));
        }
        ctx.check_cancelled()?;

        let (mut config, download_job, placed) = match &resolved {
            ResolvedSource::Api { slug } => (api_config(&key, &request.source, slug), None, None),
            ResolvedSource::Local { path } => {
                let probed = probe_path(path)
                    .await
                    .map_err(|e| JobError::from_error(ErrorKind::Resolution, &e))?;
                let config = disk_config(&key, &request.source, source_type, path, probed);
                (config, None, None)
            }
            ResolvedSource::Url { url } => {
                let (path, download_id) = self.fetch(job_id, url, &key, ctx).await?;
                let placed = self.models_dir.join(&key);
                let probed = match probe_path(&path).await {
                    Ok(probed) => probed,
                    Err(e) => {
                        remove_dir(&placed).await;
                        return Err(JobError::from_error(ErrorKind::Resolution, &e));
                    }
                };
                (
                    disk_config(&key, &request.source, source_type, &path, probed),
                    Some(download_id),
                    Some(placed),
                )
            }
        };
        if !request.overrides.is_empty() {
            config.apply(&request.overrides);
        }

        if ctx.is_cancelled() {
            if let Some(dir) = &placed {
                remove_dir(dir).await;
            }
            return Err(JobError::Cancelled);
        }

        match self.records.add(&config).await {
            Ok(saved) => {
                // Last chance to cancel while no other install can see the record.
                if ctx.is_cancelled() {
                    self.unregister(&key, placed.is_some()).await?;
                    return Err(JobError::Cancelled);
                }
                self.claim(&key, job_id);
                tracing::info!("Installed {} ({}) as {}", saved.name, saved.source_type, saved.key);
                Ok(InstallResult {
                    config_out: saved,
                    source_type,
                    download_job,
                    already_installed: false,
                })
            }
            Err(DbError::Duplicate(_)) => {
                let existing = self.records.get(&key).await.map_err(registration)?;
                self.claim(&key, job_id);
                Ok(InstallResult::existing(existing, source_type))
            }
            Err(e) => {
                if let Some(dir) = &placed {
                    remove_dir(dir).await;
                }
                Err(registration(e))
            }
        }
    }

    /// Download `url` into a scratch directory, then move it to
    /// `<models_dir>/<key>`. Returns the installed path and the download job.
    async fn fetch(
        &self,
        job_id: JobId,
        url: &Url,
        key: &str,
        ctx: &JobContext,
    ) -> Result<(PathBuf, JobId), JobError> {
        let scratch = self.models_dir.join(format!("{TMP_INSTALL_PREFIX}{job_id}"));
        let mut progress = ctx.bus().subscribe("download.progress");

        let request = DownloadRequest::new(vec![RemoteSource::new(url.clone())], scratch.clone());
        let download = self
            .downloads
            .download(request)
            .await
            .map_err(|e| JobError::from_error(ErrorKind::Transfer, &e))?;
        tracing::debug!("Install {} waits on download {}", job_id, download.id);

        let finished = {
            let wait = self.downloads.wait_for_job(download.id, None);
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        if let Err(e) = self.downloads.cancel(download.id).await {
                            tracing::warn!("Failed to cancel download {}: {}", download.id, e);
                        }
                        let _ = (&mut wait).await;
                        remove_dir(&scratch).await;
                        return Err(JobError::Cancelled);
                    }
                    Some(event) = progress.recv() => mirror_progress(&event, download.id, ctx),
                    finished = &mut wait => break finished,
                }
            }
        };
        // Progress published just before completion may still be buffered.
        while let Some(event) = progress.try_recv() {
            mirror_progress(&event, download.id, ctx);
        }

        let finished = finished.map_err(|e| JobError::from_error(ErrorKind::Transfer, &e))?;
        let files = match (finished.state(), finished.result()) {
            (JobState::Completed, Some(result)) => result.files.clone(),
            (JobState::Cancelled, _) => {
                remove_dir(&scratch).await;
                return Err(JobError::Cancelled);
            }
            _ => {
                remove_dir(&scratch).await;
                let reason = finished.error().unwrap_or("download did not complete");
                let message = format!("Download {} failed: {reason}", download.id);
                return Err(JobError::new(ErrorKind::Transfer, message));
            }
        };

        let destination = self.models_dir.join(key);
        remove_dir(&destination).await;
        tokio::fs::rename(&scratch, &destination)
            .await
            .map_err(|e| JobError::from_error(ErrorKind::Internal, &e))?;

        // A single file is the model itself; several files form a model directory.
        let path = match files.as_slice() {
            [file] => match file.path.file_name() {
                Some(name) => destination.join(name),
                None => destination.clone(),
            },
            _ => destination.clone(),
        };
        Ok((path, download.id))
    }
}

fn mirror_progress(event: &Event, download_id: JobId, ctx: &JobContext) {
    if event.job_id != Some(download_id) {
        return;
    }
    let bytes = event.payload.get("bytes").and_then(|v| v.as_u64()).unwrap_or(0);
    let total = event.payload.get("total_bytes").and_then(|v| v.as_u64());
    ctx.report_progress(bytes, total);
}

fn registration(error: DbError) -> JobError {
    JobError::from_error(ErrorKind::Registration, &error)
}

fn api_config(key: &str, source: &str, slug: &str) -> ModelConfig {
    let now = Utc::now();
    let known = api_model(slug);
    ModelConfig {
        key: key.to_string(),
        hash: None,
        name: known.map(|m| m.name.to_string()).unwrap_or_else(|| slug.to_string()),
        description: known.map(|m| m.description.to_string()),
        base: BaseModelType::Any,
        model_type: ModelType::Main,
        format: ModelFormat::Api,
        source: source.to_string(),
        source_type: ModelSourceType::Api,
        path: None,
        file_size: None,
        created_at: now,
        updated_at: now,
    }
}

fn disk_config(
    key: &str,
    source: &str,
    source_type: ModelSourceType,
    path: &Path,
    probed: ProbedModel,
) -> ModelConfig {
    let now = Utc::now();
    ModelConfig {
        key: key.to_string(),
        hash: Some(probed.hash),
        name: probed.name,
        description: None,
        base: probed.base,
        model_type: probed.model_type,
        format: probed.format,
        source: source.to_string(),
        source_type,
        path: Some(path.display().to_string()),
        file_size: Some(probed.file_size),
        created_at: now,
        updated_at: now,
    }
}

pub(super) async fn remove_dir(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => tracing::debug!("Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove {}: {}", path.display(), e),
    }
}

/// Executes install jobs.
pub struct InstallExecutor {
    installer: Arc<Installer>,
}

impl InstallExecutor {
    pub(super) fn new(installer: Arc<Installer>) -> Self {
        Self { installer }
    }
}

impl JobExecutor for InstallExecutor {
    type Payload = InstallRequest;
    type Output = InstallResult;

    fn kind(&self) -> &str {
        "install"
    }

    fn execute(
        &self,
        job: Job<InstallRequest, InstallResult>,
        ctx: JobContext,
    ) -> ExecFuture<InstallResult> {
        let installer = self.installer.clone();
        Box::pin(async move { installer.install(job.id, job.payload, &ctx).await })
    }

    fn rollback(&self, job_id: JobId, output: InstallResult) -> Option<ExecFuture<()>> {
        if output.already_installed {
            return None;
        }
        let installer = self.installer.clone();
        Some(Box::pin(async move {
            let placed = output.download_job.is_some();
            installer.rollback(job_id, &output.config_out.key, placed).await
        }))
    }
}
