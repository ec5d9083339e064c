use std::path::{Path, PathBuf};
use std::sync::Arc;

use actors::{ExecFuture, JobContext, JobExecutor};
use conductor_core::{ErrorKind, Job, JobError};
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

use super::transport::{FetchResponse, TransferError, Transport};
use super::{DownloadRequest, DownloadResult, DownloadedFile, RemoteSource, part_path};

/// Executes download jobs against a [`Transport`].
pub struct DownloadExecutor {
    transport: Arc<dyn Transport>,
}

impl DownloadExecutor {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

impl JobExecutor for DownloadExecutor {
    type Payload = DownloadRequest;
    type Output = DownloadResult;

    fn kind(&self) -> &str {
        "download"
    }

    fn execute(
        &self,
        job: Job<DownloadRequest, DownloadResult>,
        ctx: JobContext,
    ) -> ExecFuture<DownloadResult> {
        let transport = self.transport.clone();
        Box::pin(async move {
            let request = job.payload;
            let mut completed = Vec::new();

            let outcome = tokio::select! {
                biased;
                _ = ctx.cancelled() => Err(None),
                result = fetch_all(transport.as_ref(), &request, &ctx, &mut completed) => {
                    result.map_err(Some)
                }
            };

            // Cancellation that lands after the last byte still discards the files.
            if ctx.is_cancelled() {
                discard(&request, &completed).await;
                return Err(JobError::Cancelled);
            }

            match outcome {
                Ok(result) => Ok(result),
                Err(Some(error)) => Err(JobError::from_error(ErrorKind::Transfer, &error)),
                Err(None) => Err(JobError::Cancelled),
            }
        })
    }
}

async fn fetch_all(
    transport: &dyn Transport,
    request: &DownloadRequest,
    ctx: &JobContext,
    completed: &mut Vec<PathBuf>,
) -> Result<DownloadResult, TransferError> {
    let targets = request.targets()?;
    fs::create_dir_all(&request.destination).await?;

    let mut files = Vec::with_capacity(targets.len());
    let mut done = 0u64;
    for (source, target) in targets {
        let file = fetch_one(transport, source, &target, request.auth.as_deref(), ctx, done).await?;
        completed.push(file.path.clone());
        done += file.bytes;
        files.push(file);
    }

    ctx.report_progress(done, Some(done));
    tracing::info!("Downloaded {} file(s), {} bytes", files.len(), done);
    Ok(DownloadResult {
        files,
        total_bytes: done,
    })
}

/// Fetch one source into `target`, resuming from an existing partial file.
async fn fetch_one(
    transport: &dyn Transport,
    source: &RemoteSource,
    target: &Path,
    auth: Option<&str>,
    ctx: &JobContext,
    base: u64,
) -> Result<DownloadedFile, TransferError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }
    let part = part_path(target);

    let mut offset = match fs::metadata(&part).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };

    let response = match transport.fetch(&source.url, offset, auth).await {
        Err(TransferError::RangeNotSatisfiable(url)) if offset > 0 => {
            tracing::debug!("Range rejected for {}, restarting from zero", url);
            fs::remove_file(&part).await?;
            offset = 0;
            transport.fetch(&source.url, 0, auth).await?
        }
        other => other?,
    };
    let FetchResponse {
        resumed,
        total_bytes,
        mut body,
    } = response;

    let mut hasher = Sha256::new();
    let file = if resumed {
        crate::hashing::update_from_file(&mut hasher, &part).await?;
        tracing::debug!("Resuming {} at byte {}", source.url, offset);
        OpenOptions::new().append(true).open(&part).await?
    } else {
        if offset > 0 {
            tracing::debug!("Server ignored range for {}, restarting", source.url);
        }
        offset = 0;
        fs::File::create(&part).await?
    };
    let mut writer = BufWriter::new(file);

    let mut written = offset;
    let streamed = async {
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            writer.write_all(&chunk).await?;
            hasher.update(&chunk);
            written += chunk.len() as u64;
            // The job-wide final report is sent once every file is stored.
            if total_bytes != Some(written) {
                ctx.report_progress(base + written, total_bytes.map(|total| base + total));
            }
        }
        Ok::<(), TransferError>(())
    }
    .await;
    // Keep what arrived so a later attempt can resume from it.
    writer.flush().await?;
    drop(writer);
    streamed?;

    let digest = format!("{:x}", hasher.finalize());
    if let Some(expected) = &source.sha256
        && !expected.eq_ignore_ascii_case(&digest)
    {
        // A finished but corrupt file cannot be resumed.
        fs::remove_file(&part).await?;
        return Err(TransferError::Integrity {
            path: target.display().to_string(),
            expected: expected.clone(),
            actual: digest,
        });
    }

    fs::rename(&part, target).await?;
    tracing::debug!("Stored {} ({} bytes)", target.display(), written);

    Ok(DownloadedFile {
        path: target.to_path_buf(),
        bytes: written,
        sha256: digest,
    })
}

/// Remove partial files of every source and the files this run completed.
async fn discard(request: &DownloadRequest, completed: &[PathBuf]) {
    let parts = request
        .targets()
        .map(|targets| targets.into_iter().map(|(_, target)| part_path(&target)).collect())
        .unwrap_or_else(|_| Vec::new());

    for path in parts.iter().chain(completed) {
        match fs::remove_file(path).await {
            Ok(()) => tracing::debug!("Removed {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
}
