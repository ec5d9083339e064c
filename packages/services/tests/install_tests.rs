#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use actors::EventBus;
use chrono::Utc;
use common::{Behavior, FakeTransport, WAIT};
use conductor_core::{
    BaseModelType, ErrorKind, JobFilter, JobProgress, JobState, ModelConfig, ModelFormat,
    ModelRecordChanges, ModelRecordFilter, ModelSourceType, ModelType,
};
use db::DbConfig;
use db::repositories::ModelRecordRepository;
use services::hashing::sha256_hex;
use services::{
    DownloadConfig, DownloadQueueService, InstallConfig, ModelInstallService, ResolvedSource,
};
use tempfile::TempDir;

const WEIGHTS: &[u8] = b"pretend these are safetensors weights";

struct Harness {
    dir: TempDir,
    transport: Arc<FakeTransport>,
    records: ModelRecordRepository,
    downloads: DownloadQueueService,
    installs: ModelInstallService,
    bus: EventBus,
}

impl Harness {
    async fn start() -> Result<Self, Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let db = db::init(&DbConfig::memory()).await?;
        Self::start_with(dir, ModelRecordRepository::new(db)).await
    }

    async fn start_with(
        dir: TempDir,
        records: ModelRecordRepository,
    ) -> Result<Self, Box<dyn Error>> {
        let bus = EventBus::default();
        let transport = FakeTransport::new();
        let downloads = DownloadQueueService::start(
            DownloadConfig::default().with_progress_interval(Duration::ZERO),
            transport.clone(),
            bus.clone(),
        )
        .await?;
        let installs = ModelInstallService::start(
            InstallConfig::new(dir.path().join("models")),
            records.clone(),
            downloads.clone(),
            bus.clone(),
            None,
        )
        .await?;

        Ok(Self {
            dir,
            transport,
            records,
            downloads,
            installs,
            bus,
        })
    }

    async fn stop(self) -> Result<(), Box<dyn Error>> {
        self.installs.stop().await?;
        self.downloads.stop().await?;
        Ok(())
    }
}

#[tokio::test]
async fn api_source_installs_without_download() -> Result<(), Box<dyn Error>> {
    let h = Harness::start().await?;

    let job = h.installs.heuristic_import("invokeai/some-api-model", None).await?;
    let done = h.installs.wait_for_job(job.id, WAIT).await?;

    assert_eq!(done.state(), JobState::Completed);
    let result = done.result().ok_or("missing result")?;
    assert_eq!(result.source_type, ModelSourceType::Api);
    assert_eq!(result.config_out.format, ModelFormat::Api);
    assert_eq!(result.config_out.name, "some-api-model");
    assert!(result.config_out.path.is_none());
    assert!(result.download_job.is_none());
    assert!(!result.already_installed);

    assert!(h.downloads.list_jobs(JobFilter::all()).await?.is_empty());
    assert!(h.transport.requests().is_empty());

    let known = h.installs.heuristic_import("invokeai/gemini-2-5-flash", None).await?;
    let known = h.installs.wait_for_job(known.id, WAIT).await?;
    assert_eq!(
        known.result().map(|r| r.config_out.name.as_str()),
        Some("Gemini 2.5 Flash Image Gen")
    );

    h.stop().await
}

#[tokio::test]
async fn url_source_is_downloaded_probed_and_registered() -> Result<(), Box<dyn Error>> {
    let h = Harness::start().await?;
    h.transport
        .serve("https://models.example/juggernaut-sdxl.safetensors", WEIGHTS);

    let job = h
        .installs
        .heuristic_import("https://models.example/juggernaut-sdxl.safetensors", None)
        .await?;
    let done = h.installs.wait_for_job(job.id, WAIT).await?;

    assert_eq!(done.state(), JobState::Completed, "{:?}", done.error());
    let result = done.result().ok_or("missing result")?;
    let config = &result.config_out;
    assert!(result.download_job.is_some());
    assert_eq!(config.format, ModelFormat::Checkpoint);
    assert_eq!(config.base, BaseModelType::StableDiffusionXl);
    assert_eq!(config.model_type, ModelType::Main);
    assert_eq!(config.hash.as_deref(), Some(sha256_hex(WEIGHTS).as_str()));
    assert_eq!(config.file_size, Some(WEIGHTS.len() as u64));

    let expected_key = ResolvedSource::Url {
        url: url::Url::parse("https://models.example/juggernaut-sdxl.safetensors")?,
    }
    .key();
    assert_eq!(config.key, expected_key);

    let path = std::path::PathBuf::from(config.path.as_deref().ok_or("missing path")?);
    assert!(path.starts_with(h.installs.models_dir().join(&config.key)));
    assert_eq!(tokio::fs::read(&path).await?, WEIGHTS);
    let stored = h.records.get(&config.key).await?;
    assert_eq!(stored.hash, config.hash);
    assert_eq!(stored.source, config.source);

    // Download progress is mirrored onto the install job.
    assert_eq!(
        done.progress,
        Some(JobProgress {
            bytes: WEIGHTS.len() as u64,
            total_bytes: Some(WEIGHTS.len() as u64),
        })
    );

    // The scratch directory is gone.
    let mut entries = tokio::fs::read_dir(h.installs.models_dir()).await?;
    while let Some(entry) = entries.next_entry().await? {
        assert!(!entry.file_name().to_string_lossy().starts_with("tmpinstall_"));
    }

    h.stop().await
}

#[tokio::test]
async fn local_source_registers_in_place_and_uninstall_keeps_it() -> Result<(), Box<dyn Error>> {
    let h = Harness::start().await?;
    let local = h.dir.path().join("my-lora.safetensors");
    tokio::fs::write(&local, WEIGHTS).await?;

    let job = h
        .installs
        .heuristic_import(&local.display().to_string(), None)
        .await?;
    let done = h.installs.wait_for_job(job.id, WAIT).await?;
    let result = done.result().ok_or("missing result")?;

    assert_eq!(result.source_type, ModelSourceType::Local);
    assert_eq!(result.config_out.model_type, ModelType::Lora);
    let canonical = tokio::fs::canonicalize(&local).await?;
    assert_eq!(result.config_out.path.as_deref(), Some(canonical.display().to_string().as_str()));

    h.installs.uninstall(&result.config_out.key).await?;
    assert!(h.records.find(&result.config_out.key).await?.is_none());
    assert!(local.exists());

    h.stop().await
}

#[tokio::test]
async fn concurrent_duplicate_installs_yield_one_record() -> Result<(), Box<dyn Error>> {
    let h = Harness::start().await?;
    let source = "https://models.example/flux-dev.safetensors";
    h.transport.serve(source, WEIGHTS);

    let first = h.installs.heuristic_import(source, None).await?;
    let second = h.installs.heuristic_import(source, None).await?;
    let (first, second) = tokio::join!(
        h.installs.wait_for_job(first.id, WAIT),
        h.installs.wait_for_job(second.id, WAIT)
    );
    let (first, second) = (first?, second?);

    assert_eq!(first.state(), JobState::Completed);
    assert_eq!(second.state(), JobState::Completed);
    let already: Vec<bool> = [&first, &second]
        .iter()
        .filter_map(|job| job.result().map(|r| r.already_installed))
        .collect();
    assert_eq!(already.iter().filter(|installed| !**installed).count(), 1);
    assert_eq!(already.iter().filter(|installed| **installed).count(), 1);

    assert_eq!(h.records.list(&ModelRecordFilter::default()).await?.len(), 1);
    assert_eq!(h.transport.requests().len(), 1);

    h.stop().await
}

#[tokio::test]
async fn existing_record_short_circuits_and_overrides_apply() -> Result<(), Box<dyn Error>> {
    let h = Harness::start().await?;

    let overrides = ModelRecordChanges::default().with_name("My Gemini");
    let job = h
        .installs
        .heuristic_import("invokeai/gemini-3-pro", Some(overrides))
        .await?;
    let done = h.installs.wait_for_job(job.id, WAIT).await?;
    assert_eq!(done.result().map(|r| r.config_out.name.as_str()), Some("My Gemini"));

    let again = h.installs.heuristic_import("invokeai/gemini-3-pro", None).await?;
    let again = h.installs.wait_for_job(again.id, WAIT).await?;
    let result = again.result().ok_or("missing result")?;
    assert!(result.already_installed);
    assert_eq!(result.config_out.name, "My Gemini");

    h.stop().await
}

#[tokio::test]
async fn unresolvable_source_errors_with_resolution_kind() -> Result<(), Box<dyn Error>> {
    let h = Harness::start().await?;

    let job = h.installs.heuristic_import("definitely not a model", None).await?;
    let done = h.installs.wait_for_job(job.id, WAIT).await?;

    assert_eq!(done.state(), JobState::Errored);
    assert_eq!(done.error_type(), Some(ErrorKind::Resolution));
    assert!(h.records.list(&ModelRecordFilter::default()).await?.is_empty());

    h.stop().await
}

#[tokio::test]
async fn failed_download_errors_with_transfer_kind() -> Result<(), Box<dyn Error>> {
    let h = Harness::start().await?;

    let job = h
        .installs
        .heuristic_import("https://models.example/missing.safetensors", None)
        .await?;
    let done = h.installs.wait_for_job(job.id, WAIT).await?;

    assert_eq!(done.state(), JobState::Errored);
    assert_eq!(done.error_type(), Some(ErrorKind::Transfer));
    assert!(h.records.list(&ModelRecordFilter::default()).await?.is_empty());

    h.stop().await
}

#[tokio::test]
async fn registration_failure_after_download_errors_and_cleans_up() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let db = db::init(&DbConfig::memory()).await?;
    // Every model write is refused by the store.
    db.query("DEFINE FIELD source ON model ASSERT $value = 'nothing'")
        .await?
        .check()?;
    let h = Harness::start_with(dir, ModelRecordRepository::new(db)).await?;
    let url = h
        .transport
        .serve("https://models.example/refused.safetensors", WEIGHTS);

    let job = h.installs.heuristic_import(url.as_str(), None).await?;
    let done = h.installs.wait_for_job(job.id, WAIT).await?;

    assert_eq!(done.state(), JobState::Errored);
    assert_eq!(done.error_type(), Some(ErrorKind::Registration));
    assert!(done.result().is_none());
    assert_eq!(h.transport.requests(), vec![(url.to_string(), 0)]);

    let key = ResolvedSource::Url { url }.key();
    assert!(!tokio::fs::try_exists(h.installs.models_dir().join(&key)).await?);
    assert!(h.records.find(&key).await?.is_none());

    let mut entries = tokio::fs::read_dir(h.installs.models_dir()).await?;
    assert!(entries.next_entry().await?.is_none());

    h.stop().await
}

#[tokio::test]
async fn cancelled_install_cancels_download_and_registers_nothing() -> Result<(), Box<dyn Error>> {
    let h = Harness::start().await?;
    let url = h
        .transport
        .serve("https://models.example/slow.safetensors", WEIGHTS);
    h.transport.misbehave(&url, Behavior::Stall(1));
    let mut downloading = h.bus.subscribe("download.running");

    let job = h.installs.heuristic_import(url.as_str(), None).await?;
    tokio::time::timeout(Duration::from_secs(10), downloading.recv())
        .await?
        .ok_or("bus closed")?;

    assert!(h.installs.cancel_job(job.id).await?);
    let done = h.installs.wait_for_job(job.id, WAIT).await?;
    assert_eq!(done.state(), JobState::Cancelled);

    let downloads = h.downloads.list_jobs(JobFilter::all()).await?;
    assert_eq!(downloads.len(), 1);
    let download = h.downloads.wait_for_job(downloads[0].id, WAIT).await?;
    assert_eq!(download.state(), JobState::Cancelled);

    assert!(h.records.list(&ModelRecordFilter::default()).await?.is_empty());
    let mut entries = tokio::fs::read_dir(h.installs.models_dir()).await?;
    assert!(entries.next_entry().await?.is_none());

    h.stop().await
}

#[tokio::test]
async fn uninstall_removes_placed_files() -> Result<(), Box<dyn Error>> {
    let h = Harness::start().await?;
    let source = "https://models.example/detail-vae.safetensors";
    h.transport.serve(source, WEIGHTS);

    let job = h.installs.heuristic_import(source, None).await?;
    let done = h.installs.wait_for_job(job.id, WAIT).await?;
    let config = done.result().ok_or("missing result")?.config_out.clone();
    assert_eq!(config.model_type, ModelType::Vae);

    let removed = h.installs.uninstall(&config.key).await?;
    assert_eq!(removed.key, config.key);
    assert!(!h.installs.models_dir().join(&config.key).exists());
    assert!(h.installs.uninstall(&config.key).await.is_err());

    h.stop().await
}

#[tokio::test]
async fn wait_for_installs_returns_finished_jobs() -> Result<(), Box<dyn Error>> {
    let h = Harness::start().await?;
    h.installs.heuristic_import("invokeai/gemini-2-5-flash", None).await?;
    h.installs.heuristic_import("invokeai/gemini-3-pro", None).await?;

    let jobs = h.installs.wait_for_installs(WAIT).await?;
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|job| job.state() == JobState::Completed));

    assert_eq!(h.installs.prune_jobs().await?, 2);
    assert!(h.installs.list_jobs().await?.is_empty());

    h.stop().await
}

#[tokio::test]
async fn startup_scan_cleans_scratch_and_reports_missing_files() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let models = dir.path().join("models");
    tokio::fs::create_dir_all(models.join("tmpinstall_leftover")).await?;
    tokio::fs::write(models.join("tmpinstall_leftover/partial.bin.part"), b"xx").await?;

    let db = db::init(&DbConfig::memory()).await?;
    let records = ModelRecordRepository::new(db);
    let now = Utc::now();
    records
        .add(&ModelConfig {
            key: "gone".to_string(),
            hash: None,
            name: "Gone".to_string(),
            description: None,
            base: BaseModelType::StableDiffusion1,
            model_type: ModelType::Main,
            format: ModelFormat::Checkpoint,
            source: "/nowhere/gone.safetensors".to_string(),
            source_type: ModelSourceType::Local,
            path: Some("/nowhere/gone.safetensors".to_string()),
            file_size: None,
            created_at: now,
            updated_at: now,
        })
        .await?;

    let h = Harness::start_with(dir, records).await?;
    let report = h.installs.scan_report();
    assert_eq!(report.removed.len(), 1);
    assert_eq!(report.missing, vec!["gone".to_string()]);
    assert!(!h.installs.models_dir().join("tmpinstall_leftover").exists());

    h.stop().await
}
