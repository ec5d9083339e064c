//! Service startup and shutdown.

use std::sync::Arc;
use std::time::Duration;

use actors::{EventBus, QueueError};
use db::repositories::{JobRepository, ModelRecordRepository};
use db::{Database, DbError};
use services::{
    DownloadConfig, DownloadQueueService, HttpTransport, InstallConfig, InstallError,
    ModelInstallService, SessionError, SessionQueue, SessionQueueConfig,
};
use thiserror::Error;

use crate::config::{AppConfig, ConfigError};
use crate::engine::PrimitiveEngine;

#[derive(Debug, Error)]
pub enum InitError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Install service error: {0}")]
    Install(#[from] InstallError),

    #[error("Session queue error: {0}")]
    Session(#[from] SessionError),
}

/// Every running service, sharing one event bus and one database.
#[derive(Clone)]
pub struct Services {
    pub bus: EventBus,
    pub db: Database,
    pub records: ModelRecordRepository,
    pub downloads: DownloadQueueService,
    pub installs: ModelInstallService,
    pub sessions: SessionQueue,
}

/// Connect the database, run migrations and start the queues.
///
/// This should be called once at startup; any error is fatal.
pub async fn init(config: &AppConfig) -> Result<Services, InitError> {
    tracing::info!("Initializing conductor...");

    let db = db::init(&config.db_config()).await?;
    let bus = EventBus::new(config.event_capacity);
    let records = ModelRecordRepository::new(db.clone());
    let journal = config.persist.then(|| JobRepository::new(db.clone()));

    let downloads = DownloadQueueService::start(
        DownloadConfig {
            workers: config.download_workers,
            progress_interval: Duration::from_millis(config.progress_interval_ms),
            max_queue_size: config.max_queue_size,
        },
        Arc::new(HttpTransport::default()),
        bus.clone(),
    )
    .await?;

    let installs = ModelInstallService::start(
        InstallConfig::new(&config.models_dir)
            .with_workers(config.install_workers)
            .with_persist(config.persist),
        records.clone(),
        downloads.clone(),
        bus.clone(),
        journal.clone(),
    )
    .await?;

    let sessions = SessionQueue::start(
        SessionQueueConfig::default()
            .with_workers(config.session_workers)
            .with_persist(config.persist)
            .with_max_queue_size(config.max_queue_size),
        Arc::new(PrimitiveEngine),
        bus.clone(),
        journal,
    )
    .await?;

    for source in &config.preload_models {
        let job = installs.heuristic_import(source, None).await?;
        tracing::info!("Preloading {} as install {}", source, job.id);
    }

    tracing::info!("Conductor initialized");
    Ok(Services {
        bus,
        db,
        records,
        downloads,
        installs,
        sessions,
    })
}

impl Services {
    /// Stop the queues, consumers before producers: sessions, installs,
    /// then the downloads installs depend on.
    pub async fn shutdown(&self) -> Result<(), InitError> {
        self.sessions.stop().await?;
        self.installs.stop().await?;
        self.downloads.stop().await?;
        tracing::info!("Conductor stopped");
        Ok(())
    }
}
