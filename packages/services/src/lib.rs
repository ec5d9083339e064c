//! Services built on the job engine.
//!
//! - [`download`]: streams remote files to disk with resume and integrity checks
//! - [`install`]: resolves model sources, downloads and probes them, and
//!   registers the result in the model record store
//! - [`session`]: validates generation graphs, fans batches out into queue
//!   items and executes their nodes in dependency order

pub mod download;
pub mod hashing;
pub mod install;
pub mod session;

pub use download::{
    DownloadConfig, DownloadExecutor, DownloadJob, DownloadQueueService, DownloadRequest,
    DownloadResult, DownloadedFile, FetchResponse, HttpTransport, RemoteSource, TransferError,
    Transport,
};
pub use install::{
    API_MODELS, ApiModel, InstallConfig, InstallError, InstallJob, InstallRequest, InstallResult,
    ModelInstallService, ProbeError, ResolvedSource, ScanReport,
};
pub use session::{
    GraphEngine, GraphError, InvocationContext, InvocationError, MAX_RUNS, SessionError,
    SessionExecutor, SessionQueue, SessionQueueConfig,
};
