//! Byte transports used by the download executor.

use std::pin::Pin;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{Stream, StreamExt};
use reqwest::StatusCode;
use reqwest::header::RANGE;
use thiserror::Error;
use url::Url;

/// Response body as a stream of chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransferError>> + Send>>;

/// An opened transfer.
pub struct FetchResponse {
    /// True when the server honoured the requested offset and the body
    /// continues the partial file.
    pub resumed: bool,
    /// Size of the complete file, when the server announced it.
    pub total_bytes: Option<u64>,
    pub body: ByteStream,
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("resumed", &self.resumed)
            .field("total_bytes", &self.total_bytes)
            .finish_non_exhaustive()
    }
}

/// Opens byte streams for remote sources.
pub trait Transport: Send + Sync + 'static {
    /// Start fetching `url` from byte `offset`. An offset of zero requests
    /// the whole file; servers are free to ignore a non-zero offset.
    fn fetch<'a>(
        &'a self,
        url: &'a Url,
        offset: u64,
        auth: Option<&'a str>,
    ) -> BoxFuture<'a, Result<FetchResponse, TransferError>>;
}

/// HTTP(S) transport backed by reqwest.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Transport for HttpTransport {
    fn fetch<'a>(
        &'a self,
        url: &'a Url,
        offset: u64,
        auth: Option<&'a str>,
    ) -> BoxFuture<'a, Result<FetchResponse, TransferError>> {
        Box::pin(async move {
            let mut request = self.client.get(url.clone());
            if offset > 0 {
                request = request.header(RANGE, format!("bytes={offset}-"));
            }
            if let Some(token) = auth {
                request = request.bearer_auth(token);
            }

            let response = request.send().await?;
            let status = response.status();
            if status == StatusCode::RANGE_NOT_SATISFIABLE {
                return Err(TransferError::RangeNotSatisfiable(url.to_string()));
            }
            if !status.is_success() {
                return Err(TransferError::Status {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }

            let resumed = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
            let total_bytes = response
                .content_length()
                .map(|length| if resumed { length + offset } else { length });
            let body = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(TransferError::from))
                .boxed();

            Ok(FetchResponse {
                resumed,
                total_bytes,
                body,
            })
        })
    }
}

/// Transfer errors.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Requested range not satisfiable for {0}")]
    RangeNotSatisfiable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Integrity check failed for {path}: expected sha256 {expected}, got {actual}")]
    Integrity {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Invalid download request: {0}")]
    InvalidRequest(String),

    #[error("Stream error: {0}")]
    Stream(String),
}
