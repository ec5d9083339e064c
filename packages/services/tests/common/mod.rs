#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use conductor_core::{InvocationOutput, Node};
use futures_util::future::BoxFuture;
use futures_util::{StreamExt, stream};
use serde_json::{Map, Value};
use services::download::ByteStream;
use services::{
    FetchResponse, GraphEngine, InvocationContext, InvocationError, TransferError, Transport,
};
use url::Url;

pub const CHUNK: usize = 4;
pub const WAIT: Option<Duration> = Some(Duration::from_secs(10));

/// How the next request for a URL misbehaves.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Send `n` chunks, then drop the connection.
    FailAfter(usize),
    /// Send `n` chunks, then hang until the transfer is abandoned.
    Stall(usize),
}

/// In-memory transport serving fixed files in small chunks.
pub struct FakeTransport {
    files: Mutex<HashMap<String, Vec<u8>>>,
    behaviors: Mutex<HashMap<String, Behavior>>,
    honor_range: AtomicBool,
    requests: Mutex<Vec<(String, u64)>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            files: Mutex::new(HashMap::new()),
            behaviors: Mutex::new(HashMap::new()),
            honor_range: AtomicBool::new(true),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn serve(&self, url: &str, data: &[u8]) -> Url {
        let url = Url::parse(url).unwrap();
        self.files.lock().unwrap().insert(url.to_string(), data.to_vec());
        url
    }

    /// Applies to the next request for `url` only.
    pub fn misbehave(&self, url: &Url, behavior: Behavior) {
        self.behaviors.lock().unwrap().insert(url.to_string(), behavior);
    }

    pub fn ignore_ranges(&self) {
        self.honor_range.store(false, Ordering::SeqCst);
    }

    /// Every request as `(url, offset)`.
    pub fn requests(&self) -> Vec<(String, u64)> {
        self.requests.lock().unwrap().clone()
    }
}

impl Transport for FakeTransport {
    fn fetch<'a>(
        &'a self,
        url: &'a Url,
        offset: u64,
        _auth: Option<&'a str>,
    ) -> BoxFuture<'a, Result<FetchResponse, TransferError>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push((url.to_string(), offset));
            let data = self
                .files
                .lock()
                .unwrap()
                .get(url.as_str())
                .cloned()
                .ok_or_else(|| TransferError::Status {
                    status: 404,
                    url: url.to_string(),
                })?;

            let resumed = offset > 0 && self.honor_range.load(Ordering::SeqCst);
            let start = if resumed { offset as usize } else { 0 };
            if start > data.len() {
                return Err(TransferError::RangeNotSatisfiable(url.to_string()));
            }

            let chunks: Vec<Result<Bytes, TransferError>> = data[start..]
                .chunks(CHUNK)
                .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
                .collect();
            let behavior = self.behaviors.lock().unwrap().remove(url.as_str());
            let body: ByteStream = match behavior {
                None => stream::iter(chunks).boxed(),
                Some(Behavior::FailAfter(n)) => stream::iter(chunks.into_iter().take(n))
                    .chain(stream::once(async {
                        Err(TransferError::Stream("connection reset".to_string()))
                    }))
                    .boxed(),
                Some(Behavior::Stall(n)) => stream::iter(chunks.into_iter().take(n))
                    .chain(stream::pending())
                    .boxed(),
            };

            Ok(FetchResponse {
                resumed,
                total_bytes: Some(data.len() as u64),
                body,
            })
        })
    }
}

/// Engine with a handful of primitive node types.
///
/// - `add`: integer `a + b`
/// - `text`: echoes `value`
/// - `image`: a fixed 64x64 image
/// - `fail`: always fails
/// - `fail_once`: fails on its first invocation only
/// - `record`: appends its `label` input to [`TestEngine::log`]
/// - `wait`: runs until the item is cancelled
#[derive(Default)]
pub struct TestEngine {
    log: Mutex<Vec<String>>,
    failed_once: AtomicBool,
}

impl TestEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl GraphEngine for TestEngine {
    fn is_executable(&self, node_type: &str) -> bool {
        matches!(
            node_type,
            "add" | "text" | "image" | "fail" | "fail_once" | "record" | "wait"
        )
    }

    fn invoke<'a>(
        &'a self,
        node: &'a Node,
        inputs: Map<String, Value>,
        ctx: &'a InvocationContext,
    ) -> BoxFuture<'a, Result<InvocationOutput, InvocationError>> {
        Box::pin(async move {
            let int = |field: &str| inputs.get(field).and_then(Value::as_i64).unwrap_or(0);
            match node.node_type.as_str() {
                "add" => Ok(InvocationOutput::IntegerOutput {
                    value: int("a") + int("b"),
                }),
                "text" => Ok(InvocationOutput::StringOutput {
                    value: inputs
                        .get("value")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                }),
                "image" => Ok(InvocationOutput::image("generated.png", 64, 64)),
                "fail" => Err(InvocationError::Failed("boom".to_string())),
                "fail_once" => {
                    if self.failed_once.swap(true, Ordering::SeqCst) {
                        Ok(InvocationOutput::IntegerOutput { value: 1 })
                    } else {
                        Err(InvocationError::Failed("first run fails".to_string()))
                    }
                }
                "record" => {
                    let label = inputs
                        .get("label")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    self.log.lock().unwrap().push(label.clone());
                    Ok(InvocationOutput::StringOutput { value: label })
                }
                "wait" => {
                    ctx.job.cancelled().await;
                    Err(InvocationError::Failed("interrupted".to_string()))
                }
                other => Err(InvocationError::UnknownNodeType(other.to_string())),
            }
        })
    }
}

/// Poll `check` until it holds or ten seconds pass.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
