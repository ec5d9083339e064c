//! Generation graphs, batches and session queue views.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ulid::Ulid;

use crate::{BatchId, ErrorKind, Job, JobCounts, JobId, JobState};

/// Identifier of one graph execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Ulid);

impl SessionId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single invocation in a graph. Everything besides `id` and `type` is
/// an input field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(flatten)]
    pub inputs: Map<String, Value>,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            inputs: Map::new(),
        }
    }

    pub fn with_input(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(field.into(), value.into());
        self
    }
}

/// One end of an edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeConnection {
    pub node_id: String,
    pub field: String,
}

/// Copies `source.field` of one node's output into `destination.field` of
/// another node's input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub source: EdgeConnection,
    pub destination: EdgeConnection,
}

impl Edge {
    pub fn new(
        source_node: impl Into<String>,
        source_field: impl Into<String>,
        destination_node: impl Into<String>,
        destination_field: impl Into<String>,
    ) -> Self {
        Self {
            source: EdgeConnection {
                node_id: source_node.into(),
                field: source_field.into(),
            },
            destination: EdgeConnection {
                node_id: destination_node.into(),
                field: destination_field.into(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub nodes: BTreeMap<String, Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Graph {
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.insert(node.id.clone(), node);
        self
    }

    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }
}

fn default_runs() -> u32 {
    1
}

/// A graph plus the number of times to run it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    pub graph: Graph,
    #[serde(default = "default_runs")]
    pub runs: u32,
}

impl Batch {
    pub fn new(graph: Graph) -> Self {
        Self {
            origin: None,
            destination: None,
            graph,
            runs: 1,
        }
    }

    pub fn with_runs(mut self, runs: u32) -> Self {
        self.runs = runs;
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }
}

/// Payload of one session queue item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionPayload {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    pub graph: Graph,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageField {
    pub image_name: String,
}

/// Typed output of a single node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InvocationOutput {
    ImageOutput {
        image: ImageField,
        width: u32,
        height: u32,
    },
    StringOutput {
        value: String,
    },
    IntegerOutput {
        value: i64,
    },
    FloatOutput {
        value: f64,
    },
}

impl InvocationOutput {
    pub fn image(name: impl Into<String>, width: u32, height: u32) -> Self {
        InvocationOutput::ImageOutput {
            image: ImageField {
                image_name: name.into(),
            },
            width,
            height,
        }
    }

    /// Look up an output field by name, as used by edges.
    pub fn field(&self, name: &str) -> Option<Value> {
        match self {
            InvocationOutput::ImageOutput {
                image,
                width,
                height,
            } => match name {
                "image" => serde_json::to_value(image).ok(),
                "width" => Some(Value::from(*width)),
                "height" => Some(Value::from(*height)),
                _ => None,
            },
            InvocationOutput::StringOutput { value } => {
                (name == "value").then(|| Value::from(value.as_str()))
            }
            InvocationOutput::IntegerOutput { value } => {
                (name == "value").then(|| Value::from(*value))
            }
            InvocationOutput::FloatOutput { value } => {
                (name == "value").then(|| Value::from(*value))
            }
        }
    }
}

/// Result of a completed session item: node id to that node's output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionResults {
    #[serde(default)]
    pub results: BTreeMap<String, InvocationOutput>,
}

/// Session as exposed on a queue item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub graph: Graph,
    #[serde(default)]
    pub results: BTreeMap<String, InvocationOutput>,
}

/// Full per-item record returned by the session queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionQueueItem {
    pub item_id: JobId,
    pub queue_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,
    pub status: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    pub session: Session,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_traceback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_origin: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Job<SessionPayload, SessionResults>> for SessionQueueItem {
    fn from(job: Job<SessionPayload, SessionResults>) -> Self {
        let results = job
            .result()
            .map(|r| r.results.clone())
            .unwrap_or_default();
        Self {
            item_id: job.id,
            status: job.state(),
            error_type: job.error_type(),
            error_message: job.error().map(str::to_string),
            error_traceback: job.error_traceback().map(str::to_string),
            error_origin: job.error_origin().map(str::to_string),
            started_at: job.started_at(),
            completed_at: job.finished_at(),
            created_at: job.created_at,
            updated_at: job.updated_at,
            queue_id: job.queue_id,
            batch_id: job.batch_id,
            origin: job.payload.origin,
            destination: job.payload.destination,
            session: Session {
                id: job.payload.session_id,
                graph: job.payload.graph,
                results,
            },
        }
    }
}

/// Aggregate counts for one batch.
///
/// `pending + in_progress + completed + failed + cancelled == total`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStatus {
    pub queue_id: String,
    pub batch_id: BatchId,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
}

impl BatchStatus {
    pub fn from_counts(queue_id: impl Into<String>, batch_id: BatchId, counts: JobCounts) -> Self {
        Self {
            queue_id: queue_id.into(),
            batch_id,
            pending: counts.waiting,
            in_progress: counts.running,
            completed: counts.completed,
            failed: counts.errored,
            cancelled: counts.cancelled,
            total: counts.total(),
        }
    }
}

/// Aggregate counts for a whole session queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionQueueStatus {
    pub queue_id: String,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
}

impl SessionQueueStatus {
    pub fn from_counts(queue_id: impl Into<String>, counts: JobCounts) -> Self {
        Self {
            queue_id: queue_id.into(),
            pending: counts.waiting,
            in_progress: counts.running,
            completed: counts.completed,
            failed: counts.errored,
            cancelled: counts.cancelled,
            total: counts.total(),
        }
    }
}

/// Response to an `enqueue_batch` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueBatchResult {
    pub queue_id: String,
    pub batch_id: BatchId,
    pub item_ids: Vec<JobId>,
    pub requested: usize,
    pub enqueued: usize,
    pub prepend: bool,
}
