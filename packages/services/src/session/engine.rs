//! Seam between the session queue and whatever actually runs nodes.

use actors::JobContext;
use conductor_core::{BatchId, InvocationOutput, JobId, Node, SessionId};
use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use thiserror::Error;

/// Where an invocation runs.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub queue_id: String,
    pub item_id: JobId,
    pub batch_id: Option<BatchId>,
    pub session_id: SessionId,
    pub job: JobContext,
}

impl InvocationContext {
    pub fn is_cancelled(&self) -> bool {
        self.job.is_cancelled()
    }
}

/// Runs individual graph nodes.
pub trait GraphEngine: Send + Sync + 'static {
    /// Whether nodes of this type can be invoked.
    fn is_executable(&self, node_type: &str) -> bool;

    /// Invoke one node with its resolved inputs (literal fields merged
    /// with values carried along incoming edges).
    fn invoke<'a>(
        &'a self,
        node: &'a Node,
        inputs: Map<String, Value>,
        ctx: &'a InvocationContext,
    ) -> BoxFuture<'a, Result<InvocationOutput, InvocationError>>;
}

#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Invalid input {field}: {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("Invocation failed: {0}")]
    Failed(String),
}
