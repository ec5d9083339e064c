use std::collections::BTreeMap;
use std::sync::Arc;

use actors::{ExecFuture, JobContext, JobExecutor};
use conductor_core::{ErrorKind, Event, Job, JobError, SessionPayload, SessionResults};
use serde_json::json;

use super::engine::{GraphEngine, InvocationContext};
use super::graph::{collect_inputs, execution_order};

/// Runs one session item: every node of its graph in dependency order.
pub struct SessionExecutor {
    engine: Arc<dyn GraphEngine>,
}

impl SessionExecutor {
    pub fn new(engine: Arc<dyn GraphEngine>) -> Self {
        Self { engine }
    }
}

impl JobExecutor for SessionExecutor {
    type Payload = SessionPayload;
    type Output = SessionResults;

    fn kind(&self) -> &str {
        "session"
    }

    fn execute(
        &self,
        job: Job<SessionPayload, SessionResults>,
        ctx: JobContext,
    ) -> ExecFuture<SessionResults> {
        let engine = self.engine.clone();
        Box::pin(async move {
            let graph = &job.payload.graph;
            let order = execution_order(graph)
                .map_err(|e| JobError::from_error(ErrorKind::Execution, &e))?;
            let topic = |name: &str| format!("{}.{}", ctx.kind(), name);
            let invocation = InvocationContext {
                queue_id: job.queue_id.clone(),
                item_id: job.id,
                batch_id: job.batch_id,
                session_id: job.payload.session_id,
                job: ctx.clone(),
            };

            let mut results = BTreeMap::new();
            for node_id in order {
                ctx.check_cancelled()?;
                let Some(node) = graph.nodes.get(node_id) else {
                    continue;
                };
                let details = json!({
                    "queue_id": invocation.queue_id,
                    "batch_id": invocation.batch_id,
                    "session_id": invocation.session_id,
                    "node_id": node.id,
                    "node_type": node.node_type,
                });

                let inputs = collect_inputs(node, graph, &results).map_err(|e| {
                    JobError::from_error(ErrorKind::Execution, &e).with_origin(node_id)
                })?;

                ctx.publish(Event::new(topic("invocation_started")).with_payload(details.clone()));
                match engine.invoke(node, inputs, &invocation).await {
                    Ok(output) => {
                        let mut payload = details;
                        payload["result"] = serde_json::to_value(&output).unwrap_or_default();
                        ctx.publish(Event::new(topic("invocation_complete")).with_payload(payload));
                        results.insert(node_id.to_string(), output);
                    }
                    Err(_) if ctx.is_cancelled() => return Err(JobError::Cancelled),
                    Err(error) => {
                        let mut payload = details;
                        payload["error"] = json!(error.to_string());
                        ctx.publish(Event::new(topic("invocation_error")).with_payload(payload));
                        tracing::debug!("Node {} failed: {}", node_id, error);
                        return Err(JobError::from_error(ErrorKind::Execution, &error)
                            .with_origin(node_id));
                    }
                }
            }

            Ok(SessionResults { results })
        })
    }
}
