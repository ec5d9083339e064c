//! Built-in engine for primitive nodes.
//!
//! Generation nodes live outside this binary; the primitives are enough to
//! exercise graphs, edges and batches end to end.

use conductor_core::{InvocationOutput, Node};
use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use services::{GraphEngine, InvocationContext, InvocationError};

const NODE_TYPES: &[&str] = &["integer", "float", "string", "add", "multiply", "string_join"];

#[derive(Debug, Clone, Copy, Default)]
pub struct PrimitiveEngine;

impl GraphEngine for PrimitiveEngine {
    fn is_executable(&self, node_type: &str) -> bool {
        NODE_TYPES.contains(&node_type)
    }

    fn invoke<'a>(
        &'a self,
        node: &'a Node,
        inputs: Map<String, Value>,
        ctx: &'a InvocationContext,
    ) -> BoxFuture<'a, Result<InvocationOutput, InvocationError>> {
        Box::pin(async move {
            tracing::debug!("Invoking {} ({}) for item {}", node.id, node.node_type, ctx.item_id);
            match node.node_type.as_str() {
                "integer" => Ok(InvocationOutput::IntegerOutput {
                    value: integer(&inputs, "value")?,
                }),
                "float" => Ok(InvocationOutput::FloatOutput {
                    value: float(&inputs, "value")?,
                }),
                "string" => Ok(InvocationOutput::StringOutput {
                    value: string(&inputs, "value")?,
                }),
                "add" => Ok(InvocationOutput::IntegerOutput {
                    value: integer(&inputs, "a")?.saturating_add(integer(&inputs, "b")?),
                }),
                "multiply" => Ok(InvocationOutput::IntegerOutput {
                    value: integer(&inputs, "a")?.saturating_mul(integer(&inputs, "b")?),
                }),
                "string_join" => Ok(InvocationOutput::StringOutput {
                    value: format!("{}{}", string(&inputs, "left")?, string(&inputs, "right")?),
                }),
                other => Err(InvocationError::UnknownNodeType(other.to_string())),
            }
        })
    }
}

fn field<'a>(inputs: &'a Map<String, Value>, name: &str) -> Result<&'a Value, InvocationError> {
    inputs.get(name).ok_or_else(|| InvocationError::InvalidInput {
        field: name.to_string(),
        reason: "missing".to_string(),
    })
}

fn integer(inputs: &Map<String, Value>, name: &str) -> Result<i64, InvocationError> {
    field(inputs, name)?.as_i64().ok_or_else(|| InvocationError::InvalidInput {
        field: name.to_string(),
        reason: "expected an integer".to_string(),
    })
}

fn float(inputs: &Map<String, Value>, name: &str) -> Result<f64, InvocationError> {
    field(inputs, name)?.as_f64().ok_or_else(|| InvocationError::InvalidInput {
        field: name.to_string(),
        reason: "expected a number".to_string(),
    })
}

fn string(inputs: &Map<String, Value>, name: &str) -> Result<String, InvocationError> {
    field(inputs, name)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| InvocationError::InvalidInput {
            field: name.to_string(),
            reason: "expected a string".to_string(),
        })
}
