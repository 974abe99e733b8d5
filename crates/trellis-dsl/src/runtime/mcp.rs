use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

use trellis_core::{Context, CoreError, Result, ToolSet, ValueProgram};

use super::{extract_first_json, input_view, structured_update};
use crate::schema::STATE_KEY_NODE_STRUCTURED;

/// `builtin.mcp`: calls one tool on an MCP server with arguments evaluated
/// from state and the upstream node's output.
pub struct McpNode {
    pub(crate) toolset: Arc<dyn ToolSet>,
    pub(crate) server: String,
    pub(crate) tool_name: String,
    pub(crate) params: Vec<(String, ValueProgram)>,
    pub(crate) upstream: Option<String>,
}

impl McpNode {
    /// Tool called by this node
    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    pub(crate) async fn run(&self, node_id: &str, ctx: &Context, state: &Map<String, Value>) -> Result<Map<String, Value>> {
        let tool = self
            .toolset
            .tools(ctx)
            .await?
            .into_iter()
            .find(|t| t.declaration().name == self.tool_name)
            .ok_or_else(|| {
                CoreError::NotFound(format!("MCP tool {:?} not found on server {:?}", self.tool_name, self.server))
            })?;

        let input = input_view(state, self.upstream.as_deref().unwrap_or_default());
        let state_value = Value::Object(state.clone());
        let mut args = Map::new();
        for (name, program) in &self.params {
            let value = program.eval(&state_value, &input).map_err(|e| {
                CoreError::ExpressionError(format!("failed to evaluate MCP param {:?}: {}", name, e))
            })?;
            args.insert(name.clone(), value);
        }
        debug!(node_id, tool = %self.tool_name, args = args.len(), "calling MCP tool");

        let result = tool
            .call(ctx, Value::Object(args))
            .await
            .map_err(|e| CoreError::UpstreamError(format!("MCP tool {:?} call failed: {}", self.tool_name, e)))?;

        let results = normalize_content(result);
        let results_text = results
            .iter()
            .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .filter(|t| !t.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        if results.is_empty() && results_text.is_empty() {
            return Ok(Map::new());
        }

        let mut entry = Map::new();
        if let Some(parsed) = extract_first_json(&results_text) {
            entry.insert("output_parsed".to_string(), parsed);
        }
        if !results_text.is_empty() {
            entry.insert("results_text".to_string(), Value::String(results_text));
        }
        if !results.is_empty() {
            entry.insert("results".to_string(), Value::Array(results));
        }

        let mut update = Map::new();
        update.insert(STATE_KEY_NODE_STRUCTURED.to_string(), structured_update(node_id, entry));
        Ok(update)
    }
}

/// MCP content as a list of objects. Plain strings become text items and a
/// `{"content": [...]}` envelope is unwrapped.
fn normalize_content(result: Value) -> Vec<Value> {
    let items = match result {
        Value::Null => return Vec::new(),
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("content") {
            Some(Value::Array(items)) => items,
            Some(other) => {
                map.insert("content".to_string(), other);
                vec![Value::Object(map)]
            }
            None => vec![Value::Object(map)],
        },
        other => vec![other],
    };
    items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(_) => Some(item),
            Value::String(text) => Some(json!({"type": "text", "text": text})),
            _ => None,
        })
        .collect()
}
