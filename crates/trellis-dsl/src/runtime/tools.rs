use futures::future::join_all;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use trellis_core::{Context, Message, Result, Role, Tool, ToolCall};

use super::state_messages;
use crate::schema::STATE_KEY_MESSAGES;

/// `builtin.tools`: runs the tool calls of the latest assistant message.
pub struct ToolsNode {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolsNode {
    /// Node serving the given tools
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Self {
        Self { tools: tools.into_iter().map(|t| (t.declaration().name, t)).collect() }
    }

    /// Names of bound tools
    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub(crate) async fn run(&self, ctx: &Context, state: &Map<String, Value>) -> Result<Map<String, Value>> {
        let messages = state_messages(state);
        let Some(last) = messages.iter().rev().find(|m| m.role == Role::Assistant) else {
            debug!("no assistant message to take tool calls from");
            return Ok(Map::new());
        };
        if last.tool_calls.is_empty() {
            debug!("latest assistant message has no tool calls");
            return Ok(Map::new());
        }

        let results = execute_tool_calls(ctx, &self.tools, &last.tool_calls).await;
        let mut update = Map::new();
        update.insert(STATE_KEY_MESSAGES.to_string(), serde_json::to_value(results)?);
        Ok(update)
    }
}

fn render(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

async fn call_one(ctx: &Context, tools: &BTreeMap<String, Arc<dyn Tool>>, call: &ToolCall) -> Message {
    let name = call.function.name.as_str();
    let content = match tools.get(name) {
        None => {
            warn!(tool = name, "model called an unknown tool");
            json!({"error": format!("tool {} not found", name)}).to_string()
        }
        Some(tool) => {
            let raw = call.function.arguments.trim();
            let args = if raw.is_empty() { Ok(json!({})) } else { serde_json::from_str::<Value>(raw) };
            match args {
                Err(e) => json!({"error": format!("invalid arguments for {}: {}", name, e)}).to_string(),
                Ok(args) => match tool.call(ctx, args).await {
                    Ok(value) => render(value),
                    Err(e) => {
                        warn!(tool = name, error = %e, "tool call failed");
                        json!({"error": e.to_string()}).to_string()
                    }
                },
            }
        }
    };
    Message::tool(call.id.clone(), name, content)
}

/// Run tool calls concurrently; results keep the call order. Failures are
/// reported to the model as `{"error": ...}` tool messages.
pub async fn execute_tool_calls(
    ctx: &Context,
    tools: &BTreeMap<String, Arc<dyn Tool>>,
    calls: &[ToolCall],
) -> Vec<Message> {
    join_all(calls.iter().map(|call| call_one(ctx, tools, call))).await
}
