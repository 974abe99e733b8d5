use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use trellis_core::{Context, Result, Tool, ValueProgram};

use super::{input_view, structured_update};
use crate::schema::STATE_KEY_NODE_STRUCTURED;

/// `builtin.knowledge_search`: one knowledge base query. Results land in
/// `node_structured[<id>].documents`.
pub struct KnowledgeSearchNode {
    pub(crate) tool: Arc<dyn Tool>,
    pub(crate) query: ValueProgram,
    pub(crate) upstream: Option<String>,
}

impl KnowledgeSearchNode {
    pub(crate) async fn run(&self, node_id: &str, ctx: &Context, state: &Map<String, Value>) -> Result<Map<String, Value>> {
        let input = input_view(state, self.upstream.as_deref().unwrap_or_default());
        let query = match self.query.eval(&Value::Object(state.clone()), &input)? {
            Value::String(s) => s,
            other => other.to_string(),
        };
        debug!(node_id, query_len = query.len(), "knowledge search");

        let entry = match self.tool.call(ctx, json!({"query": query})).await {
            Ok(raw) => normalize(raw),
            Err(e) => {
                warn!(node_id, error = %e, "knowledge search failed");
                let mut entry = Map::new();
                entry.insert("documents".to_string(), json!([]));
                entry.insert("message".to_string(), Value::String(format!("Search failed: {}", e)));
                entry
            }
        };
        info!(
            node_id,
            documents = entry.get("documents").and_then(serde_json::Value::as_array).map_or(0, Vec::len),
            "knowledge search done"
        );

        let mut update = Map::new();
        update.insert(STATE_KEY_NODE_STRUCTURED.to_string(), structured_update(node_id, entry));
        Ok(update)
    }
}

/// Keep `text`, `score` and `metadata` of each document plus a non-empty `message`.
fn normalize(raw: Value) -> Map<String, Value> {
    let documents: Vec<Value> = raw
        .get("documents")
        .and_then(Value::as_array)
        .map(|docs| {
            docs.iter()
                .map(|doc| {
                    let mut out = Map::new();
                    out.insert("text".to_string(), doc.get("text").cloned().unwrap_or_else(|| json!("")));
                    out.insert("score".to_string(), doc.get("score").cloned().unwrap_or_else(|| json!(0.0)));
                    if let Some(meta) = doc.get("metadata").filter(|m| !m.is_null()) {
                        out.insert("metadata".to_string(), meta.clone());
                    }
                    Value::Object(out)
                })
                .collect()
        })
        .unwrap_or_default();

    let mut entry = Map::new();
    entry.insert("documents".to_string(), Value::Array(documents));
    if let Some(message) = raw.get("message").and_then(Value::as_str).filter(|m| !m.is_empty()) {
        entry.insert("message".to_string(), Value::String(message.to_string()));
    }
    entry
}
