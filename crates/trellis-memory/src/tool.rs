//! Agent-facing memory tools.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::warn;

use trellis_core::{Context, CoreError, Result, Tool, ToolDeclaration};

use crate::entry::{Entry, MemoryKey, UserKey};
use crate::operation::{string_arg, topics_arg};
use crate::service::MemoryService;

/// Store a new memory
pub const ADD_TOOL_NAME: &str = "memory_add";
/// Rewrite a memory
pub const UPDATE_TOOL_NAME: &str = "memory_update";
/// Remove a memory
pub const DELETE_TOOL_NAME: &str = "memory_delete";
/// Remove all memories
pub const CLEAR_TOOL_NAME: &str = "memory_clear";
/// Find memories by query
pub const SEARCH_TOOL_NAME: &str = "memory_search";
/// List recent memories
pub const LOAD_TOOL_NAME: &str = "memory_load";

/// Every memory tool, sorted.
pub const ALL_TOOL_NAMES: [&str; 6] =
    [ADD_TOOL_NAME, CLEAR_TOOL_NAME, DELETE_TOOL_NAME, LOAD_TOOL_NAME, SEARCH_TOOL_NAME, UPDATE_TOOL_NAME];

/// Tools the extractor may ask for, in prompt order.
pub const BACKGROUND_TOOL_NAMES: [&str; 4] = [ADD_TOOL_NAME, UPDATE_TOOL_NAME, DELETE_TOOL_NAME, CLEAR_TOOL_NAME];

const DEFAULT_LOAD_LIMIT: usize = 10;

/// Tools enabled when the agent manages memory itself.
pub const AGENTIC_DEFAULT_TOOLS: [&str; 4] = [ADD_TOOL_NAME, UPDATE_TOOL_NAME, SEARCH_TOOL_NAME, LOAD_TOOL_NAME];

/// Tools enabled when an extractor manages memory in the background.
pub const AUTO_DEFAULT_TOOLS: [&str; 4] = [ADD_TOOL_NAME, UPDATE_TOOL_NAME, DELETE_TOOL_NAME, SEARCH_TOOL_NAME];

/// Default tool set for the mode with explicit user choices applied on top.
/// Unknown names are ignored.
pub fn resolve_enabled_tools(auto_mode: bool, overrides: &BTreeMap<String, bool>) -> BTreeSet<String> {
    let defaults: &[&str] = if auto_mode { &AUTO_DEFAULT_TOOLS } else { &AGENTIC_DEFAULT_TOOLS };
    let mut enabled: BTreeSet<String> = defaults.iter().map(|s| s.to_string()).collect();
    for (name, on) in overrides {
        if !ALL_TOOL_NAMES.contains(&name.as_str()) {
            warn!(tool = %name, "ignoring unknown memory tool");
            continue;
        }
        if *on {
            enabled.insert(name.clone());
        } else {
            enabled.remove(name);
        }
    }
    enabled
}

/// Names exposed to the agent. With an extractor running only the
/// read-side tools are exposed; writes happen in the background.
pub fn exposed_tool_names(auto_mode: bool, enabled: &BTreeSet<String>) -> Vec<String> {
    enabled
        .iter()
        .filter(|name| !auto_mode || name.as_str() == SEARCH_TOOL_NAME || name.as_str() == LOAD_TOOL_NAME)
        .cloned()
        .collect()
}

fn topics_schema() -> Value {
    json!({
        "type": "array",
        "items": {"type": "string"},
        "description": "Optional topics for categorizing the memory."
    })
}

/// Declaration of a memory tool by name
pub fn declaration(name: &str) -> Option<ToolDeclaration> {
    let (description, parameters) = match name {
        ADD_TOOL_NAME => (
            "Remember a piece of information about the user.",
            json!({
                "type": "object",
                "properties": {
                    "memory": {
                        "type": "string",
                        "description": "The memory content to store. Should be a brief, third-person statement that captures key information about the user."
                    },
                    "topics": topics_schema()
                },
                "required": ["memory"]
            }),
        ),
        UPDATE_TOOL_NAME => (
            "Update an existing memory.",
            json!({
                "type": "object",
                "properties": {
                    "memory_id": {"type": "string", "description": "The ID of the memory to update."},
                    "memory": {"type": "string", "description": "The updated memory content."},
                    "topics": topics_schema()
                },
                "required": ["memory_id", "memory"]
            }),
        ),
        DELETE_TOOL_NAME => (
            "Delete a memory.",
            json!({
                "type": "object",
                "properties": {
                    "memory_id": {"type": "string", "description": "The ID of the memory to delete."}
                },
                "required": ["memory_id"]
            }),
        ),
        CLEAR_TOOL_NAME => (
            "Delete all memories of the user.",
            json!({"type": "object", "description": "No parameters required. Clears all memories for the user."}),
        ),
        SEARCH_TOOL_NAME => (
            "Search the user's memories.",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "The search query to find relevant memories."}
                },
                "required": ["query"]
            }),
        ),
        LOAD_TOOL_NAME => (
            "Load the user's most recent memories.",
            json!({
                "type": "object",
                "properties": {
                    "limit": {"type": "integer", "description": "Maximum number of memories to load (default: 10)."}
                }
            }),
        ),
        _ => return None,
    };
    Some(ToolDeclaration::new(name, description, parameters))
}

/// Declarations of the enabled background tools, in prompt order.
pub fn background_declarations(enabled: &BTreeSet<String>) -> Vec<ToolDeclaration> {
    BACKGROUND_TOOL_NAMES
        .iter()
        .filter(|name| enabled.is_empty() || enabled.contains(**name))
        .filter_map(|name| declaration(name))
        .collect()
}

#[derive(Debug, Serialize)]
struct MemoryResult {
    id: String,
    memory: String,
    topics: Vec<String>,
    created: DateTime<Utc>,
}

impl From<Entry> for MemoryResult {
    fn from(entry: Entry) -> Self {
        Self { id: entry.id, memory: entry.memory.memory, topics: entry.memory.topics, created: entry.created_at }
    }
}

fn user_from_context(ctx: &Context) -> Result<UserKey> {
    let scope = ctx
        .scope()
        .ok_or_else(|| CoreError::ValidationError("no invocation scope found".to_string()))?;
    let key = UserKey::new(scope.app_name.clone(), scope.user_id.clone());
    key.check_user_key()?;
    Ok(key)
}

fn required(args: &Map<String, Value>, name: &str) -> Result<String> {
    string_arg(args, name).ok_or_else(|| CoreError::ValidationError(format!("{} is required", name)))
}

/// One memory tool bound to a service.
pub struct MemoryTool {
    name: &'static str,
    service: Arc<dyn MemoryService>,
}

impl std::fmt::Debug for MemoryTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTool").field("name", &self.name).finish()
    }
}

impl MemoryTool {
    /// Tool for a known name, `None` otherwise
    pub fn new(name: &str, service: Arc<dyn MemoryService>) -> Option<Self> {
        let name = ALL_TOOL_NAMES.iter().copied().find(|n| *n == name)?;
        Some(Self { name, service })
    }
}

#[async_trait]
impl Tool for MemoryTool {
    fn declaration(&self) -> ToolDeclaration {
        declaration(self.name).unwrap_or_else(|| ToolDeclaration::new(self.name, "", json!({"type": "object"})))
    }

    async fn call(&self, ctx: &Context, args: Value) -> Result<Value> {
        let user = user_from_context(ctx)?;
        let args = match args {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => return Err(CoreError::ValidationError("invalid arguments format".to_string())),
        };

        match self.name {
            ADD_TOOL_NAME => {
                let memory = required(&args, "memory")?;
                let topics = topics_arg(&args);
                self.service.add_memory(ctx, &user, &memory, topics.clone()).await?;
                Ok(json!({"success": true, "message": "Memory added successfully", "memory": memory, "topics": topics}))
            }
            UPDATE_TOOL_NAME => {
                let memory_id = required(&args, "memory_id")?;
                let memory = required(&args, "memory")?;
                let topics = topics_arg(&args);
                let key = MemoryKey::new(user.app_name, user.user_id, memory_id.clone());
                self.service.update_memory(ctx, &key, &memory, topics.clone()).await?;
                Ok(json!({
                    "success": true,
                    "message": "Memory updated successfully",
                    "memory_id": memory_id,
                    "memory": memory,
                    "topics": topics
                }))
            }
            DELETE_TOOL_NAME => {
                let memory_id = required(&args, "memory_id")?;
                let key = MemoryKey::new(user.app_name, user.user_id, memory_id.clone());
                self.service.delete_memory(ctx, &key).await?;
                Ok(json!({"success": true, "message": "Memory deleted successfully", "memory_id": memory_id}))
            }
            CLEAR_TOOL_NAME => {
                self.service.clear_memories(ctx, &user).await?;
                Ok(json!({"success": true, "message": "All memories cleared successfully"}))
            }
            SEARCH_TOOL_NAME => {
                let query = required(&args, "query")?;
                let results: Vec<MemoryResult> =
                    self.service.search_memories(ctx, &user, &query).await?.into_iter().map(Into::into).collect();
                Ok(json!({"success": true, "query": query, "count": results.len(), "results": results}))
            }
            _ => {
                let limit = args
                    .get("limit")
                    .and_then(Value::as_f64)
                    .filter(|l| *l >= 1.0)
                    .map_or(DEFAULT_LOAD_LIMIT, |l| l as usize);
                let results: Vec<MemoryResult> =
                    self.service.read_memories(ctx, &user, limit).await?.into_iter().map(Into::into).collect();
                Ok(json!({"success": true, "limit": limit, "count": results.len(), "results": results}))
            }
        }
    }
}

/// Tools for `names` bound to `service`; unknown names are skipped.
pub fn build_tools(service: Arc<dyn MemoryService>, names: &[String]) -> Vec<Arc<dyn Tool>> {
    names
        .iter()
        .filter_map(|name| MemoryTool::new(name, Arc::clone(&service)))
        .map(|tool| Arc::new(tool) as Arc<dyn Tool>)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides(pairs: &[(&str, bool)]) -> BTreeMap<String, bool> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn mode_defaults_and_overrides() {
        let agentic = resolve_enabled_tools(false, &BTreeMap::new());
        assert_eq!(exposed_tool_names(false, &agentic), vec!["memory_add", "memory_load", "memory_search", "memory_update"]);

        let auto = resolve_enabled_tools(true, &overrides(&[("memory_load", true), ("memory_delete", false), ("bogus", true)]));
        assert!(auto.contains("memory_add"));
        assert!(!auto.contains("memory_delete"));
        assert!(!auto.contains("bogus"));
        assert_eq!(exposed_tool_names(true, &auto), vec!["memory_load", "memory_search"]);
    }

    #[test]
    fn background_declarations_follow_prompt_order() {
        let enabled: BTreeSet<String> = ["memory_clear", "memory_add", "memory_search"].iter().map(|s| s.to_string()).collect();
        let names: Vec<String> = background_declarations(&enabled).into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["memory_add", "memory_clear"]);
        assert_eq!(background_declarations(&BTreeSet::new()).len(), 4);
    }

    #[test]
    fn every_tool_has_an_object_schema() {
        for name in ALL_TOOL_NAMES {
            let decl = declaration(name).unwrap();
            assert_eq!(decl.parameters["type"], "object", "{}", name);
        }
        assert!(declaration("memory_nope").is_none());
    }
}
