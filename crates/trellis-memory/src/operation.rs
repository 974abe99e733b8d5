//! Memory mutations requested by the extractor.

use serde_json::{Map, Value};
use tracing::warn;

use trellis_core::ToolCall;

use crate::tool::{ADD_TOOL_NAME, CLEAR_TOOL_NAME, DELETE_TOOL_NAME, UPDATE_TOOL_NAME};

/// One change to a user's memories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Store a new memory
    Add {
        /// Memory text
        memory: String,
        /// Topics, possibly empty
        topics: Vec<String>,
    },
    /// Rewrite an existing memory
    Update {
        /// Target id
        memory_id: String,
        /// New text
        memory: String,
        /// New topics
        topics: Vec<String>,
    },
    /// Remove one memory
    Delete {
        /// Target id
        memory_id: String,
    },
    /// Remove every memory of the user
    Clear,
}

impl Operation {
    /// Tool that produces this operation
    pub fn tool_name(&self) -> &'static str {
        match self {
            Operation::Add { .. } => ADD_TOOL_NAME,
            Operation::Update { .. } => UPDATE_TOOL_NAME,
            Operation::Delete { .. } => DELETE_TOOL_NAME,
            Operation::Clear => CLEAR_TOOL_NAME,
        }
    }
}

pub(crate) fn string_arg(args: &Map<String, Value>, name: &str) -> Option<String> {
    args.get(name).and_then(Value::as_str).filter(|s| !s.is_empty()).map(str::to_string)
}

/// String topics of the `topics` argument; other values are skipped.
pub(crate) fn topics_arg(args: &Map<String, Value>) -> Vec<String> {
    args.get("topics")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

/// Operation for a decoded argument object, `None` when required
/// arguments are missing or the tool is unknown.
pub fn parse_tool_args(name: &str, args: &Map<String, Value>) -> Option<Operation> {
    match name {
        ADD_TOOL_NAME => Some(Operation::Add { memory: string_arg(args, "memory")?, topics: topics_arg(args) }),
        UPDATE_TOOL_NAME => Some(Operation::Update {
            memory_id: string_arg(args, "memory_id")?,
            memory: string_arg(args, "memory")?,
            topics: topics_arg(args),
        }),
        DELETE_TOOL_NAME => Some(Operation::Delete { memory_id: string_arg(args, "memory_id")? }),
        CLEAR_TOOL_NAME => Some(Operation::Clear),
        _ => None,
    }
}

/// Decode a model tool call. Malformed arguments and unknown tools
/// yield `None` with a warning.
pub fn parse_tool_call(call: &ToolCall) -> Option<Operation> {
    let raw = call.function.arguments.trim();
    let args = if raw.is_empty() {
        Map::new()
    } else {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                warn!(tool = %call.function.name, arguments = %other, "memory tool arguments are not an object");
                return None;
            }
            Err(e) => {
                warn!(tool = %call.function.name, error = %e, "failed to parse memory tool arguments");
                return None;
            }
        }
    };
    let op = parse_tool_args(&call.function.name, &args);
    if op.is_none() {
        warn!(tool = %call.function.name, "ignoring memory tool call");
    }
    op
}
