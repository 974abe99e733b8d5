//! Contracts for the collaborators the compiler wires into nodes: MCP
//! transports, knowledge bases and code executors. Implementations are
//! injected through [`crate::CompilerBuilder`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use trellis_core::{Result, Tool, ToolSet};

use crate::numconv;

/// Default MCP call timeout
pub const DEFAULT_MCP_TIMEOUT: Duration = Duration::from_secs(10);

/// MCP transport kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpTransport {
    /// Child process over stdin/stdout
    Stdio,
    /// Streamable HTTP
    StreamableHttp,
    /// Server-sent events
    Sse,
}

impl McpTransport {
    /// Parse a transport name
    pub fn parse(name: &str) -> std::result::Result<Self, String> {
        match name.trim() {
            "stdio" => Ok(Self::Stdio),
            "streamable_http" => Ok(Self::StreamableHttp),
            "sse" => Ok(Self::Sse),
            other => Err(format!("unsupported transport type: {}", other)),
        }
    }
}

/// How to reach one MCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpConnectionConfig {
    /// Transport kind
    pub transport: McpTransport,
    /// Server URL (HTTP transports)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    /// Command (stdio transport)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Command arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Extra HTTP headers
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Per-call timeout
    #[serde(default = "default_mcp_timeout")]
    pub timeout: Duration,
    /// Only expose these tools; empty exposes all
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_filter: Vec<String>,
    /// Toolset name, used as a tool name prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

fn default_mcp_timeout() -> Duration {
    DEFAULT_MCP_TIMEOUT
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

impl McpConnectionConfig {
    /// Build from a node's `config` map.
    pub fn from_config(config: &Map<String, Value>) -> std::result::Result<Self, String> {
        let transport = config
            .get("transport")
            .and_then(Value::as_str)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| "transport is required in MCP tool config".to_string())?;
        let transport = McpTransport::parse(transport)?;

        let timeout = match config.get("timeout") {
            Some(v) => {
                let secs = numconv::to_f64(v, "timeout")?;
                if secs <= 0.0 {
                    return Err("timeout must be positive".to_string());
                }
                Duration::from_secs_f64(secs)
            }
            None => DEFAULT_MCP_TIMEOUT,
        };

        let mut out = Self {
            transport,
            server_url: None,
            command: None,
            args: Vec::new(),
            headers: BTreeMap::new(),
            timeout,
            tool_filter: string_list(config.get("tool_filter")),
            name: config.get("name").and_then(Value::as_str).map(str::to_string),
        };

        match transport {
            McpTransport::Stdio => {
                let command = config
                    .get("command")
                    .and_then(Value::as_str)
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| "command is required for stdio transport".to_string())?;
                out.command = Some(command.to_string());
                out.args = config
                    .get("args")
                    .and_then(Value::as_array)
                    .map(|args| args.iter().filter_map(Value::as_str).map(str::to_string).collect())
                    .unwrap_or_default();
            }
            McpTransport::StreamableHttp | McpTransport::Sse => {
                let url = config
                    .get("server_url")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .ok_or_else(|| format!("server_url is required for {} transport", transport_name(transport)))?;
                out.server_url = Some(url.to_string());
                if let Some(Value::Object(headers)) = config.get("headers") {
                    out.headers = headers
                        .iter()
                        .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                        .collect();
                }
            }
        }
        Ok(out)
    }
}

fn transport_name(transport: McpTransport) -> &'static str {
    match transport {
        McpTransport::Stdio => "stdio",
        McpTransport::StreamableHttp => "streamable_http",
        McpTransport::Sse => "sse",
    }
}

/// Opens MCP toolsets. Connections are established lazily by the toolset.
#[cfg_attr(test, mockall::automock)]
pub trait McpConnector: Send + Sync {
    /// Toolset for one server
    fn connect(&self, config: &McpConnectionConfig) -> Result<Arc<dyn ToolSet>>;
}

/// Value of a knowledge filter condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    /// Operands of `and` / `or`
    Conditions(Vec<FilterCondition>),
    /// Comparison operand
    Literal(Value),
}

/// A metadata filter applied to knowledge searches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    /// Metadata field (empty for `and` / `or`)
    #[serde(default)]
    pub field: String,
    /// `eq`, `ne`, `gt`, `in`, ..., `and`, `or`
    pub operator: String,
    /// Operand
    pub value: FilterValue,
}

impl FilterCondition {
    /// Convert a raw condition; `and` / `or` operands are converted recursively
    /// and malformed operands are dropped.
    pub fn from_value(raw: &Value) -> Option<Self> {
        let map = raw.as_object()?;
        let field = map.get("field").and_then(Value::as_str).unwrap_or_default().to_string();
        let operator = map.get("operator").and_then(Value::as_str).unwrap_or_default().to_string();
        let raw_value = map.get("value").cloned().unwrap_or(Value::Null);
        let value = if operator == "and" || operator == "or" {
            let subs = raw_value
                .as_array()
                .map(|items| items.iter().filter_map(Self::from_value).collect())
                .unwrap_or_default();
            FilterValue::Conditions(subs)
        } else {
            FilterValue::Literal(raw_value)
        };
        Some(Self { field, operator, value })
    }
}

/// Agentic filter: the model picks metadata filters itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AgenticFilter {
    /// Enabled
    #[serde(default)]
    pub enabled: bool,
    /// Known metadata values, shown to the model
    #[serde(default)]
    pub info: Map<String, Value>,
}

/// Everything needed to build a knowledge search tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct KnowledgeSearchSpec {
    /// Vector store config, opaque to the compiler
    #[serde(default)]
    pub vector_store: Value,
    /// Embedder config, opaque to the compiler
    #[serde(default)]
    pub embedder: Value,
    /// Result cap; 0 leaves the backend default
    #[serde(default)]
    pub max_results: usize,
    /// Minimum relevance score; 0 disables
    #[serde(default)]
    pub min_score: f64,
    /// Static metadata filter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditioned_filter: Option<FilterCondition>,
    /// Model-chosen filters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agentic_filter: Option<AgenticFilter>,
}

impl KnowledgeSearchSpec {
    /// Build from a node or tool config map.
    pub fn from_config(config: &Map<String, Value>) -> std::result::Result<Self, String> {
        let vector_store = config
            .get("vector_store")
            .filter(|v| v.is_object())
            .cloned()
            .ok_or_else(|| "vector_store config is required".to_string())?;
        let embedder = config
            .get("embedder")
            .filter(|v| v.is_object())
            .cloned()
            .ok_or_else(|| "embedder config is required".to_string())?;
        let max_results = match config.get("max_results") {
            Some(v) => {
                let n = numconv::to_i64(v, "max_results")?;
                usize::try_from(n).map_err(|_| "max_results must not be negative".to_string())?
            }
            None => 0,
        };
        let min_score = match config.get("min_score") {
            Some(v) => numconv::to_f64(v, "min_score")?,
            None => 0.0,
        };
        let agentic_filter = match config.get("agentic_filter") {
            Some(raw) => Some(
                serde_json::from_value(raw.clone()).map_err(|e| format!("invalid agentic_filter: {}", e))?,
            ),
            None => None,
        };
        Ok(Self {
            vector_store,
            embedder,
            max_results,
            min_score,
            conditioned_filter: config.get("conditioned_filter").and_then(FilterCondition::from_value),
            agentic_filter,
        })
    }
}

/// Builds knowledge search tools. The tool takes `{"query": ...}` and returns
/// `{"documents": [{"text", "score", "metadata"}], "message"?}`.
#[cfg_attr(test, mockall::automock)]
pub trait KnowledgeFactory: Send + Sync {
    /// Search tool for a spec
    fn search_tool(&self, spec: &KnowledgeSearchSpec) -> Result<Arc<dyn Tool>>;
}

/// Builds the code interpreter tool from an `executor` config (`Null` for defaults).
#[cfg_attr(test, mockall::automock)]
pub trait CodeExecutorFactory: Send + Sync {
    /// Code execution tool
    fn create(&self, executor: &Value) -> Result<Arc<dyn Tool>>;
}
