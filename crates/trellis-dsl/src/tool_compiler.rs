//! Compiles the `tools` list of agent nodes into runtime tools.
//!
//! Entries are either plain strings naming tools of the configured
//! [`ToolProvider`] (`"*"` binds all of them) or typed objects:
//!
//! ```yaml
//! tools:
//!   - calculator
//!   - type: mcp
//!     server_url: https://mcp.example.com/mcp
//!     server_label: example
//!     allowed_tools: [lookup]
//!   - type: web_search
//!   - type: knowledge_search
//!     vector_store: { type: inmemory }
//!     embedder: { type: openai, api_key: env:OPENAI_API_KEY }
//!   - type: code_interpreter
//! ```

use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use trellis_core::{Tool, ToolSet};

use crate::compiler::Dependencies;
use crate::external::{KnowledgeSearchSpec, McpConnectionConfig, McpTransport};
use crate::model_spec::resolve_secret;
use crate::web_search::{DuckDuckGoConfig, DuckDuckGoTool};

const DEFAULT_MCP_LABEL: &str = "mcp";

/// An MCP server entry
#[derive(Debug, Clone, PartialEq)]
pub struct McpToolSpec {
    /// Server URL
    pub server_url: String,
    /// `streamable_http` (default) or `sse`
    pub transport: McpTransport,
    /// Toolset name; required once several servers are configured
    pub server_label: Option<String>,
    /// Only expose these tools
    pub allowed_tools: Vec<String>,
    /// Request headers; values may be `env:VAR`
    pub headers: BTreeMap<String, String>,
}

/// A web search entry
#[derive(Debug, Clone, PartialEq)]
pub struct WebSearchSpec {
    /// Search provider; only DuckDuckGo is served
    pub provider: String,
    /// Result cap
    pub max_results: Option<usize>,
}

/// Parsed `tools` list
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolSpecs {
    /// Provider tool names
    pub builtin: Vec<String>,
    /// `"*"` was listed
    pub all_builtin: bool,
    /// MCP servers
    pub mcp: Vec<McpToolSpec>,
    /// Web search entries
    pub web_search: Vec<WebSearchSpec>,
    /// Knowledge bases
    pub knowledge_search: Vec<KnowledgeSearchSpec>,
    /// Code interpreter executor configs
    pub code_interpreter: Vec<Value>,
}

impl ToolSpecs {
    /// True when any tool is configured
    pub fn has_any(&self) -> bool {
        self.all_builtin
            || !self.builtin.is_empty()
            || !self.mcp.is_empty()
            || !self.web_search.is_empty()
            || !self.knowledge_search.is_empty()
            || !self.code_interpreter.is_empty()
    }
}

fn string_field(item: &Map<String, Value>, key: &str) -> Option<String> {
    item.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    match value {
        Some(Value::Object(map)) => map
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
            .collect(),
        _ => BTreeMap::new(),
    }
}

fn parse_mcp(idx: usize, item: &Map<String, Value>) -> Result<McpToolSpec, String> {
    let server_url =
        string_field(item, "server_url").ok_or_else(|| format!("tools[{}]: mcp server_url is required", idx))?;
    let transport = match string_field(item, "transport") {
        None => McpTransport::StreamableHttp,
        Some(name) => match McpTransport::parse(&name)? {
            McpTransport::Stdio => return Err(format!("tools[{}]: mcp transport stdio is not supported here", idx)),
            t => t,
        },
    };
    let allowed_tools = match item.get("allowed_tools") {
        Some(Value::Array(names)) => names
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };
    Ok(McpToolSpec {
        server_url,
        transport,
        server_label: string_field(item, "server_label"),
        allowed_tools,
        headers: string_map(item.get("headers")),
    })
}

/// Parse a `tools` value. `None` and `null` yield an empty list.
pub fn parse_tools(raw: Option<&Value>) -> Result<ToolSpecs, String> {
    let mut specs = ToolSpecs::default();
    let items = match raw {
        None | Some(Value::Null) => return Ok(specs),
        Some(Value::Array(items)) => items,
        Some(other) => return Err(format!("tools must be a list, got {}", other)),
    };

    for (idx, item) in items.iter().enumerate() {
        let item = match item {
            Value::String(name) if name.trim() == "*" => {
                specs.all_builtin = true;
                continue;
            }
            Value::String(name) if !name.trim().is_empty() => {
                specs.builtin.push(name.trim().to_string());
                continue;
            }
            Value::Object(map) => map,
            other => return Err(format!("tools[{}] must be a tool name or an object, got {}", idx, other)),
        };
        let kind = string_field(item, "type").ok_or_else(|| format!("tools[{}]: type is required", idx))?;
        match kind.as_str() {
            "builtin" => {
                let name = string_field(item, "name").ok_or_else(|| format!("tools[{}]: builtin name is required", idx))?;
                specs.builtin.push(name);
            }
            "mcp" => specs.mcp.push(parse_mcp(idx, item)?),
            "web_search" => {
                let max_results = match item.get("max_results") {
                    Some(v) => Some(
                        usize::try_from(crate::numconv::to_positive_i64(v, "max_results")?)
                            .map_err(|_| "max_results out of range".to_string())?,
                    ),
                    None => None,
                };
                specs.web_search.push(WebSearchSpec {
                    provider: string_field(item, "provider").unwrap_or_else(|| "duckduckgo".to_string()),
                    max_results,
                });
            }
            "knowledge_search" => specs
                .knowledge_search
                .push(KnowledgeSearchSpec::from_config(item).map_err(|e| format!("tools[{}]: {}", idx, e))?),
            "code_interpreter" => specs.code_interpreter.push(item.get("executor").cloned().unwrap_or(Value::Null)),
            other => return Err(format!("tools[{}]: unknown tool type {:?}", idx, other)),
        }
    }
    Ok(specs)
}

/// Reject configurations where later entries would silently shadow earlier ones.
pub fn validate_tool_specs(specs: &ToolSpecs) -> Result<(), String> {
    if specs.web_search.len() > 1 {
        return Err("multiple web_search tools configured: all web_search tools produce the same tool name \
                    'duckduckgo_search', only the last one would be effective; remove duplicates or use \
                    different tool types"
            .to_string());
    }
    if specs.knowledge_search.len() > 1 {
        return Err("multiple knowledge_search tools configured: all knowledge_search tools produce the same \
                    tool name 'knowledge_search', only the last one would be effective; remove duplicates"
            .to_string());
    }
    if specs.code_interpreter.len() > 1 {
        return Err(
            "multiple code_interpreter tools configured: only one code executor can be active, remove duplicates"
                .to_string(),
        );
    }

    let mut seen = HashSet::new();
    for name in &specs.builtin {
        if !seen.insert(name.as_str()) {
            return Err(format!("duplicate builtin tool {:?} configured: remove the duplicate entry", name));
        }
    }

    if specs.mcp.len() > 1 {
        let mut labels: HashMap<&str, usize> = HashMap::new();
        for (idx, spec) in specs.mcp.iter().enumerate() {
            let label = spec.server_label.as_deref().unwrap_or(DEFAULT_MCP_LABEL);
            let count = labels.entry(label).or_default();
            *count += 1;
            if *count > 1 {
                if spec.server_label.is_none() {
                    return Err(format!(
                        "multiple mcp tools configured without server_label: mcp tools[{}] and others use \
                         default toolset name 'mcp', which causes tool name conflicts; add unique server_label \
                         to each mcp tool",
                        idx
                    ));
                }
                return Err(format!(
                    "duplicate mcp server_label {:?}: mcp tools with the same server_label will have \
                     conflicting tool name prefixes; use unique server_label for each mcp server",
                    label
                ));
            }
        }
    }
    Ok(())
}

/// Runtime tools of one agent node
#[derive(Clone, Default)]
pub struct CompiledTools {
    /// Provider and web search tools
    pub tools: Vec<Arc<dyn Tool>>,
    /// MCP toolsets, listed at run time
    pub toolsets: Vec<Arc<dyn ToolSet>>,
    /// Knowledge search tools
    pub knowledge_tools: Vec<Arc<dyn Tool>>,
    /// Code interpreter
    pub code_executor: Option<Arc<dyn Tool>>,
}

impl CompiledTools {
    /// Every static tool: provider, web search, knowledge and code execution
    pub fn static_tools(&self) -> Vec<Arc<dyn Tool>> {
        self.tools
            .iter()
            .chain(self.knowledge_tools.iter())
            .chain(self.code_executor.iter())
            .cloned()
            .collect()
    }
}

pub(crate) fn mcp_connection(
    spec: &McpToolSpec,
    allow_env_secrets: bool,
) -> Result<McpConnectionConfig, String> {
    let mut headers = BTreeMap::new();
    for (name, value) in &spec.headers {
        let field = format!("headers.{}", name);
        headers.insert(name.clone(), resolve_secret(value.clone(), &field, allow_env_secrets)?);
    }
    Ok(McpConnectionConfig {
        transport: spec.transport,
        server_url: Some(spec.server_url.clone()),
        command: None,
        args: Vec::new(),
        headers,
        timeout: crate::external::DEFAULT_MCP_TIMEOUT,
        tool_filter: spec.allowed_tools.clone(),
        name: spec.server_label.clone(),
    })
}

/// Compile the `tools` value of a node config.
pub(crate) fn compile_tools(raw: Option<&Value>, deps: &Dependencies) -> Result<CompiledTools, String> {
    let specs = parse_tools(raw).map_err(|e| format!("failed to parse tools: {}", e))?;
    validate_tool_specs(&specs)?;
    let mut out = CompiledTools::default();

    if specs.all_builtin || !specs.builtin.is_empty() {
        let provider = deps.tool_provider.as_ref().ok_or_else(|| {
            format!("builtin tools configured but no tool provider available: {:?}", specs.builtin)
        })?;
        if specs.all_builtin {
            out.tools.extend(provider.get_all());
        }
        for name in &specs.builtin {
            if specs.all_builtin && out.tools.iter().any(|t| &t.declaration().name == name) {
                continue;
            }
            let tool = provider
                .get(name)
                .ok_or_else(|| format!("builtin tool {:?} not found in tool provider", name))?;
            out.tools.push(tool);
        }
    }

    for spec in &specs.mcp {
        let connector = deps
            .mcp_connector
            .as_ref()
            .ok_or_else(|| "mcp tools configured but no MCP connector available".to_string())?;
        let config = mcp_connection(spec, deps.allow_env_secrets)?;
        let toolset = connector
            .connect(&config)
            .map_err(|e| format!("failed to compile mcp tool: {}", e))?;
        out.toolsets.push(toolset);
    }

    for spec in &specs.web_search {
        if spec.provider != "duckduckgo" {
            debug!(provider = %spec.provider, "web search provider not available, using duckduckgo");
        }
        let mut config: DuckDuckGoConfig = deps.web_search.clone();
        if let Some(max) = spec.max_results {
            config.max_results = max;
        }
        out.tools.push(Arc::new(DuckDuckGoTool::new(config)));
    }

    for spec in &specs.knowledge_search {
        let factory = deps
            .knowledge_factory
            .as_ref()
            .ok_or_else(|| "knowledge_search tools configured but no knowledge factory available".to_string())?;
        let tool = factory
            .search_tool(spec)
            .map_err(|e| format!("failed to compile knowledge_search tool: {}", e))?;
        out.knowledge_tools.push(tool);
    }

    if let Some(executor) = specs.code_interpreter.first() {
        let factory = deps
            .code_executors
            .as_ref()
            .ok_or_else(|| "code_interpreter configured but no code executor factory available".to_string())?;
        let tool = factory
            .create(executor)
            .map_err(|e| format!("failed to compile code_interpreter tool: {}", e))?;
        out.code_executor = Some(tool);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{MockCodeExecutorFactory, MockKnowledgeFactory, MockMcpConnector};
    use crate::testing::echo_tool;
    use crate::web_search::WEB_SEARCH_TOOL_NAME;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use trellis_core::{Context, ToolRegistry};

    struct EmptySet;

    #[async_trait]
    impl ToolSet for EmptySet {
        fn name(&self) -> &str {
            "empty"
        }

        async fn tools(&self, _ctx: &Context) -> trellis_core::Result<Vec<Arc<dyn Tool>>> {
            Ok(vec![])
        }
    }

    fn deps() -> Dependencies {
        Dependencies {
            tool_provider: Some(Arc::new(ToolRegistry::new().with(echo_tool("calculator")).with(echo_tool("clock")))),
            ..Dependencies::default()
        }
    }

    #[test]
    fn parses_mixed_entries() {
        let specs = parse_tools(Some(&json!([
            "calculator",
            {"type": "mcp", "server_url": "https://mcp.example.com/mcp", "server_label": "ex",
             "allowed_tools": ["a", " ", "b"], "headers": {"Authorization": "Bearer t"}},
            {"type": "builtin", "name": "clock"},
            {"type": "web_search", "max_results": 3}
        ])))
        .unwrap();
        assert_eq!(specs.builtin, vec!["calculator", "clock"]);
        assert_eq!(specs.mcp[0].transport, McpTransport::StreamableHttp);
        assert_eq!(specs.mcp[0].allowed_tools, vec!["a", "b"]);
        assert_eq!(specs.web_search[0], WebSearchSpec { provider: "duckduckgo".into(), max_results: Some(3) });
        assert!(specs.has_any());
        assert!(!parse_tools(None).unwrap().has_any());
    }

    #[test]
    fn rejects_malformed_entries() {
        for (raw, needle) in [
            (json!([{"server_url": "x"}]), "type is required"),
            (json!([{"type": "unknown_type"}]), "unknown tool type"),
            (json!([{"type": "mcp"}]), "server_url is required"),
            (json!([{"type": "builtin"}]), "name is required"),
            (json!([{"type": "knowledge_search", "embedder": {"type": "openai"}}]), "vector_store config is required"),
            (json!([{"type": "knowledge_search", "vector_store": {"type": "pgvector"}}]), "embedder config is required"),
            (json!([42]), "must be a tool name or an object"),
            (json!({"type": "mcp"}), "tools must be a list"),
        ] {
            let err = parse_tools(Some(&raw)).unwrap_err();
            assert!(err.contains(needle), "{} does not mention {}", err, needle);
        }
    }

    #[test]
    fn rejects_shadowing_configurations() {
        let check = |raw: Value| validate_tool_specs(&parse_tools(Some(&raw)).unwrap()).unwrap_err();

        assert!(check(json!([{"type": "web_search"}, {"type": "web_search"}])).starts_with("multiple web_search"));
        assert!(check(json!(["calculator", {"type": "builtin", "name": "calculator"}]))
            .starts_with("duplicate builtin tool \"calculator\""));
        assert!(check(json!([{"type": "code_interpreter"}, {"type": "code_interpreter"}]))
            .starts_with("multiple code_interpreter"));
        assert!(check(json!([
            {"type": "mcp", "server_url": "http://a"},
            {"type": "mcp", "server_url": "http://b"}
        ]))
        .contains("without server_label"));
        assert!(check(json!([
            {"type": "mcp", "server_url": "http://a", "server_label": "x"},
            {"type": "mcp", "server_url": "http://b", "server_label": "x"}
        ]))
        .starts_with("duplicate mcp server_label \"x\""));
    }

    #[test]
    fn compiles_builtin_and_web_search() {
        let compiled = compile_tools(Some(&json!(["clock", {"type": "web_search"}])), &deps()).unwrap();
        let names: Vec<String> = compiled.static_tools().iter().map(|t| t.declaration().name).collect();
        assert_eq!(names, vec!["clock".to_string(), WEB_SEARCH_TOOL_NAME.to_string()]);

        let all = compile_tools(Some(&json!(["*", "clock"])), &deps()).unwrap();
        assert_eq!(all.tools.len(), 2);
    }

    #[test]
    fn unknown_builtin_fails() {
        let err = compile_tools(Some(&json!(["missing"])), &deps()).err().unwrap();
        assert_eq!(err, "builtin tool \"missing\" not found in tool provider");
    }

    #[test]
    fn mcp_headers_resolve_secrets() {
        let mut connector = MockMcpConnector::new();
        connector
            .expect_connect()
            .withf(|cfg: &McpConnectionConfig| {
                cfg.headers.get("X-Key").map(String::as_str) == Some("k-123") && cfg.name.as_deref() == Some("docs")
            })
            .times(1)
            .returning(|_| Ok(Arc::new(EmptySet) as Arc<dyn ToolSet>));

        std::env::set_var("TRELLIS_TOOL_COMPILER_KEY", "k-123");
        let raw = json!([{"type": "mcp", "server_url": "http://mcp", "server_label": "docs",
                          "headers": {"X-Key": "env:TRELLIS_TOOL_COMPILER_KEY"}}]);

        let denied = Dependencies { mcp_connector: Some(Arc::new(MockMcpConnector::new())), ..deps() };
        let err = compile_tools(Some(&raw), &denied).err().unwrap();
        assert!(err.contains("environment secrets are not allowed"), "{}", err);

        let allowed = Dependencies { mcp_connector: Some(Arc::new(connector)), allow_env_secrets: true, ..deps() };
        assert_eq!(compile_tools(Some(&raw), &allowed).unwrap().toolsets.len(), 1);
    }

    #[test]
    fn knowledge_and_code_factories_are_used() {
        let mut knowledge = MockKnowledgeFactory::new();
        knowledge
            .expect_search_tool()
            .withf(|spec: &KnowledgeSearchSpec| spec.max_results == 4)
            .returning(|_| Ok(echo_tool("knowledge_search")));
        let mut code = MockCodeExecutorFactory::new();
        code.expect_create().returning(|_| Ok(echo_tool("execute_code")));

        let deps = Dependencies {
            knowledge_factory: Some(Arc::new(knowledge)),
            code_executors: Some(Arc::new(code)),
            ..deps()
        };
        let compiled = compile_tools(
            Some(&json!([
                {"type": "knowledge_search", "vector_store": {"type": "inmemory"}, "embedder": {"type": "openai"}, "max_results": 4},
                {"type": "code_interpreter"}
            ])),
            &deps,
        )
        .unwrap();
        assert_eq!(compiled.knowledge_tools.len(), 1);
        assert!(compiled.code_executor.is_some());
        assert_eq!(compiled.static_tools().len(), 2);
    }

    #[test]
    fn missing_collaborators_are_reported() {
        let err = compile_tools(Some(&json!([{"type": "code_interpreter"}])), &Dependencies::default())
            .err()
            .unwrap();
        assert!(err.contains("no code executor factory"), "{}", err);
    }
}
