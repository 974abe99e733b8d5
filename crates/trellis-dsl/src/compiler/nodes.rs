//! Builds the runtime body of each graph node.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use trellis_core::{GenerationConfig, Model, StructuredOutput, Tool, ToolSet};

use super::Dependencies;
use crate::error::{error_codes, ValidationError};
use crate::external::{KnowledgeSearchSpec, McpConnectionConfig, McpTransport, DEFAULT_MCP_TIMEOUT};
use crate::graph::{node_types, Node};
use crate::model_spec::{resolve_secret, ModelSpec};
use crate::numconv;
use crate::registry::ComponentRegistry;
use crate::runtime::{
    AgentNode, ApprovalNode, ComponentNode, KnowledgeSearchNode, LlmNode, McpNode, NodeKind, ToolsNode,
    DEFAULT_MAX_ITERATIONS,
};
use crate::tool_compiler::compile_tools;

/// Failure inside one node builder, before it is tied to the node.
struct BuildError {
    code: &'static str,
    field: Option<String>,
    message: String,
}

impl BuildError {
    fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: error_codes::INVALID_CONFIG, field: Some(field.into()), message: message.into() }
    }

    fn missing(field: &str) -> Self {
        Self {
            code: error_codes::MISSING_REQUIRED_FIELD,
            field: Some(field.to_string()),
            message: format!("{} is required", field),
        }
    }
}

type BuildResult<T> = std::result::Result<T, BuildError>;

/// Build the runtime body of `node`. `upstream` is the single incoming
/// source used for the `input` view of MCP and knowledge search nodes.
pub(crate) fn build_node(
    node: &Node,
    deps: &Dependencies,
    components: &ComponentRegistry,
    upstream: Option<&str>,
) -> Result<NodeKind, ValidationError> {
    let cfg = &node.config;
    let built = match node.node_type.as_str() {
        node_types::START => Ok(NodeKind::Start),
        node_types::END => Ok(NodeKind::End),
        node_types::WHILE => Ok(NodeKind::While),
        node_types::LLM => build_llm(cfg, deps).map(NodeKind::Llm),
        node_types::LLM_AGENT => build_agent(cfg, deps).map(NodeKind::LlmAgent),
        node_types::TOOLS => build_tools(cfg, deps).map(NodeKind::Tools),
        node_types::MCP => build_mcp(cfg, deps, upstream).map(NodeKind::Mcp),
        node_types::KNOWLEDGE_SEARCH => build_knowledge(cfg, deps, upstream).map(NodeKind::KnowledgeSearch),
        node_types::USER_APPROVAL => Ok(NodeKind::UserApproval(build_approval(cfg))),
        other => match components.get(other) {
            Some(component) => build_component(node, component).map(NodeKind::Component),
            None => {
                return Err(ValidationError::new(
                    error_codes::UNKNOWN_NODE_TYPE,
                    format!("unknown node type {:?} for node {}", other, node.id),
                )
                .at_node(node.id.clone())
                .in_field("node_type"))
            }
        },
    };

    built.map_err(|e| {
        let err = ValidationError::new(
            e.code,
            format!("failed to create node {}: {}[{}]: {}", node.id, node.node_type, node.id, e.message),
        )
        .at_node(node.id.clone());
        match e.field {
            Some(field) => err.in_field(field),
            None => err,
        }
    })
}

fn opt_string(cfg: &Map<String, Value>, key: &str) -> String {
    cfg.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

/// Generation parameters read flat from the node config.
pub(crate) fn generation_config(cfg: &Map<String, Value>) -> BuildResult<GenerationConfig> {
    let mut gen = GenerationConfig::default();
    let float = |key: &str| -> BuildResult<Option<f64>> {
        cfg.get(key)
            .map(|v| numconv::to_f64(v, key).map_err(|e| BuildError::config(key, e)))
            .transpose()
    };
    let positive = |key: &str| -> BuildResult<Option<i64>> {
        cfg.get(key)
            .map(|v| numconv::to_positive_i64(v, key).map_err(|e| BuildError::config(key, e)))
            .transpose()
    };

    gen.temperature = float("temperature")?;
    gen.max_tokens = positive("max_tokens")?;
    gen.top_p = float("top_p")?;
    gen.presence_penalty = float("presence_penalty")?;
    gen.frequency_penalty = float("frequency_penalty")?;
    gen.thinking_tokens = positive("thinking_tokens")?;

    if let Some(Value::Array(items)) = cfg.get("stop") {
        gen.stop = items.iter().filter_map(Value::as_str).map(str::to_string).collect();
    }
    gen.reasoning_effort = cfg
        .get("reasoning_effort")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    gen.thinking_enabled = cfg.get("thinking_enabled").and_then(Value::as_bool);
    if let Some(stream) = cfg.get("stream").and_then(Value::as_bool) {
        gen.stream = stream;
    }
    Ok(gen)
}

/// `output_format: {type: json, schema: {...}}`
pub(crate) fn structured_output(cfg: &Map<String, Value>) -> Option<StructuredOutput> {
    let format = cfg.get("output_format")?.as_object()?;
    if format.get("type").and_then(Value::as_str) != Some("json") {
        return None;
    }
    let schema = format.get("schema").filter(|s| s.as_object().is_some_and(|o| !o.is_empty()))?;
    Some(StructuredOutput { name: "output".to_string(), schema: schema.clone() })
}

fn resolve_model(cfg: &Map<String, Value>, deps: &Dependencies) -> BuildResult<(Arc<dyn Model>, String)> {
    let raw = cfg.get("model_spec").ok_or_else(|| BuildError::missing("model_spec"))?;
    let spec = ModelSpec::parse(raw)
        .and_then(|spec| spec.resolve_env(deps.allow_env_secrets))
        .map_err(|e| BuildError::config("model_spec", e))?;
    let provider = deps
        .model_provider
        .as_ref()
        .ok_or_else(|| BuildError::config("model_spec", "no model provider configured"))?;
    let model = provider
        .create_model(&spec)
        .map_err(|e| BuildError::config("model_spec", format!("failed to create model: {}", e)))?;
    Ok((model, spec.model_name))
}

/// `tools` of a plain LLM node: `"*"`, one name or a list of names.
fn provider_tools(cfg: &Map<String, Value>, deps: &Dependencies, default_all: bool) -> BuildResult<Vec<Arc<dyn Tool>>> {
    let Some(provider) = deps.tool_provider.as_ref() else {
        if cfg.get("tools").is_some_and(|t| !t.is_null()) {
            return Err(BuildError::config("tools", "tools configured but no tool provider available"));
        }
        return Ok(Vec::new());
    };
    let names: Vec<String> = match cfg.get("tools") {
        None | Some(Value::Null) if default_all => return Ok(provider.get_all()),
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::String(s)) if s.trim() == "*" => return Ok(provider.get_all()),
        Some(Value::String(s)) => vec![s.trim().to_string()],
        Some(Value::Array(items)) => {
            if items.iter().any(|v| v.as_str() == Some("*")) {
                return Ok(provider.get_all());
            }
            items.iter().filter_map(Value::as_str).map(str::to_string).collect()
        }
        Some(_) => return Err(BuildError::config("tools", "tools must be \"*\", a tool name or a list of names")),
    };
    provider
        .get_multiple(&names)
        .map_err(|e| BuildError::config("tools", e.to_string()))
}

fn build_llm(cfg: &Map<String, Value>, deps: &Dependencies) -> BuildResult<LlmNode> {
    let generation = generation_config(cfg)?;
    let (model, model_name) = resolve_model(cfg, deps)?;
    Ok(LlmNode {
        model,
        model_name,
        instruction: opt_string(cfg, "instruction"),
        tools: provider_tools(cfg, deps, false)?,
        generation,
        structured_output: structured_output(cfg),
    })
}

/// Older agent documents list MCP servers under `mcp_tools`.
fn legacy_mcp_toolsets(cfg: &Map<String, Value>, deps: &Dependencies) -> BuildResult<Vec<Arc<dyn ToolSet>>> {
    let Some(Value::Array(entries)) = cfg.get("mcp_tools") else {
        return Ok(Vec::new());
    };
    let mut toolsets = Vec::with_capacity(entries.len());
    for (idx, entry) in entries.iter().enumerate() {
        let field = format!("mcp_tools[{}]", idx);
        let entry = entry
            .as_object()
            .ok_or_else(|| BuildError::config(field.clone(), format!("{} must be an object", field)))?;
        let server_url = entry
            .get("server_url")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| BuildError::config(field.clone(), format!("{}.server_url is required", field)))?;
        let transport = match entry.get("transport").and_then(Value::as_str).map(str::trim) {
            None | Some("") | Some("streamable_http") => McpTransport::StreamableHttp,
            Some("sse") => McpTransport::Sse,
            Some(other) => {
                return Err(BuildError::config(
                    field.clone(),
                    format!(
                        "{}.transport {:?} is not supported (must be \"streamable_http\" or \"sse\")",
                        field, other
                    ),
                ))
            }
        };
        let mut headers = BTreeMap::new();
        if let Some(Value::Object(raw)) = entry.get("headers") {
            for (name, value) in raw {
                let Some(value) = value.as_str() else { continue };
                let header_field = format!("{}.headers.{}", field, name);
                let value = resolve_secret(value.to_string(), &header_field, deps.allow_env_secrets)
                    .map_err(|e| BuildError::config(header_field.clone(), e))?;
                headers.insert(name.clone(), value);
            }
        }
        let tool_filter = match entry.get("allowed_tools") {
            Some(Value::Array(names)) => names
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };

        let connector = deps
            .mcp_connector
            .as_ref()
            .ok_or_else(|| BuildError::config(field.clone(), "mcp_tools configured but no MCP connector available"))?;
        let config = McpConnectionConfig {
            transport,
            server_url: Some(server_url.to_string()),
            command: None,
            args: Vec::new(),
            headers,
            timeout: DEFAULT_MCP_TIMEOUT,
            tool_filter,
            name: None,
        };
        let toolset = connector.connect(&config).map_err(|e| {
            BuildError::config(field.clone(), format!("failed to create MCP toolset for server {:?}: {}", server_url, e))
        })?;
        toolsets.push(toolset);
    }
    Ok(toolsets)
}

fn build_agent(cfg: &Map<String, Value>, deps: &Dependencies) -> BuildResult<AgentNode> {
    let generation = generation_config(cfg)?;
    let (model, model_name) = resolve_model(cfg, deps)?;
    let compiled = compile_tools(cfg.get("tools"), deps).map_err(|e| BuildError {
        code: error_codes::INVALID_TOOLS,
        field: Some("tools".to_string()),
        message: e,
    })?;
    let mut toolsets = compiled.toolsets.clone();
    toolsets.extend(legacy_mcp_toolsets(cfg, deps)?);

    let max_iterations = match cfg.get("max_iterations") {
        Some(v) => numconv::to_positive_i64(v, "max_iterations")
            .map_err(|e| BuildError::config("max_iterations", e))
            .map(|n| usize::try_from(n).unwrap_or(usize::MAX))?,
        None => DEFAULT_MAX_ITERATIONS,
    };

    Ok(AgentNode {
        model,
        model_name,
        instruction: opt_string(cfg, "instruction"),
        description: opt_string(cfg, "description"),
        tools: compiled.static_tools(),
        toolsets,
        generation,
        structured_output: structured_output(cfg),
        max_iterations,
    })
}

fn build_tools(cfg: &Map<String, Value>, deps: &Dependencies) -> BuildResult<ToolsNode> {
    Ok(ToolsNode::new(provider_tools(cfg, deps, true)?))
}

fn build_mcp(cfg: &Map<String, Value>, deps: &Dependencies, upstream: Option<&str>) -> BuildResult<McpNode> {
    let mut connection_cfg = cfg.clone();
    if connection_cfg.get("transport").and_then(Value::as_str).map_or(true, |t| t.trim().is_empty()) {
        connection_cfg.insert("transport".to_string(), Value::String("streamable_http".to_string()));
    }
    let mut connection = McpConnectionConfig::from_config(&connection_cfg).map_err(|e| BuildError::config("transport", e))?;
    let mut headers = BTreeMap::new();
    for (name, value) in std::mem::take(&mut connection.headers) {
        let field = format!("headers.{}", name);
        let value = resolve_secret(value, &field, deps.allow_env_secrets).map_err(|e| BuildError::config(field.clone(), e))?;
        headers.insert(name, value);
    }
    connection.headers = headers;

    let tool_name = cfg
        .get("tool_name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| BuildError::missing("tool_name"))?
        .to_string();

    let mut params = Vec::new();
    if let Some(raw) = cfg.get("params") {
        let raw = raw.as_object().ok_or_else(|| BuildError::config("params", "params must be an object"))?;
        for (name, param) in raw {
            let field = format!("params.{}.expression", name);
            let expr = param
                .get("expression")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .ok_or_else(|| BuildError { code: error_codes::MISSING_REQUIRED_FIELD, field: Some(field.clone()), message: format!("{} is required", field) })?;
            let program = trellis_core::compile(expr).map_err(|e| BuildError {
                code: error_codes::INVALID_EXPRESSION,
                field: Some(field.clone()),
                message: format!("invalid expression for param {:?}: {}", name, e),
            })?;
            params.push((name.clone(), program));
        }
    }

    let connector = deps
        .mcp_connector
        .as_ref()
        .ok_or_else(|| BuildError::config("server_url", "no MCP connector available"))?;
    let toolset = connector
        .connect(&connection)
        .map_err(|e| BuildError::config("server_url", format!("failed to create MCP toolset: {}", e)))?;
    let server = connection.server_url.clone().or(connection.command.clone()).unwrap_or_default();
    debug!(server = %server, tool = %tool_name, params = params.len(), "compiled MCP node");

    Ok(McpNode { toolset, server, tool_name, params, upstream: upstream.map(str::to_string) })
}

fn build_knowledge(
    cfg: &Map<String, Value>,
    deps: &Dependencies,
    upstream: Option<&str>,
) -> BuildResult<KnowledgeSearchNode> {
    let expr = cfg
        .get("query")
        .and_then(|q| q.get("expression"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .ok_or_else(|| BuildError::missing("query.expression"))?;
    let query = trellis_core::compile(expr).map_err(|e| BuildError {
        code: error_codes::INVALID_EXPRESSION,
        field: Some("query.expression".to_string()),
        message: e.to_string(),
    })?;
    let spec = KnowledgeSearchSpec::from_config(cfg).map_err(|e| BuildError::config("vector_store", e))?;
    let factory = deps
        .knowledge_factory
        .as_ref()
        .ok_or_else(|| BuildError::config("vector_store", "no knowledge factory available"))?;
    let tool = factory
        .search_tool(&spec)
        .map_err(|e| BuildError::config("vector_store", format!("failed to create knowledge search tool: {}", e)))?;
    Ok(KnowledgeSearchNode { tool, query, upstream: upstream.map(str::to_string) })
}

fn build_approval(cfg: &Map<String, Value>) -> ApprovalNode {
    ApprovalNode::new(
        opt_string(cfg, "message").trim(),
        cfg.get("auto_approve").and_then(Value::as_bool).unwrap_or(false),
    )
}

fn build_component(node: &Node, component: Arc<dyn crate::registry::Component>) -> BuildResult<ComponentNode> {
    component.validate(&node.config).map_err(|e| BuildError::config("config", e))?;
    let metadata = component.metadata();
    for output in &node.outputs {
        if metadata.output(&output.name).is_none() {
            let available: Vec<&str> = metadata.outputs.iter().map(|o| o.name.as_str()).collect();
            return Err(BuildError::config(
                "outputs",
                format!("output '{}' not found in component metadata (available: {:?})", output.name, available),
            ));
        }
    }
    Ok(ComponentNode {
        name: node.node_type.clone(),
        component,
        config: node.config.clone(),
        outputs: node.outputs.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{MockKnowledgeFactory, MockMcpConnector};
    use crate::graph::NodeIO;
    use crate::model_spec::StaticModelProvider;
    use crate::testing::{echo_tool, scripted, text};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use trellis_core::{Context, Result as CoreResult, ToolRegistry};

    fn node(node_type: &str, config: Value) -> Node {
        Node {
            id: "n1".into(),
            node_type: node_type.into(),
            config: config.as_object().cloned().unwrap_or_default(),
            ..Default::default()
        }
    }

    fn deps() -> Dependencies {
        let (model, _) = scripted(vec![text("ok")]);
        Dependencies {
            model_provider: Some(Arc::new(StaticModelProvider::new().with_fallback(model))),
            tool_provider: Some(Arc::new(ToolRegistry::new().with(echo_tool("calc")).with(echo_tool("clock")))),
            ..Default::default()
        }
    }

    fn build(n: &Node, deps: &Dependencies) -> std::result::Result<NodeKind, ValidationError> {
        build_node(n, deps, &ComponentRegistry::with_builtins(), None)
    }

    fn model_spec() -> Value {
        json!({"provider": "openai", "model_name": "gpt-4o-mini"})
    }

    #[test]
    fn llm_node_reads_generation_config() {
        let n = node(
            node_types::LLM,
            json!({
                "model_spec": model_spec(),
                "instruction": "be brief",
                "temperature": 0.2,
                "max_tokens": 256.0,
                "stop": ["END", 3],
                "thinking_enabled": true,
                "tools": "*",
                "output_format": {"type": "json", "schema": {"type": "object"}}
            }),
        );
        let NodeKind::Llm(llm) = build(&n, &deps()).unwrap() else { panic!("expected llm node") };
        assert_eq!(llm.model_name(), "gpt-4o-mini");
        assert_eq!(llm.generation().max_tokens, Some(256));
        assert_eq!(llm.generation().temperature, Some(0.2));
        assert_eq!(llm.generation().stop, vec!["END".to_string()]);
        assert_eq!(llm.generation().thinking_enabled, Some(true));
        assert_eq!(llm.tools.len(), 2);
        assert_eq!(llm.structured_output.as_ref().map(|s| s.name.as_str()), Some("output"));
    }

    #[test]
    fn fractional_max_tokens_names_field_and_node() {
        let n = node(node_types::LLM, json!({"model_spec": model_spec(), "max_tokens": 1.5}));
        let err = build(&n, &deps()).unwrap_err();
        assert_eq!(err.code, error_codes::INVALID_CONFIG);
        assert_eq!(err.node_id.as_deref(), Some("n1"));
        assert_eq!(err.field.as_deref(), Some("max_tokens"));
        assert_eq!(
            err.message,
            "failed to create node n1: builtin.llm[n1]: max_tokens must be an integer, got 1.5"
        );
    }

    #[test]
    fn generation_config_is_checked_before_the_model() {
        let n = node(node_types::LLM_AGENT, json!({"thinking_tokens": 0}));
        let err = build(&n, &Dependencies::default()).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("thinking_tokens"));
    }

    #[test]
    fn missing_model_spec() {
        let err = build(&node(node_types::LLM, json!({})), &deps()).unwrap_err();
        assert_eq!(err.code, error_codes::MISSING_REQUIRED_FIELD);
        assert_eq!(err.field.as_deref(), Some("model_spec"));
    }

    #[test]
    fn env_secrets_need_permission() {
        let spec = json!({"provider": "openai", "model_name": "m", "api_key": "env:TRELLIS_TEST_KEY"});
        let err = build(&node(node_types::LLM, json!({"model_spec": spec})), &deps()).unwrap_err();
        assert!(err.message.contains("environment secrets are not allowed"), "{}", err);
    }

    #[test]
    fn agent_compiles_tools_and_iterations() {
        let n = node(
            node_types::LLM_AGENT,
            json!({"model_spec": model_spec(), "tools": ["calc"], "max_iterations": 3, "description": "helper"}),
        );
        let NodeKind::LlmAgent(agent) = build(&n, &deps()).unwrap() else { panic!("expected agent node") };
        assert_eq!(agent.tool_names(), vec!["calc".to_string()]);
        assert_eq!(agent.max_iterations, 3);
        assert_eq!(agent.description(), "helper");
    }

    #[test]
    fn agent_unknown_tool_is_invalid_tools() {
        let n = node(node_types::LLM_AGENT, json!({"model_spec": model_spec(), "tools": ["weather"]}));
        let err = build(&n, &deps()).unwrap_err();
        assert_eq!(err.code, error_codes::INVALID_TOOLS);
        assert!(err.message.contains("\"weather\""), "{}", err);
    }

    #[test]
    fn legacy_mcp_tools_are_validated() {
        let n = node(
            node_types::LLM_AGENT,
            json!({"model_spec": model_spec(), "mcp_tools": [{"server_url": "http://x", "transport": "stdio"}]}),
        );
        let err = build(&n, &deps()).unwrap_err();
        assert_eq!(
            err.message,
            "failed to create node n1: builtin.llmagent[n1]: mcp_tools[0].transport \"stdio\" is not supported (must be \"streamable_http\" or \"sse\")"
        );
        let n = node(node_types::LLM_AGENT, json!({"model_spec": model_spec(), "mcp_tools": ["x"]}));
        assert!(build(&n, &deps()).unwrap_err().message.ends_with("mcp_tools[0] must be an object"));
    }

    #[test]
    fn tools_node_defaults_to_every_tool() {
        let NodeKind::Tools(tools) = build(&node(node_types::TOOLS, json!({})), &deps()).unwrap() else {
            panic!("expected tools node")
        };
        assert_eq!(tools.tool_names(), vec!["calc".to_string(), "clock".to_string()]);
        let NodeKind::Tools(tools) = build(&node(node_types::TOOLS, json!({"tools": ["clock"]})), &deps()).unwrap()
        else {
            panic!("expected tools node")
        };
        assert_eq!(tools.tool_names(), vec!["clock".to_string()]);
    }

    #[test]
    fn mcp_node_requires_tool_name_and_compiles_params() {
        let mut connector = MockMcpConnector::new();
        connector.expect_connect().returning(|config| {
            assert_eq!(config.server_url.as_deref(), Some("http://mcp.local"));
            assert_eq!(config.transport, McpTransport::StreamableHttp);
            struct Empty;
            #[async_trait::async_trait]
            impl ToolSet for Empty {
                fn name(&self) -> &str {
                    "empty"
                }
                async fn tools(&self, _ctx: &Context) -> CoreResult<Vec<Arc<dyn Tool>>> {
                    Ok(Vec::new())
                }
            }
            Ok(Arc::new(Empty))
        });
        let deps = Dependencies { mcp_connector: Some(Arc::new(connector)), ..deps() };

        let err = build(&node(node_types::MCP, json!({"server_url": "http://mcp.local"})), &deps).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("tool_name"));

        let n = node(
            node_types::MCP,
            json!({"server_url": "http://mcp.local", "tool_name": "weather",
                   "params": {"city": {"expression": "input.output_parsed.city"}}}),
        );
        let NodeKind::Mcp(mcp) = build_node(&n, &deps, &ComponentRegistry::new(), Some("extract")).unwrap() else {
            panic!("expected mcp node")
        };
        assert_eq!(mcp.tool_name(), "weather");
        assert_eq!(mcp.params.len(), 1);
        assert_eq!(mcp.upstream.as_deref(), Some("extract"));
    }

    #[test]
    fn knowledge_node_needs_query_and_factory() {
        let cfg = json!({"query": {"expression": "state.question"}, "vector_store": {"type": "inmemory"}, "embedder": {"type": "openai"}, "max_results": 4});
        let err = build(&node(node_types::KNOWLEDGE_SEARCH, json!({"vector_store": {}})), &deps()).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("query.expression"));
        assert!(build(&node(node_types::KNOWLEDGE_SEARCH, cfg.clone()), &deps()).is_err());

        let mut factory = MockKnowledgeFactory::new();
        factory.expect_search_tool().withf(|spec| spec.max_results == 4).returning(|_| Ok(echo_tool("kb")));
        let deps = Dependencies { knowledge_factory: Some(Arc::new(factory)), ..deps() };
        assert!(matches!(build(&node(node_types::KNOWLEDGE_SEARCH, cfg), &deps), Ok(NodeKind::KnowledgeSearch(_))));
    }

    #[test]
    fn approval_node_uses_default_message() {
        let NodeKind::UserApproval(a) = build(&node(node_types::USER_APPROVAL, json!({"message": "  "})), &deps()).unwrap()
        else {
            panic!("expected approval node")
        };
        assert_eq!(a.message(), crate::runtime::DEFAULT_APPROVAL_MESSAGE);
    }

    #[test]
    fn components_validate_config_and_outputs() {
        let err = build(&node(node_types::TRANSFORM, json!({})), &deps()).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("config"));

        let mut n = node(node_types::TRANSFORM, json!({"expr": "1"}));
        n.outputs = vec![NodeIO { name: "score".into(), ..Default::default() }];
        let err = build(&n, &deps()).unwrap_err();
        assert!(err.message.contains("output 'score' not found in component metadata"), "{}", err);
    }

    #[test]
    fn unknown_node_type() {
        let err = build(&node("custom.nope", json!({})), &deps()).unwrap_err();
        assert_eq!(err.code, error_codes::UNKNOWN_NODE_TYPE);
        assert_eq!(err.node_id.as_deref(), Some("n1"));
    }
}
