//! Graph compiler.
//!
//! Turns a [`Graph`] document into a [`CompiledGraph`]: while loops are
//! flattened, the state schema is inferred, every node is bound to its
//! runtime body and every routing predicate is compiled. Compilation stops
//! at the first error; validation errors name the node and field.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use trellis_core::ToolProvider;

use crate::error::{error_codes, Result, ValidationError};
use crate::external::{CodeExecutorFactory, KnowledgeFactory, McpConnector};
use crate::graph::{self, node_types, Graph};
use crate::model_spec::ModelProvider;
use crate::reducer::ReducerRegistry;
use crate::registry::{Component, ComponentRegistry};
use crate::runtime::NodeKind;
use crate::schema::{infer_schema, StateSchema};
use crate::web_search::DuckDuckGoConfig;

mod nodes;
mod routing;
mod while_loop;

pub use routing::{CompiledCase, CompiledCondition};
pub use while_loop::{expand_while, WhileExpansion};

/// Collaborators injected into node construction
#[derive(Clone, Default)]
pub(crate) struct Dependencies {
    pub(crate) tool_provider: Option<Arc<dyn ToolProvider>>,
    pub(crate) model_provider: Option<Arc<dyn ModelProvider>>,
    pub(crate) mcp_connector: Option<Arc<dyn McpConnector>>,
    pub(crate) knowledge_factory: Option<Arc<dyn KnowledgeFactory>>,
    pub(crate) code_executors: Option<Arc<dyn CodeExecutorFactory>>,
    pub(crate) allow_env_secrets: bool,
    pub(crate) web_search: DuckDuckGoConfig,
}

/// Builder for [`Compiler`]
#[derive(Default)]
pub struct CompilerBuilder {
    components: Option<ComponentRegistry>,
    reducers: Option<ReducerRegistry>,
    deps: Dependencies,
}

impl fmt::Debug for CompilerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilerBuilder")
            .field("components", &self.components)
            .field("allow_env_secrets", &self.deps.allow_env_secrets)
            .finish_non_exhaustive()
    }
}

impl CompilerBuilder {
    /// Builder with builtin components and reducers
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the component registry
    pub fn with_components(mut self, components: ComponentRegistry) -> Self {
        self.components = Some(components);
        self
    }

    /// Register one component on top of the builtins
    pub fn with_component(mut self, component: Arc<dyn Component>) -> Self {
        self.components
            .get_or_insert_with(ComponentRegistry::with_builtins)
            .register(component);
        self
    }

    /// Replace the reducer registry
    pub fn with_reducers(mut self, reducers: ReducerRegistry) -> Self {
        self.reducers = Some(reducers);
        self
    }

    /// Tools referenced by name
    pub fn with_tool_provider(mut self, provider: Arc<dyn ToolProvider>) -> Self {
        self.deps.tool_provider = Some(provider);
        self
    }

    /// Creates models for LLM nodes
    pub fn with_model_provider(mut self, provider: Arc<dyn ModelProvider>) -> Self {
        self.deps.model_provider = Some(provider);
        self
    }

    /// Connects MCP toolsets
    pub fn with_mcp_connector(mut self, connector: Arc<dyn McpConnector>) -> Self {
        self.deps.mcp_connector = Some(connector);
        self
    }

    /// Builds knowledge search tools
    pub fn with_knowledge_factory(mut self, factory: Arc<dyn KnowledgeFactory>) -> Self {
        self.deps.knowledge_factory = Some(factory);
        self
    }

    /// Builds code interpreter tools
    pub fn with_code_executor_factory(mut self, factory: Arc<dyn CodeExecutorFactory>) -> Self {
        self.deps.code_executors = Some(factory);
        self
    }

    /// Allow `env:VAR` placeholders in model specs and headers
    pub fn allow_env_secrets(mut self, allow: bool) -> Self {
        self.deps.allow_env_secrets = allow;
        self
    }

    /// Settings of the builtin web search tool
    pub fn with_web_search_config(mut self, config: DuckDuckGoConfig) -> Self {
        self.deps.web_search = config;
        self
    }

    /// Finish; the registries are read-only from here on.
    pub fn build(self) -> Compiler {
        Compiler {
            components: self.components.unwrap_or_else(ComponentRegistry::with_builtins),
            reducers: self.reducers.unwrap_or_default(),
            deps: self.deps,
        }
    }
}

/// Compiles graph documents
pub struct Compiler {
    components: ComponentRegistry,
    reducers: ReducerRegistry,
    deps: Dependencies,
}

impl fmt::Debug for Compiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compiler")
            .field("components", &self.components)
            .field("reducers", &self.reducers)
            .finish_non_exhaustive()
    }
}

/// A node bound to its runtime body
#[derive(Debug)]
pub struct CompiledNode {
    /// Node id
    pub id: String,
    /// Node type from the document
    pub node_type: String,
    /// Runtime body
    pub kind: NodeKind,
}

/// An executable graph
#[derive(Debug)]
pub struct CompiledGraph {
    name: String,
    nodes: BTreeMap<String, CompiledNode>,
    successors: HashMap<String, Vec<String>>,
    conditions: HashMap<String, CompiledCondition>,
    entry: String,
    finish: HashSet<String>,
    schema: StateSchema,
    loops: Vec<WhileExpansion>,
}

impl CompiledGraph {
    /// Graph name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Node by id
    pub fn node(&self, id: &str) -> Option<&CompiledNode> {
        self.nodes.get(id)
    }

    /// Node ids, sorted
    pub fn node_ids(&self) -> Vec<&str> {
        self.nodes.keys().map(String::as_str).collect()
    }

    /// Static successors of a node
    pub fn successors(&self, id: &str) -> &[String] {
        self.successors.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Conditional edge leaving a node
    pub fn condition(&self, id: &str) -> Option<&CompiledCondition> {
        self.conditions.get(id)
    }

    /// Entry node
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Whether the node is a finish point
    pub fn is_finish(&self, id: &str) -> bool {
        self.finish.contains(id)
    }

    /// State schema
    pub fn schema(&self) -> &StateSchema {
        &self.schema
    }

    /// Expanded while loops
    pub fn loops(&self) -> &[WhileExpansion] {
        &self.loops
    }
}

fn has_single_upstream(node_type: &str) -> bool {
    node_type == node_types::MCP || node_type == node_types::KNOWLEDGE_SEARCH
}

impl Compiler {
    /// Compiler with builtin components and no collaborators
    pub fn new() -> Self {
        CompilerBuilder::new().build()
    }

    /// Start configuring a compiler
    pub fn builder() -> CompilerBuilder {
        CompilerBuilder::new()
    }

    /// Parse and compile a JSON document.
    pub fn compile_json(&self, text: &str) -> Result<CompiledGraph> {
        self.compile(&graph::parse_graph_json(text)?)
    }

    /// Parse and compile a YAML document.
    pub fn compile_yaml(&self, text: &str) -> Result<CompiledGraph> {
        self.compile(&graph::parse_graph_yaml(text)?)
    }

    /// Parse and compile an already decoded document.
    pub fn compile_value(&self, value: Value) -> Result<CompiledGraph> {
        self.compile(&graph::parse_graph_value(value)?)
    }

    /// Compile a graph document.
    pub fn compile(&self, graph: &Graph) -> Result<CompiledGraph> {
        let (graph, loops) = expand_while(graph)?;

        let mut ids = HashSet::with_capacity(graph.nodes.len());
        for node in &graph.nodes {
            if node.id.trim().is_empty() {
                return Err(ValidationError::new(error_codes::DUPLICATE_ID, "node has empty id")
                    .in_field("id")
                    .into());
            }
            if !ids.insert(node.id.as_str()) {
                return Err(ValidationError::new(error_codes::DUPLICATE_ID, format!("duplicate node id {:?}", node.id))
                    .at_node(node.id.clone())
                    .in_field("id")
                    .into());
            }
        }

        let entry = resolve_entry(&graph, &ids)?;
        let schema = infer_schema(&graph, &self.components, &self.reducers)?;
        let upstreams = index_upstreams(&graph)?;

        let mut nodes = BTreeMap::new();
        for node in &graph.nodes {
            let upstream = upstreams.get(node.id.as_str()).copied();
            let kind = nodes::build_node(node, &self.deps, &self.components, upstream)?;
            debug!(node_id = %node.id, kind = kind.name(), "compiled node");
            nodes.insert(
                node.id.clone(),
                CompiledNode { id: node.id.clone(), node_type: node.node_type.clone(), kind },
            );
        }

        let mut successors: HashMap<String, Vec<String>> = HashMap::new();
        for edge in &graph.edges {
            for endpoint in [&edge.source, &edge.target] {
                if !ids.contains(endpoint.as_str()) {
                    return Err(unknown_reference(format!(
                        "edge {} -> {} references unknown node {}",
                        edge.source, edge.target, endpoint
                    ))
                    .into());
                }
            }
            let targets = successors.entry(edge.source.clone()).or_default();
            if !targets.contains(&edge.target) {
                targets.push(edge.target.clone());
            }
        }

        let mut conditions = HashMap::new();
        for edge in &graph.conditional_edges {
            if !ids.contains(edge.from.as_str()) {
                return Err(unknown_reference(format!("conditional edge references unknown node {}", edge.from))
                    .in_field("conditional_edges")
                    .into());
            }
            let compiled = CompiledCondition::compile(edge)?;
            if let Some(target) = compiled.targets().find(|t| !ids.contains(t)) {
                return Err(unknown_reference(format!(
                    "conditional edge from {} routes to unknown node {}",
                    edge.from, target
                ))
                .at_node(edge.from.clone())
                .into());
            }
            if conditions.insert(edge.from.clone(), compiled).is_some() {
                return Err(ValidationError::new(
                    error_codes::INVALID_CONFIG,
                    format!("node {} has more than one conditional edge", edge.from),
                )
                .at_node(edge.from.clone())
                .in_field("conditional_edges")
                .into());
            }
        }

        let finish = graph
            .nodes
            .iter()
            .filter(|n| n.node_type == node_types::END)
            .map(|n| n.id.clone())
            .collect();

        info!(graph = %graph.name, nodes = nodes.len(), loops = loops.len(), entry = %entry, "compiled graph");
        Ok(CompiledGraph {
            name: graph.name.clone(),
            nodes,
            successors,
            conditions,
            entry,
            finish,
            schema,
            loops,
        })
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

fn unknown_reference(message: String) -> ValidationError {
    ValidationError::new(error_codes::INVALID_REFERENCE, message).in_field("edges")
}

/// `builtin.start` if present, otherwise the document's `start_node_id`.
fn resolve_entry(graph: &Graph, ids: &HashSet<&str>) -> std::result::Result<String, ValidationError> {
    let starts: Vec<&str> = graph
        .nodes
        .iter()
        .filter(|n| n.node_type == node_types::START)
        .map(|n| n.id.as_str())
        .collect();
    match starts.as_slice() {
        [single] => Ok(single.to_string()),
        [] => {
            let start = graph.start_node_id.trim();
            if start.is_empty() {
                return Err(ValidationError::new(
                    error_codes::INVALID_ENTRY,
                    "graph has no builtin.start node and no start_node_id",
                )
                .in_field("start_node_id"));
            }
            if !ids.contains(start) {
                return Err(ValidationError::new(
                    error_codes::INVALID_ENTRY,
                    format!("start_node_id {:?} does not reference a node", start),
                )
                .in_field("start_node_id"));
            }
            Ok(start.to_string())
        }
        many => Err(ValidationError::new(
            error_codes::INVALID_ENTRY,
            format!("graph has multiple builtin.start nodes ({})", many.join(", ")),
        )
        .in_field("nodes")),
    }
}

/// Single upstream of every MCP and knowledge search node.
fn index_upstreams(graph: &Graph) -> std::result::Result<HashMap<&str, &str>, ValidationError> {
    let mut upstreams: HashMap<&str, &str> = HashMap::new();
    for edge in &graph.edges {
        let Some(target) = graph.node(&edge.target) else { continue };
        if !has_single_upstream(&target.node_type) {
            continue;
        }
        match upstreams.get(edge.target.as_str()) {
            Some(existing) if *existing != edge.source => {
                return Err(ValidationError::new(
                    error_codes::MULTIPLE_UPSTREAMS,
                    format!(
                        "{} node {} has multiple incoming edges ({}, {}); it must have a single upstream node for input.* semantics",
                        target.node_type, edge.target, existing, edge.source
                    ),
                )
                .at_node(edge.target.clone())
                .in_field("edges"));
            }
            Some(_) => {}
            None => {
                upstreams.insert(edge.target.as_str(), edge.source.as_str());
            }
        }
    }
    Ok(upstreams)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DslError;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn compile(doc: Value) -> Result<CompiledGraph> {
        Compiler::new().compile_value(doc)
    }

    fn validation(err: DslError) -> ValidationError {
        err.as_validation().cloned().unwrap_or_else(|| panic!("expected validation error, got {}", err))
    }

    #[test]
    fn compiles_linear_graph() {
        let graph = compile(json!({
            "version": "1",
            "name": "linear",
            "nodes": [
                {"id": "start", "node_type": "builtin.start"},
                {"id": "double", "node_type": "builtin.transform", "config": {"expr": "state.n * 2"}},
                {"id": "end", "node_type": "builtin.end"}
            ],
            "edges": [
                {"source": "start", "target": "double"},
                {"source": "double", "target": "end"},
                {"source": "double", "target": "end"}
            ]
        }))
        .unwrap();
        assert_eq!(graph.name(), "linear");
        assert_eq!(graph.entry(), "start");
        assert_eq!(graph.successors("double"), ["end".to_string()]);
        assert!(graph.successors("end").is_empty());
        assert!(graph.is_finish("end"));
        assert_eq!(graph.node("double").map(|n| n.kind.name()), Some("builtin.transform"));
    }

    #[test]
    fn start_node_id_is_the_fallback_entry() {
        let doc = json!({
            "version": "1",
            "start_node_id": "only",
            "nodes": [{"id": "only", "node_type": "builtin.end"}]
        });
        assert_eq!(compile(doc).unwrap().entry(), "only");

        let err = validation(compile(json!({"version": "1", "nodes": [{"id": "a", "node_type": "builtin.end"}]})).unwrap_err());
        assert_eq!(err.code, error_codes::INVALID_ENTRY);
    }

    #[test]
    fn several_start_nodes_are_rejected() {
        let err = validation(
            compile(json!({
                "version": "1",
                "nodes": [
                    {"id": "s1", "node_type": "builtin.start"},
                    {"id": "s2", "node_type": "builtin.start"}
                ]
            }))
            .unwrap_err(),
        );
        assert_eq!(err.code, error_codes::INVALID_ENTRY);
        assert_eq!(err.message, "graph has multiple builtin.start nodes (s1, s2)");
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = validation(
            compile(json!({
                "version": "1",
                "nodes": [
                    {"id": "s", "node_type": "builtin.start"},
                    {"id": "s", "node_type": "builtin.end"}
                ]
            }))
            .unwrap_err(),
        );
        assert_eq!(err.code, error_codes::DUPLICATE_ID);
    }

    #[test]
    fn unknown_edge_endpoints_are_rejected() {
        let err = validation(
            compile(json!({
                "version": "1",
                "nodes": [{"id": "s", "node_type": "builtin.start"}],
                "edges": [{"source": "s", "target": "ghost"}]
            }))
            .unwrap_err(),
        );
        assert_eq!(err.code, error_codes::INVALID_REFERENCE);
        assert!(err.message.contains("ghost"));

        let err = validation(
            compile(json!({
                "version": "1",
                "nodes": [{"id": "s", "node_type": "builtin.start"}],
                "conditional_edges": [{"from": "s", "condition": {"cases": [], "default": "ghost"}}]
            }))
            .unwrap_err(),
        );
        assert_eq!(err.code, error_codes::INVALID_REFERENCE);
    }

    #[test]
    fn knowledge_search_needs_a_single_upstream() {
        let err = validation(
            compile(json!({
                "version": "1",
                "nodes": [
                    {"id": "s", "node_type": "builtin.start"},
                    {"id": "a", "node_type": "builtin.transform", "config": {"expr": "1"}},
                    {"id": "kb", "node_type": "builtin.knowledge_search"}
                ],
                "edges": [
                    {"source": "s", "target": "a"},
                    {"source": "s", "target": "kb"},
                    {"source": "a", "target": "kb"}
                ]
            }))
            .unwrap_err(),
        );
        assert_eq!(err.code, error_codes::MULTIPLE_UPSTREAMS);
        assert_eq!(
            err.message,
            "builtin.knowledge_search node kb has multiple incoming edges (s, a); it must have a single upstream node for input.* semantics"
        );
    }

    #[test]
    fn while_loops_become_conditional_edges() {
        let graph = compile(json!({
            "version": "1",
            "state_variables": [{"name": "counter", "kind": "number"}],
            "nodes": [
                {"id": "start", "node_type": "builtin.start"},
                {"id": "loop", "node_type": "builtin.while", "config": {
                    "body": {
                        "nodes": [{"id": "inc", "node_type": "builtin.transform", "config": {"expr": "state.counter + 1"},
                                   "outputs": [{"name": "result", "target": {"type": "state", "field": "counter"}}]}],
                        "start_node_id": "inc",
                        "exit_node_id": "inc"
                    },
                    "condition": {"expression": "state.counter < 3"}
                }},
                {"id": "end", "node_type": "builtin.end"}
            ],
            "edges": [
                {"source": "start", "target": "loop"},
                {"source": "loop", "target": "end"}
            ]
        }))
        .unwrap();
        assert_eq!(graph.successors("loop"), ["inc".to_string()]);
        let cond = graph.condition("inc").unwrap();
        assert_eq!(cond.targets().collect::<Vec<_>>(), vec!["inc", "end"]);
        assert_eq!(graph.loops().len(), 1);
        assert!(matches!(graph.node("loop").map(|n| &n.kind), Some(NodeKind::While)));
    }

    #[test]
    fn builder_keeps_builtins_when_adding_components() {
        let compiler = Compiler::builder().with_component(Arc::new(crate::registry::TransformComponent)).build();
        assert_eq!(compiler.components.names(), vec![node_types::TRANSFORM]);
    }
}
