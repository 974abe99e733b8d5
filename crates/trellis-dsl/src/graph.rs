//! Graph document: the declarative input of the compiler.
//!
//! Documents are JSON or YAML. Only the structure is checked here; node
//! configs stay as raw JSON maps until the compiler interprets them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DslError, Result};

/// Document versions this crate understands
pub const SUPPORTED_VERSIONS: &[&str] = &["1", "1.0"];

/// Builtin node type names
pub mod node_types {
    /// Entry marker
    pub const START: &str = "builtin.start";
    /// Finish marker
    pub const END: &str = "builtin.end";
    /// Single LLM call
    pub const LLM: &str = "builtin.llm";
    /// LLM with a tool loop
    pub const LLM_AGENT: &str = "builtin.llmagent";
    /// Executes pending tool calls
    pub const TOOLS: &str = "builtin.tools";
    /// One MCP tool call
    pub const MCP: &str = "builtin.mcp";
    /// Knowledge base query
    pub const KNOWLEDGE_SEARCH: &str = "builtin.knowledge_search";
    /// Human approval interrupt
    pub const USER_APPROVAL: &str = "builtin.user_approval";
    /// Structural loop, expanded before compilation
    pub const WHILE: &str = "builtin.while";
    /// Expression transform component
    pub const TRANSFORM: &str = "builtin.transform";
}

/// A complete graph document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Graph {
    /// Document version
    pub version: String,

    /// Graph name
    #[serde(default)]
    pub name: String,

    /// Optional description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Nodes
    #[serde(default)]
    pub nodes: Vec<Node>,

    /// Static edges
    #[serde(default)]
    pub edges: Vec<Edge>,

    /// Routed edges
    #[serde(default)]
    pub conditional_edges: Vec<ConditionalEdge>,

    /// Declared state fields
    #[serde(default)]
    pub state_variables: Vec<StateVariable>,

    /// Entry node when no `builtin.start` is present
    #[serde(default)]
    pub start_node_id: String,

    /// Free-form metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl Graph {
    /// Node by id
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// One node of the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Node {
    /// Unique node id
    pub id: String,

    /// Display label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// `builtin.*` or a registered component name
    pub node_type: String,

    /// Type-specific configuration
    #[serde(default)]
    pub config: Map<String, Value>,

    /// Declared inputs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<NodeIO>,

    /// Declared outputs and where they land
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<NodeIO>,
}

/// A static edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Edge {
    /// Optional edge id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Source node id
    pub source: String,

    /// Target node id
    pub target: String,
}

impl Edge {
    /// Edge between two nodes
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self { id: None, source: source.into(), target: target.into() }
    }
}

/// An edge whose target is chosen at run time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConditionalEdge {
    /// Optional edge id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Source node id
    pub from: String,

    /// Routing cases
    pub condition: Condition,
}

/// Ordered cases plus a fallback target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Condition {
    /// Evaluated in order; first match wins
    #[serde(default)]
    pub cases: Vec<Case>,

    /// Target when nothing matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// One routing case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Case {
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Boolean predicate
    pub predicate: Expression,

    /// Target node id
    pub target: String,
}

/// Expression text wrapper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Expression {
    /// Expression source
    #[serde(default)]
    pub expression: String,
}

impl Expression {
    /// Wrap expression text
    pub fn new(expression: impl Into<String>) -> Self {
        Self { expression: expression.into() }
    }
}

/// A declared state field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StateVariable {
    /// Field name
    pub name: String,

    /// `string`, `number`, `boolean`, `object`, `array` or `opaque`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Optional JSON schema, carried for editors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<Value>,

    /// Initial value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Reducer name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reducer: Option<String>,
}

/// Declared node input or output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NodeIO {
    /// Parameter name
    pub name: String,

    /// Type hint
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_hint: Option<String>,

    /// Missing value is an error when no default exists
    #[serde(default)]
    pub required: bool,

    /// Fallback value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Where the value is written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<IOTarget>,

    /// Reducer for the target state field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reducer: Option<String>,
}

/// Destination of a node output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IOTarget {
    /// State field or graph output
    #[serde(rename = "type")]
    pub kind: TargetKind,

    /// Field name; defaults to the output name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

/// Kinds of output destinations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    /// Written into graph state
    State,
    /// Surfaced as a graph output only
    Output,
}

/// Config of a `builtin.while` node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WhileConfig {
    /// Loop body
    #[serde(default)]
    pub body: WhileBody,

    /// Continue while this holds
    #[serde(default)]
    pub condition: Expression,
}

/// Sub-graph looped by a while node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WhileBody {
    /// Body nodes
    #[serde(default)]
    pub nodes: Vec<Node>,

    /// Body edges
    #[serde(default)]
    pub edges: Vec<Edge>,

    /// Body conditional edges
    #[serde(default)]
    pub conditional_edges: Vec<ConditionalEdge>,

    /// First body node of each iteration
    #[serde(default)]
    pub start_node_id: String,

    /// Last body node of each iteration
    #[serde(default)]
    pub exit_node_id: String,
}

fn check_version(graph: Graph) -> Result<Graph> {
    if !SUPPORTED_VERSIONS.contains(&graph.version.as_str()) {
        return Err(DslError::UnsupportedVersion(graph.version));
    }
    Ok(graph)
}

/// Parse a JSON graph document.
pub fn parse_graph_json(text: &str) -> Result<Graph> {
    check_version(serde_json::from_str(text)?)
}

/// Parse a YAML graph document.
pub fn parse_graph_yaml(text: &str) -> Result<Graph> {
    check_version(serde_yaml::from_str(text)?)
}

/// Parse a graph from an already decoded JSON value.
pub fn parse_graph_value(value: Value) -> Result<Graph> {
    check_version(serde_json::from_value(value)?)
}
