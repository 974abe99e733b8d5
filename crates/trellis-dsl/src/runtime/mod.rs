//! Node runtime.
//!
//! Every compiled node is a [`NodeKind`] variant carrying the dependencies
//! resolved at compile time. [`run_node`] is the single dispatch point; it
//! reads the current state and returns either a state update or an
//! interrupt request.

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::debug;

use trellis_core::{Context, Event, Message, Result};

use crate::schema::{STATE_KEY_MESSAGES, STATE_KEY_NODE_STRUCTURED, STATE_KEY_USER_INPUT};

mod approval;
mod component;
mod json_text;
mod knowledge;
mod llm;
mod mcp;
mod tools;

pub use approval::{normalize_decision, ApprovalNode, DEFAULT_APPROVAL_MESSAGE};
pub use component::ComponentNode;
pub use json_text::extract_first_json;
pub use knowledge::KnowledgeSearchNode;
pub use llm::{AgentNode, LlmNode, DEFAULT_MAX_ITERATIONS};
pub use mcp::McpNode;
pub use tools::{execute_tool_calls, ToolsNode};

/// A compiled node body
pub enum NodeKind {
    /// Entry marker; passes state through
    Start,
    /// Finish marker; passes state through
    End,
    /// Expanded while node; routes into its body
    While,
    /// Single LLM call
    Llm(LlmNode),
    /// LLM with a tool loop
    LlmAgent(AgentNode),
    /// Runs pending tool calls
    Tools(ToolsNode),
    /// One MCP tool call
    Mcp(McpNode),
    /// Knowledge base query
    KnowledgeSearch(KnowledgeSearchNode),
    /// Human approval
    UserApproval(ApprovalNode),
    /// Registered component, `builtin.transform` included
    Component(ComponentNode),
}

impl NodeKind {
    /// Short variant name for logs
    pub fn name(&self) -> &str {
        match self {
            NodeKind::Start => "start",
            NodeKind::End => "end",
            NodeKind::While => "while",
            NodeKind::Llm(_) => "llm",
            NodeKind::LlmAgent(_) => "llmagent",
            NodeKind::Tools(_) => "tools",
            NodeKind::Mcp(_) => "mcp",
            NodeKind::KnowledgeSearch(_) => "knowledge_search",
            NodeKind::UserApproval(_) => "user_approval",
            NodeKind::Component(c) => c.name(),
        }
    }
}

impl std::fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeKind::{}", self.name())
    }
}

/// Value handed back to a suspended node
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeValue {
    /// Node the value is meant for
    pub node_id: String,
    /// Resume payload
    pub value: Value,
}

/// Per-run context travelling beside the state
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// Invocation id stamped on forwarded events
    pub invocation_id: String,
    /// Parent event channel; model events are forwarded when present
    pub events: Option<mpsc::Sender<Event>>,
    /// Resume value for an interrupted node
    pub resume: Option<ResumeValue>,
}

impl ExecutionContext {
    /// Resume value addressed to `node_id`
    pub fn resume_for(&self, node_id: &str) -> Option<&Value> {
        self.resume.as_ref().filter(|r| r.node_id == node_id).map(|r| &r.value)
    }

    pub(crate) async fn forward(&self, event: Event) {
        if let Some(tx) = &self.events {
            if tx.send(event).await.is_err() {
                debug!("event receiver dropped");
            }
        }
    }
}

/// A node asking the executor to suspend the run
#[derive(Debug, Clone, PartialEq)]
pub struct InterruptRequest {
    /// Interrupt key (the node id)
    pub key: String,
    /// Shown to whoever resumes
    pub payload: Value,
}

/// Result of running one node
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutput {
    /// Fields to fold into state
    Update(Map<String, Value>),
    /// Suspend until resumed
    Interrupt(InterruptRequest),
}

impl NodeOutput {
    /// Update with no fields
    pub fn empty() -> Self {
        NodeOutput::Update(Map::new())
    }
}

/// Run one node against the current state.
pub async fn run_node(
    node_id: &str,
    kind: &NodeKind,
    ctx: &Context,
    exec: &ExecutionContext,
    state: &Map<String, Value>,
) -> Result<NodeOutput> {
    debug!(node_id, kind = kind.name(), "running node");
    match kind {
        NodeKind::Start | NodeKind::End | NodeKind::While => Ok(NodeOutput::empty()),
        NodeKind::Llm(node) => node.run(node_id, ctx, exec, state).await.map(NodeOutput::Update),
        NodeKind::LlmAgent(node) => node.run(node_id, ctx, exec, state).await.map(NodeOutput::Update),
        NodeKind::Tools(node) => node.run(ctx, state).await.map(NodeOutput::Update),
        NodeKind::Mcp(node) => node.run(node_id, ctx, state).await.map(NodeOutput::Update),
        NodeKind::KnowledgeSearch(node) => node.run(node_id, ctx, state).await.map(NodeOutput::Update),
        NodeKind::UserApproval(node) => Ok(node.run(node_id, exec)),
        NodeKind::Component(node) => node.run(node_id, ctx, state).await.map(NodeOutput::Update),
    }
}

/// The `input` view of a node: its entry in `node_structured`.
pub fn input_view(state: &Map<String, Value>, node_id: &str) -> Value {
    if node_id.is_empty() {
        return Value::Object(Map::new());
    }
    match state
        .get(STATE_KEY_NODE_STRUCTURED)
        .and_then(|ns| ns.get(node_id))
    {
        Some(Value::Object(entry)) => Value::Object(entry.clone()),
        _ => Value::Object(Map::new()),
    }
}

/// Messages currently in state; malformed entries are skipped.
pub(crate) fn state_messages(state: &Map<String, Value>) -> Vec<Message> {
    match state.get(STATE_KEY_MESSAGES) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|m| serde_json::from_value(m.clone()).ok())
            .collect(),
        _ => Vec::new(),
    }
}

/// Pending user input, if any.
pub(crate) fn pending_user_input(state: &Map<String, Value>) -> Option<String> {
    state
        .get(STATE_KEY_USER_INPUT)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// One-entry `node_structured` update for `node_id`.
pub(crate) fn structured_update(node_id: &str, entry: Map<String, Value>) -> Value {
    let mut ns = Map::new();
    ns.insert(node_id.to_string(), Value::Object(entry));
    Value::Object(ns)
}
