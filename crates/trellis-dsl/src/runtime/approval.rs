use serde_json::{json, Map, Value};
use tracing::info;

use super::{ExecutionContext, InterruptRequest, NodeOutput};
use crate::schema::STATE_KEY_APPROVAL_RESULT;

/// Prompt used when the node config has none
pub const DEFAULT_APPROVAL_MESSAGE: &str = "Please approve this action (yes/no):";

/// Map a free-form answer to `approve` or `reject`.
pub fn normalize_decision(answer: &str) -> &'static str {
    match answer.trim().to_lowercase().as_str() {
        "approve" | "yes" | "y" => "approve",
        _ => "reject",
    }
}

/// `builtin.user_approval`: suspends the run until someone answers.
#[derive(Debug, Clone)]
pub struct ApprovalNode {
    pub(crate) message: String,
    pub(crate) auto_approve: bool,
}

impl ApprovalNode {
    /// Node with the given prompt; an empty prompt falls back to the default
    pub fn new(message: impl Into<String>, auto_approve: bool) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() { DEFAULT_APPROVAL_MESSAGE.to_string() } else { message };
        Self { message, auto_approve }
    }

    /// Prompt shown to the approver
    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn run(&self, node_id: &str, exec: &ExecutionContext) -> NodeOutput {
        let decision = if self.auto_approve {
            "approve"
        } else {
            match exec.resume_for(node_id) {
                Some(Value::String(answer)) => normalize_decision(answer),
                Some(_) => "reject",
                None => {
                    return NodeOutput::Interrupt(InterruptRequest {
                        key: node_id.to_string(),
                        payload: json!({"message": self.message, "node_id": node_id}),
                    })
                }
            }
        };
        info!(node_id, decision, "approval decided");
        let mut update = Map::new();
        update.insert(STATE_KEY_APPROVAL_RESULT.to_string(), Value::String(decision.to_string()));
        NodeOutput::Update(update)
    }
}
