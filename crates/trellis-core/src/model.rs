//! Model contract and wire-neutral message types.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::context::Context;
use crate::error::Result;
use crate::tool::ToolDeclaration;

/// Conversation role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt
    System,
    /// End user
    #[default]
    User,
    /// Model output
    Assistant,
    /// Tool result
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        f.write_str(s)
    }
}

/// Function part of a tool call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FunctionCall {
    /// Tool name
    pub name: String,
    /// Raw JSON arguments as produced by the model
    #[serde(default)]
    pub arguments: String,
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ToolCall {
    /// Call id, echoed back in the tool result message
    #[serde(default)]
    pub id: String,
    /// Function name and arguments
    pub function: FunctionCall,
}

impl ToolCall {
    /// Build a call from a name and JSON arguments.
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: &serde_json::Value) -> Self {
        Self {
            id: id.into(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.to_string(),
            },
        }
    }
}

/// One chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Message {
    /// Role of the author
    pub role: Role,
    /// Text content
    #[serde(default)]
    pub content: String,
    /// Tool calls (assistant messages only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Id of the tool call this message answers (tool messages only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    /// Name of the tool that produced this message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl Message {
    /// System message
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into(), ..Default::default() }
    }

    /// User message
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into(), ..Default::default() }
    }

    /// Assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into(), ..Default::default() }
    }

    /// Tool result message
    pub fn tool(tool_id: impl Into<String>, tool_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_id: Some(tool_id.into()),
            tool_name: Some(tool_name.into()),
            ..Default::default()
        }
    }

    /// True when the message carries text or tool calls.
    pub fn has_payload(&self) -> bool {
        !self.content.is_empty() || !self.tool_calls.is_empty()
    }
}

/// One generated alternative
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Choice {
    /// Index among alternatives
    #[serde(default)]
    pub index: u32,
    /// Generated message
    pub message: Message,
    /// Why generation stopped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Token usage of one call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Usage {
    /// Prompt tokens
    #[serde(default)]
    pub prompt_tokens: u64,
    /// Completion tokens
    #[serde(default)]
    pub completion_tokens: u64,
    /// Total tokens
    #[serde(default)]
    pub total_tokens: u64,
}

/// Error carried inside a response rather than as a transport failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResponseError {
    /// Error class (e.g. `api_error`, `rate_limit`)
    #[serde(rename = "type", default)]
    pub error_type: String,
    /// Human readable message
    #[serde(default)]
    pub message: String,
}

/// One model response (or streamed chunk)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Response {
    /// Response id
    #[serde(default)]
    pub id: String,
    /// Model that produced it
    #[serde(default)]
    pub model: String,
    /// Alternatives
    #[serde(default)]
    pub choices: Vec<Choice>,
    /// Token usage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Response-level error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
    /// Final chunk of the stream
    #[serde(default)]
    pub done: bool,
    /// Partial (streaming delta) chunk
    #[serde(default)]
    pub is_partial: bool,
}

impl Response {
    /// Single-choice, completed response
    pub fn from_message(message: Message) -> Self {
        Self {
            choices: vec![Choice { index: 0, message, finish_reason: None }],
            done: true,
            ..Default::default()
        }
    }

    /// Completed response carrying only an error
    pub fn from_error(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: Some(ResponseError { error_type: error_type.into(), message: message.into() }),
            done: true,
            ..Default::default()
        }
    }

    /// First choice's message, if any
    pub fn first_message(&self) -> Option<&Message> {
        self.choices.first().map(|c| &c.message)
    }
}

/// Generation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GenerationConfig {
    /// Stream partial chunks
    #[serde(default)]
    pub stream: bool,
    /// Sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Maximum completion tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    /// Nucleus sampling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Stop sequences
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    /// Presence penalty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    /// Frequency penalty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    /// Reasoning effort hint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    /// Enable extended thinking
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_enabled: Option<bool>,
    /// Thinking token budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_tokens: Option<i64>,
}

/// Structured output request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredOutput {
    /// Schema name
    pub name: String,
    /// JSON schema the output must satisfy
    pub schema: serde_json::Value,
}

/// Model request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Request {
    /// Conversation so far
    pub messages: Vec<Message>,
    /// Tools the model may call, keyed by name
    #[serde(default)]
    pub tools: BTreeMap<String, ToolDeclaration>,
    /// Generation parameters
    #[serde(default)]
    pub generation_config: GenerationConfig,
    /// Structured output constraint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_output: Option<StructuredOutput>,
}

/// Static model description
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModelInfo {
    /// Model name
    pub name: String,
}

/// Stream of responses produced by one model call
pub type ResponseStream = BoxStream<'static, Response>;

/// An LLM backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Model: Send + Sync {
    /// Start generation. Transport failures are `Err`; model-level
    /// failures arrive as `Response::error` inside the stream.
    async fn generate_content(&self, ctx: &Context, request: Request) -> Result<ResponseStream>;

    /// Model description
    fn info(&self) -> ModelInfo;
}

/// Runs before the model call; may rewrite the request or short-circuit with a response.
pub type BeforeModelCallback = Arc<dyn Fn(&Context, &mut Request) -> Result<Option<Response>> + Send + Sync>;

/// Runs after each response; may replace it.
pub type AfterModelCallback = Arc<dyn Fn(&Context, &Request, &Response) -> Result<Option<Response>> + Send + Sync>;

/// Ordered before/after model callbacks
#[derive(Clone, Default)]
pub struct ModelCallbacks {
    before: Vec<BeforeModelCallback>,
    after: Vec<AfterModelCallback>,
}

impl fmt::Debug for ModelCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelCallbacks")
            .field("before", &self.before.len())
            .field("after", &self.after.len())
            .finish()
    }
}

impl ModelCallbacks {
    /// Empty callback set
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a before-model callback
    pub fn register_before(mut self, cb: BeforeModelCallback) -> Self {
        self.before.push(cb);
        self
    }

    /// Register an after-model callback
    pub fn register_after(mut self, cb: AfterModelCallback) -> Self {
        self.after.push(cb);
        self
    }

    /// Run before-callbacks in order; the first custom response wins.
    pub fn run_before(&self, ctx: &Context, request: &mut Request) -> Result<Option<Response>> {
        for cb in &self.before {
            if let Some(rsp) = cb(ctx, request)? {
                return Ok(Some(rsp));
            }
        }
        Ok(None)
    }

    /// Run after-callbacks in order; the first replacement wins.
    pub fn run_after(&self, ctx: &Context, request: &Request, response: &Response) -> Result<Option<Response>> {
        for cb in &self.after {
            if let Some(rsp) = cb(ctx, request, response)? {
                return Ok(Some(rsp));
            }
        }
        Ok(None)
    }

    /// True when no callbacks are registered
    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.after.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_roles_serialize_lowercase() {
        let json = serde_json::to_value(Message::assistant("hi")).unwrap();
        assert_eq!(json["role"], "assistant");
        assert!(json.get("tool_calls").is_none());
    }

    #[test]
    fn before_callback_short_circuits() {
        let callbacks = ModelCallbacks::new()
            .register_before(Arc::new(|_: &Context, req: &mut Request| {
                req.messages.push(Message::user("added"));
                Ok(None)
            }))
            .register_before(Arc::new(|_: &Context, _: &mut Request| Ok(Some(Response::from_message(Message::assistant("canned"))))));

        let mut req = Request::default();
        let rsp = callbacks.run_before(&Context::new(), &mut req).unwrap();
        assert_eq!(req.messages.len(), 1);
        assert_eq!(rsp.unwrap().first_message().unwrap().content, "canned");
    }
}
